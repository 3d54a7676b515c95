//! Step engine contract and the loop context
//!
//! A [`StepEngine`] executes one bounded step of asynchronous work at a time
//! and accepts three kinds of registrations: run soon, run at a deadline, and
//! run when a wait source is signaled. The worker drives it; callbacks see it
//! only through the [`Loop`] context, which is the sole way to reach
//! loop-thread-only operations.

mod sync_loop;

pub use sync_loop::{EngineLimits, SyncLoop, DEFAULT_MAX_PENDING};

use crate::completion::CompletionSignal;
use crate::error::{RegistrationError, Status, StatusCode};
use crate::signal::WaitSource;
use crate::time::{self, Deadline, Timeout};
use crate::worker::WorkerHandle;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Ordering hint for soon callbacks
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Runs before default and low priority work in the same tick
    High,
    /// Normal priority
    #[default]
    Default,
    /// Runs after everything else ready in the same tick
    Low,
}

/// A callback registered with the engine.
///
/// Receives the loop context and the reason it is being invoked (`ok`,
/// `cancelled`, `deadline exceeded`, or a wait source's failure). Captured
/// state is owned by the callback and dropped once it has run.
pub type LoopCallback =
    Box<dyn for<'a> FnOnce(&mut Loop<'a>, Status) -> Result<(), Status> + Send + 'static>;

/// Bounded-step asynchronous engine driven by a worker's loop thread.
///
/// An engine is owned by exactly one worker and only ever touched by that
/// worker's loop thread once the loop is running.
pub trait StepEngine: Send {
    /// Run `callback` at the next tick
    fn call(&mut self, callback: LoopCallback, priority: Priority)
        -> Result<(), RegistrationError>;

    /// Run `callback` once, at or after `deadline`
    fn wait_until(
        &mut self,
        deadline: Deadline,
        callback: LoopCallback,
    ) -> Result<(), RegistrationError>;

    /// Run `callback` once `source` is signaled, or with `DeadlineExceeded`
    /// once `deadline` passes, whichever is first
    fn wait_one(
        &mut self,
        source: Arc<dyn WaitSource>,
        deadline: Deadline,
        callback: LoopCallback,
    ) -> Result<(), RegistrationError>;

    /// Earliest deadline among pending timed registrations
    fn next_deadline(&self) -> Option<Deadline>;

    /// Run ready work, blocking at most until `deadline`.
    ///
    /// Returns early once the engine's wake event fires and no work is
    /// immediately actionable. An `Err` means the engine cannot continue.
    fn step(&mut self, worker: &WorkerHandle, deadline: Deadline) -> Result<(), Status>;

    /// Invoke every outstanding registration with a cancellation status and
    /// refuse all further registrations
    fn cancel_all(&mut self, worker: &WorkerHandle);

    /// Number of outstanding registrations
    fn pending(&self) -> usize;
}

/// Builds the engine for a worker, given the event that wakes its loop
pub type EngineFactory =
    Box<dyn FnOnce(Arc<crate::signal::Event>) -> Box<dyn StepEngine> + Send + 'static>;

/// Loop-thread context handed to thunks and callbacks.
///
/// Holding a `Loop` proves the code is running on the worker's loop thread.
pub struct Loop<'a> {
    engine: &'a mut dyn StepEngine,
    worker: &'a WorkerHandle,
}

impl<'a> Loop<'a> {
    /// Wrap an engine and the worker that drives it
    pub fn new(engine: &'a mut dyn StepEngine, worker: &'a WorkerHandle) -> Self {
        Self { engine, worker }
    }

    /// The worker running this loop
    pub fn worker(&self) -> &WorkerHandle {
        self.worker
    }

    /// Current absolute monotonic time in nanoseconds
    pub fn now(&self) -> u64 {
        time::now()
    }

    /// Request the worker to stop after the current iteration
    pub fn kill(&self) {
        self.worker.kill();
    }

    /// Run `callback` at the next tick.
    ///
    /// Registration failures are returned here; the callback's own failure
    /// is confined to the callback.
    pub fn call_low_level<F>(&mut self, callback: F, priority: Priority) -> Result<(), RegistrationError>
    where
        F: FnOnce(&mut Loop<'_>, Status) -> Result<(), Status> + Send + 'static,
    {
        self.engine.call(Box::new(callback), priority)
    }

    /// Run `callback` once, at or after the absolute `deadline`
    pub fn wait_until_low_level<F>(
        &mut self,
        deadline: Deadline,
        callback: F,
    ) -> Result<(), RegistrationError>
    where
        F: FnOnce(&mut Loop<'_>, Status) -> Result<(), Status> + Send + 'static,
    {
        self.engine.wait_until(deadline, Box::new(callback))
    }

    /// Run `callback` once `source` is signaled or `timeout` elapses.
    ///
    /// A relative timeout is resolved against the clock now, at registration.
    pub fn wait_one_low_level<F>(
        &mut self,
        source: Arc<dyn WaitSource>,
        timeout: impl Into<Timeout>,
        callback: F,
    ) -> Result<(), RegistrationError>
    where
        F: FnOnce(&mut Loop<'_>, Status) -> Result<(), Status> + Send + 'static,
    {
        let deadline = timeout.into().to_deadline();
        self.engine.wait_one(source, deadline, Box::new(callback))
    }

    /// Run `f` soon on this loop; dropped unrun if the worker shuts down first
    pub fn call<F>(&mut self, f: F) -> Result<(), RegistrationError>
    where
        F: FnOnce(&mut Loop<'_>) + Send + 'static,
    {
        self.call_low_level(
            move |lp, status| {
                status.into_result()?;
                f(lp);
                Ok(())
            },
            Priority::Default,
        )
    }

    /// Run `f` on this loop at or after `deadline`; dropped unrun if the
    /// worker shuts down first
    pub fn delay_call<F>(&mut self, deadline: Deadline, f: F) -> Result<(), RegistrationError>
    where
        F: FnOnce(&mut Loop<'_>) + Send + 'static,
    {
        self.wait_until_low_level(deadline, move |lp, status| {
            status.into_result()?;
            f(lp);
            Ok(())
        })
    }

    /// Hand `f` the outcome of `signal` once it is signaled.
    ///
    /// `f` also runs, with `Cancelled`, if the worker shuts down first.
    pub fn await_completion<F>(&mut self, signal: &CompletionSignal, f: F) -> Result<(), RegistrationError>
    where
        F: FnOnce(&mut Loop<'_>, Result<(), Status>) + Send + 'static,
    {
        self.wait_one_low_level(signal.wait_source(), Timeout::Infinite, move |lp, status| {
            f(lp, status.into_result());
            Ok(())
        })
    }

    /// Queue a thunk through the worker's cross-thread queue
    pub fn call_threadsafe<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.worker.call_threadsafe(f);
    }
}

/// Invoke a registered callback without letting a panic escape.
///
/// A panic or an `Err` return is logged and counted against the worker;
/// neither reaches the engine or sibling callbacks.
pub fn invoke_guarded(callback: LoopCallback, lp: &mut Loop<'_>, status: Status) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| callback(lp, status)))
        .unwrap_or_else(|payload| {
            Err(Status::internal(format!(
                "callback panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

    if let Err(status) = result {
        // A callback told it was cancelled may simply hand the status back.
        if status.code() == StatusCode::Cancelled {
            return;
        }
        lp.worker().record_callback_failure();
        warn!(worker = %lp.worker().name(), %status, "loop callback failed");
    }
}

/// Extract a message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
