//! One-shot completion signal
//!
//! A task creates a [`CompletionSignal`] to publish its own termination.
//! Awaiters register against its wait source through the loop; the engine
//! keeps the source alive until the registered callback has fired.
//!
//! Several loops (or several registrations on one loop) may wait on the same
//! signal. Every registration fires exactly once with the same outcome.

use crate::error::Status;
use crate::signal::{Event, WaitSource, WaitState};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

struct SignalState {
    outcome: Option<Status>,
    subscribers: Vec<Arc<Event>>,
}

struct SignalCore {
    state: Mutex<SignalState>,
    /// Wakes threads blocked in `wait`/`wait_timeout`
    cond: Condvar,
}

impl SignalCore {
    fn signal(&self, outcome: Status) -> bool {
        let subscribers = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            self.cond.notify_all();
            state.subscribers.clone()
        };
        for event in subscribers {
            event.set();
        }
        true
    }
}

impl WaitSource for SignalCore {
    fn query(&self) -> WaitState {
        match &self.state.lock().outcome {
            Some(status) => WaitState::Signaled(status.clone()),
            None => WaitState::Pending,
        }
    }

    fn subscribe(&self, event: &Arc<Event>) {
        let signaled = {
            let mut state = self.state.lock();
            state.subscribers.push(Arc::clone(event));
            state.outcome.is_some()
        };
        if signaled {
            event.set();
        }
    }

    fn unsubscribe(&self, event: &Arc<Event>) {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .subscribers
            .iter()
            .position(|sub| Arc::ptr_eq(sub, event))
        {
            state.subscribers.swap_remove(pos);
        }
    }
}

/// A pending-then-signaled primitive carrying an optional failure
#[derive(Clone)]
pub struct CompletionSignal {
    core: Arc<SignalCore>,
}

impl CompletionSignal {
    /// Create a pending signal
    pub fn new() -> Self {
        Self {
            core: Arc::new(SignalCore {
                state: Mutex::new(SignalState {
                    outcome: None,
                    subscribers: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signal success. Returns `false` if the signal had already fired.
    pub fn set(&self) -> bool {
        self.core.signal(Status::ok())
    }

    /// Signal with an outcome; an ok `status` counts as success.
    /// Returns `false` if the signal had already fired.
    pub fn fail(&self, status: Status) -> bool {
        self.core.signal(status)
    }

    /// Whether the signal has fired
    pub fn is_signaled(&self) -> bool {
        self.core.state.lock().outcome.is_some()
    }

    /// The carried outcome, once signaled
    pub fn result(&self) -> Option<Result<(), Status>> {
        self.core
            .state
            .lock()
            .outcome
            .clone()
            .map(Status::into_result)
    }

    /// The wait source to register with a step engine
    pub fn wait_source(&self) -> Arc<dyn WaitSource> {
        self.core.clone()
    }

    /// Block the calling thread until signaled.
    ///
    /// Never call this from a loop thread: it stalls the whole worker.
    pub fn wait(&self) -> Result<(), Status> {
        let mut state = self.core.state.lock();
        while state.outcome.is_none() {
            self.core.cond.wait(&mut state);
        }
        state.outcome.clone().map_or(Ok(()), Status::into_result)
    }

    /// Block the calling thread until signaled or `timeout` passes.
    ///
    /// Returns `None` on timeout. Same restriction as [`CompletionSignal::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), Status>> {
        let mut state = self.core.state.lock();
        if state.outcome.is_none() {
            self.core.cond.wait_for(&mut state, timeout);
        }
        state.outcome.clone().map(Status::into_result)
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("outcome", &self.core.state.lock().outcome)
            .finish()
    }
}
