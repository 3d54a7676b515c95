//! Cooperative worker
//!
//! A [`Worker`] owns one step engine, one cross-thread call queue, and one
//! loop thread (spawned with [`Worker::start`] or donated with
//! [`Worker::run_on_current_thread`]). Each loop iteration:
//!
//! 1. swaps the pending queue out and runs every thunk in enqueue order,
//! 2. computes `min(now + quantum, engine.next_deadline())`,
//! 3. runs one bounded engine step up to that deadline,
//! 4. leaves if a kill was requested.
//!
//! The quantum bounds how long a blocked step can delay a kill or newly
//! queued work.

use crate::engine::{panic_message, EngineFactory, EngineLimits, Loop, StepEngine, SyncLoop};
use crate::error::{PreconditionViolation, Result, Status, WorkerError};
use crate::queue::{CallQueue, Thunk};
use crate::signal::Event;
use crate::time::{self, Deadline};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

/// Default maximum time between engine steps
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(500);

/// Fixed configuration captured when a worker is constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Diagnostic name
    pub name: String,

    /// Maximum duration between successive engine steps. Bounds how long a
    /// kill or a cross-thread call can wait behind a blocked step.
    pub quantum: Duration,

    /// Spawn a dedicated thread (`true`) or wait to adopt a caller's thread
    pub owned_thread: bool,
}

impl WorkerOptions {
    /// Options with the default quantum and an owned thread
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quantum: DEFAULT_QUANTUM,
            owned_thread: true,
        }
    }

    /// Override the quantum
    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;
        self
    }

    /// Choose between an owned and an adopted thread
    pub fn with_owned_thread(mut self, owned_thread: bool) -> Self {
        self.owned_thread = owned_thread;
        self
    }
}

/// Attach points for foreign per-thread runtime state.
///
/// `on_thread_start` runs on the loop thread before the first iteration and
/// `on_thread_stop` after the last one (including after an abnormal exit).
/// Hooks must not re-enter the loop synchronously.
pub trait WorkerHooks: Send + Sync {
    /// Called on the loop thread before the loop starts
    fn on_thread_start(&self, _worker: &WorkerHandle) {}

    /// Called on the loop thread after the loop exits
    fn on_thread_stop(&self, _worker: &WorkerHandle) {}
}

struct NoHooks;

impl WorkerHooks for NoHooks {}

/// Builds workers from options, e.g. to install custom hooks
pub type WorkerFactory = Box<dyn Fn(WorkerOptions) -> Worker + Send + Sync>;

/// Counters describing what a worker has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Cross-thread thunks executed
    pub thunks_executed: u64,

    /// Cross-thread thunks discarded because the loop had exited
    pub thunks_dropped: u64,

    /// Engine steps taken
    pub steps: u64,

    /// Thunks or callbacks that panicked or returned an error
    pub callbacks_failed: u64,
}

struct Shared {
    options: WorkerOptions,
    hooks: Arc<dyn WorkerHooks>,

    /// Taken by the loop thread for the loop's lifetime
    engine: Mutex<Option<Box<dyn StepEngine>>>,

    queue: CallQueue,
    signal_transact: Arc<Event>,
    signal_ended: Event,

    kill: AtomicBool,
    has_run: AtomicBool,
    running: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
    exit: Mutex<Option<Result<()>>>,

    thunks_executed: AtomicU64,
    thunks_dropped: AtomicU64,
    steps: AtomicU64,
    callbacks_failed: AtomicU64,
}

/// Cheap, cloneable, thread-safe handle to a worker
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.shared.options.name
    }

    /// Configuration captured at construction
    pub fn options(&self) -> &WorkerOptions {
        &self.shared.options
    }

    /// Enqueue `f` to run once on the loop thread.
    ///
    /// Items run in the order their enqueue acquired the queue lock, all
    /// before the loop's next engine step. Items submitted after the loop has
    /// exited are dropped without running.
    pub fn call_threadsafe<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(move |_: &mut Loop<'_>| f()));
    }

    /// Like [`WorkerHandle::call_threadsafe`], with access to the loop
    pub fn call_threadsafe_with<F>(&self, f: F)
    where
        F: FnOnce(&mut Loop<'_>) + Send + 'static,
    {
        self.submit(Box::new(f));
    }

    fn submit(&self, thunk: Thunk) {
        if self.shared.queue.push(thunk) {
            self.shared.signal_transact.set();
        } else {
            self.shared.thunks_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(worker = %self.name(), "worker has exited, dropping cross-thread call");
        }
    }

    /// Request termination. Idempotent and safe from any thread.
    pub fn kill(&self) {
        self.shared.kill.store(true, Ordering::Release);
        self.shared.signal_transact.set();
    }

    /// Whether a kill has been requested
    pub fn is_killed(&self) -> bool {
        self.shared.kill.load(Ordering::Acquire)
    }

    /// Whether the loop is currently running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether the calling thread is this worker's loop thread
    pub fn is_loop_thread(&self) -> bool {
        *self.shared.loop_thread.lock() == Some(thread::current().id())
    }

    /// Current absolute monotonic time in nanoseconds
    pub fn now(&self) -> u64 {
        time::now()
    }

    /// Absolute deadline `timeout_ns` from now
    pub fn convert_relative_timeout_to_deadline_ns(&self, timeout_ns: i64) -> Deadline {
        time::relative_timeout_to_deadline_ns(timeout_ns)
    }

    /// Absolute deadline `seconds` from now
    pub fn delay_to_deadline(&self, seconds: f64) -> Deadline {
        time::relative_timeout_to_deadline_ns((seconds * 1e9) as i64)
    }

    /// Snapshot of the worker's counters
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            thunks_executed: self.shared.thunks_executed.load(Ordering::Relaxed),
            thunks_dropped: self.shared.thunks_dropped.load(Ordering::Relaxed),
            steps: self.shared.steps.load(Ordering::Relaxed),
            callbacks_failed: self.shared.callbacks_failed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_callback_failure(&self) {
        self.shared.callbacks_failed.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Worker(name='{}')", self.name())
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .finish()
    }
}

/// The owning value of a cooperative worker.
///
/// Dropping a worker whose loop is running kills it and waits for shutdown.
pub struct Worker {
    handle: WorkerHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Worker with the default engine and no hooks
    pub fn new(options: WorkerOptions) -> Self {
        Self::with_parts(options, Arc::new(NoHooks), SyncLoop::factory(EngineLimits::default()))
    }

    /// Worker with the default engine and custom thread hooks
    pub fn with_hooks(options: WorkerOptions, hooks: Arc<dyn WorkerHooks>) -> Self {
        Self::with_parts(options, hooks, SyncLoop::factory(EngineLimits::default()))
    }

    /// Worker driving an engine built by `factory`
    pub fn with_engine(options: WorkerOptions, factory: EngineFactory) -> Self {
        Self::with_parts(options, Arc::new(NoHooks), factory)
    }

    /// Worker with custom hooks and engine
    pub fn with_parts(
        options: WorkerOptions,
        hooks: Arc<dyn WorkerHooks>,
        factory: EngineFactory,
    ) -> Self {
        let signal_transact = Arc::new(Event::auto_reset());
        let engine = factory(Arc::clone(&signal_transact));

        let shared = Arc::new(Shared {
            options,
            hooks,
            engine: Mutex::new(Some(engine)),
            queue: CallQueue::new(),
            signal_transact,
            signal_ended: Event::manual_reset(),
            kill: AtomicBool::new(false),
            has_run: AtomicBool::new(false),
            running: AtomicBool::new(false),
            loop_thread: Mutex::new(None),
            exit: Mutex::new(None),
            thunks_executed: AtomicU64::new(0),
            thunks_dropped: AtomicU64::new(0),
            steps: AtomicU64::new(0),
            callbacks_failed: AtomicU64::new(0),
        });

        Self {
            handle: WorkerHandle { shared },
            thread: Mutex::new(None),
        }
    }

    /// A cloneable handle for other threads
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Configuration captured at construction
    pub fn options(&self) -> &WorkerOptions {
        self.handle.options()
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Whether the worker has been started or adopted
    pub fn has_run(&self) -> bool {
        self.handle.shared.has_run.load(Ordering::Acquire)
    }

    /// Whether the loop is currently running
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Snapshot of the worker's counters
    pub fn stats(&self) -> WorkerStats {
        self.handle.stats()
    }

    /// Current absolute monotonic time in nanoseconds
    pub fn now(&self) -> u64 {
        time::now()
    }

    /// Absolute deadline `timeout_ns` from now
    pub fn convert_relative_timeout_to_deadline_ns(&self, timeout_ns: i64) -> Deadline {
        self.handle.convert_relative_timeout_to_deadline_ns(timeout_ns)
    }

    /// See [`WorkerHandle::call_threadsafe`]
    pub fn call_threadsafe<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.call_threadsafe(f);
    }

    /// See [`WorkerHandle::call_threadsafe_with`]
    pub fn call_threadsafe_with<F>(&self, f: F)
    where
        F: FnOnce(&mut Loop<'_>) + Send + 'static,
    {
        self.handle.call_threadsafe_with(f);
    }

    /// Request termination. Idempotent and safe from any thread.
    pub fn kill(&self) {
        self.handle.kill();
    }

    /// Spawn the owned loop thread.
    ///
    /// Fails if the worker was configured for an adopted thread or has
    /// already run.
    pub fn start(&self) -> Result<()> {
        let shared = &self.handle.shared;
        if !shared.options.owned_thread {
            return Err(PreconditionViolation::NotOwnedThread.into());
        }
        if shared.has_run.swap(true, Ordering::AcqRel) {
            return Err(PreconditionViolation::AlreadyRun.into());
        }

        // Held across the spawn so a concurrent wait always finds the handle.
        let mut slot = self.thread.lock();
        let thread_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("cadence-{}", shared.options.name))
            .spawn(move || {
                let _ = run_on_thread(&thread_shared);
            });

        match spawned {
            Ok(join) => {
                *slot = Some(join);
                Ok(())
            }
            Err(err) => {
                shared.has_run.store(false, Ordering::Release);
                error!(worker = %shared.options.name, %err, "failed to spawn worker thread");
                Err(WorkerError::Spawn(err))
            }
        }
    }

    /// Run the loop on the calling thread until it is killed.
    ///
    /// Used instead of [`Worker::start`] when `owned_thread` is false, to
    /// donate an existing thread. Returns the loop's exit result.
    pub fn run_on_current_thread(&self) -> Result<()> {
        let shared = &self.handle.shared;
        if shared.options.owned_thread {
            return Err(PreconditionViolation::OwnedThread.into());
        }
        if shared.has_run.swap(true, Ordering::AcqRel) {
            return Err(PreconditionViolation::AlreadyRun.into());
        }
        run_on_thread(shared)
    }

    /// Block until the loop thread has fully exited.
    ///
    /// Must not be called from the loop thread itself; doing so returns
    /// [`PreconditionViolation::ShutdownFromLoopThread`] instead of
    /// deadlocking. Returns immediately for a worker that never ran, and
    /// reports [`WorkerError::EngineStep`] if the loop ended abnormally.
    pub fn wait_for_shutdown(&self) -> Result<()> {
        let shared = &self.handle.shared;
        if !shared.has_run.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.handle.is_loop_thread() {
            return Err(PreconditionViolation::ShutdownFromLoopThread.into());
        }

        shared.signal_ended.wait();

        if let Some(join) = self.thread.lock().take() {
            if let Err(payload) = join.join() {
                warn!(
                    worker = %shared.options.name,
                    panic = %panic_message(payload.as_ref()),
                    "worker thread panicked outside the loop"
                );
            }
        }

        shared.exit.lock().clone().unwrap_or(Ok(()))
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.handle, f)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("options", self.options())
            .field("has_run", &self.has_run())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.has_run() {
            self.handle.shared.queue.close();
            return;
        }
        self.kill();
        if self.handle.is_loop_thread() {
            // Dropped from inside its own loop; the loop exits on its own.
            return;
        }
        if let Err(err) = self.wait_for_shutdown() {
            warn!(worker = %self.name(), %err, "worker exited abnormally");
        }
    }
}

/// Thread entry shared by owned and adopted threads
fn run_on_thread(shared: &Arc<Shared>) -> Result<()> {
    let handle = WorkerHandle {
        shared: Arc::clone(shared),
    };
    let span = info_span!("worker", name = %shared.options.name);
    let _enter = span.enter();

    *shared.loop_thread.lock() = Some(thread::current().id());
    shared.running.store(true, Ordering::Release);
    info!(
        owned_thread = shared.options.owned_thread,
        quantum_ms = shared.options.quantum.as_millis() as u64,
        "worker loop starting"
    );

    let engine = shared.engine.lock().take();
    let outcome = match engine {
        Some(engine) => drive(&handle, engine),
        None => Err(PreconditionViolation::AlreadyRun.into()),
    };

    let discarded = shared.queue.close();
    if discarded > 0 {
        shared.thunks_dropped.fetch_add(discarded as u64, Ordering::Relaxed);
        debug!(discarded, "dropped calls queued after the loop exited");
    }

    let stats = handle.stats();
    info!(
        thunks_executed = stats.thunks_executed,
        steps = stats.steps,
        callbacks_failed = stats.callbacks_failed,
        "worker loop exited"
    );

    *shared.exit.lock() = Some(outcome.clone());
    *shared.loop_thread.lock() = None;
    shared.running.store(false, Ordering::Release);
    shared.signal_ended.set();
    outcome
}

/// Run the hooks around the loop. `on_thread_stop` runs on every path,
/// including a panicking hook or engine.
fn drive(handle: &WorkerHandle, mut engine: Box<dyn StepEngine>) -> Result<()> {
    let hooks = &handle.shared.hooks;

    debug!("on_thread_start");
    let started = panic::catch_unwind(AssertUnwindSafe(|| hooks.on_thread_start(handle)))
        .map_err(|payload| panicked("on_thread_start", payload.as_ref()));

    let result = started.and_then(|()| {
        panic::catch_unwind(AssertUnwindSafe(|| {
            let result = run_loop(handle, engine.as_mut());
            if result.is_ok() {
                engine.cancel_all(handle);
            }
            result
        }))
        .unwrap_or_else(|payload| Err(panicked("worker thread", payload.as_ref())))
    });
    if let Err(err) = &result {
        error!(%err, "worker loop exited abnormally");
    }

    debug!("on_thread_stop");
    let stopped = panic::catch_unwind(AssertUnwindSafe(|| hooks.on_thread_stop(handle)));
    if let Err(payload) = stopped {
        let err = panicked("on_thread_stop", payload.as_ref());
        warn!(%err, "stop hook failed");
        return result.and(Err(err));
    }
    result
}

fn panicked(site: &str, payload: &(dyn std::any::Any + Send)) -> WorkerError {
    WorkerError::EngineStep(Status::internal(format!(
        "{} panicked: {}",
        site,
        panic_message(payload)
    )))
}

/// The scheduling loop proper
fn run_loop(handle: &WorkerHandle, engine: &mut dyn StepEngine) -> Result<()> {
    let shared = &handle.shared;
    let mut next: Vec<Thunk> = Vec::new();

    loop {
        transact(handle, engine, &mut next);

        let quantum_deadline = Deadline::after(shared.options.quantum);
        let deadline = engine
            .next_deadline()
            .map_or(quantum_deadline, |next| next.min(quantum_deadline));

        shared.steps.fetch_add(1, Ordering::Relaxed);
        engine
            .step(handle, deadline)
            .map_err(WorkerError::EngineStep)?;

        if shared.kill.load(Ordering::Acquire) {
            break;
        }
    }

    // Calls queued before the kill was observed still run exactly once.
    transact(handle, engine, &mut next);
    Ok(())
}

/// Swap the pending queue out and run every thunk in order
fn transact(handle: &WorkerHandle, engine: &mut dyn StepEngine, next: &mut Vec<Thunk>) {
    handle.shared.queue.swap_into(next);
    for thunk in next.drain(..) {
        let mut lp = Loop::new(&mut *engine, handle);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| thunk(&mut lp)));
        handle.shared.thunks_executed.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = outcome {
            handle.record_callback_failure();
            warn!(
                panic = %panic_message(payload.as_ref()),
                "cross-thread call panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistrationError;
    use std::sync::atomic::AtomicUsize;

    fn options(name: &str) -> WorkerOptions {
        WorkerOptions::new(name).with_quantum(Duration::from_millis(20))
    }

    #[test]
    fn test_worker_is_send_sync() {
        fn check<T: Send + Sync>() {}
        check::<Worker>();
        check::<WorkerHandle>();
    }

    #[test]
    fn test_worker_creation() {
        let worker = Worker::new(WorkerOptions::new("w0"));
        assert_eq!(worker.name(), "w0");
        assert_eq!(worker.options().quantum, DEFAULT_QUANTUM);
        assert!(worker.options().owned_thread);
        assert!(!worker.has_run());
        assert!(!worker.is_running());
        assert_eq!(worker.to_string(), "Worker(name='w0')");
    }

    #[test]
    fn test_worker_start_kill() {
        let worker = Worker::new(options("start-kill"));
        worker.start().unwrap();
        assert!(worker.has_run());

        worker.kill();
        worker.kill();
        worker.wait_for_shutdown().unwrap();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let worker = Worker::new(options("twice"));
        worker.start().unwrap();
        let err = worker.start().unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Precondition(PreconditionViolation::AlreadyRun)
        ));
        worker.kill();
        worker.wait_for_shutdown().unwrap();
    }

    #[test]
    fn test_concurrent_wait_joins_thread() {
        for _ in 0..20 {
            let worker = Arc::new(Worker::new(options("racing-wait")));
            // Killed up front so the loop exits as soon as it is spawned.
            worker.kill();

            let waiter = {
                let worker = Arc::clone(&worker);
                thread::spawn(move || {
                    while !worker.has_run() {
                        thread::yield_now();
                    }
                    worker.wait_for_shutdown()
                })
            };
            worker.start().unwrap();

            waiter.join().unwrap().unwrap();
            assert!(worker.thread.lock().is_none(), "loop thread was never joined");
            assert!(!worker.is_running());
        }
    }

    #[test]
    fn test_start_requires_owned_thread() {
        let worker = Worker::new(options("adopted").with_owned_thread(false));
        assert!(matches!(
            worker.start(),
            Err(WorkerError::Precondition(PreconditionViolation::NotOwnedThread))
        ));
        assert!(!worker.has_run());
    }

    #[test]
    fn test_run_on_current_thread_requires_adoption() {
        let worker = Worker::new(options("owned"));
        assert!(matches!(
            worker.run_on_current_thread(),
            Err(WorkerError::Precondition(PreconditionViolation::OwnedThread))
        ));
    }

    #[test]
    fn test_wait_for_shutdown_before_run() {
        let worker = Worker::new(options("idle"));
        worker.wait_for_shutdown().unwrap();
    }

    #[test]
    fn test_call_threadsafe_runs_on_loop_thread() {
        let worker = Worker::new(options("dispatch"));
        worker.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = worker.handle();
        worker.call_threadsafe(move || {
            tx.send(handle.is_loop_thread()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        worker.kill();
        worker.wait_for_shutdown().unwrap();
        assert_eq!(worker.stats().thunks_executed, 1);
    }

    #[test]
    fn test_hooks_run_on_loop_thread() {
        #[derive(Default)]
        struct Recorder {
            started: AtomicUsize,
            stopped: AtomicUsize,
        }
        impl WorkerHooks for Recorder {
            fn on_thread_start(&self, worker: &WorkerHandle) {
                assert!(worker.is_loop_thread());
                self.started.fetch_add(1, Ordering::SeqCst);
            }
            fn on_thread_stop(&self, worker: &WorkerHandle) {
                assert!(worker.is_loop_thread());
                self.stopped.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hooks = Arc::new(Recorder::default());
        let worker = Worker::with_hooks(options("hooks"), hooks.clone());
        worker.start().unwrap();
        worker.kill();
        worker.wait_for_shutdown().unwrap();
        assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_for_shutdown_from_loop_thread_is_rejected() {
        let worker = Arc::new(Worker::new(options("self-wait")));
        worker.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let inner = Arc::clone(&worker);
        worker.call_threadsafe(move || {
            let result = inner.wait_for_shutdown();
            tx.send(matches!(
                result,
                Err(WorkerError::Precondition(
                    PreconditionViolation::ShutdownFromLoopThread
                ))
            ))
            .unwrap();
            inner.kill();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        worker.wait_for_shutdown().unwrap();
    }

    #[test]
    fn test_calls_after_exit_are_dropped() {
        let worker = Worker::new(options("late"));
        worker.start().unwrap();
        worker.kill();
        worker.wait_for_shutdown().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        worker.call_threadsafe(move || flag.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(worker.stats().thunks_dropped, 1);
    }

    #[test]
    fn test_registration_after_cancel_fails() {
        let worker = Worker::new(options("aborted"));
        worker.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        worker.call_threadsafe_with(move |lp| {
            // Fires with Cancelled at shutdown and tries to re-register.
            lp.wait_until_low_level(Deadline::INFINITE_FUTURE, move |lp, status| {
                let again = lp.call(|_| {});
                tx.send((status.code(), again)).unwrap();
                Ok(())
            })
            .unwrap();
            lp.kill();
        });

        let (code, again) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, crate::error::StatusCode::Cancelled);
        assert_eq!(again, Err(RegistrationError::Aborted));
        worker.wait_for_shutdown().unwrap();
    }

    #[test]
    fn test_drop_kills_running_worker() {
        let worker = Worker::new(options("dropped"));
        worker.start().unwrap();
        let handle = worker.handle();
        drop(worker);
        assert!(!handle.is_running());
        assert!(handle.is_killed());
    }
}
