//! Synchronous single-thread step engine
//!
//! Soon callbacks live in per-priority FIFO queues, timers in a min-heap
//! ordered by deadline then registration order, and wait-one registrations in
//! a list polled every pass. When nothing is ready the engine parks on the
//! worker's wake event until the nearest deadline.

use super::{invoke_guarded, EngineFactory, Loop, LoopCallback, Priority, StepEngine};
use crate::error::{RegistrationError, Status};
use crate::signal::{Event, WaitSource, WaitState};
use crate::time::{self, Deadline};
use crate::worker::WorkerHandle;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default cap on outstanding registrations
pub const DEFAULT_MAX_PENDING: usize = 65_536;

/// Capacity limits for a [`SyncLoop`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EngineLimits {
    /// Maximum outstanding registrations across all kinds
    pub max_pending: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// Timer entry (min-heap by deadline, FIFO among equal deadlines)
struct TimerEntry {
    deadline: Deadline,
    seq: u64,
    callback: LoopCallback,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse for min-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// A pending wait-one registration
struct WaitEntry {
    source: Arc<dyn WaitSource>,
    deadline: Deadline,
    callback: LoopCallback,
}

/// The default [`StepEngine`]
pub struct SyncLoop {
    limits: EngineLimits,
    wake: Arc<Event>,
    soon: [VecDeque<LoopCallback>; 3],
    timers: BinaryHeap<TimerEntry>,
    waits: Vec<WaitEntry>,
    next_seq: u64,
    aborted: bool,
}

impl SyncLoop {
    /// Create an engine that parks on `wake` when idle
    pub fn new(wake: Arc<Event>, limits: EngineLimits) -> Self {
        Self {
            limits,
            wake,
            soon: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            timers: BinaryHeap::new(),
            waits: Vec::new(),
            next_seq: 0,
            aborted: false,
        }
    }

    /// Factory installing a `SyncLoop` with `limits` into a worker
    pub fn factory(limits: EngineLimits) -> EngineFactory {
        Box::new(move |wake| Box::new(SyncLoop::new(wake, limits)) as Box<dyn StepEngine>)
    }

    fn admit(&self) -> Result<(), RegistrationError> {
        if self.aborted {
            return Err(RegistrationError::Aborted);
        }
        if self.pending() >= self.limits.max_pending {
            return Err(RegistrationError::ResourceExhausted {
                limit: self.limits.max_pending,
            });
        }
        Ok(())
    }

    fn soon_index(priority: Priority) -> usize {
        match priority {
            Priority::High => 0,
            Priority::Default => 1,
            Priority::Low => 2,
        }
    }

    /// Run everything ready right now. Returns how many callbacks ran.
    fn run_ready(&mut self, worker: &WorkerHandle) -> usize {
        let mut ran = 0;

        // Soon work registered by these callbacks waits for the next pass.
        let batch: Vec<LoopCallback> = self.soon.iter_mut().flat_map(|q| q.drain(..)).collect();
        for callback in batch {
            invoke_guarded(callback, &mut Loop::new(&mut *self, worker), Status::ok());
            ran += 1;
        }

        let now = time::now();
        while self
            .timers
            .peek()
            .is_some_and(|entry| entry.deadline.has_passed(now))
        {
            if let Some(entry) = self.timers.pop() {
                invoke_guarded(entry.callback, &mut Loop::new(&mut *self, worker), Status::ok());
                ran += 1;
            }
        }

        if !self.waits.is_empty() {
            let now = time::now();
            let mut fired = Vec::new();
            for entry in std::mem::take(&mut self.waits) {
                match entry.source.query() {
                    WaitState::Signaled(status) => fired.push((entry, status)),
                    WaitState::Pending if entry.deadline.has_passed(now) => {
                        fired.push((entry, Status::deadline_exceeded("wait source timed out")))
                    }
                    WaitState::Pending => self.waits.push(entry),
                }
            }
            for (entry, status) in fired {
                entry.source.unsubscribe(&self.wake);
                invoke_guarded(entry.callback, &mut Loop::new(&mut *self, worker), status);
                ran += 1;
            }
        }

        ran
    }

    fn has_soon_work(&self) -> bool {
        self.soon.iter().any(|q| !q.is_empty())
    }
}

impl StepEngine for SyncLoop {
    fn call(
        &mut self,
        callback: LoopCallback,
        priority: Priority,
    ) -> Result<(), RegistrationError> {
        self.admit()?;
        self.soon[Self::soon_index(priority)].push_back(callback);
        Ok(())
    }

    fn wait_until(
        &mut self,
        deadline: Deadline,
        callback: LoopCallback,
    ) -> Result<(), RegistrationError> {
        self.admit()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        trace!(deadline_ns = deadline.as_nanos(), seq, "timer registered");
        self.timers.push(TimerEntry {
            deadline,
            seq,
            callback,
        });
        Ok(())
    }

    fn wait_one(
        &mut self,
        source: Arc<dyn WaitSource>,
        deadline: Deadline,
        callback: LoopCallback,
    ) -> Result<(), RegistrationError> {
        self.admit()?;
        source.subscribe(&self.wake);
        self.waits.push(WaitEntry {
            source,
            deadline,
            callback,
        });
        Ok(())
    }

    fn next_deadline(&self) -> Option<Deadline> {
        let timer = self.timers.peek().map(|entry| entry.deadline);
        let wait = self
            .waits
            .iter()
            .map(|entry| entry.deadline)
            .filter(|deadline| !deadline.is_infinite())
            .min();
        match (timer, wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn step(&mut self, worker: &WorkerHandle, deadline: Deadline) -> Result<(), Status> {
        let mut woken = false;
        loop {
            loop {
                let ran = self.run_ready(worker);
                if ran == 0 || deadline.has_passed(time::now()) || self.wake.is_set() {
                    break;
                }
            }

            if woken || deadline.has_passed(time::now()) {
                return Ok(());
            }

            // Soon work left behind by a wake-interrupted pass must not sleep.
            let park_until = if self.has_soon_work() {
                Deadline::INFINITE_PAST
            } else {
                self.next_deadline()
                    .map_or(deadline, |next| next.min(deadline))
            };
            trace!(
                park_us = park_until.remaining(time::now()).as_micros() as u64,
                "parking"
            );
            woken = self.wake.wait_until(park_until);
        }
    }

    fn cancel_all(&mut self, worker: &WorkerHandle) {
        self.aborted = true;
        let mut cancelled = 0usize;

        while self.pending() > 0 {
            let soon: Vec<LoopCallback> =
                self.soon.iter_mut().flat_map(|q| q.drain(..)).collect();
            let mut timers = Vec::with_capacity(self.timers.len());
            while let Some(entry) = self.timers.pop() {
                timers.push(entry.callback);
            }
            let waits = std::mem::take(&mut self.waits);

            for callback in soon.into_iter().chain(timers) {
                invoke_guarded(
                    callback,
                    &mut Loop::new(&mut *self, worker),
                    Status::cancelled("worker is shutting down"),
                );
                cancelled += 1;
            }
            for entry in waits {
                entry.source.unsubscribe(&self.wake);
                invoke_guarded(
                    entry.callback,
                    &mut Loop::new(&mut *self, worker),
                    Status::cancelled("worker is shutting down"),
                );
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            debug!(worker = %worker.name(), cancelled, "cancelled outstanding registrations");
        }
    }

    fn pending(&self) -> usize {
        self.soon.iter().map(VecDeque::len).sum::<usize>() + self.timers.len() + self.waits.len()
    }
}

impl Drop for SyncLoop {
    fn drop(&mut self) {
        // Waits left behind by a skipped cancel_all still hold our wake event.
        for entry in std::mem::take(&mut self.waits) {
            entry.source.unsubscribe(&self.wake);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionSignal;
    use crate::error::StatusCode;
    use crate::time::Timeout;
    use crate::worker::{Worker, WorkerOptions};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn setup(max_pending: usize) -> (Worker, SyncLoop) {
        let worker = Worker::new(WorkerOptions::new("engine-test"));
        let engine = SyncLoop::new(Arc::new(Event::auto_reset()), EngineLimits { max_pending });
        (worker, engine)
    }

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn step_once(engine: &mut SyncLoop, worker: &Worker) {
        engine
            .step(&worker.handle(), Deadline::INFINITE_PAST)
            .unwrap();
    }

    #[test]
    fn test_soon_callbacks_run_in_priority_order() {
        let (worker, mut engine) = setup(16);
        let log = recorder();
        for (name, priority) in [
            ("low", Priority::Low),
            ("default-1", Priority::Default),
            ("high", Priority::High),
            ("default-2", Priority::Default),
        ] {
            let log = Arc::clone(&log);
            engine
                .call(
                    Box::new(move |_: &mut Loop<'_>, status: Status| {
                        assert!(status.is_ok());
                        log.lock().push(name.to_string());
                        Ok(())
                    }),
                    priority,
                )
                .unwrap();
        }

        step_once(&mut engine, &worker);
        assert_eq!(
            *log.lock(),
            vec!["high", "default-1", "default-2", "low"]
        );
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let (worker, mut engine) = setup(16);
        let log = recorder();
        let base = time::now();
        for (name, offset_ms) in [("late", 2u64), ("early", 1), ("early-2", 1)] {
            let log = Arc::clone(&log);
            let deadline = Deadline::from_nanos(base + offset_ms * 1_000_000);
            engine
                .wait_until(
                    deadline,
                    Box::new(move |lp: &mut Loop<'_>, _status: Status| {
                        assert!(lp.now() >= deadline.as_nanos());
                        log.lock().push(name.to_string());
                        Ok(())
                    }),
                )
                .unwrap();
        }
        assert_eq!(
            engine.next_deadline(),
            Some(Deadline::from_nanos(base + 1_000_000))
        );

        engine
            .step(&worker.handle(), Deadline::after(Duration::from_millis(50)))
            .unwrap();
        let fired = log.lock().clone();
        assert_eq!(fired, vec!["early", "early-2", "late"]);
    }

    #[test]
    fn test_step_returns_at_deadline_when_idle() {
        let (worker, mut engine) = setup(16);
        let start = std::time::Instant::now();
        engine
            .step(&worker.handle(), Deadline::after(Duration::from_millis(20)))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wake_interrupts_idle_step() {
        let wake = Arc::new(Event::auto_reset());
        let mut engine = SyncLoop::new(Arc::clone(&wake), EngineLimits::default());
        let worker = Worker::new(WorkerOptions::new("wake"));

        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            wake.set();
        });
        let start = std::time::Instant::now();
        engine
            .step(&worker.handle(), Deadline::after(Duration::from_secs(10)))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    #[test]
    fn test_wait_one_on_signaled_source_fires() {
        let (worker, mut engine) = setup(16);
        let signal = CompletionSignal::new();
        signal.set();

        let seen = Arc::new(Mutex::new(None));
        let out = Arc::clone(&seen);
        engine
            .wait_one(
                signal.wait_source(),
                Timeout::Infinite.to_deadline(),
                Box::new(move |_: &mut Loop<'_>, status: Status| {
                    *out.lock() = Some(status.code());
                    Ok(())
                }),
            )
            .unwrap();

        step_once(&mut engine, &worker);
        assert_eq!(*seen.lock(), Some(StatusCode::Ok));
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_wait_one_times_out() {
        let (worker, mut engine) = setup(16);
        let signal = CompletionSignal::new();
        let seen = Arc::new(Mutex::new(None));
        let out = Arc::clone(&seen);
        engine
            .wait_one(
                signal.wait_source(),
                Deadline::after(Duration::from_millis(5)),
                Box::new(move |_: &mut Loop<'_>, status: Status| {
                    *out.lock() = Some(status.code());
                    Ok(())
                }),
            )
            .unwrap();

        engine
            .step(&worker.handle(), Deadline::after(Duration::from_millis(200)))
            .unwrap();
        assert_eq!(*seen.lock(), Some(StatusCode::DeadlineExceeded));

        // A late signal must not reach the already-fired registration.
        signal.set();
        step_once(&mut engine, &worker);
        assert_eq!(*seen.lock(), Some(StatusCode::DeadlineExceeded));
    }

    #[test]
    fn test_wait_one_carries_failure() {
        let (worker, mut engine) = setup(16);
        let signal = CompletionSignal::new();
        let seen = Arc::new(Mutex::new(None));
        let out = Arc::clone(&seen);
        engine
            .wait_one(
                signal.wait_source(),
                Deadline::INFINITE_FUTURE,
                Box::new(move |_: &mut Loop<'_>, status: Status| {
                    *out.lock() = Some(status);
                    Ok(())
                }),
            )
            .unwrap();

        step_once(&mut engine, &worker);
        assert!(seen.lock().is_none());

        signal.fail(Status::unknown("child failed"));
        step_once(&mut engine, &worker);
        assert_eq!(*seen.lock(), Some(Status::unknown("child failed")));
    }

    #[test]
    fn test_drop_releases_wait_subscriptions() {
        let wake = Arc::new(Event::auto_reset());
        let mut engine = SyncLoop::new(Arc::clone(&wake), EngineLimits::default());
        let signal = CompletionSignal::new();
        engine
            .wait_one(
                signal.wait_source(),
                Deadline::INFINITE_FUTURE,
                Box::new(|_: &mut Loop<'_>, _: Status| Ok(())),
            )
            .unwrap();
        assert_eq!(Arc::strong_count(&wake), 3);

        drop(engine);
        assert_eq!(Arc::strong_count(&wake), 1);
        signal.set();
        assert!(!wake.try_take());
    }

    #[test]
    fn test_resource_exhausted() {
        let (_worker, mut engine) = setup(2);
        for _ in 0..2 {
            engine
                .call(Box::new(|_: &mut Loop<'_>, _: Status| Ok(())), Priority::Default)
                .unwrap();
        }
        let err = engine
            .wait_until(Deadline::INFINITE_FUTURE, Box::new(|_: &mut Loop<'_>, _: Status| Ok(())))
            .unwrap_err();
        assert_eq!(err, RegistrationError::ResourceExhausted { limit: 2 });
    }

    #[test]
    fn test_callback_can_reregister() {
        let (worker, mut engine) = setup(16);
        let count = Arc::new(Mutex::new(0u32));
        let outer = Arc::clone(&count);
        engine
            .call(
                Box::new(move |lp: &mut Loop<'_>, _: Status| {
                    *outer.lock() += 1;
                    let inner = Arc::clone(&outer);
                    lp.call(move |_| *inner.lock() += 1)?;
                    Ok(())
                }),
                Priority::Default,
            )
            .unwrap();

        step_once(&mut engine, &worker);
        step_once(&mut engine, &worker);
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let (worker, mut engine) = setup(16);
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        engine
            .call(Box::new(|_: &mut Loop<'_>, _: Status| -> Result<(), Status> { panic!("boom") }), Priority::Default)
            .unwrap();
        engine
            .call(
                Box::new(move |_: &mut Loop<'_>, _: Status| {
                    *flag.lock() = true;
                    Ok(())
                }),
                Priority::Default,
            )
            .unwrap();

        step_once(&mut engine, &worker);
        assert!(*ran.lock());
        assert_eq!(worker.stats().callbacks_failed, 1);
    }

    #[test]
    fn test_cancel_all_fires_everything_once() {
        let (worker, mut engine) = setup(16);
        let codes = Arc::new(Mutex::new(Vec::new()));
        let signal = CompletionSignal::new();

        let out = Arc::clone(&codes);
        engine
            .call(
                Box::new(move |_: &mut Loop<'_>, s: Status| {
                    out.lock().push(s.code());
                    Ok(())
                }),
                Priority::Default,
            )
            .unwrap();
        let out = Arc::clone(&codes);
        engine
            .wait_until(
                Deadline::INFINITE_FUTURE,
                Box::new(move |_: &mut Loop<'_>, s: Status| {
                    out.lock().push(s.code());
                    Ok(())
                }),
            )
            .unwrap();
        let out = Arc::clone(&codes);
        engine
            .wait_one(
                signal.wait_source(),
                Deadline::INFINITE_FUTURE,
                Box::new(move |_: &mut Loop<'_>, s: Status| {
                    out.lock().push(s.code());
                    Ok(())
                }),
            )
            .unwrap();

        engine.cancel_all(&worker.handle());
        assert_eq!(*codes.lock(), vec![StatusCode::Cancelled; 3]);
        assert_eq!(engine.pending(), 0);
        assert_eq!(
            engine.call(Box::new(|_: &mut Loop<'_>, _: Status| Ok(())), Priority::High),
            Err(RegistrationError::Aborted)
        );
        // Cancelled callbacks handing the status back are not failures.
        assert_eq!(worker.stats().callbacks_failed, 0);
    }
}
