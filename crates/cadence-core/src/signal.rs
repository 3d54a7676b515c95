//! Binary events and the wait-source contract
//!
//! An [`Event`] is the OS-level signal a worker uses to wake its loop and to
//! publish loop termination. A [`WaitSource`] is anything a step engine can
//! wait on; it notifies subscribed events when it becomes signaled.

use crate::error::Status;
use crate::time::Deadline;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// How an [`Event`] behaves once a waiter observes it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetMode {
    /// A successful wait consumes the signal
    Auto,
    /// Once set the event stays set
    Manual,
}

/// A binary signal backed by a mutex and condvar
#[derive(Debug)]
pub struct Event {
    set: Mutex<bool>,
    cond: Condvar,
    mode: ResetMode,
}

impl Event {
    /// Create an unset event
    pub fn new(mode: ResetMode) -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
            mode,
        }
    }

    /// Unset auto-reset event
    pub fn auto_reset() -> Self {
        Self::new(ResetMode::Auto)
    }

    /// Unset manual-reset event
    pub fn manual_reset() -> Self {
        Self::new(ResetMode::Manual)
    }

    /// Set the event and wake every waiter
    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    /// Whether the event is currently set
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Consume the signal if it is set, without blocking
    #[cfg(test)]
    pub(crate) fn try_take(&self) -> bool {
        let mut set = self.set.lock();
        self.observe(&mut set)
    }

    /// Block until the event is set
    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
        self.observe(&mut set);
    }

    /// Block until the event is set or `deadline` passes.
    ///
    /// Returns `true` if the event was observed set.
    pub fn wait_until(&self, deadline: Deadline) -> bool {
        let mut set = self.set.lock();
        match deadline.to_instant() {
            None => {
                while !*set {
                    self.cond.wait(&mut set);
                }
            }
            Some(instant) => {
                while !*set {
                    if self.cond.wait_until(&mut set, instant).timed_out() {
                        break;
                    }
                }
            }
        }
        self.observe(&mut set)
    }

    fn observe(&self, set: &mut bool) -> bool {
        let was_set = *set;
        if was_set && self.mode == ResetMode::Auto {
            *set = false;
        }
        was_set
    }
}

/// Observable state of a wait source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitState {
    /// Not yet signaled
    Pending,
    /// Signaled, carrying the outcome (`Status::ok()` on success)
    Signaled(Status),
}

/// A waitable completion condition consumable by a step engine.
///
/// Implementations must call [`Event::set`] on every subscribed event when
/// they transition to signaled, so a loop blocked in a step notices promptly.
pub trait WaitSource: Send + Sync {
    /// Current state
    fn query(&self) -> WaitState;

    /// Ask to be woken through `event` when the source becomes signaled.
    ///
    /// If the source is already signaled the event is set immediately.
    fn subscribe(&self, event: &Arc<Event>);

    /// Drop a subscription made with [`WaitSource::subscribe`]
    fn unsubscribe(&self, event: &Arc<Event>);
}
