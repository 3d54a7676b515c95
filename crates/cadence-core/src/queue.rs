//! Cross-thread call queue
//!
//! Any thread appends; only the loop thread drains. The mutex is held for the
//! append or for swapping the whole buffer out, never while thunks execute.

use crate::engine::Loop;
use parking_lot::Mutex;

/// A deferred, owned unit of work executed once on the loop thread
pub type Thunk = Box<dyn for<'a> FnOnce(&mut Loop<'a>) + Send + 'static>;

struct Pending {
    thunks: Vec<Thunk>,
    closed: bool,
}

/// Mutex-guarded buffer of pending thunks
pub struct CallQueue {
    pending: Mutex<Pending>,
}

impl CallQueue {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                thunks: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Append a thunk.
    ///
    /// Ownership passes to the queue under the lock. Returns `false` (and
    /// drops the thunk) if the queue was closed.
    pub fn push(&self, thunk: Thunk) -> bool {
        let mut pending = self.pending.lock();
        if pending.closed {
            return false;
        }
        pending.thunks.push(thunk);
        true
    }

    /// Swap every pending thunk into `next`, preserving enqueue order.
    ///
    /// `next` must be empty; its allocation is handed back to the queue so
    /// the two buffers ping-pong without reallocating.
    pub fn swap_into(&self, next: &mut Vec<Thunk>) {
        debug_assert!(next.is_empty());
        let mut pending = self.pending.lock();
        std::mem::swap(&mut pending.thunks, next);
    }

    /// Number of thunks waiting
    pub fn len(&self) -> usize {
        self.pending.lock().thunks.len()
    }

    /// Whether no thunks are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further pushes and drop anything still queued.
    ///
    /// Returns how many thunks were discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.thunks)
        };
        // Drop outside the lock; a thunk's captures may run arbitrary Drop code.
        let count = discarded.len();
        drop(discarded);
        count
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }
}

impl Default for CallQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop() -> Thunk {
        Box::new(|_: &mut Loop<'_>| {})
    }

    #[test]
    fn test_swap_moves_everything() {
        let queue = CallQueue::new();
        for _ in 0..3 {
            assert!(queue.push(noop()));
        }
        assert_eq!(queue.len(), 3);

        let mut next = Vec::new();
        queue.swap_into(&mut next);
        assert!(queue.is_empty());
        assert_eq!(next.len(), 3);
    }

    #[test]
    fn test_swap_reuses_buffer() {
        let queue = CallQueue::new();
        queue.push(noop());
        let mut next = Vec::with_capacity(64);
        queue.swap_into(&mut next);
        assert_eq!(next.len(), 1);
        next.clear();
        queue.push(noop());
        let mut other = Vec::new();
        queue.swap_into(&mut other);
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_close_discards_and_rejects() {
        struct CountDrop(Arc<AtomicUsize>);
        impl Drop for CountDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let queue = CallQueue::new();
        for _ in 0..2 {
            let guard = CountDrop(Arc::clone(&drops));
            queue.push(Box::new(move |_: &mut Loop<'_>| drop(guard)));
        }
        assert_eq!(queue.close(), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(queue.is_closed());

        let guard = CountDrop(Arc::clone(&drops));
        assert!(!queue.push(Box::new(move |_: &mut Loop<'_>| drop(guard))));
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }
}
