//! FIFO wait queue with O(1) removal and deadline tracking.

use crate::backend::BackendId;
use crate::error::UpstreamError;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Opaque per-request handle supplied by the caller.
///
/// The core never interprets the value; it only needs handles to be unique
/// among live requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a tracked request currently lives.
///
/// Queue membership is part of the waiter's state rather than a nullable link
/// field; a waiter in a terminal state is removed from the table entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaiterState {
    /// Linked into the wait queue between its two neighbors.
    Queued {
        prev: Option<RequestId>,
        next: Option<RequestId>,
    },
    /// Popped from the queue, between dispatch and backend assignment.
    Detached,
    /// Holding a slot on a backend.
    Assigned { backend: BackendId },
}

/// Book-keeping for one request from arrival to teardown.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) enqueued_at: Instant,
    pub(crate) force_assign: bool,
    pub(crate) state: WaiterState,
}

/// FIFO of pending requests plus the table of all live waiters.
///
/// The list is intrusive: each queued waiter stores its neighbors' handles, so
/// unlinking an arbitrary waiter is O(1). The head deadline is derived from
/// the oldest waiter's arrival time, which keeps it armed exactly while the
/// queue is non-empty.
pub(crate) struct WaitQueue {
    waiters: HashMap<RequestId, Waiter>,
    head: Option<RequestId>,
    tail: Option<RequestId>,
    len: usize,
    max_queue_length: usize,
    queue_timeout: Duration,
}

impl WaitQueue {
    pub(crate) fn new(max_queue_length: usize, queue_timeout: Duration) -> Self {
        Self {
            waiters: HashMap::new(),
            head: None,
            tail: None,
            len: 0,
            max_queue_length,
            queue_timeout,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn get(&self, id: RequestId) -> Option<&Waiter> {
        self.waiters.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut Waiter> {
        self.waiters.get_mut(&id)
    }

    /// Admits a new waiter at the back of the queue.
    ///
    /// Refuses with `QueueFull` when the queue is at capacity, leaving all
    /// state untouched.
    pub(crate) fn push_back(&mut self, id: RequestId, now: Instant) -> Result<(), UpstreamError> {
        if self.len >= self.max_queue_length {
            return Err(UpstreamError::QueueFull {
                max_queue_length: self.max_queue_length,
            });
        }
        debug_assert!(!self.waiters.contains_key(&id), "duplicate request handle");
        let waiter = Waiter {
            enqueued_at: now,
            force_assign: false,
            state: WaiterState::Queued {
                prev: self.tail,
                next: None,
            },
        };
        if let Some(tail) = self.tail {
            self.set_next(tail, Some(id));
        } else {
            self.head = Some(id);
        }
        self.tail = Some(id);
        self.waiters.insert(id, waiter);
        self.len += 1;
        Ok(())
    }

    /// Re-inserts a detached waiter at the front of the queue.
    ///
    /// The waiter keeps its original arrival time, so it stays senior to every
    /// later arrival and its deadline is unchanged. Used for the failure-retry
    /// path; re-insertion of an already-admitted request is never refused.
    pub(crate) fn push_front(&mut self, id: RequestId) {
        let old_head = self.head;
        let Some(waiter) = self.waiters.get_mut(&id) else {
            debug_assert!(false, "push_front for unknown request");
            return;
        };
        debug_assert_eq!(waiter.state, WaiterState::Detached);
        waiter.state = WaiterState::Queued {
            prev: None,
            next: old_head,
        };
        if let Some(head) = old_head {
            self.set_prev(head, Some(id));
        } else {
            self.tail = Some(id);
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// The oldest waiter, without side effects.
    pub(crate) fn peek_oldest(&self) -> Option<(RequestId, &Waiter)> {
        let id = self.head?;
        self.waiters.get(&id).map(|waiter| (id, waiter))
    }

    /// Removes and returns the oldest waiter, leaving it detached.
    pub(crate) fn pop_oldest(&mut self) -> Option<RequestId> {
        let id = self.head?;
        self.unlink(id);
        Some(id)
    }

    /// Unlinks a waiter if it is queued. Idempotent: returns whether the
    /// waiter was present in the queue.
    pub(crate) fn remove(&mut self, id: RequestId) -> bool {
        match self.waiters.get(&id) {
            Some(waiter) if matches!(waiter.state, WaiterState::Queued { .. }) => {
                self.unlink(id);
                true
            }
            _ => false,
        }
    }

    /// Drops a waiter from the table entirely (terminal state).
    pub(crate) fn discard(&mut self, id: RequestId) -> Option<Waiter> {
        self.remove(id);
        self.waiters.remove(&id)
    }

    /// Absolute deadline of the queue head. `Some` exactly while the queue is
    /// non-empty.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        let id = self.head?;
        self.waiters
            .get(&id)
            .map(|waiter| waiter.enqueued_at + self.queue_timeout)
    }

    /// Pops every waiter whose deadline has passed, oldest first.
    pub(crate) fn expire_overdue(&mut self, now: Instant) -> Vec<RequestId> {
        let mut expired = Vec::new();
        while let Some(deadline) = self.deadline() {
            if deadline > now {
                break;
            }
            match self.pop_oldest() {
                Some(id) => expired.push(id),
                None => break,
            }
        }
        expired
    }

    /// Number of waiters tracked in any state.
    #[cfg(debug_assertions)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Number of waiters currently holding a backend slot.
    pub(crate) fn assigned_count(&self) -> usize {
        self.waiters
            .values()
            .filter(|waiter| matches!(waiter.state, WaiterState::Assigned { .. }))
            .count()
    }

    fn unlink(&mut self, id: RequestId) {
        let Some(waiter) = self.waiters.get_mut(&id) else {
            return;
        };
        let WaiterState::Queued { prev, next } = waiter.state else {
            return;
        };
        waiter.state = WaiterState::Detached;
        match prev {
            Some(prev) => self.set_next(prev, next),
            None => self.head = next,
        }
        match next {
            Some(next) => self.set_prev(next, prev),
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    fn set_next(&mut self, id: RequestId, new_next: Option<RequestId>) {
        if let Some(waiter) = self.waiters.get_mut(&id) {
            if let WaiterState::Queued { next, .. } = &mut waiter.state {
                *next = new_next;
            }
        }
    }

    fn set_prev(&mut self, id: RequestId, new_prev: Option<RequestId>) {
        if let Some(waiter) = self.waiters.get_mut(&id) {
            if let WaiterState::Queued { prev, .. } = &mut waiter.state {
                *prev = new_prev;
            }
        }
    }

    /// Walks the list and checks it against the incremental book-keeping.
    #[cfg(debug_assertions)]
    pub(crate) fn check_links(&self) {
        let mut count = 0;
        let mut cursor = self.head;
        let mut prev: Option<RequestId> = None;
        let mut last_enqueued: Option<Instant> = None;
        while let Some(id) = cursor {
            let waiter = &self.waiters[&id];
            let WaiterState::Queued {
                prev: stored_prev,
                next,
            } = waiter.state
            else {
                panic!("linked waiter {id} is not queued");
            };
            assert_eq!(stored_prev, prev, "broken prev link at {id}");
            if let Some(last) = last_enqueued {
                assert!(last <= waiter.enqueued_at, "queue order not FIFO at {id}");
            }
            last_enqueued = Some(waiter.enqueued_at);
            prev = Some(id);
            cursor = next;
            count += 1;
        }
        assert_eq!(prev, self.tail, "tail does not match last node");
        assert_eq!(count, self.len, "queue_length out of sync with node count");
    }
}
