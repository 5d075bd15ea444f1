//! FIFO send queue with at most one send in flight

use std::collections::VecDeque;

/// Ordered queue of outgoing items.
///
/// The item handed out by `submit` or `complete` is "in flight" until the
/// next `complete`; while one is in flight, new items wait at the tail.
#[derive(Debug)]
pub struct SendQueue<T> {
    pending: VecDeque<T>,
    sending: bool,
}

impl<T> SendQueue<T> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            sending: false,
        }
    }

    /// Enqueue an item. Returns the item to dispatch now if nothing was in
    /// flight, which then becomes the in-flight item.
    pub fn submit(&mut self, item: T) -> Option<T> {
        self.pending.push_back(item);
        if self.sending {
            return None;
        }
        let next = self.pending.pop_front();
        self.sending = next.is_some();
        next
    }

    /// Mark the in-flight item as sent. Returns the next item to dispatch,
    /// or `None` once the queue is idle.
    pub fn complete(&mut self) -> Option<T> {
        if !self.sending {
            return None;
        }
        let next = self.pending.pop_front();
        self.sending = next.is_some();
        next
    }

    /// Forget the in-flight item without dispatching another
    pub fn abort_in_flight(&mut self) {
        self.sending = false;
    }

    /// Remove queued items matching `predicate`, returning how many were removed
    pub fn remove_where(&mut self, predicate: impl Fn(&T) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|item| !predicate(item));
        before - self.pending.len()
    }

    /// Drop everything and go idle
    pub fn clear(&mut self) {
        self.pending.clear();
        self.sending = false;
    }

    /// Number of items waiting behind the in-flight one
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.pending.iter()
    }
}

impl<T> Default for SendQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
