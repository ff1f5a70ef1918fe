//! Expiry Index
//!
//! A min-heap of `(deadline, key)` records. One record is pushed for every
//! write that sets a deadline. Records are never removed by key: when a key is
//! deleted, overwritten, or already reaped, its record simply goes stale and is
//! discarded when it reaches the top of the heap.
//!
//! The heap therefore over-reports but never under-reports. The store is the
//! only authority on whether a popped key is actually due.

use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Default)]
pub struct ExpiryIndex {
    heap: BinaryHeap<Reverse<(u64, Bytes)>>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a deadline for `key`. O(log n).
    pub fn schedule(&mut self, deadline: u64, key: Bytes) {
        self.heap.push(Reverse((deadline, key)));
    }

    /// The key with the smallest deadline, if that deadline is `<= now`. O(1).
    pub fn peek_due(&self, now: u64) -> Option<&Bytes> {
        match self.heap.peek() {
            Some(Reverse((deadline, key))) if *deadline <= now => Some(key),
            _ => None,
        }
    }

    /// Pops the smallest record only if it is due. O(log n).
    pub fn pop_due(&mut self, now: u64) -> Option<Bytes> {
        self.peek_due(now)?;
        self.heap.pop().map(|Reverse((_, key))| key)
    }

    /// The smallest deadline in the heap, due or not. May belong to a stale record.
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
