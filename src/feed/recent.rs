//! Bounded window of recently seen creation mints.

use std::collections::{HashSet, VecDeque};

/// FIFO set of the last `capacity` keys; the oldest key is evicted first.
#[derive(Debug)]
pub struct RecentTokenSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentTokenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    /// Record `key`. Returns false if it was already in the window.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.members.contains(key) {
            return false;
        }

        self.order.push_back(key.to_string());
        self.members.insert(key.to_string());

        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
