//! PriorityTokenQueue - token addresses ranked by market cap.
//!
//! Addresses live in rank buckets keyed by their market cap value. Each
//! address is in at most one bucket, and empty buckets are removed at once.
//! Writers are serialized by a mutex; the size is mirrored in an atomic so
//! `len` never waits on a writer.

use crate::types::Pubkey;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Market cap with a total order, usable as a map key.
#[derive(Debug, Clone, Copy)]
struct Rank(f64);

impl PartialEq for Rank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Rank {}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct Buckets {
    by_rank: BTreeMap<Rank, HashSet<Pubkey>>,
    rank_of: HashMap<Pubkey, Rank>,
}

impl Buckets {
    fn detach(&mut self, address: &str, rank: Rank) {
        if let Some(bucket) = self.by_rank.get_mut(&rank) {
            bucket.remove(address);
            if bucket.is_empty() {
                self.by_rank.remove(&rank);
            }
        }
    }
}

/// Thread-safe max-priority structure over token addresses.
#[derive(Debug, Default)]
pub struct PriorityTokenQueue {
    buckets: Mutex<Buckets>,
    len: AtomicUsize,
}

impl PriorityTokenQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `address` with `market_cap`, moving it if already queued.
    pub fn upsert(&self, address: &str, market_cap: f64) {
        let rank = Rank(market_cap);
        let mut buckets = self.buckets.lock();

        match buckets.rank_of.insert(address.to_string(), rank) {
            Some(previous) if previous == rank => return,
            Some(previous) => buckets.detach(address, previous),
            None => {
                self.len.fetch_add(1, AtomicOrdering::Release);
            }
        }

        buckets
            .by_rank
            .entry(rank)
            .or_default()
            .insert(address.to_string());
    }

    /// Remove and return an address from the highest bucket.
    ///
    /// Which address is returned among equal market caps is unspecified.
    pub fn try_take_highest(&self) -> Option<Pubkey> {
        let mut buckets = self.buckets.lock();

        let mut entry = buckets.by_rank.last_entry()?;
        let address = entry.get().iter().next().cloned()?;
        entry.get_mut().remove(&address);
        if entry.get().is_empty() {
            entry.remove();
        }

        buckets.rank_of.remove(&address);
        self.len.fetch_sub(1, AtomicOrdering::Release);
        Some(address)
    }

    /// Market cap an address is currently ranked by.
    #[cfg(test)]
    pub fn market_cap_of(&self, address: &str) -> Option<f64> {
        self.buckets.lock().rank_of.get(address).map(|rank| rank.0)
    }

    /// Number of queued addresses. May briefly lag a concurrent writer.
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().by_rank.len()
    }

    #[cfg(test)]
    fn has_empty_bucket(&self) -> bool {
        self.buckets.lock().by_rank.values().any(HashSet::is_empty)
    }
}
