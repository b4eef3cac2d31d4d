/// Vector clock for tracking causal order between peers
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::PeerId;

/// How two vector clocks relate in the causal partial order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Equal,
    /// Left happened before right
    Before,
    /// Right happened before left
    After,
    Concurrent,
}

/// Per-peer logical counters
///
/// A peer only ever increments its own entry; remote knowledge arrives
/// through `merge`. Missing entries read as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<PeerId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clocks: BTreeMap::new(),
        }
    }

    /// Increment the entry for `peer` and return its new value
    pub fn increment(&mut self, peer: &PeerId) -> u64 {
        let entry = self.clocks.entry(peer.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Get the current value for a peer
    pub fn get(&self, peer: &PeerId) -> u64 {
        self.clocks.get(peer).copied().unwrap_or(0)
    }

    /// Merge with another vector clock (pointwise max)
    pub fn merge(&mut self, other: &VectorClock) {
        for (peer, &count) in &other.clocks {
            let current = self.clocks.entry(peer.clone()).or_insert(0);
            *current = (*current).max(count);
        }
    }

    /// Pointwise max of two clocks without touching either
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let peers: BTreeSet<_> = self.clocks.keys().chain(other.clocks.keys()).collect();

        let mut less = false;
        let mut greater = false;

        for peer in peers {
            let self_val = self.get(peer);
            let other_val = other.get(peer);

            if self_val < other_val {
                less = true;
            }
            if self_val > other_val {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True iff neither clock causally precedes the other
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// Check if this clock happened strictly before another
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, u64)> {
        self.clocks.iter().map(|(peer, &count)| (peer, count))
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.clocks.clear();
    }
}

impl FromIterator<(PeerId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (PeerId, u64)>>(iter: I) -> Self {
        Self {
            clocks: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries
            .iter()
            .map(|(peer, count)| (PeerId::from(*peer), *count))
            .collect()
    }

    #[test]
    fn test_increment_is_monotonic() {
        let peer = PeerId::from("a");
        let mut vc = VectorClock::new();

        let mut last = 0;
        for _ in 0..5 {
            let next = vc.increment(&peer);
            assert!(next > last);
            last = next;
        }
        assert_eq!(vc.get(&peer), 5);
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let mut vc = clock(&[("a", 3), ("b", 1)]);
        vc.merge(&clock(&[("b", 4), ("c", 2)]));

        assert_eq!(vc, clock(&[("a", 3), ("b", 4), ("c", 2)]));
    }

    #[test]
    fn test_merge_idempotent_and_commutative() {
        let a = clock(&[("a", 3), ("b", 1)]);
        let b = clock(&[("b", 4), ("c", 2)]);

        let ab = a.merged(&b);
        assert_eq!(ab.merged(&b), ab);
        assert_eq!(ab, b.merged(&a));
    }

    #[test]
    fn test_concurrency_is_symmetric() {
        let a = clock(&[("a", 3)]);
        let b = clock(&[("b", 2)]);
        let c = clock(&[("a", 3), ("b", 2)]);

        assert!(a.is_concurrent_with(&b));
        assert!(b.is_concurrent_with(&a));
        assert!(!a.is_concurrent_with(&c));
        assert!(!c.is_concurrent_with(&a));
    }

    #[test]
    fn test_compare_orders() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 1), ("b", 1)]);

        assert_eq!(a.compare(&a.clone()), CausalOrder::Equal);
        assert_eq!(a.compare(&b), CausalOrder::Before);
        assert_eq!(b.compare(&a), CausalOrder::After);
        assert!(a.happened_before(&b));
        assert!(!b.happened_before(&a));
    }

    #[test]
    fn test_missing_entries_count_as_zero() {
        let empty = VectorClock::new();
        let zero = clock(&[("a", 0)]);
        assert_eq!(empty.compare(&zero), CausalOrder::Equal);
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let json = serde_json::to_value(clock(&[("a", 2)])).unwrap();
        assert_eq!(json, serde_json::json!({ "a": 2 }));
    }
}
