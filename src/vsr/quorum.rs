//! Vote counting for the primary and for view changes.
//!
//! Votes are kept in a `u64` bitset, which caps a cluster at 64 replicas.
//! Cluster configuration is validated against [`MAX_CLUSTER_SIZE`] before
//! any replica starts.

use std::collections::BTreeMap;

pub const MAX_CLUSTER_SIZE: u32 = 64;

/// Set of replica ids; bit `n` stands for replica `n`.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ReplicaSet(u64);

impl ReplicaSet {
    #[inline]
    pub fn add(&mut self, replica: u32) {
        debug_assert!(replica < MAX_CLUSTER_SIZE);
        self.0 |= 1 << replica;
    }

    #[inline]
    pub fn has(&self, replica: u32) -> bool {
        replica < MAX_CLUSTER_SIZE && self.0 & (1 << replica) != 0
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Majority of `cluster_size`.
#[inline]
pub fn quorum_size(cluster_size: u32) -> u32 {
    cluster_size / 2 + 1
}

/// Which replicas hold each uncommitted log index.
///
/// The primary's own append counts as a vote. An index is committable once
/// it and every index below it are held by a majority.
#[derive(Debug)]
pub struct QuorumTracker {
    majority: u32,
    local: u32,
    holders: BTreeMap<u64, ReplicaSet>,
}

impl QuorumTracker {
    /// # Panics
    /// If `cluster_size` exceeds [`MAX_CLUSTER_SIZE`] or `local` is not a
    /// member of the cluster.
    pub fn new(cluster_size: u32, local: u32) -> Self {
        assert!(cluster_size <= MAX_CLUSTER_SIZE, "cluster of {} replicas is too large", cluster_size);
        assert!(local < cluster_size, "replica {} outside a cluster of {}", local, cluster_size);
        QuorumTracker {
            majority: quorum_size(cluster_size),
            local,
            holders: BTreeMap::new(),
        }
    }

    pub fn record_local_write(&mut self, index: u64) {
        self.holders.entry(index).or_default().add(self.local);
    }

    /// Count `replica` as holding `index`. Returns true once a majority does.
    pub fn record_prepare_ok(&mut self, index: u64, replica: u32) -> bool {
        let holders = self.holders.entry(index).or_default();
        holders.add(replica);
        holders.len() >= self.majority
    }

    pub fn has_quorum(&self, index: u64) -> bool {
        self.vote_count(index) >= self.majority
    }

    /// Highest index reachable from `committed` through consecutive indices
    /// that each have a majority. `committed` itself when there is none.
    pub fn committable_index_from(&self, committed: Option<u64>) -> Option<u64> {
        let first = committed.map_or(0, |c| c + 1);
        (first..)
            .take_while(|&index| self.has_quorum(index))
            .last()
            .or(committed)
    }

    /// Drop indices at or below the commit point.
    pub fn gc(&mut self, committed: u64) {
        self.holders = self.holders.split_off(&(committed + 1));
    }

    pub fn vote_count(&self, index: u64) -> u32 {
        self.holders.get(&index).map_or(0, ReplicaSet::len)
    }

    pub fn quorum_size(&self) -> u32 {
        self.majority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_sizes() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn test_replica_set() {
        let mut set = ReplicaSet::default();
        assert!(set.is_empty());
        set.add(0);
        set.add(63);
        set.add(0);
        assert_eq!(set.len(), 2);
        assert!(set.has(63));
        assert!(!set.has(1));
    }

    #[test]
    fn test_commit_waits_for_every_earlier_index() {
        let mut votes = QuorumTracker::new(3, 0);
        (0..3).for_each(|i| votes.record_local_write(i));

        assert!(votes.record_prepare_ok(2, 2));
        assert_eq!(votes.committable_index_from(None), None);

        votes.record_prepare_ok(0, 1);
        assert_eq!(votes.committable_index_from(None), Some(0));

        votes.record_prepare_ok(1, 1);
        assert_eq!(votes.committable_index_from(None), Some(2));
        assert_eq!(votes.committable_index_from(Some(0)), Some(2));
        assert_eq!(votes.committable_index_from(Some(2)), Some(2));
    }

    #[test]
    fn test_lone_replica_is_its_own_majority() {
        let mut votes = QuorumTracker::new(1, 0);
        votes.record_local_write(0);
        assert_eq!(votes.committable_index_from(None), Some(0));
    }

    #[test]
    fn test_repeated_ack_counts_once_and_gc_forgets() {
        let mut votes = QuorumTracker::new(5, 4);
        votes.record_local_write(7);
        votes.record_prepare_ok(7, 1);
        votes.record_prepare_ok(7, 1);
        assert_eq!(votes.vote_count(7), 2);
        assert!(votes.record_prepare_ok(7, 3));

        votes.record_local_write(8);
        votes.gc(7);
        assert_eq!(votes.vote_count(7), 0);
        assert_eq!(votes.vote_count(8), 1);
    }
}
