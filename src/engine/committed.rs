use std::sync::atomic::{AtomicU64, Ordering};

/// Commit point shared between a replica thread and its observers.
///
/// The replica stores with Release, observers load with Acquire.
/// `u64::MAX` encodes "nothing committed yet".
#[derive(Debug)]
pub struct CommittedState {
    committed_index: AtomicU64,
    applied_index: AtomicU64,
}

impl CommittedState {
    pub fn new() -> Self {
        CommittedState {
            committed_index: AtomicU64::new(u64::MAX),
            applied_index: AtomicU64::new(u64::MAX),
        }
    }

    #[inline]
    fn decode(raw: u64) -> Option<u64> {
        if raw == u64::MAX {
            None
        } else {
            Some(raw)
        }
    }

    /// Highest index known to be durable on a quorum.
    #[inline]
    pub fn committed_index(&self) -> Option<u64> {
        Self::decode(self.committed_index.load(Ordering::Acquire))
    }

    /// Highest index applied to the local state machine.
    #[inline]
    pub fn applied_index(&self) -> Option<u64> {
        Self::decode(self.applied_index.load(Ordering::Acquire))
    }

    /// Advance the commit point. Never moves backwards.
    #[inline]
    pub fn advance(&self, new_index: u64) {
        self.committed_index.fetch_max_encoded(new_index);
    }

    #[inline]
    pub fn mark_applied(&self, index: u64) {
        self.applied_index.fetch_max_encoded(index);
    }
}

impl Default for CommittedState {
    fn default() -> Self {
        Self::new()
    }
}

/// `fetch_max` that treats `u64::MAX` as "below zero".
trait FetchMaxEncoded {
    fn fetch_max_encoded(&self, value: u64);
}

impl FetchMaxEncoded for AtomicU64 {
    fn fetch_max_encoded(&self, value: u64) {
        let mut current = self.load(Ordering::Acquire);
        loop {
            if current != u64::MAX && current >= value {
                return;
            }
            match self.compare_exchange_weak(current, value, Ordering::Release, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_until_first_commit() {
        let state = CommittedState::new();
        assert_eq!(state.committed_index(), None);
        state.advance(0);
        assert_eq!(state.committed_index(), Some(0));
    }

    #[test]
    fn test_commit_point_is_monotonic() {
        let state = CommittedState::new();
        state.advance(5);
        state.advance(3);
        assert_eq!(state.committed_index(), Some(5));
        state.mark_applied(2);
        state.mark_applied(1);
        assert_eq!(state.applied_index(), Some(2));
    }
}
