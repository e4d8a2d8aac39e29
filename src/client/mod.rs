//! Cluster client.
//!
//! Provides:
//! - leader discovery and caching (redirect hints, round-robin probing)
//! - bounded retry of transient failures with capped exponential backoff
//!
//! Delivery is at-least-once. Resubmitting a request whose first attempt was
//! applied is answered by the notary's idempotent replay, so the client never
//! deduplicates on its own.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::NotaryError;
use crate::notary::request::CommitRequest;
use crate::notary::wire::{NotaryRequest, NotaryResponse};
use crate::uniqueness::{CommitOutcome, SecureHash, StateRef};

/// How the client reaches cluster members.
pub trait ClusterTransport {
    /// Member ids, in probing order.
    fn members(&self) -> Vec<u32>;

    /// Deliver `request` to `member`. A member that cannot be reached is
    /// reported as `Unavailable`.
    fn call(&self, member: u32, request: &NotaryRequest) -> Result<NotaryResponse, NotaryError>;
}

impl<T: ClusterTransport + ?Sized> ClusterTransport for &T {
    fn members(&self) -> Vec<u32> {
        (**self).members()
    }

    fn call(&self, member: u32, request: &NotaryRequest) -> Result<NotaryResponse, NotaryError> {
        (**self).call(member, request)
    }
}

pub struct ClusterClient<T: ClusterTransport> {
    transport: T,
    members: Vec<u32>,
    /// Last known leader.
    last_known_leader: Option<u32>,
    /// Position in `members` of the next probe when no leader is known.
    probe: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl<T: ClusterTransport> ClusterClient<T> {
    pub fn new(transport: T, config: &ClientConfig) -> Self {
        let members = transport.members();
        ClusterClient {
            transport,
            members,
            last_known_leader: None,
            probe: 0,
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn update_leader(&mut self, leader_id: u32) {
        self.last_known_leader = Some(leader_id);
    }

    pub fn last_known_leader(&self) -> Option<u32> {
        self.last_known_leader
    }

    /// The last known leader, or the next member in round-robin order.
    pub fn target_node(&self) -> Option<u32> {
        if let Some(leader) = self.last_known_leader {
            return Some(leader);
        }
        if self.members.is_empty() {
            return None;
        }
        Some(self.members[self.probe % self.members.len()])
    }

    /// Forget `failed` as leader. Follows `leader_hint` when it names another
    /// member, otherwise probes the member after `failed`.
    pub fn handle_redirect(&mut self, failed: u32, leader_hint: Option<u32>) {
        match leader_hint {
            Some(hint) if hint != failed && self.members.contains(&hint) => {
                self.last_known_leader = Some(hint);
            }
            _ => {
                self.last_known_leader = None;
                let pos = self.members.iter().position(|&m| m == failed).unwrap_or(self.probe);
                self.probe = pos + 1;
            }
        }
    }

    /// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped,
    /// with up to 50% jitter taken off.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.backoff_cap);
        let jitter_ms = capped.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return capped;
        }
        capped - Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Notarise `request` on the current leader.
    ///
    /// Transient failures are retried up to `max_attempts` times; the last
    /// one is returned if none succeeds. Permanent errors and every
    /// `CommitOutcome` are returned as they are.
    pub fn commit(&mut self, request: &CommitRequest) -> Result<CommitOutcome, NotaryError> {
        let wire = NotaryRequest::CommitTransaction(request.clone());
        self.call_with_retry(&wire)?.into_commit_outcome()
    }

    /// Which transaction consumed `state_ref`, read from the leader.
    pub fn get(&mut self, state_ref: &StateRef) -> Result<Option<SecureHash>, NotaryError> {
        let wire = NotaryRequest::Get { state_ref: *state_ref };
        self.call_with_retry(&wire)?.into_tx_id()
    }

    fn call_with_retry(&mut self, request: &NotaryRequest) -> Result<NotaryResponse, NotaryError> {
        let mut last_error = NotaryError::unavailable("no cluster members");

        for attempt in 0..self.max_attempts {
            let target = match self.target_node() {
                Some(t) => t,
                None => break,
            };

            let error = match self.transport.call(target, request) {
                Ok(NotaryResponse::Failed(e)) | Err(e) => e,
                Ok(response) => {
                    self.last_known_leader = Some(target);
                    return Ok(response);
                }
            };

            if !error.is_transient() {
                return Err(error);
            }

            debug!(member = target, attempt, error = %error, "transient failure, retrying");
            match &error {
                NotaryError::NotLeader { leader_hint } => {
                    let redirected = matches!(leader_hint, Some(h) if *h != target);
                    self.handle_redirect(target, *leader_hint);
                    last_error = error;
                    // A concrete hint is worth trying straight away.
                    if redirected {
                        continue;
                    }
                }
                _ => {
                    self.handle_redirect(target, None);
                    last_error = error;
                }
            }

            if attempt + 1 < self.max_attempts {
                thread::sleep(self.backoff_duration(attempt));
            }
        }

        warn!(attempts = self.max_attempts, error = %last_error, "giving up");
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned answers and records which member each call went to.
    struct Scripted {
        members: Vec<u32>,
        answers: Mutex<VecDeque<Result<NotaryResponse, NotaryError>>>,
        calls: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<NotaryResponse, NotaryError>>) -> Self {
            Scripted {
                members: vec![0, 1, 2],
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().clone()
        }
    }

    impl ClusterTransport for Scripted {
        fn members(&self) -> Vec<u32> {
            self.members.clone()
        }

        fn call(&self, member: u32, _request: &NotaryRequest) -> Result<NotaryResponse, NotaryError> {
            self.calls.lock().push(member);
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(NotaryError::unavailable("script exhausted")))
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            max_attempts: 4,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
        }
    }

    fn request() -> CommitRequest {
        CommitRequest::new(vec![], SecureHash::sha256(b"tx"), "O=Alice")
    }

    fn success() -> Result<NotaryResponse, NotaryError> {
        Ok(NotaryResponse::CommitTransaction { error: None })
    }

    #[test]
    fn test_follows_leader_hint() {
        let transport = Scripted::new(vec![Err(NotaryError::NotLeader { leader_hint: Some(2) }), success()]);
        let mut client = ClusterClient::new(&transport, &config());

        assert_eq!(client.commit(&request()).unwrap(), CommitOutcome::Success);
        assert_eq!(transport.calls(), vec![0, 2]);
        assert_eq!(client.last_known_leader(), Some(2));
    }

    #[test]
    fn test_probes_round_robin_without_hint() {
        let transport = Scripted::new(vec![
            Err(NotaryError::unavailable("down")),
            Ok(NotaryResponse::Failed(NotaryError::NotLeader { leader_hint: None })),
            success(),
        ]);
        let mut client = ClusterClient::new(&transport, &config());

        assert!(client.commit(&request()).unwrap().is_success());
        assert_eq!(transport.calls(), vec![0, 1, 2]);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let transport = Scripted::new(vec![Err(NotaryError::SignatureInvalid {
            requester: "O=Alice".into(),
        })]);
        let mut client = ClusterClient::new(&transport, &config());

        let err = client.commit(&request()).unwrap_err();
        assert!(matches!(err, NotaryError::SignatureInvalid { .. }));
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let transport = Scripted::new(vec![]);
        let mut client = ClusterClient::new(&transport, &config());

        let err = client.commit(&request()).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(transport.calls(), vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let transport = Scripted::new(vec![]);
        let client = ClusterClient::new(
            &transport,
            &ClientConfig {
                max_attempts: 3,
                backoff_base_ms: 10,
                backoff_cap_ms: 100,
            },
        );
        for attempt in 0..20 {
            let delay = client.backoff_duration(attempt);
            assert!(delay <= Duration::from_millis(100));
            assert!(delay >= Duration::from_millis(5));
        }
    }
}
