//! Commit coordinator: the notary façade of one replica.
//!
//! Authenticates the request, hands it to the replica's consensus runner and
//! waits (bounded) for the outcome of applying it.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::NotaryError;
use crate::kernel::notary_app::{NotaryApp, NotaryCommand};
use crate::uniqueness::{CommitOutcome, SecureHash, StateRef, UniquenessStore};
use crate::vsr::runner::{NodeHandle, NodeStatus};

use super::request::CommitRequest;
use super::signature::SignatureVerifier;
use super::wire::{NotaryRequest, NotaryResponse};

pub struct CommitCoordinator {
    replica: NodeHandle<NotaryApp>,
    store: Arc<UniquenessStore>,
    verifier: Arc<dyn SignatureVerifier>,
    commit_timeout: Duration,
}

impl CommitCoordinator {
    pub fn new(
        replica: NodeHandle<NotaryApp>,
        store: Arc<UniquenessStore>,
        verifier: Arc<dyn SignatureVerifier>,
        config: &CoordinatorConfig,
    ) -> Self {
        CommitCoordinator {
            replica,
            store,
            verifier,
            commit_timeout: config.commit_timeout(),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.replica.node_id
    }

    pub fn replica(&self) -> &NodeHandle<NotaryApp> {
        &self.replica
    }

    pub fn store(&self) -> &Arc<UniquenessStore> {
        &self.store
    }

    pub fn status(&self) -> Option<NodeStatus> {
        self.replica.status()
    }

    /// Notarise `request` with the configured timeout.
    pub fn request_commit(&self, request: CommitRequest) -> Result<CommitOutcome, NotaryError> {
        self.request_commit_with_timeout(request, self.commit_timeout)
    }

    /// Notarise `request`, waiting at most `timeout` for the outcome.
    ///
    /// A `Timeout` says nothing about the outcome: the command may still be
    /// applied. Resubmitting the same request is safe.
    pub fn request_commit_with_timeout(
        &self,
        request: CommitRequest,
        timeout: Duration,
    ) -> Result<CommitOutcome, NotaryError> {
        let tx_id = request.tx_id;
        if !self.verifier.verify(&request.requester, &request.digest(), &request.signature) {
            warn!(
                node_id = self.node_id(),
                tx_id = %tx_id.short(),
                requester = %request.requester,
                "rejecting request with invalid signature"
            );
            return Err(NotaryError::SignatureInvalid {
                requester: request.requester,
            });
        }

        debug!(node_id = self.node_id(), tx_id = %tx_id.short(), inputs = request.inputs.len(), "submitting");
        let reply = self.replica.submit(NotaryCommand::CommitTransactionV1(request))?;

        let result = match reply.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(NotaryError::Timeout { after: timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(NotaryError::unavailable("replica stopped")),
        };

        match &result {
            Ok(CommitOutcome::Success) => {
                debug!(node_id = self.node_id(), tx_id = %tx_id.short(), "notarised");
            }
            Ok(CommitOutcome::Conflict(conflicts)) => {
                info!(node_id = self.node_id(), tx_id = %tx_id.short(), conflicts = conflicts.len(), "double spend");
            }
            Ok(CommitOutcome::TimeWindowInvalid { window, evaluated_at }) => {
                info!(node_id = self.node_id(), tx_id = %tx_id.short(), %window, evaluated_at, "outside time window");
            }
            Err(e) => {
                debug!(node_id = self.node_id(), tx_id = %tx_id.short(), error = %e, "commit failed");
            }
        }
        result
    }

    /// Local read; may lag the leader.
    pub fn get(&self, state_ref: &StateRef) -> Option<SecureHash> {
        self.store.get(state_ref)
    }

    /// Serve one wire request.
    pub fn handle(&self, request: NotaryRequest) -> NotaryResponse {
        match request {
            NotaryRequest::CommitTransaction(request) => self.request_commit(request).into(),
            NotaryRequest::Get { state_ref } => {
                if self.replica.is_killed() {
                    return NotaryResponse::Failed(NotaryError::unavailable("replica is down"));
                }
                NotaryResponse::Get {
                    tx_id: self.get(&state_ref),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ReplayPolicy;
    use crate::engine::manifest::Manifest;
    use crate::notary::signature::KeyDirectory;
    use crate::vsr::network::MockNetwork;
    use crate::vsr::node::{VsrNode, VsrTiming};
    use crate::vsr::runner::spawn_node;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    struct Fixture {
        coordinator: CommitCoordinator,
        key: SigningKey,
        store: Arc<UniquenessStore>,
        _network: MockNetwork,
    }

    /// Replica 0 of a `size`-member cluster whose other members never run.
    fn fixture(size: u32) -> Fixture {
        let mut network = MockNetwork::new(size);
        let store = Arc::new(UniquenessStore::in_memory());
        let app = NotaryApp::new(store.clone(), ReplayPolicy::Bypass);
        let node = VsrNode::new(
            0,
            size,
            network.create_endpoint(0).unwrap(),
            app,
            Arc::new(ManualClock::new(1_000)),
            Manifest::in_memory(),
            VsrTiming::default(),
        );
        let handle = spawn_node(node, Duration::from_millis(1));

        let key = SigningKey::generate(&mut OsRng);
        let mut keys = KeyDirectory::new();
        keys.register("O=Alice", key.verifying_key());

        let coordinator =
            CommitCoordinator::new(handle, store.clone(), Arc::new(keys), &CoordinatorConfig::default());
        Fixture {
            coordinator,
            key,
            store,
            _network: network,
        }
    }

    fn state(index: u32) -> StateRef {
        StateRef::new(SecureHash::sha256(b"issue"), index)
    }

    fn request(tx: &str, inputs: Vec<StateRef>) -> CommitRequest {
        CommitRequest::new(inputs, SecureHash::sha256(tx.as_bytes()), "O=Alice")
    }

    #[test]
    fn test_commit_and_double_spend() {
        let f = fixture(1);
        let a = request("A", vec![state(0), state(1)]).signed(&f.key);
        assert_eq!(f.coordinator.request_commit(a).unwrap(), CommitOutcome::Success);

        let b = request("B", vec![state(1), state(2)]).signed(&f.key);
        let outcome = f.coordinator.request_commit(b).unwrap();
        let conflicts = outcome.conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[&state(1)].record.consuming_tx_id, SecureHash::sha256(b"A"));

        assert_eq!(f.coordinator.get(&state(1)), Some(SecureHash::sha256(b"A")));
        assert_eq!(f.coordinator.get(&state(2)), None);
    }

    #[test]
    fn test_bad_signature_never_reaches_the_log() {
        let f = fixture(1);
        let other = SigningKey::generate(&mut OsRng);
        let forged = request("A", vec![state(0)]).signed(&other);

        let err = f.coordinator.request_commit(forged).unwrap_err();
        assert_eq!(err, NotaryError::SignatureInvalid { requester: "O=Alice".into() });
        assert!(!err.is_transient());
        assert!(f.store.is_empty());
        assert!(f.store.request_log().is_empty());
        assert_eq!(f.coordinator.replica().committed_index(), None);
    }

    #[test]
    fn test_timeout_without_quorum() {
        let f = fixture(3);
        let a = request("A", vec![state(0)]).signed(&f.key);

        let err = f
            .coordinator
            .request_commit_with_timeout(a, Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err, NotaryError::Timeout { after: Duration::from_millis(50) });
        assert!(err.is_transient());
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_wire_requests() {
        let f = fixture(1);
        let a = request("A", vec![state(0)]).signed(&f.key);

        let response = f.coordinator.handle(NotaryRequest::CommitTransaction(a));
        assert_eq!(response, NotaryResponse::CommitTransaction { error: None });

        let response = f.coordinator.handle(NotaryRequest::Get { state_ref: state(0) });
        assert_eq!(response.into_tx_id().unwrap(), Some(SecureHash::sha256(b"A")));
    }

    #[test]
    fn test_killed_replica_is_unavailable() {
        let f = fixture(1);
        f.coordinator.replica().kill();

        let a = request("A", vec![state(0)]).signed(&f.key);
        let err = f.coordinator.request_commit(a).unwrap_err();
        assert!(matches!(err, NotaryError::Unavailable { .. }));
        assert!(err.is_transient());
    }
}
