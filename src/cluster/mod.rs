//! In-process notary cluster.
//!
//! Runs every replica on its own thread over a [`MockNetwork`], each with its
//! own uniqueness store and commit coordinator. Members can be isolated,
//! healed and killed to exercise failover.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{NotaryConfig, StoreBackendKind};
use crate::client::ClusterTransport;
use crate::engine::manifest::Manifest;
use crate::error::{NotaryError, StorageError};
use crate::kernel::notary_app::NotaryApp;
use crate::notary::coordinator::CommitCoordinator;
use crate::notary::signature::SignatureVerifier;
use crate::notary::wire::{NotaryRequest, NotaryResponse};
use crate::uniqueness::{JournalBackend, UniquenessStore};
use crate::vsr::network::MockNetwork;
use crate::vsr::node::{NodeRole, VsrNode, VsrTiming};
use crate::vsr::runner::spawn_node;


pub struct LocalCluster {
    network: MockNetwork,
    replicas: Vec<CommitCoordinator>,
}

impl LocalCluster {
    /// Start every member of `config.cluster` on the system clock.
    pub fn start(config: &NotaryConfig, verifier: Arc<dyn SignatureVerifier>) -> Result<Self, StorageError> {
        Self::start_with_clock(config, verifier, Arc::new(SystemClock))
    }

    /// Start every member, sharing `clock` for time-window checks and
    /// consensus timestamps.
    pub fn start_with_clock(
        config: &NotaryConfig,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let size = config.cluster.size();
        let timing = VsrTiming::from(&config.cluster);
        let mut network = MockNetwork::new(size);
        let mut replicas = Vec::with_capacity(size as usize);

        if let (StoreBackendKind::Journal, Some(dir)) = (config.store.backend, &config.store.journal_dir) {
            fs::create_dir_all(dir)?;
        }

        // `replicas[i]` must be replica `i`: primaries and leader hints are ids.
        let mut members: Vec<_> = config.cluster.members.iter().collect();
        members.sort_by_key(|m| m.id);

        for member in members {
            let id = member.id;
            let (store, manifest) = match (config.store.backend, &config.store.journal_dir) {
                (StoreBackendKind::Journal, Some(dir)) => {
                    let backend = JournalBackend::open(&dir.join(format!("replica-{}.journal", id)))?;
                    let manifest = Manifest::open(&dir.join(format!("replica-{}.manifest", id)))?;
                    (UniquenessStore::with_backend(backend), manifest)
                }
                _ => (UniquenessStore::in_memory(), Manifest::in_memory()),
            };
            let store = Arc::new(store);

            let endpoint = network.create_endpoint(id).ok_or_else(|| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("duplicate member id {}", id),
                ))
            })?;
            let app = NotaryApp::new(store.clone(), config.time_window.replay_policy);
            let node = VsrNode::new(id, size, endpoint, app, clock.clone(), manifest, timing);
            let handle = spawn_node(node, config.cluster.tick_interval());

            info!(node_id = id, name = %member.name, "replica started");
            replicas.push(CommitCoordinator::new(handle, store, verifier.clone(), &config.coordinator));
        }

        Ok(LocalCluster { network, replicas })
    }

    pub fn size(&self) -> u32 {
        self.replicas.len() as u32
    }

    pub fn replica(&self, id: u32) -> Option<&CommitCoordinator> {
        self.replicas.get(id as usize)
    }

    pub fn is_alive(&self, id: u32) -> bool {
        self.replica(id).map_or(false, |r| !r.replica().is_killed())
    }

    /// Crash a member: its thread stops and its links are cut.
    pub fn kill(&self, id: u32) {
        if let Some(replica) = self.replica(id) {
            warn!(node_id = id, "killing replica");
            self.network.disconnect(id);
            replica.replica().kill();
        }
    }

    /// Cut every link to and from a live member.
    pub fn isolate(&self, id: u32) {
        info!(node_id = id, "isolating replica");
        self.network.disconnect(id);
    }

    pub fn heal(&self, id: u32) {
        if self.is_alive(id) {
            info!(node_id = id, "reconnecting replica");
            self.network.reconnect(id);
        }
    }

    /// The live primary with the highest view.
    pub fn leader(&self) -> Option<u32> {
        self.replicas
            .iter()
            .filter_map(|r| r.status())
            .filter(|s| s.role == NodeRole::Primary && !s.halted)
            .max_by_key(|s| s.view)
            .map(|s| s.node_id)
    }

    pub fn wait_for_leader(&self, timeout: Duration) -> Option<u32> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(leader) = self.leader() {
                return Some(leader);
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    }

    /// Wait until every live member has applied the same, highest committed
    /// index.
    pub fn wait_for_sync(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let live: Vec<_> = self.replicas.iter().map(|r| r.replica()).filter(|h| !h.is_killed()).collect();
            let max_committed = live.iter().filter_map(|h| h.committed_index()).max();
            if let Some(max) = max_committed {
                if live.iter().all(|h| h.applied_index() == Some(max)) {
                    return true;
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl ClusterTransport for LocalCluster {
    fn members(&self) -> Vec<u32> {
        (0..self.size()).collect()
    }

    fn call(&self, member: u32, request: &NotaryRequest) -> Result<NotaryResponse, NotaryError> {
        match self.replica(member) {
            Some(replica) if !replica.replica().is_killed() => Ok(replica.handle(request.clone())),
            _ => Err(NotaryError::unavailable(format!("member {} unreachable", member))),
        }
    }
}
