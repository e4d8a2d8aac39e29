//! VSR (Viewstamped Replication) consensus layer.
//!
//! - The primary of view `v` is replica `v % cluster_size`; it alone orders
//!   commands and broadcasts Prepare messages
//! - Backups append, acknowledge with PrepareOk and apply committed entries
//! - A silent primary is replaced through a view change
//!
//! # Invariants
//!
//! 1. **Single Writer per Replica**: a replica's log and state machine are
//!    owned by one thread.
//! 2. **Monotonic Commit**: `committed_index` only advances forward.
//! 3. **Quorum Required**: an entry is committed only when a majority holds it.
//! 4. **In-Order Commit**: entry N is committed only after all entries < N.
//! 5. **View Fence**: a replica never processes a message from a view below
//!    the highest one it has persisted.

pub mod message;
pub mod network;
pub mod node;
pub mod quorum;
pub mod runner;


pub use message::VsrMessage;
pub use network::{MockNetwork, NetworkEndpoint};
pub use node::{
    AppliedEntry, NodeRole, Proposal, SubmitError, VsrNode, VsrTiming, ELECTION_TIMEOUT, HEARTBEAT_INTERVAL,
};
pub use quorum::{quorum_size, QuorumTracker, ReplicaSet, MAX_CLUSTER_SIZE};
pub use runner::{spawn_node, NodeCommand, NodeHandle, NodeStatus};
