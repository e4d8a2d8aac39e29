//! Replicated uniqueness provider.
//!
//! A notary cluster guarantees that every state (an output of a prior
//! transaction) is consumed by at most one transaction. Commit requests are
//! ordered by a viewstamped-replication log and applied, in log order, to a
//! uniqueness store on every replica.
//!
//! Layers, leaves first:
//! - `uniqueness`: the store and its check-and-write primitive
//! - `engine`, `kernel`: the replicated log and deterministic apply
//! - `vsr`: primary/backup replication and view change
//! - `notary`: request authentication and the commit coordinator
//! - `client`: leader discovery and retry
//! - `cluster`: an in-process cluster wiring everything together

pub mod client;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod notary;
pub mod uniqueness;
pub mod vsr;

pub use client::{ClusterClient, ClusterTransport};
pub use cluster::LocalCluster;
pub use config::NotaryConfig;
pub use error::{NotaryError, StorageError};
pub use notary::{CommitCoordinator, CommitRequest};
pub use uniqueness::{CommitOutcome, SecureHash, StateRef, TimeWindow};
