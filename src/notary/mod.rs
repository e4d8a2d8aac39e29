//! Notary façade: request authentication, the commit coordinator and the
//! wire contract.

pub mod coordinator;
pub mod request;
pub mod signature;
pub mod wire;

pub use coordinator::CommitCoordinator;
pub use request::CommitRequest;
pub use signature::{request_digest, sign_request, KeyDirectory, SignatureVerifier};
pub use wire::{CommitRejection, NotaryRequest, NotaryResponse};
