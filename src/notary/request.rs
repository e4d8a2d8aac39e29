use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::uniqueness::{SecureHash, StateRef, TimeWindow};

use super::signature::{request_digest, sign_request};

/// A request to notarise one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// States the transaction consumes.
    pub inputs: Vec<StateRef>,
    /// States the transaction reads; they must be unconsumed but are not spent.
    pub references: Vec<StateRef>,
    pub tx_id: SecureHash,
    pub requester: String,
    /// Requester's signature over [`CommitRequest::digest`].
    pub signature: Vec<u8>,
    pub time_window: Option<TimeWindow>,
}

impl CommitRequest {
    /// An unsigned request without references or time window.
    pub fn new(inputs: Vec<StateRef>, tx_id: SecureHash, requester: impl Into<String>) -> Self {
        CommitRequest {
            inputs,
            references: Vec::new(),
            tx_id,
            requester: requester.into(),
            signature: Vec::new(),
            time_window: None,
        }
    }

    pub fn with_references(mut self, references: Vec<StateRef>) -> Self {
        self.references = references;
        self
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    /// Sign with the requester's key.
    pub fn signed(mut self, key: &SigningKey) -> Self {
        self.signature = sign_request(key, &self.inputs, &self.tx_id);
        self
    }

    pub fn digest(&self) -> [u8; 32] {
        request_digest(&self.inputs, &self.tx_id)
    }
}
