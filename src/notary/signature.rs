//! Requester signatures over commit requests.
//!
//! A requester signs the SHA-256 digest of the transaction id followed by the
//! ordered input list. The coordinator checks the signature before anything
//! reaches the replicated log.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::uniqueness::{SecureHash, StateRef};

const DIGEST_DOMAIN: &[u8] = b"notary/commit-request/v1";

/// Canonical digest of a commit request.
pub fn request_digest(inputs: &[StateRef], tx_id: &SecureHash) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DIGEST_DOMAIN);
    hasher.update(tx_id.as_bytes());
    hasher.update((inputs.len() as u32).to_le_bytes());
    for input in inputs {
        hasher.update(input.tx_hash.as_bytes());
        hasher.update(input.index.to_le_bytes());
    }
    hasher.finalize().into()
}

/// Sign the digest of `(inputs, tx_id)`.
pub fn sign_request(key: &SigningKey, inputs: &[StateRef], tx_id: &SecureHash) -> Vec<u8> {
    key.sign(&request_digest(inputs, tx_id)).to_bytes().to_vec()
}

/// Checks that `signature` was produced by `requester` over `digest`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, requester: &str, digest: &[u8; 32], signature: &[u8]) -> bool;
}

/// Known requesters and their Ed25519 public keys.
#[derive(Debug, Default, Clone)]
pub struct KeyDirectory {
    keys: HashMap<String, VerifyingKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, requester: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(requester.into(), key);
    }
}

impl SignatureVerifier for KeyDirectory {
    fn verify(&self, requester: &str, digest: &[u8; 32], signature: &[u8]) -> bool {
        let key = match self.keys.get(requester) {
            Some(k) => k,
            None => return false,
        };
        match Signature::from_slice(signature) {
            Ok(sig) => key.verify(digest, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn inputs() -> Vec<StateRef> {
        vec![
            StateRef::new(SecureHash::sha256(b"issue"), 0),
            StateRef::new(SecureHash::sha256(b"issue"), 1),
        ]
    }

    #[test]
    fn test_valid_signature_verifies() {
        let key = SigningKey::generate(&mut OsRng);
        let mut directory = KeyDirectory::new();
        directory.register("O=Alice", key.verifying_key());

        let tx_id = SecureHash::sha256(b"tx");
        let signature = sign_request(&key, &inputs(), &tx_id);
        assert!(directory.verify("O=Alice", &request_digest(&inputs(), &tx_id), &signature));
    }

    #[test]
    fn test_signature_is_bound_to_request() {
        let key = SigningKey::generate(&mut OsRng);
        let mut directory = KeyDirectory::new();
        directory.register("O=Alice", key.verifying_key());

        let tx_id = SecureHash::sha256(b"tx");
        let signature = sign_request(&key, &inputs(), &tx_id);

        let other_tx = SecureHash::sha256(b"other");
        assert!(!directory.verify("O=Alice", &request_digest(&inputs(), &other_tx), &signature));

        let mut reordered = inputs();
        reordered.reverse();
        assert!(!directory.verify("O=Alice", &request_digest(&reordered, &tx_id), &signature));
    }

    #[test]
    fn test_unknown_requester_and_garbage_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut directory = KeyDirectory::new();
        directory.register("O=Alice", key.verifying_key());

        let tx_id = SecureHash::sha256(b"tx");
        let digest = request_digest(&inputs(), &tx_id);
        let signature = sign_request(&key, &inputs(), &tx_id);

        assert!(!directory.verify("O=Mallory", &digest, &signature));
        assert!(!directory.verify("O=Alice", &digest, &[0u8; 12]));
    }
}
