//! Wire contract between clients and notary replicas.

use serde::{Deserialize, Serialize};

use crate::error::NotaryError;
use crate::uniqueness::{CommitOutcome, ConflictMap, SecureHash, StateRef, TimeWindow};

use super::request::CommitRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotaryRequest {
    CommitTransaction(CommitRequest),
    /// Which transaction consumed `state_ref`, if any.
    Get { state_ref: StateRef },
}

/// Why a commit was refused. Absent on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitRejection {
    Conflict { consumed_states: ConflictMap },
    TimeWindowInvalid { window: TimeWindow, evaluated_at: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotaryResponse {
    CommitTransaction { error: Option<CommitRejection> },
    Get { tx_id: Option<SecureHash> },
    /// The request was not processed.
    Failed(NotaryError),
}

impl NotaryRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl NotaryResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Back to a commit outcome. Fails on `Failed` or a response to a
    /// different request kind.
    pub fn into_commit_outcome(self) -> Result<CommitOutcome, NotaryError> {
        match self {
            NotaryResponse::CommitTransaction { error: None } => Ok(CommitOutcome::Success),
            NotaryResponse::CommitTransaction {
                error: Some(CommitRejection::Conflict { consumed_states }),
            } => Ok(CommitOutcome::Conflict(consumed_states)),
            NotaryResponse::CommitTransaction {
                error: Some(CommitRejection::TimeWindowInvalid { window, evaluated_at }),
            } => Ok(CommitOutcome::TimeWindowInvalid { window, evaluated_at }),
            NotaryResponse::Failed(e) => Err(e),
            NotaryResponse::Get { .. } => Err(mismatched("Get")),
        }
    }

    pub fn into_tx_id(self) -> Result<Option<SecureHash>, NotaryError> {
        match self {
            NotaryResponse::Get { tx_id } => Ok(tx_id),
            NotaryResponse::Failed(e) => Err(e),
            NotaryResponse::CommitTransaction { .. } => Err(mismatched("CommitTransaction")),
        }
    }
}

fn mismatched(kind: &str) -> NotaryError {
    NotaryError::InternalStorage {
        message: format!("unexpected {} response", kind),
        retryable: false,
    }
}

impl From<CommitOutcome> for NotaryResponse {
    fn from(outcome: CommitOutcome) -> Self {
        let error = match outcome {
            CommitOutcome::Success => None,
            CommitOutcome::Conflict(consumed_states) => Some(CommitRejection::Conflict { consumed_states }),
            CommitOutcome::TimeWindowInvalid { window, evaluated_at } => {
                Some(CommitRejection::TimeWindowInvalid { window, evaluated_at })
            }
        };
        NotaryResponse::CommitTransaction { error }
    }
}

impl From<Result<CommitOutcome, NotaryError>> for NotaryResponse {
    fn from(result: Result<CommitOutcome, NotaryError>) -> Self {
        match result {
            Ok(outcome) => outcome.into(),
            Err(e) => NotaryResponse::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniqueness::{ConsumedStateType, ConsumingRecord, StateConsumption};

    fn state(index: u32) -> StateRef {
        StateRef::new(SecureHash::sha256(b"issue"), index)
    }

    #[test]
    fn test_conflict_detail_survives_the_wire() {
        let mut consumed = ConflictMap::new();
        consumed.insert(
            state(2),
            StateConsumption {
                record: ConsumingRecord {
                    consuming_tx_id: SecureHash::sha256(b"A"),
                    input_index: 1,
                    requester: "O=Alice".into(),
                    recorded_at: 7,
                },
                kind: ConsumedStateType::Input,
            },
        );
        let response = NotaryResponse::from(CommitOutcome::Conflict(consumed.clone()));

        let decoded = NotaryResponse::from_bytes(&response.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.into_commit_outcome().unwrap(), CommitOutcome::Conflict(consumed));
    }

    #[test]
    fn test_failure_and_kind_mismatch() {
        let failed = NotaryResponse::from(Err::<CommitOutcome, _>(NotaryError::NotLeader { leader_hint: Some(2) }));
        assert_eq!(
            failed.clone().into_commit_outcome(),
            Err(NotaryError::NotLeader { leader_hint: Some(2) })
        );
        assert!(failed.into_tx_id().is_err());

        let get = NotaryResponse::Get { tx_id: None };
        assert!(get.clone().into_commit_outcome().is_err());
        assert_eq!(get.into_tx_id(), Ok(None));
    }

    #[test]
    fn test_request_encoding() {
        let request = NotaryRequest::Get { state_ref: state(0) };
        assert_eq!(NotaryRequest::from_bytes(&request.to_bytes().unwrap()).unwrap(), request);
    }
}
