use serde::{Deserialize, Serialize};

use crate::engine::log::LogEntry;

/// VSR protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VsrMessage {
    /// Primary → backups: replicate one entry.
    Prepare {
        view: u64,
        entry: LogEntry,
        /// Primary's commit point (piggyback commit notification).
        /// Backups must NOT advance their commit point when this is None.
        commit_index: Option<u64>,
    },

    /// Backup → primary: the entry at `index` is held locally.
    PrepareOk { view: u64, index: u64, node_id: u32 },

    /// Primary → backups: commit notification, also sent as the heartbeat
    /// when the primary is idle.
    Commit { view: u64, commit_index: Option<u64> },

    /// Broadcast by a replica that suspects the primary of `new_view - 1`
    /// (or of a stalled view change) has failed.
    StartViewChange { new_view: u64, node_id: u32 },

    /// Sent to the primary of `new_view` once a replica has seen a quorum of
    /// StartViewChange. Carries the sender's whole log so the new primary can
    /// pick the most up to date one.
    DoViewChange {
        new_view: u64,
        node_id: u32,
        /// Last view in which the sender was in normal operation.
        last_normal_view: u64,
        commit_index: Option<u64>,
        log: Vec<LogEntry>,
    },

    /// New primary → everyone: the view is established with this log.
    StartView {
        new_view: u64,
        primary_id: u32,
        commit_index: Option<u64>,
        log: Vec<LogEntry>,
    },

    /// Backup → primary: entries `[from_index, to_index]` are missing.
    CatchUpRequest {
        view: u64,
        node_id: u32,
        from_index: u64,
        to_index: u64,
    },

    /// Primary → backup: requested entries (possibly a prefix of them).
    CatchUpResponse {
        view: u64,
        entries: Vec<LogEntry>,
        has_more: bool,
        commit_index: Option<u64>,
    },

    /// Sent by a replica that learned of a view higher than its own; the
    /// primary of that view answers with StartView.
    RecoveryRequest { view: u64, node_id: u32 },
}

impl VsrMessage {
    /// Encode with bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// The view this message belongs to.
    pub fn view(&self) -> u64 {
        match self {
            VsrMessage::Prepare { view, .. }
            | VsrMessage::PrepareOk { view, .. }
            | VsrMessage::Commit { view, .. }
            | VsrMessage::CatchUpRequest { view, .. }
            | VsrMessage::CatchUpResponse { view, .. }
            | VsrMessage::RecoveryRequest { view, .. } => *view,
            VsrMessage::StartViewChange { new_view, .. }
            | VsrMessage::DoViewChange { new_view, .. }
            | VsrMessage::StartView { new_view, .. } => *new_view,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            VsrMessage::Prepare { .. } => "Prepare",
            VsrMessage::PrepareOk { .. } => "PrepareOk",
            VsrMessage::Commit { .. } => "Commit",
            VsrMessage::StartViewChange { .. } => "StartViewChange",
            VsrMessage::DoViewChange { .. } => "DoViewChange",
            VsrMessage::StartView { .. } => "StartView",
            VsrMessage::CatchUpRequest { .. } => "CatchUpRequest",
            VsrMessage::CatchUpResponse { .. } => "CatchUpResponse",
            VsrMessage::RecoveryRequest { .. } => "RecoveryRequest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::log::ReplicatedLog;

    #[test]
    fn test_message_survives_encoding() {
        let mut log = ReplicatedLog::new();
        log.append(3, 1_000, b"payload".to_vec());
        let msg = VsrMessage::StartView {
            new_view: 3,
            primary_id: 0,
            commit_index: Some(0),
            log: log.entries().to_vec(),
        };

        let decoded = VsrMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.view(), 3);
        assert_eq!(decoded.kind(), "StartView");
    }
}
