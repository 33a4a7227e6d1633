use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a transfer ended in the failed state.
///
/// Serialized and displayed with the same kebab-case names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// No activity within the idle window.
    Timeout,
    /// Reassembled object did not match the declared hash.
    HashMismatch,
    /// A committed chunk index was re-sent with different content.
    ChunkConflict,
    /// Byte total reached with a gap in the chunk indices.
    Incomplete,
    /// Chunk data could not be read back during finalization.
    Storage,
    /// The content scanner refused the object.
    Rejected,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::HashMismatch => "hash-mismatch",
            Self::ChunkConflict => "chunk-conflict",
            Self::Incomplete => "incomplete",
            Self::Storage => "storage",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum TransferState {
    #[serde(rename = "initiated")]
    Initiated,
    #[serde(rename = "receiving")]
    Receiving,
    #[serde(rename = "finalizing")]
    Finalizing,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed(FailureReason),
}

impl TransferState {
    /// `Completed` and `Failed` accept no further messages.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiated => f.write_str("initiated"),
            Self::Receiving => f.write_str("receiving"),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TransferState::Initiated.is_terminal());
        assert!(!TransferState::Receiving.is_terminal());
        assert!(!TransferState::Finalizing.is_terminal());
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Failed(FailureReason::Timeout).is_terminal());
    }

    #[test]
    fn state_serialization() {
        assert_eq!(
            serde_json::to_string(&TransferState::Receiving).unwrap(),
            r#"{"state":"receiving"}"#
        );
        assert_eq!(
            serde_json::to_string(&TransferState::Failed(FailureReason::HashMismatch)).unwrap(),
            r#"{"state":"failed","reason":"hash-mismatch"}"#
        );
    }

    #[test]
    fn state_json_roundtrip_failed() {
        let state = TransferState::Failed(FailureReason::ChunkConflict);
        let json = serde_json::to_string(&state).unwrap();
        let parsed: TransferState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn failure_reason_display_matches_wire_name() {
        for reason in [
            FailureReason::Timeout,
            FailureReason::HashMismatch,
            FailureReason::ChunkConflict,
            FailureReason::Incomplete,
            FailureReason::Storage,
            FailureReason::Rejected,
        ] {
            let wire = serde_json::to_string(&reason).unwrap();
            assert_eq!(wire, format!("\"{reason}\""));
        }
    }

    #[test]
    fn display_includes_reason() {
        let s = TransferState::Failed(FailureReason::Timeout).to_string();
        assert_eq!(s, "failed(timeout)");
    }
}
