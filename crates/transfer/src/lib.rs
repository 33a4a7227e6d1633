//! Resumable, integrity-verified chunked object transfers.
//!
//! A peer opens a transfer with the object's size and SHA-256, streams
//! indexed chunks in any order, and may reconnect and ask which indices are
//! already durable. The [`TransferCoordinator`] owns every in-flight
//! [`TransferSession`], writes chunk bytes through a [`ChunkStore`], and once
//! the last chunk lands hands the ordered chunks to the [`Reassembler`],
//! which verifies the whole object before passing it to an [`ObjectSink`].

mod coordinator;
mod journal;
mod reassembler;
mod scan;
mod session;
mod sink;
mod store;
pub mod verifier;

use std::fmt;

use serde::{Deserialize, Serialize};

use chunkvault_protocol::constants::{
    ERR_CONFLICT, ERR_INTEGRITY, ERR_INTERNAL, ERR_INVALID_REQUEST, ERR_NOT_FOUND,
    ERR_SIZE_EXCEEDED, ERR_STORAGE,
};
use chunkvault_protocol::types::TransferState;

pub use coordinator::{
    ChunkAck, CoordinatorConfig, ResumeInfo, StartTransfer, TransferCoordinator,
};
pub use journal::{FsJournal, JournalError, MemoryJournal, SessionJournal};
pub use reassembler::{FinalObject, FinalizeError, ObjectManifest, Reassembler};
pub use scan::{ContentScanner, NoopScanner, ScanVerdict};
pub use session::{ChunkRecord, Readiness, TransferSession};
pub use sink::{FsObjectSink, MemoryObjectSink, ObjectSink, SinkError};
pub use store::{ChunkStore, ChunkStream, FsChunkStore, MemoryChunkStore, StoreError};
pub use verifier::{ContentHash, ObjectDigest};

/// Zero-based position of a chunk within its object.
pub type ChunkIndex = u32;

/// Opaque transfer identifier, minted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Mints a fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TransferId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors produced by the transfer crate.
///
/// Every variant is scoped to a single chunk or a single transfer; none of
/// them is fatal to the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    #[error("transfer {id} is already {state}")]
    Terminal { id: TransferId, state: TransferState },

    #[error("chunk {index} does not match its declared hash")]
    ChunkHashMismatch { index: ChunkIndex },

    #[error("chunk {index} was re-sent with different content")]
    ChunkConflict { index: ChunkIndex },

    #[error("chunk {index} of {size} bytes exceeds declared size ({received}/{expected} received)")]
    SizeExceeded {
        index: ChunkIndex,
        size: u64,
        received: u64,
        expected: u64,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("finalization failed: {0}")]
    Finalize(#[from] FinalizeError),
}

impl TransferError {
    /// Wire error code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => ERR_INVALID_REQUEST,
            Self::NotFound(_) => ERR_NOT_FOUND,
            Self::Terminal { .. } | Self::ChunkConflict { .. } => ERR_CONFLICT,
            Self::SizeExceeded { .. } => ERR_SIZE_EXCEEDED,
            Self::ChunkHashMismatch { .. } => ERR_INTEGRITY,
            Self::Storage(_) | Self::Journal(_) => ERR_STORAGE,
            Self::Finalize(FinalizeError::Storage(_) | FinalizeError::Sink(_)) => ERR_INTERNAL,
            Self::Finalize(_) => ERR_INTEGRITY,
        }
    }

    /// `true` if the peer can resend the same chunk and expect a different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Journal(_))
    }
}
