//! Final assembly of a completed transfer.
//!
//! The reassembler makes up to three ordered passes over the stored chunks:
//! hash verification, the optional content scan, and the hand-off to the
//! [`ObjectSink`]. Each pass opens a fresh stream from the store, so memory
//! use is bounded by the chunk size rather than the object size.

use std::sync::Arc;

use chunkvault_protocol::types::FailureReason;

use crate::scan::{ContentScanner, ScanVerdict};
use crate::sink::{ObjectSink, SinkError};
use crate::store::{ChunkStore, StoreError};
use crate::verifier::{self, ContentHash};
use crate::TransferId;

/// What the reassembler needs to know about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectManifest {
    pub transfer_id: TransferId,
    pub filename: String,
    pub expected_size: u64,
    pub expected_hash: ContentHash,
    pub chunk_count: u32,
}

/// A verified object that has been handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalObject {
    pub transfer_id: TransferId,
    pub filename: String,
    pub size: u64,
    pub hash: ContentHash,
    /// Sink-specific location (path, URL, key).
    pub location: String,
}

/// Why finalization failed.
#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("object hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("object incomplete: {0}")]
    Incomplete(String),

    #[error("reading chunks: {0}")]
    Storage(StoreError),

    #[error("rejected by content scan: {0}")]
    Rejected(String),

    #[error("object sink: {0}")]
    Sink(#[from] SinkError),
}

impl FinalizeError {
    /// The terminal state reason recorded on the session.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::HashMismatch { .. } => FailureReason::HashMismatch,
            Self::Incomplete(_) => FailureReason::Incomplete,
            Self::Storage(_) | Self::Sink(_) => FailureReason::Storage,
            Self::Rejected(_) => FailureReason::Rejected,
        }
    }
}

impl From<StoreError> for FinalizeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MissingChunk { index, .. } => {
                Self::Incomplete(format!("chunk {index} missing from store"))
            }
            other => Self::Storage(other),
        }
    }
}

/// Verifies and delivers completed objects.
pub struct Reassembler {
    store: Arc<dyn ChunkStore>,
    sink: Arc<dyn ObjectSink>,
    scanner: Option<Arc<dyn ContentScanner>>,
}

impl Reassembler {
    pub fn new(store: Arc<dyn ChunkStore>, sink: Arc<dyn ObjectSink>) -> Self {
        Self {
            store,
            sink,
            scanner: None,
        }
    }

    /// Runs `scanner` on every verified object before it reaches the sink.
    pub fn with_scanner(mut self, scanner: Arc<dyn ContentScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Verifies the stored chunks of `manifest` and hands them to the sink.
    ///
    /// Does not touch session state or delete chunk data; the coordinator
    /// does both based on the result.
    pub async fn finalize(&self, manifest: &ObjectManifest) -> Result<FinalObject, FinalizeError> {
        let id = &manifest.transfer_id;

        let digest =
            verifier::digest_object(self.store.read_ordered(id, manifest.chunk_count)).await?;

        if digest.hash != manifest.expected_hash {
            tracing::warn!(
                transfer_id = %id,
                expected = %manifest.expected_hash,
                actual = %digest.hash,
                "object hash mismatch"
            );
            return Err(FinalizeError::HashMismatch {
                expected: manifest.expected_hash,
                actual: digest.hash,
            });
        }
        if digest.size != manifest.expected_size {
            return Err(FinalizeError::Incomplete(format!(
                "read {} bytes, expected {}",
                digest.size, manifest.expected_size
            )));
        }

        if let Some(scanner) = &self.scanner {
            let chunks = self.store.read_ordered(id, manifest.chunk_count);
            if let ScanVerdict::Rejected(reason) = scanner.scan(manifest, chunks).await? {
                tracing::warn!(transfer_id = %id, %reason, "object rejected by scanner");
                return Err(FinalizeError::Rejected(reason));
            }
        }

        let chunks = self.store.read_ordered(id, manifest.chunk_count);
        let location = self.sink.store_object(manifest, chunks).await?;

        tracing::info!(transfer_id = %id, bytes = digest.size, chunks = digest.chunks, "object finalized");
        Ok(FinalObject {
            transfer_id: id.clone(),
            filename: manifest.filename.clone(),
            size: digest.size,
            hash: digest.hash,
            location,
        })
    }
}
