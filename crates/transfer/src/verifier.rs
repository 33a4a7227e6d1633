//! Content hashing for chunks and reassembled objects.
//!
//! The digest is SHA-256 and is not negotiable per message. Hashes travel as
//! 64-character hex strings; input is accepted in either case.

use std::fmt;
use std::str::FromStr;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ChunkIndex;

/// Length of a SHA-256 digest in bytes.
pub const HASH_LEN: usize = 32;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Error returned when a hash string is not 64 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashParseError {
    #[error("hash is empty")]
    Empty,

    #[error("hash must be {expected} hex characters, got {got}")]
    Length { expected: usize, got: usize },

    #[error("hash is not valid hex")]
    NotHex,
}

impl FromStr for ContentHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(HashParseError::Empty);
        }
        if s.len() != HASH_LEN * 2 {
            return Err(HashParseError::Length {
                expected: HASH_LEN * 2,
                got: s.len(),
            });
        }
        let mut out = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|_| HashParseError::NotHex)?;
        Ok(Self(out))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.to_hex()
    }
}

// ---------------------------------------------------------------------------
// Chunk-level hashing
// ---------------------------------------------------------------------------

/// Computes the SHA-256 of a single chunk.
pub fn hash_chunk(payload: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    ContentHash(hasher.finalize().into())
}

/// Returns `true` if `payload` hashes to `declared`.
pub fn verify_chunk(payload: &[u8], declared: &ContentHash) -> bool {
    hash_chunk(payload) == *declared
}

// ---------------------------------------------------------------------------
// Object-level hashing
// ---------------------------------------------------------------------------

/// Result of hashing an ordered chunk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectDigest {
    pub hash: ContentHash,
    pub size: u64,
    pub chunks: u32,
}

/// Feeds an ordered chunk stream through SHA-256 without buffering the object.
///
/// The stream's own error type is passed through unchanged, so a missing
/// chunk surfaces as whatever error the store produced for it.
pub async fn digest_object<S, E>(chunks: S) -> Result<ObjectDigest, E>
where
    S: Stream<Item = Result<(ChunkIndex, Vec<u8>), E>>,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut count = 0u32;

    while let Some(item) = chunks.next().await {
        let (_index, payload) = item?;
        hasher.update(&payload);
        size += payload.len() as u64;
        count += 1;
    }

    Ok(ObjectDigest {
        hash: ContentHash(hasher.finalize().into()),
        size,
        chunks: count,
    })
}

/// Returns `true` if the concatenation of `chunks` hashes to `expected`.
pub async fn verify_object<S, E>(chunks: S, expected: &ContentHash) -> Result<bool, E>
where
    S: Stream<Item = Result<(ChunkIndex, Vec<u8>), E>>,
{
    let digest = digest_object(chunks).await?;
    Ok(digest.hash == *expected)
}
