//! Durable per-chunk storage keyed by `(transfer id, chunk index)`.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::{ChunkIndex, TransferId};

/// A boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Lazy, finite sequence of `(index, payload)` in ascending index order.
pub type ChunkStream<'a> = BoxStream<'a, Result<(ChunkIndex, Vec<u8>), StoreError>>;

/// Errors produced by chunk stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk {index} missing for transfer {transfer_id}")]
    MissingChunk {
        transfer_id: TransferId,
        index: ChunkIndex,
    },

    #[error("invalid transfer id: {0}")]
    InvalidId(TransferId),
}

/// Storage backend for chunk bytes.
///
/// Implementations must make `write_chunk` idempotent for identical input
/// and isolate concurrent writes to different indices of the same transfer.
pub trait ChunkStore: Send + Sync + 'static {
    /// Stores `payload` under `(id, index)`.
    fn write_chunk<'a>(
        &'a self,
        id: &'a TransferId,
        index: ChunkIndex,
        payload: &'a [u8],
    ) -> StoreFuture<'a, ()>;

    /// Streams indices `0..chunk_count` in order.
    ///
    /// Each call starts a fresh pass. A missing index yields
    /// [`StoreError::MissingChunk`] rather than being skipped.
    fn read_ordered<'a>(&'a self, id: &'a TransferId, chunk_count: u32) -> ChunkStream<'a>;

    /// Removes everything stored for `id`. Safe on partial or absent data.
    fn delete_transfer<'a>(&'a self, id: &'a TransferId) -> StoreFuture<'a, ()>;
}

// ---------------------------------------------------------------------------
// MemoryChunkStore
// ---------------------------------------------------------------------------

/// In-process chunk store. Contents do not survive a restart.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<TransferId, BTreeMap<ChunkIndex, Arc<[u8]>>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks held for `id`.
    pub fn chunk_count(&self, id: &TransferId) -> usize {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        chunks.get(id).map_or(0, BTreeMap::len)
    }

    /// Returns `true` if anything is stored for `id`.
    pub fn contains(&self, id: &TransferId) -> bool {
        self.chunk_count(id) > 0
    }

    fn get(&self, id: &TransferId, index: ChunkIndex) -> Result<(ChunkIndex, Vec<u8>), StoreError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        chunks
            .get(id)
            .and_then(|m| m.get(&index))
            .map(|data| (index, data.to_vec()))
            .ok_or_else(|| StoreError::MissingChunk {
                transfer_id: id.clone(),
                index,
            })
    }
}

impl ChunkStore for MemoryChunkStore {
    fn write_chunk<'a>(
        &'a self,
        id: &'a TransferId,
        index: ChunkIndex,
        payload: &'a [u8],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
            chunks
                .entry(id.clone())
                .or_default()
                .insert(index, Arc::from(payload));
            Ok(())
        })
    }

    fn read_ordered<'a>(&'a self, id: &'a TransferId, chunk_count: u32) -> ChunkStream<'a> {
        stream::iter(0..chunk_count)
            .map(move |index| self.get(id, index))
            .boxed()
    }

    fn delete_transfer<'a>(&'a self, id: &'a TransferId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
            chunks.remove(id);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// FsChunkStore
// ---------------------------------------------------------------------------

/// Filesystem chunk store.
///
/// Layout: `<root>/<transfer id>/<index>.chunk`. Each write goes to a unique
/// temp file in the same directory and is renamed into place, so readers
/// never observe a partially written chunk and concurrent writers of the
/// same key cannot interleave bytes.
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the chunks of `id`.
    ///
    /// Ids are used as a single path component, so anything outside
    /// `[A-Za-z0-9_-]` is refused.
    fn transfer_dir(&self, id: &TransferId) -> Result<PathBuf, StoreError> {
        let s = id.as_str();
        let valid = !s.is_empty()
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(StoreError::InvalidId(id.clone()));
        }
        Ok(self.root.join(s))
    }

    fn chunk_file(dir: &Path, index: ChunkIndex) -> PathBuf {
        dir.join(format!("{index:010}.chunk"))
    }

    async fn read_one(&self, id: &TransferId, index: ChunkIndex) -> Result<(ChunkIndex, Vec<u8>), StoreError> {
        let path = Self::chunk_file(&self.transfer_dir(id)?, index);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok((index, data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::MissingChunk {
                transfer_id: id.clone(),
                index,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl ChunkStore for FsChunkStore {
    fn write_chunk<'a>(
        &'a self,
        id: &'a TransferId,
        index: ChunkIndex,
        payload: &'a [u8],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.transfer_dir(id)?;
            tokio::fs::create_dir_all(&dir).await?;

            let tmp = dir.join(format!(".{index:010}.{}.tmp", uuid::Uuid::new_v4().simple()));
            let result = async {
                let mut file = tokio::fs::File::create(&tmp).await?;
                file.write_all(payload).await?;
                file.sync_all().await?;
                tokio::fs::rename(&tmp, Self::chunk_file(&dir, index)).await
            }
            .await;

            if let Err(e) = result {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }

            tracing::trace!(transfer_id = %id, index, bytes = payload.len(), "chunk written");
            Ok(())
        })
    }

    fn read_ordered<'a>(&'a self, id: &'a TransferId, chunk_count: u32) -> ChunkStream<'a> {
        stream::iter(0..chunk_count)
            .then(move |index| self.read_one(id, index))
            .boxed()
    }

    fn delete_transfer<'a>(&'a self, id: &'a TransferId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.transfer_dir(id)?;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
