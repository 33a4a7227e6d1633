//! Destinations for verified objects.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::TransferId;
use crate::reassembler::ObjectManifest;
use crate::store::{ChunkStream, StoreError};

/// A boxed future returned by [`ObjectSink::store_object`].
///
/// Resolves to a location string describing where the object now lives.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<String, SinkError>> + Send + 'a>>;

/// Errors produced by object sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reading chunks: {0}")]
    Store(#[from] StoreError),
}

/// Durable home for finalized objects.
///
/// Only called after the whole object matched its declared hash. The sink
/// must not expose the object until the stream has been fully consumed.
pub trait ObjectSink: Send + Sync + 'static {
    fn store_object<'a>(&'a self, manifest: &'a ObjectManifest, chunks: ChunkStream<'a>) -> SinkFuture<'a>;
}

// ---------------------------------------------------------------------------
// MemoryObjectSink
// ---------------------------------------------------------------------------

/// Keeps finalized objects in memory.
#[derive(Default)]
pub struct MemoryObjectSink {
    objects: Mutex<HashMap<TransferId, (String, Vec<u8>)>>,
}

impl MemoryObjectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bytes stored for `id`.
    pub fn get(&self, id: &TransferId) -> Option<Vec<u8>> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.get(id).map(|(_, data)| data.clone())
    }

    /// Returns the filename stored for `id`.
    pub fn filename(&self, id: &TransferId) -> Option<String> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.get(id).map(|(name, _)| name.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectSink for MemoryObjectSink {
    fn store_object<'a>(&'a self, manifest: &'a ObjectManifest, mut chunks: ChunkStream<'a>) -> SinkFuture<'a> {
        Box::pin(async move {
            let mut data = Vec::with_capacity(manifest.expected_size as usize);
            while let Some(item) = chunks.next().await {
                let (_, payload) = item?;
                data.extend_from_slice(&payload);
            }
            let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
            objects.insert(manifest.transfer_id.clone(), (manifest.filename.clone(), data));
            Ok(format!("memory://{}", manifest.transfer_id))
        })
    }
}

// ---------------------------------------------------------------------------
// FsObjectSink
// ---------------------------------------------------------------------------

/// Writes objects to `<root>/<transfer id>.bin` with a JSON sidecar
/// `<root>/<transfer id>.json`.
///
/// The sender's filename is opaque and only recorded in the sidecar; it is
/// never used to build a path.
pub struct FsObjectSink {
    root: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta<'a> {
    transfer_id: &'a TransferId,
    filename: &'a str,
    size: u64,
    hash: String,
    stored_at: chrono::DateTime<chrono::Utc>,
}

impl FsObjectSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the object file for `id`.
    pub fn object_path(&self, id: &TransferId) -> PathBuf {
        self.root.join(format!("{id}.bin"))
    }
}

impl ObjectSink for FsObjectSink {
    fn store_object<'a>(&'a self, manifest: &'a ObjectManifest, mut chunks: ChunkStream<'a>) -> SinkFuture<'a> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.root).await?;

            let id = &manifest.transfer_id;
            let part = self.root.join(format!("{id}.part"));
            let result: Result<u64, SinkError> = async {
                let mut file = tokio::fs::File::create(&part).await?;
                let mut written = 0u64;
                while let Some(item) = chunks.next().await {
                    let (_, payload) = item?;
                    file.write_all(&payload).await?;
                    written += payload.len() as u64;
                }
                file.sync_all().await?;
                Ok(written)
            }
            .await;

            let written = match result {
                Ok(n) => n,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(e);
                }
            };

            let meta = ObjectMeta {
                transfer_id: id,
                filename: &manifest.filename,
                size: written,
                hash: manifest.expected_hash.to_hex(),
                stored_at: chrono::Utc::now(),
            };
            tokio::fs::write(
                self.root.join(format!("{id}.json")),
                serde_json::to_vec_pretty(&meta)?,
            )
            .await?;

            let path = self.object_path(id);
            tokio::fs::rename(&part, &path).await?;
            tracing::info!(transfer_id = %id, path = %path.display(), bytes = written, "object stored");
            Ok(path.display().to_string())
        })
    }
}
