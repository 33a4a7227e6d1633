//! Durable session metadata.
//!
//! Chunk bytes live in the [`ChunkStore`](crate::ChunkStore); the journal
//! keeps the matching [`TransferSession`] records so a restarted coordinator
//! can still answer `resume_transfer` and pick up where it stopped.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

use crate::TransferId;
use crate::session::TransferSession;

/// A boxed future returned by journal methods.
pub type JournalFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, JournalError>> + Send + 'a>>;

/// Errors produced by session journals.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt session record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Persistence for session metadata.
pub trait SessionJournal: Send + Sync + 'static {
    /// Writes (or replaces) the record for `session.id()`.
    fn save<'a>(&'a self, session: &'a TransferSession) -> JournalFuture<'a, ()>;

    /// Returns every stored record.
    ///
    /// A record that cannot be parsed or fails its consistency checks is
    /// logged and left out; the remaining records still load.
    fn load_all(&self) -> JournalFuture<'_, Vec<TransferSession>>;

    /// Deletes the record for `id`. Safe if absent.
    fn remove<'a>(&'a self, id: &'a TransferId) -> JournalFuture<'a, ()>;
}

// ---------------------------------------------------------------------------
// MemoryJournal
// ---------------------------------------------------------------------------

/// In-process journal, useful for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryJournal {
    records: RwLock<HashMap<TransferId, TransferSession>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored record for `id`.
    pub fn get(&self, id: &TransferId) -> Option<TransferSession> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionJournal for MemoryJournal {
    fn save<'a>(&'a self, session: &'a TransferSession) -> JournalFuture<'a, ()> {
        Box::pin(async move {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            records.insert(session.id().clone(), session.clone());
            Ok(())
        })
    }

    fn load_all(&self) -> JournalFuture<'_, Vec<TransferSession>> {
        Box::pin(async move {
            let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
            Ok(records.values().cloned().collect())
        })
    }

    fn remove<'a>(&'a self, id: &'a TransferId) -> JournalFuture<'a, ()> {
        Box::pin(async move {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            records.remove(id);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// FsJournal
// ---------------------------------------------------------------------------

/// One JSON file per session: `<root>/<transfer id>.json`.
///
/// Records are written to a temp file and renamed, so a crash leaves either
/// the previous or the new record, never a torn one.
pub struct FsJournal {
    root: PathBuf,
}

impl FsJournal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &TransferId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

/// Parses and checks one record file.
async fn read_record(path: &Path) -> Result<TransferSession, JournalError> {
    let content = tokio::fs::read(path).await?;
    let session: TransferSession = serde_json::from_slice(&content)?;
    session
        .check_invariants()
        .map_err(|reason| JournalError::Corrupt {
            id: session.id().to_string(),
            reason,
        })?;
    Ok(session)
}

impl SessionJournal for FsJournal {
    fn save<'a>(&'a self, session: &'a TransferSession) -> JournalFuture<'a, ()> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.root).await?;
            let content = serde_json::to_vec_pretty(session)?;

            let path = self.record_path(session.id());
            let tmp = self.root.join(format!(".{}.tmp", session.id()));
            tokio::fs::write(&tmp, &content).await?;

            // Restrict permissions on Unix.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
            }

            tokio::fs::rename(&tmp, &path).await?;
            Ok(())
        })
    }

    fn load_all(&self) -> JournalFuture<'_, Vec<TransferSession>> {
        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(&self.root).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut sessions = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_record = path.extension().is_some_and(|ext| ext == "json")
                    && !entry.file_name().to_string_lossy().starts_with('.');
                if !is_record {
                    continue;
                }

                match read_record(&path).await {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "skipping unreadable session record: {e}");
                        let aside = path.with_extension("corrupt");
                        if let Err(e) = tokio::fs::rename(&path, &aside).await {
                            tracing::warn!(path = %path.display(), "failed to move record aside: {e}");
                        }
                    }
                }
            }

            tracing::debug!(count = sessions.len(), root = %self.root.display(), "journal loaded");
            Ok(sessions)
        })
    }

    fn remove<'a>(&'a self, id: &'a TransferId) -> JournalFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.record_path(id)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::hash_chunk;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample(id: &str) -> TransferSession {
        let mut s = TransferSession::new(
            TransferId::from(id),
            "report.pdf".into(),
            6,
            hash_chunk(b"abcdef"),
            Some(3),
            Utc::now(),
        );
        s.record_chunk(0, 3, hash_chunk(b"abc"), Utc::now());
        s
    }

    #[tokio::test]
    async fn memory_journal_save_replace_remove() {
        let journal = MemoryJournal::new();
        let mut s = sample("t1");
        journal.save(&s).await.unwrap();
        s.record_chunk(1, 3, hash_chunk(b"def"), Utc::now());
        journal.save(&s).await.unwrap();

        assert_eq!(journal.len(), 1);
        assert_eq!(journal.get(s.id()).unwrap().received_bytes(), 6);

        journal.remove(s.id()).await.unwrap();
        journal.remove(s.id()).await.unwrap();
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn fs_journal_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let s = sample("t1");
        FsJournal::new(dir.path()).save(&s).await.unwrap();

        let reopened = FsJournal::new(dir.path());
        let loaded = reopened.load_all().await.unwrap();
        assert_eq!(loaded, vec![s]);
    }

    #[tokio::test]
    async fn fs_journal_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let journal = FsJournal::new(dir.path().join("never-created"));
        assert!(journal.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fs_journal_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let journal = FsJournal::new(dir.path());
        let s = sample("t1");
        journal.save(&s).await.unwrap();
        journal.remove(s.id()).await.unwrap();
        journal.remove(s.id()).await.unwrap();
        assert!(journal.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fs_journal_sets_aside_bad_records() {
        let dir = TempDir::new().unwrap();
        let good = sample("t1");
        let journal = FsJournal::new(dir.path());
        journal.save(&good).await.unwrap();

        let mut drifted = serde_json::to_value(sample("t2")).unwrap();
        drifted["receivedBytes"] = serde_json::json!(4);
        std::fs::write(dir.path().join("t2.json"), drifted.to_string()).unwrap();
        std::fs::write(dir.path().join("t3.json"), b"{not json").unwrap();

        let loaded = journal.load_all().await.unwrap();
        assert_eq!(loaded, vec![good]);
        assert!(dir.path().join("t2.corrupt").exists());
        assert!(dir.path().join("t3.corrupt").exists());
        assert!(!dir.path().join("t3.json").exists());

        // Set-aside records are not picked up again.
        assert_eq!(journal.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_record_reports_drift() {
        let dir = TempDir::new().unwrap();
        let mut json = serde_json::to_value(sample("t1")).unwrap();
        json["receivedBytes"] = serde_json::json!(4);
        let path = dir.path().join("t1.json");
        std::fs::write(&path, json.to_string()).unwrap();

        let err = read_record(&path).await.unwrap_err();
        assert!(matches!(err, JournalError::Corrupt { .. }));
    }
}
