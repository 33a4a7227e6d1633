//! Transfer coordinator: owns every active session and drives its state machine.
//!
//! ```text
//! Initiated --first chunk--> Receiving --all bytes, no gap--> Finalizing
//! Finalizing --hash ok--> Completed
//! Finalizing --hash mismatch--> Failed
//! any non-terminal --timeout / integrity violation--> Failed
//! ```
//!
//! Locking: the session table is a short-lived `std::sync::RwLock` used only
//! for insert, lookup, and evict. Each session has its own async operation
//! lock held for the whole of `accept_chunk` (store write and finalize
//! included), so operations on one transfer are serialized while different
//! transfers proceed in parallel. Session fields sit behind a separate
//! `std::sync::Mutex` that is never held across an `.await`, which lets
//! `resume_transfer` read metadata without waiting on chunk I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use chunkvault_protocol::constants::DEFAULT_CHUNK_SIZE_HINT;
use chunkvault_protocol::types::{FailureReason, TransferState};

use crate::journal::SessionJournal;
use crate::reassembler::{FinalObject, FinalizeError, Reassembler};
use crate::scan::ContentScanner;
use crate::session::{Readiness, TransferSession};
use crate::sink::ObjectSink;
use crate::store::ChunkStore;
use crate::verifier::{self, ContentHash};
use crate::{ChunkIndex, TransferError, TransferId};

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Chunk size suggested to peers in `transfer_started`.
    pub chunk_size_hint: u32,
    /// How many retired transfer ids are remembered for "already terminal"
    /// answers to late chunk messages.
    pub retired_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            chunk_size_hint: DEFAULT_CHUNK_SIZE_HINT,
            retired_capacity: 1024,
        }
    }
}

/// Parameters of a `start-transfer` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTransfer {
    pub filename: String,
    pub expected_size: u64,
    /// Hex SHA-256 of the whole object.
    pub expected_hash: String,
    pub chunk_size_hint: Option<u32>,
}

/// Outcome of a successfully handled chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub transfer_id: TransferId,
    pub index: ChunkIndex,
    pub completes_transfer: bool,
    /// Bytes received when this chunk was committed.
    pub received_bytes: u64,
    /// Present when this chunk completed the transfer.
    pub object: Option<FinalObject>,
}

/// Answer to `resume_transfer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    pub transfer_id: TransferId,
    pub received_indices: Vec<ChunkIndex>,
    pub received_bytes: u64,
    pub expected_size: u64,
    pub state: TransferState,
}

/// One entry of the session table.
struct SessionSlot {
    /// Serializes mutating operations on this transfer.
    op: tokio::sync::Mutex<()>,
    data: Mutex<TransferSession>,
}

impl SessionSlot {
    fn new(session: TransferSession) -> Arc<Self> {
        Arc::new(Self {
            op: tokio::sync::Mutex::new(()),
            data: Mutex::new(session),
        })
    }

    fn data(&self) -> MutexGuard<'_, TransferSession> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded memory of transfers that reached a terminal state.
struct RetiredLog {
    order: VecDeque<TransferId>,
    states: HashMap<TransferId, TransferState>,
    capacity: usize,
}

impl RetiredLog {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            states: HashMap::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: TransferId, state: TransferState) {
        if self.capacity == 0 {
            return;
        }
        if self.states.insert(id.clone(), state).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.states.remove(&old);
            }
        }
    }

    fn get(&self, id: &TransferId) -> Option<TransferState> {
        self.states.get(id).copied()
    }
}

/// Owns all in-flight transfers.
pub struct TransferCoordinator {
    store: Arc<dyn ChunkStore>,
    journal: Arc<dyn SessionJournal>,
    reassembler: Reassembler,
    sessions: RwLock<HashMap<TransferId, Arc<SessionSlot>>>,
    retired: Mutex<RetiredLog>,
    config: CoordinatorConfig,
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        journal: Arc<dyn SessionJournal>,
        sink: Arc<dyn ObjectSink>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            reassembler: Reassembler::new(Arc::clone(&store), sink),
            store,
            journal,
            sessions: RwLock::new(HashMap::new()),
            retired: Mutex::new(RetiredLog::new(config.retired_capacity)),
            config,
        }
    }

    /// Runs `scanner` on every verified object before it is stored.
    pub fn with_scanner(mut self, scanner: Arc<dyn ContentScanner>) -> Self {
        self.reassembler = self.reassembler.with_scanner(scanner);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of sessions that are not yet terminal.
    pub fn active_count(&self) -> usize {
        self.table().len()
    }

    /// Copy of the current session record.
    pub fn session_snapshot(&self, id: &TransferId) -> Option<TransferSession> {
        let slot = self.table().get(id).cloned()?;
        let snapshot = slot.data().clone();
        Some(snapshot)
    }

    /// Terminal state of a recently retired transfer.
    pub fn retired_state(&self, id: &TransferId) -> Option<TransferState> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner).get(id)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Opens a new transfer and returns its id.
    ///
    /// Always creates a fresh session, even if an identical size/hash pair
    /// is already in flight; resumption is explicit via
    /// [`resume_transfer`](Self::resume_transfer).
    pub async fn start_transfer(&self, req: StartTransfer) -> Result<TransferId, TransferError> {
        if req.expected_size == 0 {
            return Err(TransferError::InvalidRequest("size must be greater than zero".into()));
        }
        if req.expected_hash.trim().is_empty() {
            return Err(TransferError::InvalidRequest("hash is required".into()));
        }
        let expected_hash: ContentHash = req
            .expected_hash
            .parse()
            .map_err(|e| TransferError::InvalidRequest(format!("hash: {e}")))?;

        let id = TransferId::generate();
        let session = TransferSession::new(
            id.clone(),
            req.filename,
            req.expected_size,
            expected_hash,
            req.chunk_size_hint,
            Utc::now(),
        );
        self.journal.save(&session).await?;

        self.table_mut().insert(id.clone(), SessionSlot::new(session));
        tracing::info!(transfer_id = %id, size = req.expected_size, "transfer started");
        Ok(id)
    }

    /// Accepts one chunk.
    ///
    /// The returned ack (or error) is the chunk's final outcome. When this
    /// chunk completes the object, finalization runs before returning.
    pub async fn accept_chunk(
        &self,
        id: &TransferId,
        index: ChunkIndex,
        payload: &[u8],
        declared_hash: &str,
    ) -> Result<ChunkAck, TransferError> {
        let declared: ContentHash = declared_hash
            .parse()
            .map_err(|e| TransferError::InvalidRequest(format!("chunk hash: {e}")))?;

        let slot = self.active_slot(id)?;
        let _op = slot.op.lock().await;

        let size = payload.len() as u64;
        let now = Utc::now();
        let (existing, received, expected) = {
            let s = slot.data();
            if s.state().is_terminal() {
                // Retired while this call waited for the operation lock.
                return Err(TransferError::Terminal {
                    id: id.clone(),
                    state: s.state(),
                });
            }
            (s.chunk(index).copied(), s.received_bytes(), s.expected_size())
        };

        if payload.is_empty() {
            return Err(TransferError::InvalidRequest("empty chunk payload".into()));
        }

        if !verifier::verify_chunk(payload, &declared) {
            tracing::warn!(transfer_id = %id, index, "chunk hash mismatch, not stored");
            return Err(TransferError::ChunkHashMismatch { index });
        }

        if let Some(prior) = existing {
            if prior.hash == declared {
                tracing::debug!(transfer_id = %id, index, "duplicate chunk");
                slot.data().touch(now);
                return Ok(ChunkAck {
                    transfer_id: id.clone(),
                    index,
                    completes_transfer: false,
                    received_bytes: prior.acked_bytes,
                    object: None,
                });
            }
            tracing::error!(transfer_id = %id, index, "committed chunk re-sent with different content");
            self.retire(id, &slot, TransferState::Failed(FailureReason::ChunkConflict))
                .await;
            return Err(TransferError::ChunkConflict { index });
        }

        if received + size > expected {
            tracing::warn!(transfer_id = %id, index, size, received, expected, "chunk exceeds declared size");
            slot.data().touch(now);
            return Err(TransferError::SizeExceeded {
                index,
                size,
                received,
                expected,
            });
        }

        if let Err(e) = self.store.write_chunk(id, index, payload).await {
            tracing::warn!(transfer_id = %id, index, "chunk write failed: {e}");
            return Err(e.into());
        }

        let (received_bytes, snapshot) = {
            let mut s = slot.data();
            let total = s.record_chunk(index, size, declared, now);
            (total, s.clone())
        };
        if let Err(e) = self.journal.save(&snapshot).await {
            tracing::warn!(transfer_id = %id, index, "journal write failed: {e}");
            slot.data().rollback_chunk(index);
            return Err(e.into());
        }
        tracing::debug!(transfer_id = %id, index, size, received_bytes, "chunk accepted");

        let readiness = slot.data().readiness();
        match readiness {
            Readiness::Pending => Ok(ChunkAck {
                transfer_id: id.clone(),
                index,
                completes_transfer: false,
                received_bytes,
                object: None,
            }),
            Readiness::Gap { missing } => {
                tracing::warn!(transfer_id = %id, missing, "declared size reached with missing chunk");
                self.retire(id, &slot, TransferState::Failed(FailureReason::Incomplete))
                    .await;
                Err(FinalizeError::Incomplete(format!(
                    "declared size reached but chunk {missing} is missing"
                ))
                .into())
            }
            Readiness::Ready { .. } => {
                let object = self.finish(id, &slot).await?;
                Ok(ChunkAck {
                    transfer_id: id.clone(),
                    index,
                    completes_transfer: true,
                    received_bytes,
                    object: Some(object),
                })
            }
        }
    }

    /// Reports which chunk indices are already stored.
    ///
    /// Read-only, and never waits on an in-flight chunk write.
    pub fn resume_transfer(&self, id: &TransferId) -> Result<ResumeInfo, TransferError> {
        let slot = self
            .table()
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        let s = slot.data();
        if s.state().is_terminal() {
            return Err(TransferError::NotFound(id.clone()));
        }
        Ok(ResumeInfo {
            transfer_id: id.clone(),
            received_indices: s.received_indices(),
            received_bytes: s.received_bytes(),
            expected_size: s.expected_size(),
            state: s.state(),
        })
    }

    /// Fails every session idle for longer than `max_idle` and reclaims its
    /// storage. Returns the expired ids.
    ///
    /// Sessions that are finalizing, or busy with another operation right
    /// now, are left alone.
    pub async fn expire_stale(&self, now: DateTime<Utc>, max_idle: Duration) -> Vec<TransferId> {
        let max_idle = chrono::TimeDelta::from_std(max_idle).unwrap_or(chrono::TimeDelta::MAX);
        let slots: Vec<(TransferId, Arc<SessionSlot>)> = self
            .table()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut expired = Vec::new();
        for (id, slot) in slots {
            let Ok(_op) = slot.op.try_lock() else {
                continue;
            };
            let stale = {
                let s = slot.data();
                !s.state().is_terminal()
                    && s.state() != TransferState::Finalizing
                    && s.is_idle(now, max_idle)
            };
            if stale {
                tracing::info!(transfer_id = %id, "transfer timed out");
                self.retire(&id, &slot, TransferState::Failed(FailureReason::Timeout))
                    .await;
                expired.push(id);
            }
        }
        expired
    }

    /// Reloads sessions from the journal after a restart.
    ///
    /// Sessions that already hold every chunk are finalized now; the others
    /// wait for the peer to resume. Returns the number of sessions restored.
    pub async fn recover(&self) -> Result<usize, TransferError> {
        let sessions = self.journal.load_all().await?;
        let mut restored = Vec::new();

        for session in sessions {
            let id = session.id().clone();
            if session.state().is_terminal() {
                if let Err(e) = self.journal.remove(&id).await {
                    tracing::warn!(transfer_id = %id, "failed to remove journal record: {e}");
                }
                continue;
            }
            let slot = SessionSlot::new(session);
            self.table_mut().insert(id.clone(), Arc::clone(&slot));
            restored.push((id, slot));
        }

        let count = restored.len();
        for (id, slot) in restored {
            let _op = slot.op.lock().await;
            let readiness = slot.data().readiness();
            match readiness {
                Readiness::Pending => {}
                Readiness::Gap { .. } => {
                    self.retire(&id, &slot, TransferState::Failed(FailureReason::Incomplete))
                        .await;
                }
                Readiness::Ready { .. } => {
                    if let Err(e) = self.finish(&id, &slot).await {
                        tracing::warn!(transfer_id = %id, "finalize after restart failed: {e}");
                    }
                }
            }
        }

        tracing::info!(count, "sessions recovered");
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn table(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TransferId, Arc<SessionSlot>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TransferId, Arc<SessionSlot>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up an active session, distinguishing unknown from retired ids.
    fn active_slot(&self, id: &TransferId) -> Result<Arc<SessionSlot>, TransferError> {
        if let Some(slot) = self.table().get(id).cloned() {
            return Ok(slot);
        }
        match self.retired_state(id) {
            Some(state) => Err(TransferError::Terminal {
                id: id.clone(),
                state,
            }),
            None => Err(TransferError::NotFound(id.clone())),
        }
    }

    /// Finalizes a session whose chunks are all present. Caller holds the
    /// operation lock.
    async fn finish(
        &self,
        id: &TransferId,
        slot: &Arc<SessionSlot>,
    ) -> Result<FinalObject, TransferError> {
        let manifest = {
            let mut s = slot.data();
            s.transition(TransferState::Finalizing);
            s.manifest()
        };

        match self.reassembler.finalize(&manifest).await {
            Ok(object) => {
                self.retire(id, slot, TransferState::Completed).await;
                tracing::info!(transfer_id = %id, location = %object.location, "transfer completed");
                Ok(object)
            }
            Err(e) => {
                tracing::warn!(transfer_id = %id, "transfer failed: {e}");
                self.retire(id, slot, TransferState::Failed(e.failure_reason()))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Moves a session to a terminal state, evicts it, and reclaims its
    /// chunk data and journal record. Caller holds the operation lock.
    async fn retire(&self, id: &TransferId, slot: &Arc<SessionSlot>, state: TransferState) {
        slot.data().transition(state);

        self.table_mut().remove(id);
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), state);

        if let Err(e) = self.store.delete_transfer(id).await {
            tracing::warn!(transfer_id = %id, "failed to delete chunk data: {e}");
        }
        if let Err(e) = self.journal.remove(id).await {
            tracing::warn!(transfer_id = %id, "failed to remove journal record: {e}");
        }
    }
}
