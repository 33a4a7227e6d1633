use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chunkvault_protocol::types::{FailureReason, TransferState};

use crate::reassembler::ObjectManifest;
use crate::verifier::ContentHash;
use crate::{ChunkIndex, TransferId};

/// A verified, stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// Size of the chunk in bytes.
    pub size: u64,
    /// SHA-256 of the chunk payload.
    pub hash: ContentHash,
    /// `received_bytes` as acknowledged when this chunk was committed.
    pub acked_bytes: u64,
}

/// Whether a session has everything it needs to finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// More bytes are expected.
    Pending,
    /// Byte total reached and indices `0..chunk_count` are all present.
    Ready { chunk_count: u32 },
    /// Byte total reached but an index below the highest one is missing.
    Gap { missing: ChunkIndex },
}

/// Server-side record of one transfer.
///
/// `received_bytes` is only changed together with `received_chunks`, through
/// [`record_chunk`](Self::record_chunk) and
/// [`rollback_chunk`](Self::rollback_chunk).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    id: TransferId,
    filename: String,
    expected_size: u64,
    expected_hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_size_hint: Option<u32>,
    received_chunks: BTreeMap<ChunkIndex, ChunkRecord>,
    received_bytes: u64,
    state: TransferState,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl TransferSession {
    /// Creates a session in the `Initiated` state.
    pub fn new(
        id: TransferId,
        filename: String,
        expected_size: u64,
        expected_hash: ContentHash,
        chunk_size_hint: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            filename,
            expected_size,
            expected_hash,
            chunk_size_hint,
            received_chunks: BTreeMap::new(),
            received_bytes: 0,
            state: TransferState::Initiated,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn id(&self) -> &TransferId {
        &self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn expected_hash(&self) -> &ContentHash {
        &self.expected_hash
    }

    pub fn chunk_size_hint(&self) -> Option<u32> {
        self.chunk_size_hint
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// Returns the record for `index`, if that chunk was committed.
    pub fn chunk(&self, index: ChunkIndex) -> Option<&ChunkRecord> {
        self.received_chunks.get(&index)
    }

    /// Committed indices in ascending order.
    pub fn received_indices(&self) -> Vec<ChunkIndex> {
        self.received_chunks.keys().copied().collect()
    }

    /// Bytes still missing before the declared size is reached.
    pub fn remaining_bytes(&self) -> u64 {
        self.expected_size - self.received_bytes
    }

    /// Commits a verified chunk and returns the updated byte count.
    ///
    /// The caller has already checked for duplicates and capacity.
    pub fn record_chunk(
        &mut self,
        index: ChunkIndex,
        size: u64,
        hash: ContentHash,
        now: DateTime<Utc>,
    ) -> u64 {
        debug_assert!(!self.received_chunks.contains_key(&index));
        debug_assert!(size <= self.remaining_bytes());

        self.received_bytes += size;
        self.received_chunks.insert(
            index,
            ChunkRecord {
                size,
                hash,
                acked_bytes: self.received_bytes,
            },
        );
        if self.state == TransferState::Initiated {
            self.state = TransferState::Receiving;
        }
        self.last_activity_at = now;
        self.received_bytes
    }

    /// Undoes [`record_chunk`](Self::record_chunk) when the commit could not
    /// be made durable.
    pub fn rollback_chunk(&mut self, index: ChunkIndex) {
        if let Some(record) = self.received_chunks.remove(&index) {
            self.received_bytes -= record.size;
        }
        if self.received_chunks.is_empty() && self.state == TransferState::Receiving {
            self.state = TransferState::Initiated;
        }
    }

    /// Marks activity without changing anything else.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    /// Moves the session to `state`.
    ///
    /// Terminal states are sticky: once `Completed` or `Failed`, later calls
    /// are ignored and `false` is returned.
    pub fn transition(&mut self, state: TransferState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        true
    }

    /// Shorthand for `transition(Failed(reason))`.
    pub fn fail(&mut self, reason: FailureReason) -> bool {
        self.transition(TransferState::Failed(reason))
    }

    /// Decides whether the session can finalize.
    ///
    /// Byte count alone is not enough: chunks whose sizes happen to sum to
    /// the declared size may still leave a gap in the index range.
    pub fn readiness(&self) -> Readiness {
        if self.received_bytes < self.expected_size {
            return Readiness::Pending;
        }
        let count = self.received_chunks.len() as u32;
        match self.received_chunks.keys().zip(0..).find(|(idx, expected)| **idx != *expected) {
            None => Readiness::Ready { chunk_count: count },
            Some((_, missing)) => Readiness::Gap { missing },
        }
    }

    /// Returns `true` if the session has been idle longer than `max_idle`.
    pub fn is_idle(&self, now: DateTime<Utc>, max_idle: chrono::TimeDelta) -> bool {
        now.signed_duration_since(self.last_activity_at) > max_idle
    }

    /// Describes the object for the reassembler.
    pub fn manifest(&self) -> ObjectManifest {
        ObjectManifest {
            transfer_id: self.id.clone(),
            filename: self.filename.clone(),
            expected_size: self.expected_size,
            expected_hash: self.expected_hash,
            chunk_count: self.received_chunks.len() as u32,
        }
    }

    /// Checks the stored invariants of a session loaded from outside memory.
    pub fn check_invariants(&self) -> Result<(), String> {
        let sum: u64 = self.received_chunks.values().map(|c| c.size).sum();
        if sum != self.received_bytes {
            return Err(format!(
                "received bytes {} disagree with chunk sizes {sum}",
                self.received_bytes
            ));
        }
        if self.received_bytes > self.expected_size {
            return Err(format!(
                "received bytes {} exceed expected size {}",
                self.received_bytes, self.expected_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::hash_chunk;

    fn session(size: u64) -> TransferSession {
        TransferSession::new(
            TransferId::from("s1"),
            "file.bin".into(),
            size,
            hash_chunk(b"whole"),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn new_session_is_initiated() {
        let s = session(6);
        assert_eq!(s.state(), TransferState::Initiated);
        assert_eq!(s.received_bytes(), 0);
        assert_eq!(s.remaining_bytes(), 6);
        assert_eq!(s.readiness(), Readiness::Pending);
    }

    #[test]
    fn first_chunk_moves_to_receiving() {
        let mut s = session(6);
        let total = s.record_chunk(1, 3, hash_chunk(b"def"), Utc::now());
        assert_eq!(total, 3);
        assert_eq!(s.state(), TransferState::Receiving);
        assert_eq!(s.chunk(1).unwrap().acked_bytes, 3);
    }

    #[test]
    fn ready_only_when_indices_contiguous() {
        let mut s = session(6);
        s.record_chunk(1, 3, hash_chunk(b"def"), Utc::now());
        assert_eq!(s.readiness(), Readiness::Pending);
        s.record_chunk(0, 3, hash_chunk(b"abc"), Utc::now());
        assert_eq!(s.readiness(), Readiness::Ready { chunk_count: 2 });
    }

    #[test]
    fn gap_detected_when_sizes_sum_correctly() {
        let mut s = session(6);
        s.record_chunk(0, 3, hash_chunk(b"abc"), Utc::now());
        s.record_chunk(2, 3, hash_chunk(b"ghi"), Utc::now());
        assert_eq!(s.readiness(), Readiness::Gap { missing: 1 });
    }

    #[test]
    fn rollback_restores_counters() {
        let mut s = session(6);
        s.record_chunk(0, 3, hash_chunk(b"abc"), Utc::now());
        s.rollback_chunk(0);
        assert_eq!(s.received_bytes(), 0);
        assert!(s.received_indices().is_empty());
        assert_eq!(s.state(), TransferState::Initiated);
        s.check_invariants().unwrap();
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut s = session(6);
        assert!(s.transition(TransferState::Completed));
        assert!(!s.fail(FailureReason::Timeout));
        assert_eq!(s.state(), TransferState::Completed);
    }

    #[test]
    fn idle_detection() {
        let start = Utc::now();
        let s = TransferSession::new(
            TransferId::from("s1"),
            String::new(),
            6,
            hash_chunk(b"x"),
            None,
            start,
        );
        let window = chrono::TimeDelta::seconds(10);
        assert!(!s.is_idle(start + chrono::TimeDelta::seconds(5), window));
        assert!(s.is_idle(start + chrono::TimeDelta::seconds(11), window));
    }

    #[test]
    fn json_roundtrip_keeps_invariants() {
        let mut s = session(6);
        s.record_chunk(0, 3, hash_chunk(b"abc"), Utc::now());
        let json = serde_json::to_string(&s).unwrap();
        let back: TransferSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        back.check_invariants().unwrap();
    }

    #[test]
    fn check_invariants_catches_drift() {
        let mut s = session(6);
        s.record_chunk(0, 3, hash_chunk(b"abc"), Utc::now());
        let mut json: serde_json::Value = serde_json::to_value(&s).unwrap();
        json["receivedBytes"] = serde_json::json!(5);
        let tampered: TransferSession = serde_json::from_value(json).unwrap();
        assert!(tampered.check_invariants().is_err());
    }

    #[test]
    fn manifest_counts_chunks() {
        let mut s = session(6);
        s.record_chunk(0, 3, hash_chunk(b"abc"), Utc::now());
        s.record_chunk(1, 3, hash_chunk(b"def"), Utc::now());
        let m = s.manifest();
        assert_eq!(m.chunk_count, 2);
        assert_eq!(m.expected_size, 6);
        assert_eq!(m.filename, "file.bin");
    }
}
