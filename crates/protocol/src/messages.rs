use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens a new transfer.
///
/// `hash` is the hex SHA-256 of the whole object. `filename` is opaque and
/// only forwarded to the object sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransferRequest {
    #[serde(default)]
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub hash: String,
    /// Sender's intended chunk size. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
}

/// Sends one chunk of a transfer.
///
/// `payload` is base64-encoded in JSON. Peers that want to avoid the base64
/// overhead can use the binary chunk frame instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkRequest {
    pub transfer_id: String,
    pub index: u32,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub chunk_hash: String,
}

/// Asks which chunk indices are already durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTransferRequest {
    pub transfer_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Acknowledges `start_transfer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransferResponse {
    pub transfer_id: String,
    /// Suggested chunk size in bytes.
    pub chunk_size: u32,
}

/// Acknowledges a chunk.
///
/// Sent only after the chunk's outcome is final; when `completes_transfer`
/// is set the object has already been verified and handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckResponse {
    pub transfer_id: String,
    pub index: u32,
    pub completes_transfer: bool,
    pub received_bytes: u64,
}

/// Answer to `resume_transfer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTransferResponse {
    pub transfer_id: String,
    pub received_indices: Vec<u32>,
    pub received_bytes: u64,
    pub expected_size: u64,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Pushed to the peer that sent the final chunk once the object is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCompletedEvent {
    pub transfer_id: String,
    pub size: u64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Custom base64 serde module for raw chunk bytes.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_chunk_payload_is_base64() {
        let req = FileChunkRequest {
            transfer_id: "t1".into(),
            index: 2,
            payload: b"abc".to_vec(),
            chunk_hash: "00".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["payload"], "YWJj");
        assert_eq!(json["transferId"], "t1");
        assert_eq!(json["chunkHash"], "00");
    }

    #[test]
    fn file_chunk_rejects_bad_base64() {
        let json = r#"{"transferId":"t1","index":0,"payload":"!!!","chunkHash":"00"}"#;
        let parsed: Result<FileChunkRequest, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn start_transfer_optional_fields() {
        let json = r#"{"size":6}"#;
        let req: StartTransferRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.size, 6);
        assert!(req.hash.is_empty());
        assert!(req.filename.is_empty());
        assert!(req.chunk_size.is_none());

        let out = serde_json::to_string(&req).unwrap();
        assert!(!out.contains("chunkSize"));
    }

    #[test]
    fn chunk_ack_field_names() {
        let ack = ChunkAckResponse {
            transfer_id: "t1".into(),
            index: 0,
            completes_transfer: true,
            received_bytes: 6,
        };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"completesTransfer\":true"));
        assert!(json.contains("\"receivedBytes\":6"));
    }

    #[test]
    fn completed_event_omits_empty_location() {
        let evt = TransferCompletedEvent {
            transfer_id: "t1".into(),
            size: 6,
            hash: "ab".into(),
            location: String::new(),
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(!json.contains("location"));
    }
}
