use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// This acts as a read deadline: if *nothing* arrives within this window
/// the connection is considered dead. The peer can reconnect and send
/// `resume_transfer` to pick up where it left off.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Suggested chunk size returned to peers (4 MiB).
pub const DEFAULT_CHUNK_SIZE_HINT: u32 = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Error codes carried in `WsError::code`
// ---------------------------------------------------------------------------

/// Malformed or missing fields.
pub const ERR_INVALID_REQUEST: i32 = 400;
/// Unknown (or already retired) transfer id.
pub const ERR_NOT_FOUND: i32 = 404;
/// Transfer is terminal, or a chunk index was re-sent with different content.
pub const ERR_CONFLICT: i32 = 409;
/// Chunk would push the transfer past its declared size.
pub const ERR_SIZE_EXCEEDED: i32 = 413;
/// Chunk or object hash mismatch.
pub const ERR_INTEGRITY: i32 = 422;
/// Unknown message type.
pub const ERR_NOT_IMPLEMENTED: i32 = 501;
/// Storage failure; the chunk may be retried.
pub const ERR_STORAGE: i32 = 503;
/// Anything else.
pub const ERR_INTERNAL: i32 = 500;

/// WebSocket message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Keepalive
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Requests from peer to server
    #[serde(rename = "start_transfer")]
    StartTransfer,
    #[serde(rename = "file_chunk")]
    FileChunk,
    #[serde(rename = "resume_transfer")]
    ResumeTransfer,

    // Responses
    #[serde(rename = "transfer_started")]
    TransferStarted,
    #[serde(rename = "chunk_ack")]
    ChunkAck,
    #[serde(rename = "resume_response")]
    ResumeResponse,

    // Events
    #[serde(rename = "transfer_completed")]
    TransferCompleted,

    #[serde(rename = "error")]
    Error,

    /// Any type this build does not know about.
    #[serde(other)]
    Unknown,
}
