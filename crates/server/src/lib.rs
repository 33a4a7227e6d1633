//! WebSocket transport for chunkvault.
//!
//! Accepts any number of peer connections, dispatches JSON and binary
//! messages to a [`Handler`], and manages each connection's lifecycle
//! (ping/pong, graceful shutdown). Replies always go back on the connection
//! that sent the request.

mod binary;
mod connection;
mod handler;
mod server;
mod transfer_handler;

pub use binary::{BinaryChunkHeader, ParseError, encode_binary_chunk, parse_binary_chunk};
pub use connection::{PeerConnection, PeerMeta, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, TransferServer};
pub use transfer_handler::TransferHandler;

/// Per-connection send buffer capacity.
///
/// A peer that streams chunks without waiting for acks can queue one ack per
/// chunk plus a completion event.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the transfer server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection limit reached ({0})")]
    TooManyConnections(usize),
}
