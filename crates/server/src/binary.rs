//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw payload.
//!
//! Lets a peer send chunk bytes without base64 overhead. The header carries
//! everything a JSON `file_chunk` would, minus the payload.

use serde::{Deserialize, Serialize};

/// Header of a binary chunk frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryChunkHeader {
    /// Request id echoed in the `chunk_ack` or `error` reply.
    pub id: String,
    pub transfer_id: String,
    pub index: u32,
    pub chunk_hash: String,
}

/// Parses a raw binary WebSocket frame.
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_binary_chunk(data: &[u8]) -> Result<(BinaryChunkHeader, Vec<u8>), ParseError> {
    let Some((len_bytes, rest)) = data.split_first_chunk::<4>() else {
        return Err(ParseError::TooShort);
    };
    let header_len = u32::from_be_bytes(*len_bytes) as usize;

    if rest.len() < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }

    let (header_bytes, payload) = rest.split_at(header_len);
    let header: BinaryChunkHeader =
        serde_json::from_slice(header_bytes).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    Ok((header, payload.to_vec()))
}

/// Encodes a binary chunk frame.
pub fn encode_binary_chunk(
    header: &BinaryChunkHeader,
    payload: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}
