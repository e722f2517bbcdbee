//! Line-delimited JSON framing.

use serde::Serialize;
use thiserror::Error;

use crate::envelope::{RequestEnvelope, ResponseEnvelope};

/// Upper bound on a single framed message, newline included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("message exceeds {MAX_LINE_BYTES} bytes")]
    TooLarge,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message carries no client id")]
    MissingClientId,
}

/// Serialize `msg` as one JSON line, trailing newline included.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    if buf.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    Ok(buf)
}

/// Parse one request line. Requests without a client id are rejected.
pub fn decode_request(line: &str) -> Result<RequestEnvelope, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    let req: RequestEnvelope = serde_json::from_str(line)?;
    if req.client_id.is_empty() {
        return Err(ProtocolError::MissingClientId);
    }
    Ok(req)
}

pub fn decode_response(line: &str) -> Result<ResponseEnvelope, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(line)?)
}
