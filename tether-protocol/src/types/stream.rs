//! Output stream packets
//!
//! Sequence numbers are absolute byte offsets into the job's output, counted
//! from the first byte the job ever produced. They never reset across
//! reconnects.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Identifies one connected incarnation of the output stream plus the
/// receive window the peer is prepared to accept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamMeta {
    pub id: String,
    pub rwnd: u64,
}

impl StreamMeta {
    pub fn new(id: impl Into<String>, rwnd: u64) -> Self {
        Self { id: id.into(), rwnd }
    }
}

/// A data or terminal packet sent from the job to the peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamData {
    pub id: String,
    pub seq: u64,
    /// Base64 payload, empty for terminal packets
    pub data64: String,
    pub eof: bool,
    pub error: Option<String>,
}

impl StreamData {
    /// Build a data packet, base64-encoding the payload
    pub fn data(id: impl Into<String>, seq: u64, payload: &[u8]) -> Self {
        Self {
            id: id.into(),
            seq,
            data64: STANDARD.encode(payload),
            eof: false,
            error: None,
        }
    }

    /// Build the terminal packet for a clean end of stream
    pub fn eof(id: impl Into<String>, seq: u64) -> Self {
        Self {
            id: id.into(),
            seq,
            data64: String::new(),
            eof: true,
            error: None,
        }
    }

    /// Build the terminal packet for a stream that ended with a read error
    pub fn error(id: impl Into<String>, seq: u64, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            seq,
            data64: String::new(),
            eof: false,
            error: Some(error.into()),
        }
    }

    /// True for EOF and error packets
    pub fn is_terminal(&self) -> bool {
        self.eof || self.error.is_some()
    }

    /// Decode the payload
    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data64)
    }
}

/// Acknowledgement of every byte below `seq`, sent from the peer to the job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamAck {
    pub id: String,
    pub seq: u64,
    pub rwnd: u64,
    /// Set once the peer has received the terminal packet
    pub fin: bool,
}

impl StreamAck {
    pub fn new(id: impl Into<String>, seq: u64, rwnd: u64) -> Self {
        Self {
            id: id.into(),
            seq,
            rwnd,
            fin: false,
        }
    }

    pub fn fin(id: impl Into<String>, seq: u64, rwnd: u64) -> Self {
        Self {
            fin: true,
            ..Self::new(id, seq, rwnd)
        }
    }
}
