//! Job definition, input and exit types

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::StreamMeta;

/// Terminal size in character cells
///
/// Signed so that nonsensical sizes sent by a peer can be reported back as
/// errors instead of failing to decode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermSize {
    pub rows: i32,
    pub cols: i32,
}

impl TermSize {
    pub const DEFAULT_ROWS: i32 = 25;
    pub const DEFAULT_COLS: i32 = 80;

    pub fn new(rows: i32, cols: i32) -> Self {
        Self { rows, cols }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ROWS, Self::DEFAULT_COLS)
    }
}

/// Command the job manager should run under a PTY
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StartJobRequest {
    pub cmd: String,
    pub args: Vec<String>,
    /// Added on top of the job manager's own environment
    pub env: HashMap<String, String>,
    pub term_size: Option<TermSize>,
    /// Connect this stream at offset 0 before the PTY output starts flowing
    pub stream: Option<StreamMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartJobResult {
    pub cmd_pid: u32,
    pub cmd_pgid: i32,
    pub job_manager_pid: u32,
    /// Unix milliseconds when the job manager started
    pub job_manager_start_ts: i64,
}

/// Reply to a (corked) stream connect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectResult {
    /// Offset the stream will resume from
    pub seq: u64,
    pub stream_done: bool,
    pub stream_error: Option<String>,
    pub exit: Option<ExitInfo>,
}

/// Keystrokes, a signal and/or a resize for the running job
///
/// Inputs from one `input_session_id` are applied in `seq_num` order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JobInput {
    pub input_session_id: Option<String>,
    pub seq_num: u64,
    pub input_data64: Option<String>,
    pub sig_name: Option<String>,
    pub term_size: Option<TermSize>,
}

impl JobInput {
    /// Input carrying raw bytes for the PTY
    pub fn data(bytes: &[u8]) -> Self {
        Self {
            input_data64: Some(STANDARD.encode(bytes)),
            ..Self::default()
        }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            sig_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn resize(size: TermSize) -> Self {
        Self {
            term_size: Some(size),
            ..Self::default()
        }
    }

    /// Tag this input with its ordering key
    pub fn in_session(mut self, session_id: impl Into<String>, seq_num: u64) -> Self {
        self.input_session_id = Some(session_id.into());
        self.seq_num = seq_num;
        self
    }

    /// Decode the input bytes, if any
    pub fn decode_data(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.input_data64
            .as_deref()
            .map(|d| STANDARD.decode(d))
            .transpose()
    }
}

/// How the job's process ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// OS exit status, or -1 when the process was killed by a signal
    pub exit_code: i32,
    pub exit_signal: Option<String>,
    pub exit_err: Option<String>,
    /// Unix milliseconds when the exit was observed
    pub exit_ts: i64,
}

/// Pushed to the attached main server when the process exits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobExited {
    pub job_id: String,
    pub exit: ExitInfo,
}
