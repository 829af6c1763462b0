//! Messages exchanged between a job manager and its main server
//!
//! Both sides can issue requests. Each side numbers its own requests, so a
//! `req_id` is only unique per direction.

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Error carried back across the socket in place of a response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub message: String,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

// ==================== Main Server -> Job Manager ====================

/// Requests the main server sends to a job manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobRequest {
    /// Present a signed access token (first half of the mutual handshake)
    AuthenticateToJobManager { job_access_token: String },
    /// Spawn the job's process
    StartJob(StartJobRequest),
    /// Connect a stream with a zero window; nothing flows until `StartStream`
    PrepareConnect { stream: StreamMeta, seq: u64 },
    /// Open the window remembered by the last `PrepareConnect`
    StartStream,
    /// Close the PTY master so the process sees a hangup
    Terminate,
    /// Query how the process exited, if it has
    ExitInfo,
    /// Shut the job manager down
    ExitJobManager,
}

impl JobRequest {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuthenticateToJobManager { .. } => "authenticate_to_job_manager",
            Self::StartJob(_) => "start_job",
            Self::PrepareConnect { .. } => "prepare_connect",
            Self::StartStream => "start_stream",
            Self::Terminate => "terminate",
            Self::ExitInfo => "exit_info",
            Self::ExitJobManager => "exit_job_manager",
        }
    }
}

/// Frames read by the job manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerMessage {
    Request { req_id: u64, request: JobRequest },
    /// Reply to a request the job manager issued
    Response {
        req_id: u64,
        result: Result<(), RpcError>,
    },
    StreamAck(StreamAck),
    JobInput(JobInput),
}

// ==================== Job Manager -> Main Server ====================

/// Requests the job manager sends to its main server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerRequest {
    /// Prove the job manager's identity (second half of the handshake)
    AuthenticateJobManager {
        job_id: String,
        job_auth_token: String,
    },
}

/// Successful replies to a [`JobRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobResponse {
    Ok,
    Started(StartJobResult),
    Connected(ConnectResult),
    ExitInfo(Option<ExitInfo>),
}

/// Frames written by the job manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobMessage {
    Request { req_id: u64, request: ServerRequest },
    Response {
        req_id: u64,
        result: Result<JobResponse, RpcError>,
    },
    StreamData(StreamData),
    JobExited(JobExited),
}
