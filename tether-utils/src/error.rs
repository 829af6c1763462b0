//! Error types for tether
//!
//! Provides a unified error type used across all tether crates.

use std::path::PathBuf;

/// Main error type for tether operations
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out after {millis}ms")]
    RequestTimeout { millis: u64 },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    // === Protocol Errors ===

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // === Auth Errors ===

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Failed to authenticate to main server: {0}")]
    SelfAuthFailed(String),

    // === Job Errors ===

    #[error("Job not started")]
    JobNotStarted,

    #[error("Job already started")]
    JobAlreadyStarted,

    #[error("Invalid terminal size: {rows}x{cols}")]
    InvalidTermSize { rows: i32, cols: i32 },

    #[error("Process already exited")]
    ProcessExited,

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    // === Stream Errors ===

    #[error("Cannot consume {requested} bytes, only {available} buffered")]
    BufferOverConsume { requested: usize, available: usize },

    #[error("Another writer is already blocked on this buffer")]
    WriterBusy,

    #[error("Write cancelled after {written} bytes")]
    WriteCancelled { written: usize },

    #[error("Resume offset {client_seq} out of range (head={head}, buffered={size})")]
    ResumeOutOfRange { client_seq: u64, head: u64, size: usize },

    #[error("Stream client already connected")]
    AlreadyConnected,

    #[error("Reader already attached")]
    ReaderAlreadyAttached,

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Stream error: {0}")]
    Stream(String),

    // === PTY Errors ===

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TetherError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an auth error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a PTY error
    pub fn pty(msg: impl Into<String>) -> Self {
        Self::Pty(msg.into())
    }

    /// Create a stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::Connection(_) | Self::ConnectionClosed
        )
    }
}

/// Result type alias using TetherError
pub type Result<T> = std::result::Result<T, TetherError>;
