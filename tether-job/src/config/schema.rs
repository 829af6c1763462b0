//! Configuration schema structs

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    pub stream: StreamConfig,
    pub input: InputConfig,
    pub rpc: RpcConfig,
    pub daemon: DaemonConfig,
}

/// Output stream flow control
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Local cap on unacknowledged bytes in flight
    pub cwnd_size: usize,
    /// Capacity of the output ring buffer
    pub buffer_size: usize,
    /// Largest payload carried by one data packet
    pub max_packet_size: usize,
    /// Bytes requested per PTY read
    pub read_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            cwnd_size: 64 * 1024,
            buffer_size: 2 * 1024 * 1024,
            max_packet_size: 4 * 1024,
            read_chunk_size: 4 * 1024,
        }
    }
}

/// Input ordering
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    /// How long an out-of-order input waits for the gap to fill
    pub reorder_timeout_ms: u64,
    /// Ordered inputs queued for the PTY before new ones are dropped
    pub reorder_capacity: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            reorder_timeout_ms: 50,
            reorder_capacity: 64,
        }
    }
}

impl InputConfig {
    pub fn reorder_timeout(&self) -> Duration {
        Duration::from_millis(self.reorder_timeout_ms)
    }
}

/// Timeouts around the socket protocol and process lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    /// Deadline for requests the job manager sends to its main server
    pub request_timeout_ms: u64,
    /// Delay between acknowledging ExitJobManager and shutting down
    pub exit_delay_ms: u64,
    /// Grace period after forwarding a termination signal to the job
    pub signal_grace_ms: u64,
    /// Deadline for reading the job auth token from stdin
    pub token_read_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            exit_delay_ms: 500,
            signal_grace_ms: 100,
            token_read_timeout_ms: 5000,
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn exit_delay(&self) -> Duration {
        Duration::from_millis(self.exit_delay_ms)
    }

    pub fn signal_grace(&self) -> Duration {
        Duration::from_millis(self.signal_grace_ms)
    }

    pub fn token_read_timeout(&self) -> Duration {
        Duration::from_millis(self.token_read_timeout_ms)
    }
}

/// Detached-mode settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Where stdout/stderr go once detached (defaults to the job's log file)
    pub log_file: Option<PathBuf>,
}
