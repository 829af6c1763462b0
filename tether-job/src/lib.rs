//! tether-job: a detached PTY job with a resumable output stream
//!
//! One job manager process runs one job. Main servers connect over a Unix
//! socket, authenticate in both directions, and then drive the job and
//! consume its output through a windowed, ACK-based stream that survives
//! disconnects.

pub mod auth;
pub mod cli;
pub mod config;
pub mod conn;
pub mod daemon;
pub mod input;
#[cfg(unix)]
pub mod listener;
pub mod manager;
pub mod pty;
pub mod stream;

pub use auth::{sign_token, AccessClaims, AccessVerifier};
pub use config::{ConfigLoader, JobConfig};
pub use conn::{serve_connection, ConnId, MainServerConn};
pub use input::ReorderQueue;
#[cfg(unix)]
pub use listener::JobListener;
pub use manager::{JobIdentity, JobManager};
pub use pty::{JobCmd, JobSignal, SignalSupport};
pub use stream::{CircularBuffer, DataSender, StreamManager};
