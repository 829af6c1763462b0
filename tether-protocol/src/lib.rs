//! tether-protocol: Wire definitions shared by job managers and main servers
//!
//! Defines the messages and data structures exchanged over a job manager's
//! Unix socket, and the length-prefixed codec that frames them.

pub mod codec;
pub mod messages;
pub mod types;

// Re-export main types at crate root
pub use codec::{CodecError, JobCodec, PeerCodec, MAX_MESSAGE_SIZE};
pub use messages::{JobMessage, JobRequest, JobResponse, PeerMessage, RpcError, ServerRequest};
pub use types::{
    ConnectResult, ExitInfo, JobExited, JobInput, StartJobRequest, StartJobResult, StreamAck,
    StreamData, StreamMeta, TermSize,
};
