//! Job output streaming
//!
//! [`CircularBuffer`] holds unacknowledged output; [`StreamManager`] drives
//! the reader and send tasks and the ACK protocol on top of it.

mod buffer;
mod manager;

pub use buffer::{BufferWriter, CircularBuffer};
pub use manager::{DataSender, OutputSource, StreamManager};
