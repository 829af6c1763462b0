//! PTY-backed job process
//!
//! Uses portable-pty for the terminal and a per-platform
//! [`SignalSupport`] for signal delivery.

mod cmd;
mod signals;

pub use cmd::{resolve_term_size, JobCmd};
pub use signals::{platform_signals, JobSignal, SignalSupport, UnsupportedSignals};
#[cfg(unix)]
pub use signals::UnixSignals;
