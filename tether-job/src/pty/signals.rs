//! Signal names and delivery, per platform
//!
//! Peers send signal names as free-form strings ("int", "SIGTERM", ...).
//! [`SignalSupport`] turns those into something deliverable and sends it.

use tether_utils::{Result, TetherError};

/// Canonical signals a peer may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobSignal {
    Hup,
    Int,
    Quit,
    Kill,
    Term,
    Usr1,
    Usr2,
    Stop,
    Cont,
}

impl JobSignal {
    /// Parse a signal name: case-insensitive, with or without the `SIG` prefix
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "HUP" => Some(Self::Hup),
            "INT" => Some(Self::Int),
            "QUIT" => Some(Self::Quit),
            "KILL" => Some(Self::Kill),
            "TERM" => Some(Self::Term),
            "USR1" => Some(Self::Usr1),
            "USR2" => Some(Self::Usr2),
            "STOP" => Some(Self::Stop),
            "CONT" => Some(Self::Cont),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Hup => "SIGHUP",
            Self::Int => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Kill => "SIGKILL",
            Self::Term => "SIGTERM",
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
            Self::Stop => "SIGSTOP",
            Self::Cont => "SIGCONT",
        }
    }
}

impl std::fmt::Display for JobSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Platform capability for signalling the job's process
pub trait SignalSupport: Send + Sync {
    /// Map a peer-supplied name to a signal this platform can deliver
    fn normalize(&self, name: &str) -> Result<JobSignal>;

    /// Deliver `signal` to a single process
    fn send(&self, pid: u32, signal: JobSignal) -> Result<()>;

    /// Deliver `signal` to every process in a group
    fn send_group(&self, pgid: i32, signal: JobSignal) -> Result<()>;

    /// Process group of `pid`
    fn process_group(&self, pid: u32) -> Result<i32>;
}

#[cfg(unix)]
mod unix {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::{self, Pid};

    use super::*;

    /// Signals delivered with kill(2)
    #[derive(Debug, Default, Clone, Copy)]
    pub struct UnixSignals;

    impl UnixSignals {
        fn to_nix(signal: JobSignal) -> Signal {
            match signal {
                JobSignal::Hup => Signal::SIGHUP,
                JobSignal::Int => Signal::SIGINT,
                JobSignal::Quit => Signal::SIGQUIT,
                JobSignal::Kill => Signal::SIGKILL,
                JobSignal::Term => Signal::SIGTERM,
                JobSignal::Usr1 => Signal::SIGUSR1,
                JobSignal::Usr2 => Signal::SIGUSR2,
                JobSignal::Stop => Signal::SIGSTOP,
                JobSignal::Cont => Signal::SIGCONT,
            }
        }

        fn pid(pid: u32) -> Result<Pid> {
            i32::try_from(pid)
                .map(Pid::from_raw)
                .map_err(|_| TetherError::internal(format!("pid {} out of range", pid)))
        }
    }

    impl SignalSupport for UnixSignals {
        fn normalize(&self, name: &str) -> Result<JobSignal> {
            JobSignal::from_name(name)
                .ok_or_else(|| TetherError::InvalidMessage(format!("unknown signal: {}", name)))
        }

        fn send(&self, pid: u32, sig: JobSignal) -> Result<()> {
            signal::kill(Self::pid(pid)?, Self::to_nix(sig))
                .map_err(|e| TetherError::internal(format!("failed to send {} to {}: {}", sig, pid, e)))
        }

        fn send_group(&self, pgid: i32, sig: JobSignal) -> Result<()> {
            signal::killpg(Pid::from_raw(pgid), Self::to_nix(sig)).map_err(|e| {
                TetherError::internal(format!("failed to send {} to group {}: {}", sig, pgid, e))
            })
        }

        fn process_group(&self, pid: u32) -> Result<i32> {
            unistd::getpgid(Some(Self::pid(pid)?))
                .map(Pid::as_raw)
                .map_err(|e| TetherError::internal(format!("getpgid({}) failed: {}", pid, e)))
        }
    }
}

#[cfg(unix)]
pub use unix::UnixSignals;

/// Fallback for platforms without POSIX signals
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedSignals;

impl SignalSupport for UnsupportedSignals {
    fn normalize(&self, name: &str) -> Result<JobSignal> {
        Err(TetherError::Unsupported(format!("signal {}", name)))
    }

    fn send(&self, _pid: u32, signal: JobSignal) -> Result<()> {
        Err(TetherError::Unsupported(format!("signal {}", signal)))
    }

    fn send_group(&self, _pgid: i32, signal: JobSignal) -> Result<()> {
        Err(TetherError::Unsupported(format!("signal {}", signal)))
    }

    fn process_group(&self, _pid: u32) -> Result<i32> {
        Err(TetherError::Unsupported("process groups".into()))
    }
}

/// Signal support for the current platform
pub fn platform_signals() -> std::sync::Arc<dyn SignalSupport> {
    #[cfg(unix)]
    {
        std::sync::Arc::new(UnixSignals)
    }
    #[cfg(not(unix))]
    {
        std::sync::Arc::new(UnsupportedSignals)
    }
}
