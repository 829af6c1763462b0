//! Process-level plumbing for the job manager binary

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use tether_utils::{log_dir, Result, TetherError};

use crate::config::JobConfig;
use crate::manager::JobManager;
use crate::pty::JobSignal;

/// Label on the stdin line that carries the job auth token
pub const JOB_AUTH_TOKEN_LABEL: &str = "Tether-JobAuthToken";

/// Extract the token from a `Tether-JobAuthToken:<token>` line
pub fn parse_job_auth_token(line: &str) -> Result<String> {
    let prefix = format!("{}:", JOB_AUTH_TOKEN_LABEL);
    let token = line
        .trim()
        .strip_prefix(&prefix)
        .ok_or_else(|| TetherError::auth(format!("invalid token line, expected '{}'", prefix)))?
        .trim();
    if token.is_empty() {
        return Err(TetherError::auth("empty job auth token"));
    }
    Ok(token.to_string())
}

/// Read the job auth token line from `reader` within `timeout`
pub async fn read_job_auth_token<R>(reader: R, timeout: Duration) -> Result<String>
where
    R: BufRead + Send + 'static,
{
    let read = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut line = String::new();
        reader.read_line(&mut line).map(|_| line)
    });

    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(Ok(line))) => parse_job_auth_token(&line),
        Ok(Ok(Err(e))) => Err(TetherError::auth(format!("failed to read job auth token: {}", e))),
        Ok(Err(e)) => Err(TetherError::internal(format!("token reader failed: {}", e))),
        Err(_) => Err(TetherError::auth(format!(
            "no job auth token within {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Where a daemonized job manager sends its stdout and stderr
pub fn daemon_log_path(config: &JobConfig, job_id: &str) -> PathBuf {
    config
        .daemon
        .log_file
        .clone()
        .unwrap_or_else(|| log_dir().join(format!("job-{}.out", job_id)))
}

/// Detach from the controlling terminal
///
/// Starts a new session, points stdin at `/dev/null` and stdout/stderr at
/// `log_path`, and ignores SIGHUP.
#[cfg(unix)]
pub fn daemonize(log_path: &Path) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{signal, SigHandler, Signal};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    match nix::unistd::setsid() {
        Ok(_) => {}
        // Already a process group leader; keep the current session
        Err(Errno::EPERM) => debug!("setsid not permitted, staying in current session"),
        Err(e) => return Err(TetherError::internal(format!("setsid failed: {}", e))),
    }

    if let Some(parent) = log_path.parent() {
        tether_utils::ensure_dir(parent).map_err(|e| TetherError::FileWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let devnull = std::fs::File::open("/dev/null").map_err(|e| TetherError::FileRead {
        path: PathBuf::from("/dev/null"),
        source: e,
    })?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(log_path)
        .map_err(|e| TetherError::FileWrite {
            path: log_path.to_path_buf(),
            source: e,
        })?;

    redirect_fd(devnull.as_raw_fd(), libc::STDIN_FILENO)?;
    redirect_fd(log.as_raw_fd(), libc::STDOUT_FILENO)?;
    redirect_fd(log.as_raw_fd(), libc::STDERR_FILENO)?;

    // SAFETY: installs SIG_IGN, no handler code runs
    unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }
        .map_err(|e| TetherError::internal(format!("failed to ignore SIGHUP: {}", e)))?;
    Ok(())
}

#[cfg(unix)]
fn redirect_fd(from: libc::c_int, to: libc::c_int) -> Result<()> {
    // SAFETY: both descriptors are open for the duration of the call
    if unsafe { libc::dup2(from, to) } < 0 {
        return Err(TetherError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_log_path: &Path) -> Result<()> {
    Err(TetherError::Unsupported("daemon mode".into()))
}

/// Tell the launcher the socket is ready, then close the descriptor
#[cfg(unix)]
pub fn signal_ready(fd: i32) -> Result<()> {
    use std::io::Write;
    use std::os::unix::io::FromRawFd;

    // SAFETY: the launcher handed us this descriptor for our exclusive use
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    file.write_all(b"ready\n")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_ready(_fd: i32) -> Result<()> {
    Err(TetherError::Unsupported("ready descriptor".into()))
}

/// Pass termination signals to the job, then shut the manager down
///
/// SIGHUP is only watched when still attached to a terminal; a daemon
/// ignores it.
#[cfg(unix)]
pub async fn forward_signals(manager: Arc<JobManager>, daemonized: bool) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = if daemonized {
        None
    } else {
        Some(signal(SignalKind::hangup())?)
    };

    let received = tokio::select! {
        _ = sigint.recv() => JobSignal::Int,
        _ = sigterm.recv() => JobSignal::Term,
        Some(_) = async {
            match sighup.as_mut() {
                Some(s) => s.recv().await,
                None => std::future::pending().await,
            }
        } => JobSignal::Hup,
    };

    info!(signal = %received, "forwarding signal to job");
    manager.forward_signal(received);
    tokio::time::sleep(manager.config().rpc.signal_grace()).await;
    manager.shutdown();
    Ok(())
}

#[cfg(not(unix))]
pub async fn forward_signals(manager: Arc<JobManager>, _daemonized: bool) -> Result<()> {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to wait for ctrl-c");
        return Ok(());
    }
    manager.forward_signal(JobSignal::Int);
    tokio::time::sleep(manager.config().rpc.signal_grace()).await;
    manager.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // ==================== Token Line Tests ====================

    #[test]
    fn test_parse_token_line() {
        assert_eq!(
            parse_job_auth_token("Tether-JobAuthToken:abc123\n").unwrap(),
            "abc123"
        );
        assert_eq!(
            parse_job_auth_token("  Tether-JobAuthToken: spaced  ").unwrap(),
            "spaced"
        );
    }

    #[test]
    fn test_parse_token_line_rejects_bad_input() {
        assert!(parse_job_auth_token("abc123").is_err());
        assert!(parse_job_auth_token("Tether-JobAuthToken:").is_err());
        assert!(parse_job_auth_token("").is_err());
    }

    #[tokio::test]
    async fn test_read_token_from_reader() {
        let input = Cursor::new(b"Tether-JobAuthToken:tok\nignored\n".to_vec());
        let token = read_job_auth_token(input, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(token, "tok");
    }

    #[tokio::test]
    async fn test_read_token_times_out() {
        struct Stalled;
        impl std::io::Read for Stalled {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(0)
            }
        }

        let reader = std::io::BufReader::new(Stalled);
        let err = read_job_auth_token(reader, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no job auth token"));
    }

    // ==================== Path Tests ====================

    #[test]
    fn test_daemon_log_path() {
        let mut config = JobConfig::default();
        assert!(daemon_log_path(&config, "j1").ends_with("job-j1.out"));

        config.daemon.log_file = Some(PathBuf::from("/var/tmp/custom.log"));
        assert_eq!(
            daemon_log_path(&config, "j1"),
            PathBuf::from("/var/tmp/custom.log")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_ready_writes_line() {
        use std::io::Read;
        use std::os::unix::io::IntoRawFd;

        let (mut reader, writer) = std::os::unix::net::UnixStream::pair().unwrap();
        signal_ready(writer.into_raw_fd()).unwrap();

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ready\n");
    }
}
