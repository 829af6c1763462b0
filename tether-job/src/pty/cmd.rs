//! The job's process, running under a PTY

use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tether_protocol::{ExitInfo, JobInput, StartJobRequest, TermSize};
use tether_utils::{Result, TetherError};

use super::signals::{JobSignal, SignalSupport};

/// Apply the default size for unset dimensions and reject the rest
pub fn resolve_term_size(size: Option<TermSize>) -> Result<PtySize> {
    let mut size = size.unwrap_or_default();
    if size.rows == 0 || size.cols == 0 {
        size = TermSize::default();
    }
    to_pty_size(size)
}

fn to_pty_size(size: TermSize) -> Result<PtySize> {
    let invalid = || TetherError::InvalidTermSize {
        rows: size.rows,
        cols: size.cols,
    };
    if size.rows <= 0 || size.cols <= 0 {
        return Err(invalid());
    }
    Ok(PtySize {
        rows: u16::try_from(size.rows).map_err(|_| invalid())?,
        cols: u16::try_from(size.cols).map_err(|_| invalid())?,
        pixel_width: 0,
        pixel_height: 0,
    })
}

struct CmdState {
    exit: Option<ExitInfo>,
    pty_closed: bool,
}

/// One process attached to a PTY
///
/// Exit information is captured exactly once by a background waiter and is
/// immutable afterwards.
pub struct JobCmd {
    job_id: String,
    pid: u32,
    /// Process group right after spawn, before the child can be reaped
    start_pgid: i32,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    state: Mutex<CmdState>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    signals: Arc<dyn SignalSupport>,
}

impl JobCmd {
    /// Spawn `def` under a new PTY and start the exit waiter
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        job_id: impl Into<String>,
        def: &StartJobRequest,
        signals: Arc<dyn SignalSupport>,
    ) -> Result<Arc<Self>> {
        let job_id = job_id.into();
        let size = resolve_term_size(def.term_size)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| TetherError::pty(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&def.cmd);
        cmd.args(&def.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        for (key, value) in &def.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TetherError::ProcessSpawn(format!("{}: {}", def.cmd, e)))?;
        // Only the child keeps the slave open, so its exit ends the output
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| TetherError::ProcessSpawn("child has no pid".into()))?;

        // The child runs in its own session, so its group is its pid
        let start_pgid = signals.process_group(pid).unwrap_or(pid as i32);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TetherError::pty(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TetherError::pty(format!("Failed to get writer: {}", e)))?;

        let (exit_tx, _) = watch::channel(None);
        let job = Arc::new(Self {
            job_id,
            pid,
            start_pgid,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            state: Mutex::new(CmdState {
                exit: None,
                pty_closed: false,
            }),
            exit_tx,
            signals,
        });

        info!(job_id = %job.job_id, pid, cmd = %def.cmd, rows = size.rows, cols = size.cols, "job process started");
        tokio::spawn(Arc::clone(&job).wait_loop(child));
        Ok(job)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Hand out the PTY output reader. Returns `None` after the first call.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        self.reader.lock().take()
    }

    /// Apply keystrokes, a signal and a resize, whichever are present
    ///
    /// Each part is attempted even if an earlier one fails; the first error
    /// is returned.
    pub fn handle_input(&self, input: &JobInput) -> Result<()> {
        let mut first_err = None;

        match input.decode_data() {
            Ok(Some(data)) => {
                if let Err(e) = self.write_input(&data) {
                    first_err.get_or_insert(e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                first_err.get_or_insert(TetherError::InvalidMessage(format!(
                    "bad input data: {}",
                    e
                )));
            }
        }

        if let Some(name) = &input.sig_name {
            let result = self
                .signals
                .normalize(name)
                .and_then(|sig| self.send_signal(sig));
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }

        if let Some(size) = input.term_size {
            if let Err(e) = self.resize(size) {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let writer = writer
            .as_mut()
            .ok_or_else(|| TetherError::pty("PTY is closed"))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| TetherError::pty(format!("Write failed: {}", e)))
    }

    /// Send `signal` to the process
    pub fn send_signal(&self, signal: JobSignal) -> Result<()> {
        let st = self.state.lock();
        if st.exit.is_some() {
            return Err(TetherError::ProcessExited);
        }
        debug!(job_id = %self.job_id, pid = self.pid, signal = %signal, "signalling job");
        self.signals.send(self.pid, signal)
    }

    /// Resize the PTY
    pub fn resize(&self, size: TermSize) -> Result<()> {
        let pty_size = to_pty_size(size)?;
        let master = self.master.lock();
        let master = master
            .as_ref()
            .ok_or_else(|| TetherError::pty("PTY is closed"))?;
        master
            .resize(pty_size)
            .map_err(|e| TetherError::pty(format!("Resize failed: {}", e)))
    }

    /// Process group the job was started in, available even after exit
    pub fn start_pgid(&self) -> i32 {
        self.start_pgid
    }

    /// Process group for signal fan-out
    pub fn pgid(&self) -> Result<i32> {
        let st = self.state.lock();
        if st.exit.is_some() {
            return Err(TetherError::ProcessExited);
        }
        self.signals.process_group(self.pid)
    }

    /// Close our side of the PTY so the job sees a hangup
    ///
    /// The output reader holds its own descriptor, so the hangup the kernel
    /// would deliver on last close is sent to the process group explicitly.
    /// Safe to call repeatedly.
    pub fn terminate_by_closing_pty_master(&self) {
        let exited = {
            let mut st = self.state.lock();
            if st.pty_closed {
                return;
            }
            st.pty_closed = true;
            st.exit.is_some()
        };

        self.writer.lock().take();
        self.master.lock().take();
        info!(job_id = %self.job_id, "closed PTY master");

        if exited {
            return;
        }
        let result = self
            .signals
            .process_group(self.pid)
            .and_then(|pgid| self.signals.send_group(pgid, JobSignal::Hup))
            .or_else(|_| self.signals.send(self.pid, JobSignal::Hup));
        if let Err(e) = result {
            warn!(job_id = %self.job_id, error = %e, "failed to hang up job");
        }
    }

    /// Exit information, once the process has exited
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.state.lock().exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.state.lock().exit.is_some()
    }

    /// Watch for the exit; the value turns `Some` exactly once
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_tx.subscribe()
    }

    /// Wait until the process has exited
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.subscribe_exit();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as self, so this only races shutdown
                if let Some(exit) = self.exit_info() {
                    return exit;
                }
            }
        }
    }

    async fn wait_loop(self: Arc<Self>, child: Box<dyn Child + Send + Sync>) {
        let pid = self.pid;
        let exit = match tokio::task::spawn_blocking(move || wait_for_exit(child, pid)).await {
            Ok(exit) => exit,
            Err(e) => ExitInfo {
                exit_code: -1,
                exit_err: Some(format!("waiter failed: {}", e)),
                exit_ts: chrono::Utc::now().timestamp_millis(),
                ..ExitInfo::default()
            },
        };

        {
            let mut st = self.state.lock();
            if st.exit.is_some() {
                return;
            }
            st.exit = Some(exit.clone());
        }
        info!(
            job_id = %self.job_id,
            exit_code = exit.exit_code,
            exit_signal = ?exit.exit_signal,
            exit_err = ?exit.exit_err,
            "job process exited"
        );
        self.exit_tx.send_replace(Some(exit));
    }
}

/// Block until the child exits and classify how it ended
#[cfg(unix)]
fn wait_for_exit(child: Box<dyn Child + Send + Sync>, pid: u32) -> ExitInfo {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    // waitpid reports the signal itself, which the portable status only
    // carries as a description
    let result = loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    };
    drop(child);

    let exit_ts = chrono::Utc::now().timestamp_millis();
    match result {
        Ok(WaitStatus::Exited(_, code)) => ExitInfo {
            exit_code: code,
            exit_ts,
            ..ExitInfo::default()
        },
        Ok(WaitStatus::Signaled(_, signal, _)) => ExitInfo {
            exit_code: -1,
            exit_signal: Some(signal.as_str().to_string()),
            exit_ts,
            ..ExitInfo::default()
        },
        Ok(other) => ExitInfo {
            exit_code: -1,
            exit_err: Some(format!("unexpected wait status: {:?}", other)),
            exit_ts,
            ..ExitInfo::default()
        },
        Err(e) => ExitInfo {
            exit_code: -1,
            exit_err: Some(format!("wait failed: {}", e)),
            exit_ts,
            ..ExitInfo::default()
        },
    }
}

#[cfg(not(unix))]
fn wait_for_exit(mut child: Box<dyn Child + Send + Sync>, _pid: u32) -> ExitInfo {
    let exit_ts = chrono::Utc::now().timestamp_millis();
    match child.wait() {
        Ok(status) => match status.signal() {
            Some(signal) => ExitInfo {
                exit_code: -1,
                exit_signal: Some(signal.to_string()),
                exit_ts,
                ..ExitInfo::default()
            },
            None => ExitInfo {
                exit_code: status.exit_code() as i32,
                exit_ts,
                ..ExitInfo::default()
            },
        },
        Err(e) => ExitInfo {
            exit_code: -1,
            exit_err: Some(format!("wait failed: {}", e)),
            exit_ts,
            ..ExitInfo::default()
        },
    }
}

impl std::fmt::Debug for JobCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCmd")
            .field("job_id", &self.job_id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}
