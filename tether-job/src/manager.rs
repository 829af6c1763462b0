//! The per-job manager
//!
//! A [`JobManager`] owns at most one [`JobCmd`] and exactly one
//! [`StreamManager`] for its output. Main servers reach it through
//! [`MainServerConn`]s; the manager tracks which connection is attached
//! (authenticated both ways) and which one currently receives the stream.
//! At most one of each exists at a time.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tether_protocol::{
    ConnectResult, ExitInfo, JobExited, JobInput, JobMessage, ServerRequest, StartJobRequest,
    StartJobResult, StreamAck, StreamMeta,
};
use tether_utils::{Result, TetherError};

use crate::auth::AccessVerifier;
use crate::config::JobConfig;
use crate::conn::{ConnId, MainServerConn};
use crate::input::ReorderQueue;
use crate::pty::{platform_signals, JobCmd, JobSignal, SignalSupport};
use crate::stream::StreamManager;

/// Who this job manager is
#[derive(Debug, Clone)]
pub struct JobIdentity {
    pub client_id: String,
    pub job_id: String,
    /// Secret the job manager proves itself to main servers with
    pub job_auth_token: String,
}

#[derive(Default)]
struct ManagerState {
    cmd: Option<Arc<JobCmd>>,
    attached: Option<Arc<MainServerConn>>,
    stream_client: Option<ConnId>,
    /// Window to open on `StartStream`, set by `PrepareConnect`
    pending_stream: Option<StreamMeta>,
}

pub struct JobManager {
    config: JobConfig,
    identity: JobIdentity,
    verifier: AccessVerifier,
    signals: Arc<dyn SignalSupport>,
    stream: Arc<StreamManager>,
    input: ReorderQueue<JobInput>,
    /// Unix millis when this manager started
    start_ts: i64,
    state: Mutex<ManagerState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl JobManager {
    /// Create the manager and its background tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: JobConfig, identity: JobIdentity, verifier: AccessVerifier) -> Arc<Self> {
        Self::with_signals(config, identity, verifier, platform_signals())
    }

    pub fn with_signals(
        config: JobConfig,
        identity: JobIdentity,
        verifier: AccessVerifier,
        signals: Arc<dyn SignalSupport>,
    ) -> Arc<Self> {
        let stream = StreamManager::new(config.stream.clone());
        let (input, input_rx) = ReorderQueue::from_config(&config.input);
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = Arc::new(Self {
            config,
            identity,
            verifier,
            signals,
            stream,
            input,
            start_ts: chrono::Utc::now().timestamp_millis(),
            state: Mutex::new(ManagerState::default()),
            shutdown_tx,
        });

        tokio::spawn(input_loop(Arc::downgrade(&manager), input_rx));
        info!(
            client_id = %manager.identity.client_id,
            job_id = %manager.identity.job_id,
            "job manager ready"
        );
        manager
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn job_id(&self) -> &str {
        &self.identity.job_id
    }

    pub fn client_id(&self) -> &str {
        &self.identity.client_id
    }

    pub fn stream(&self) -> &Arc<StreamManager> {
        &self.stream
    }

    pub fn cmd(&self) -> Option<Arc<JobCmd>> {
        self.state.lock().cmd.clone()
    }

    pub fn is_job_started(&self) -> bool {
        self.state.lock().cmd.is_some()
    }

    /// Connection currently attached, if any
    pub fn attached_conn_id(&self) -> Option<ConnId> {
        self.state.lock().attached.as_ref().map(|c| c.id())
    }

    /// Connection currently receiving the output stream, if any
    pub fn stream_conn_id(&self) -> Option<ConnId> {
        self.state.lock().stream_client
    }

    // ==================== Shutdown ====================

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop accepting connections and close existing ones
    pub fn shutdown(&self) {
        info!(job_id = %self.identity.job_id, "job manager shutting down");
        self.input.close();
        self.stream.close();
        let _ = self.shutdown_tx.send(());
    }

    /// Acknowledge now, shut down after the configured delay
    pub fn exit_job_manager(self: &Arc<Self>) {
        let delay = self.config.rpc.exit_delay();
        info!(delay_ms = delay.as_millis() as u64, "exit requested");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.shutdown();
        });
    }

    /// Pass a termination signal on to the job's process
    pub fn forward_signal(&self, signal: JobSignal) {
        let Some(cmd) = self.cmd() else {
            return;
        };
        if let Err(e) = cmd.send_signal(signal) {
            debug!(signal = %signal, error = %e, "could not forward signal");
        }
    }

    // ==================== Authentication ====================

    /// Run the mutual handshake for `conn`
    ///
    /// The peer's token is verified first. The job manager then proves itself
    /// with its job auth token. Only after both succeed is `conn` attached,
    /// replacing any earlier attachment.
    pub async fn authenticate(&self, conn: &Arc<MainServerConn>, token: &str) -> Result<()> {
        if let Err(e) = self.verifier.verify_job_access(token, &self.identity.job_id) {
            warn!(conn_id = conn.id(), error = %e, "rejected main server token");
            return Err(e);
        }
        conn.set_peer_authenticated(true);
        debug!(conn_id = conn.id(), "main server authenticated");

        let request = ServerRequest::AuthenticateJobManager {
            job_id: self.identity.job_id.clone(),
            job_auth_token: self.identity.job_auth_token.clone(),
        };
        if let Err(e) = conn.request(request).await {
            conn.set_peer_authenticated(false);
            warn!(conn_id = conn.id(), error = %e, "main server rejected job manager");
            return Err(TetherError::SelfAuthFailed(e.to_string()));
        }
        conn.set_self_authenticated(true);

        let previous = self.state.lock().attached.replace(Arc::clone(conn));
        if let Some(previous) = previous {
            if previous.id() != conn.id() {
                info!(old = previous.id(), new = conn.id(), "replacing attached main server");
                previous.close();
            }
        }
        info!(conn_id = conn.id(), "main server attached");
        Ok(())
    }

    // ==================== Job Control ====================

    /// Spawn the job's process and wire its output into the stream
    pub fn start_job(
        self: &Arc<Self>,
        conn: &Arc<MainServerConn>,
        def: StartJobRequest,
    ) -> Result<StartJobResult> {
        let mut state = self.state.lock();
        if state.cmd.is_some() {
            return Err(TetherError::JobAlreadyStarted);
        }

        let cmd = JobCmd::spawn(self.identity.job_id.clone(), &def, Arc::clone(&self.signals))?;
        if let Err(e) = self.wire_output_locked(&mut state, conn, &def, &cmd) {
            warn!(pid = cmd.pid(), error = %e, "job output could not be wired, stopping job");
            cmd.terminate_by_closing_pty_master();
            if let Err(e) = cmd.send_signal(JobSignal::Kill) {
                debug!(error = %e, "could not kill unwired job");
            }
            return Err(e);
        }
        state.cmd = Some(Arc::clone(&cmd));
        drop(state);

        tokio::spawn(exit_watch(Arc::downgrade(self), Arc::clone(&cmd)));

        Ok(StartJobResult {
            cmd_pid: cmd.pid(),
            cmd_pgid: cmd.start_pgid(),
            job_manager_pid: std::process::id(),
            job_manager_start_ts: self.start_ts,
        })
    }

    /// Connect `conn` to the stream with a closed window
    ///
    /// Nothing flows until [`start_stream`](Self::start_stream) opens the
    /// window the peer asked for.
    pub fn prepare_connect(
        &self,
        conn: &Arc<MainServerConn>,
        meta: StreamMeta,
        seq: u64,
    ) -> Result<ConnectResult> {
        let mut state = self.state.lock();
        let cmd = state.cmd.clone().ok_or(TetherError::JobNotStarted)?;

        let corked = StreamMeta {
            rwnd: 0,
            ..meta.clone()
        };
        let server_seq = self.connect_stream_locked(&mut state, conn, &corked, seq)?;
        state.pending_stream = Some(meta);
        drop(state);

        let (stream_done, stream_error) = self.stream.stream_done_info();
        let exit = cmd.exit_info();
        info!(
            conn_id = conn.id(),
            client_seq = seq,
            server_seq,
            stream_done,
            exited = exit.is_some(),
            "stream prepared"
        );
        Ok(ConnectResult {
            seq: server_seq,
            stream_done,
            stream_error,
            exit,
        })
    }

    /// Open the window remembered by the last `prepare_connect`
    pub fn start_stream(&self, conn: &Arc<MainServerConn>) -> Result<()> {
        let mut state = self.state.lock();
        if state.cmd.is_none() {
            return Err(TetherError::JobNotStarted);
        }
        if state.pending_stream.is_none() {
            return Err(TetherError::stream(
                "no pending stream, PrepareConnect must come first",
            ));
        }
        if state.stream_client != Some(conn.id()) {
            return Err(TetherError::stream("stream belongs to another connection"));
        }
        let Some(meta) = state.pending_stream.take() else {
            return Err(TetherError::internal("pending stream vanished"));
        };

        self.stream.set_rwnd(meta.rwnd)?;
        info!(stream_id = %meta.id, rwnd = meta.rwnd, "streaming started");
        Ok(())
    }

    /// Hang up the job's PTY
    pub fn terminate(&self) -> Result<()> {
        let cmd = self.cmd().ok_or(TetherError::JobNotStarted)?;
        cmd.terminate_by_closing_pty_master();
        Ok(())
    }

    /// How the job exited, if it has
    pub fn exit_info(&self) -> Result<Option<ExitInfo>> {
        let cmd = self.cmd().ok_or(TetherError::JobNotStarted)?;
        Ok(cmd.exit_info())
    }

    // ==================== Stream Plumbing ====================

    /// Connect the requested stream and feed the PTY into it
    ///
    /// Leaves no stream client behind on failure.
    fn wire_output_locked(
        &self,
        state: &mut ManagerState,
        conn: &Arc<MainServerConn>,
        def: &StartJobRequest,
        cmd: &JobCmd,
    ) -> Result<()> {
        if let Some(meta) = &def.stream {
            let seq = self.connect_stream_locked(state, conn, meta, 0)?;
            debug!(stream_id = %meta.id, seq, "stream connected at job start");
        }

        let attached = cmd
            .take_reader()
            .ok_or_else(|| TetherError::internal("PTY reader already taken"))
            .and_then(|reader| self.stream.attach_reader(reader));
        if attached.is_err() && state.stream_client.take().is_some() {
            self.stream.client_disconnected();
        }
        attached
    }

    fn connect_stream_locked(
        &self,
        state: &mut ManagerState,
        conn: &Arc<MainServerConn>,
        meta: &StreamMeta,
        seq: u64,
    ) -> Result<u64> {
        if let Some(previous) = state.stream_client.take() {
            debug!(old = previous, new = conn.id(), "disconnecting previous stream client");
            self.stream.client_disconnected();
            state.pending_stream = None;
        }
        let server_seq =
            self.stream
                .client_connected(meta.id.clone(), conn.data_sender(), meta.rwnd, seq)?;
        state.stream_client = Some(conn.id());
        Ok(server_seq)
    }

    /// Apply an ACK if it comes from the stream's current client
    pub fn recv_ack(&self, conn_id: ConnId, ack: &StreamAck) {
        if self.state.lock().stream_client != Some(conn_id) {
            return;
        }
        self.stream.recv_ack(ack);
    }

    /// Hand input to the reorder queue
    pub fn queue_input(&self, input: JobInput) {
        let session = input.input_session_id.clone();
        if let Err(e) = self.input.push(session.as_deref(), input.seq_num, input) {
            warn!(error = %e, "dropping job input");
        }
    }

    /// Forget everything tied to a closed connection
    pub fn connection_closed(&self, conn: &MainServerConn) {
        let mut state = self.state.lock();
        if state.stream_client == Some(conn.id()) {
            self.stream.client_disconnected();
            state.stream_client = None;
            state.pending_stream = None;
        }
        if state.attached.as_ref().map(|c| c.id()) == Some(conn.id()) {
            state.attached = None;
            info!(conn_id = conn.id(), "main server detached");
        }
    }

    fn notify_exit(&self, exit: ExitInfo) {
        let attached = self.state.lock().attached.clone();
        match attached {
            Some(conn) => {
                let event = JobExited {
                    job_id: self.identity.job_id.clone(),
                    exit,
                };
                if !conn.send(JobMessage::JobExited(event)) {
                    debug!(conn_id = conn.id(), "attached connection gone, exit not delivered");
                }
            }
            None => debug!("no attached main server, exit notification dropped"),
        }
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("client_id", &self.identity.client_id)
            .field("job_id", &self.identity.job_id)
            .field("start_ts", &self.start_ts)
            .finish_non_exhaustive()
    }
}

/// Apply ordered input to the job's PTY
async fn input_loop(
    manager: Weak<JobManager>,
    mut rx: tokio::sync::mpsc::Receiver<JobInput>,
) {
    while let Some(input) = rx.recv().await {
        let Some(cmd) = manager.upgrade().and_then(|m| m.cmd()) else {
            warn!("input received before job start, dropping");
            continue;
        };
        // PTY writes block when the job is not reading
        let result = tokio::task::spawn_blocking(move || cmd.handle_input(&input)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to apply job input"),
            Err(e) => warn!(error = %e, "input task failed"),
        }
    }
}

async fn exit_watch(manager: Weak<JobManager>, cmd: Arc<JobCmd>) {
    let exit = cmd.wait_exit().await;
    if let Some(manager) = manager.upgrade() {
        manager.notify_exit(exit);
    }
}
