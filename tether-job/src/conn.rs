//! One main-server connection on the job socket
//!
//! Every accepted connection gets a [`MainServerConn`]. It owns the
//! connection's authentication state and its outgoing message queue, and
//! decides which requests may reach the [`JobManager`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_protocol::{
    JobCodec, JobMessage, JobRequest, JobResponse, PeerMessage, RpcError, ServerRequest,
    StreamData,
};
use tether_utils::{Result, TetherError};

use crate::manager::JobManager;
use crate::stream::DataSender;

/// Identifies a connection for the lifetime of the job manager
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

type PendingReply = oneshot::Sender<std::result::Result<(), RpcError>>;

/// State of one connected main server
pub struct MainServerConn {
    id: ConnId,
    /// The peer presented a valid main-server token for this job
    peer_authenticated: AtomicBool,
    /// The peer accepted our job auth token
    self_authenticated: AtomicBool,
    outgoing: mpsc::UnboundedSender<JobMessage>,
    next_req_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    request_timeout: Duration,
    closed: CancellationToken,
}

impl MainServerConn {
    pub fn new(request_timeout: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<JobMessage>) {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer_authenticated: AtomicBool::new(false),
            self_authenticated: AtomicBool::new(false),
            outgoing,
            next_req_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            request_timeout,
            closed: CancellationToken::new(),
        });
        (conn, outgoing_rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn is_peer_authenticated(&self) -> bool {
        self.peer_authenticated.load(Ordering::SeqCst)
    }

    pub fn is_self_authenticated(&self) -> bool {
        self.self_authenticated.load(Ordering::SeqCst)
    }

    /// Both directions of the handshake completed
    pub fn is_authenticated(&self) -> bool {
        self.is_peer_authenticated() && self.is_self_authenticated()
    }

    pub(crate) fn set_peer_authenticated(&self, value: bool) {
        self.peer_authenticated.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_self_authenticated(&self, value: bool) {
        self.self_authenticated.store(value, Ordering::SeqCst);
    }

    /// Queue a message for the peer. Returns false once the socket is gone.
    pub fn send(&self, msg: JobMessage) -> bool {
        self.outgoing.send(msg).is_ok()
    }

    /// Send a request to the peer and wait for its answer
    pub async fn request(&self, request: ServerRequest) -> Result<()> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(req_id, tx);

        if !self.send(JobMessage::Request { req_id, request }) {
            self.pending.lock().remove(&req_id);
            return Err(TetherError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(TetherError::protocol(format!("peer error: {}", e))),
            Ok(Err(_)) => Err(TetherError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&req_id);
                Err(TetherError::RequestTimeout {
                    millis: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Complete a request we sent earlier
    pub(crate) fn resolve(&self, req_id: u64, result: std::result::Result<(), RpcError>) {
        match self.pending.lock().remove(&req_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(conn_id = self.id, req_id, "response for unknown request"),
        }
    }

    /// Drop all waiters; they observe `ConnectionClosed`
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }

    /// Close the connection from our side
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A [`DataSender`] writing stream packets to this connection
    pub fn data_sender(&self) -> Arc<dyn DataSender> {
        Arc::new(ConnDataSender {
            conn_id: self.id,
            outgoing: self.outgoing.clone(),
        })
    }

    fn require_peer(&self) -> Result<()> {
        if self.is_peer_authenticated() {
            Ok(())
        } else {
            Err(TetherError::NotAuthenticated)
        }
    }

    fn require_both(&self) -> Result<()> {
        self.require_peer()?;
        if self.is_self_authenticated() {
            Ok(())
        } else {
            Err(TetherError::NotAuthenticated)
        }
    }

    /// Run one request against the manager, enforcing the auth gates
    pub(crate) async fn handle_request(
        self: &Arc<Self>,
        manager: &Arc<JobManager>,
        request: JobRequest,
    ) -> Result<JobResponse> {
        match request {
            JobRequest::AuthenticateToJobManager { job_access_token } => {
                manager.authenticate(self, &job_access_token).await?;
                Ok(JobResponse::Ok)
            }
            JobRequest::StartJob(def) => {
                self.require_peer()?;
                manager.start_job(self, def).map(JobResponse::Started)
            }
            JobRequest::PrepareConnect { stream, seq } => {
                self.require_both()?;
                manager
                    .prepare_connect(self, stream, seq)
                    .map(JobResponse::Connected)
            }
            JobRequest::StartStream => {
                self.require_both()?;
                manager.start_stream(self)?;
                Ok(JobResponse::Ok)
            }
            JobRequest::Terminate => {
                self.require_both()?;
                manager.terminate()?;
                Ok(JobResponse::Ok)
            }
            JobRequest::ExitInfo => {
                self.require_both()?;
                manager.exit_info().map(JobResponse::ExitInfo)
            }
            JobRequest::ExitJobManager => {
                self.require_peer()?;
                manager.exit_job_manager();
                Ok(JobResponse::Ok)
            }
        }
    }

    fn dispatch(self: &Arc<Self>, manager: &Arc<JobManager>, msg: PeerMessage) {
        match msg {
            PeerMessage::Request { req_id, request } => {
                let name = request.name();
                trace!(conn_id = self.id, req_id, request = name, "request");
                // Requests may wait on the peer (authentication), so they
                // must not hold up the read loop
                let conn = Arc::clone(self);
                let manager = Arc::clone(manager);
                tokio::spawn(async move {
                    let result = conn
                        .handle_request(&manager, request)
                        .await
                        .map_err(|e| {
                            debug!(conn_id = conn.id, request = name, error = %e, "request failed");
                            RpcError::new(e.to_string())
                        });
                    conn.send(JobMessage::Response { req_id, result });
                });
            }
            PeerMessage::Response { req_id, result } => self.resolve(req_id, result),
            PeerMessage::StreamAck(ack) => {
                // Bad ACKs never produce an error reply
                if self.is_authenticated() {
                    manager.recv_ack(self.id, &ack);
                } else {
                    trace!(conn_id = self.id, "ignoring ACK from unauthenticated peer");
                }
            }
            PeerMessage::JobInput(input) => {
                if self.is_authenticated() {
                    manager.queue_input(input);
                } else {
                    warn!(conn_id = self.id, "dropping input from unauthenticated peer");
                }
            }
        }
    }
}

impl std::fmt::Debug for MainServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainServerConn")
            .field("id", &self.id)
            .field("peer_authenticated", &self.is_peer_authenticated())
            .field("self_authenticated", &self.is_self_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct ConnDataSender {
    conn_id: ConnId,
    outgoing: mpsc::UnboundedSender<JobMessage>,
}

impl DataSender for ConnDataSender {
    fn send_data(&self, data: StreamData) {
        trace!(conn_id = self.conn_id, seq = data.seq, eof = data.eof, "stream data");
        if self.outgoing.send(JobMessage::StreamData(data)).is_err() {
            debug!(conn_id = self.conn_id, "connection gone, dropping stream data");
        }
    }
}

/// Serve one accepted socket until it closes, is replaced, or the job
/// manager shuts down
pub async fn serve_connection<S>(stream: S, manager: Arc<JobManager>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (conn, mut outgoing) = MainServerConn::new(manager.config().rpc.request_timeout());
    let mut framed = Framed::new(stream, JobCodec::new());
    let mut shutdown_rx = manager.subscribe_shutdown();
    debug!(conn_id = conn.id, "main server connected");

    loop {
        tokio::select! {
            Some(msg) = outgoing.recv() => {
                if let Err(e) = framed.send(msg).await {
                    warn!(conn_id = conn.id, error = %e, "failed to write to socket");
                    break;
                }
            }
            result = framed.next() => {
                match result {
                    Some(Ok(msg)) => conn.dispatch(&manager, msg),
                    Some(Err(e)) => {
                        warn!(conn_id = conn.id, error = %e, "failed to read from socket");
                        break;
                    }
                    None => {
                        debug!(conn_id = conn.id, "main server disconnected");
                        break;
                    }
                }
            }
            _ = conn.closed.cancelled() => {
                info!(conn_id = conn.id, "connection closed by job manager");
                break;
            }
            _ = shutdown_rx.recv() => {
                debug!(conn_id = conn.id, "job manager shutting down");
                break;
            }
        }
    }

    conn.close();
    manager.connection_closed(&conn);
    conn.fail_pending();
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Auth State Tests ====================

    #[tokio::test]
    async fn test_new_connection_unauthenticated() {
        let (conn, _rx) = MainServerConn::new(Duration::from_secs(1));
        assert!(!conn.is_peer_authenticated());
        assert!(!conn.is_self_authenticated());
        assert!(matches!(conn.require_peer(), Err(TetherError::NotAuthenticated)));

        conn.set_peer_authenticated(true);
        assert!(conn.require_peer().is_ok());
        assert!(conn.require_both().is_err());

        conn.set_self_authenticated(true);
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_connection_ids_unique() {
        let (a, _ra) = MainServerConn::new(Duration::from_secs(1));
        let (b, _rb) = MainServerConn::new(Duration::from_secs(1));
        assert_ne!(a.id(), b.id());
    }

    // ==================== Request Tests ====================

    fn auth_request() -> ServerRequest {
        ServerRequest::AuthenticateJobManager {
            job_id: "job".into(),
            job_auth_token: "secret".into(),
        }
    }

    #[tokio::test]
    async fn test_request_resolved() {
        let (conn, mut rx) = MainServerConn::new(Duration::from_secs(5));
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.request(auth_request()).await })
        };

        let req_id = match rx.recv().await.unwrap() {
            JobMessage::Request { req_id, .. } => req_id,
            other => panic!("unexpected message: {:?}", other),
        };
        conn.resolve(req_id, Ok(()));
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_request_peer_error() {
        let (conn, mut rx) = MainServerConn::new(Duration::from_secs(5));
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.request(auth_request()).await })
        };

        let JobMessage::Request { req_id, .. } = rx.recv().await.unwrap() else {
            panic!("expected request");
        };
        conn.resolve(req_id, Err(RpcError::new("bad token")));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("bad token"));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (conn, _rx) = MainServerConn::new(Duration::from_millis(20));
        let err = conn.request(auth_request()).await.unwrap_err();
        assert!(matches!(err, TetherError::RequestTimeout { millis: 20 }));
        assert!(conn.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_request_fails_when_connection_drops() {
        let (conn, mut rx) = MainServerConn::new(Duration::from_secs(5));
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.request(auth_request()).await })
        };
        let _ = rx.recv().await;
        conn.fail_pending();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(TetherError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_request_on_closed_socket() {
        let (conn, rx) = MainServerConn::new(Duration::from_secs(5));
        drop(rx);
        assert!(matches!(
            conn.request(auth_request()).await,
            Err(TetherError::ConnectionClosed)
        ));
    }

    // ==================== Data Sender Tests ====================

    #[tokio::test]
    async fn test_data_sender_wraps_stream_data() {
        let (conn, mut rx) = MainServerConn::new(Duration::from_secs(1));
        conn.data_sender().send_data(StreamData::data("s1", 0, b"hi"));

        match rx.recv().await.unwrap() {
            JobMessage::StreamData(data) => {
                assert_eq!(data.id, "s1");
                assert_eq!(data.payload().unwrap(), b"hi");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
