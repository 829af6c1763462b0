//! Reliable, windowed, resumable delivery of a job's output
//!
//! A [`StreamManager`] sits between a byte source that must never be blocked
//! by an absent consumer (the PTY) and a peer that wants in-order delivery
//! it can resume after reconnecting. Two tasks do the work:
//!
//! - the reader task copies source bytes into the [`CircularBuffer`] and
//!   records a one-shot terminal event (EOF or error) when the source ends;
//! - the send task peeks unsent bytes, frames them as [`StreamData`] with
//!   absolute sequence numbers, and hands them to the connected
//!   [`DataSender`], staying within `min(cwnd, rwnd)` unacknowledged bytes.
//!
//! ACKs consume the acknowledged prefix from the buffer. While no peer is
//! connected the buffer runs in lossy async mode so the reader never stalls.
//! The terminal packet goes out only after every data byte has been
//! acknowledged, and is re-sent after a reconnect until the peer ACKs it
//! with `fin`.

use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use tether_protocol::{StreamAck, StreamData};
use tether_utils::{Result, TetherError};

use super::buffer::{BufferWriter, CircularBuffer};
use crate::config::StreamConfig;

/// Destination for outgoing stream packets
///
/// Implementations must not block; flow control already bounds how much
/// data can be outstanding.
pub trait DataSender: Send + Sync {
    fn send_data(&self, data: StreamData);
}

impl DataSender for mpsc::UnboundedSender<StreamData> {
    fn send_data(&self, data: StreamData) {
        let _ = self.send(data);
    }
}

/// Anything the reader task can pull output from
pub trait OutputSource: Read + Send + 'static {}

impl<T: Read + Send + 'static> OutputSource for T {}

/// How the source ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum TerminalEvent {
    Eof,
    Error(String),
}

/// Result of a single blocking read
enum ReadResult {
    Data(usize),
    Eof,
    Error(String),
}

fn classify_read(result: std::io::Result<usize>) -> Option<ReadResult> {
    match result {
        Ok(0) => Some(ReadResult::Eof),
        Ok(n) => Some(ReadResult::Data(n)),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => None,
        Err(e)
            if e.kind() == std::io::ErrorKind::BrokenPipe
                || e.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            Some(ReadResult::Eof)
        }
        // A PTY master reports EIO once the child side has closed
        Err(e) if e.raw_os_error() == Some(libc::EIO) => Some(ReadResult::Eof),
        Err(e) => Some(ReadResult::Error(e.to_string())),
    }
}

enum NextPacket {
    Done,
    Wait,
    Send(Arc<dyn DataSender>, StreamData),
}

struct StreamState {
    stream_id: String,
    terminal: Option<TerminalEvent>,
    terminal_sent: bool,
    terminal_acked: bool,
    connected: bool,
    sender: Option<Arc<dyn DataSender>>,
    rwnd: u64,
    sent_not_acked: u64,
    closed: bool,
    reader_attached: bool,
}

/// Output stream for one job
pub struct StreamManager {
    config: StreamConfig,
    buf: Arc<CircularBuffer>,
    state: Mutex<StreamState>,
    /// Wakes the send task on new data, ACKs and state changes
    wake: Arc<Notify>,
    /// Aborts a reader blocked on a full window when the stream closes
    cancel: CancellationToken,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamManager {
    /// Create a stream and start its send task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: StreamConfig) -> Arc<Self> {
        // Nobody is connected yet, so start in lossy mode
        let buf = Arc::new(CircularBuffer::new(config.buffer_size, false));
        let manager = Arc::new(Self {
            config,
            buf,
            state: Mutex::new(StreamState {
                stream_id: String::new(),
                terminal: None,
                terminal_sent: false,
                terminal_acked: false,
                connected: false,
                sender: None,
                rwnd: 0,
                sent_not_acked: 0,
                closed: false,
                reader_attached: false,
            }),
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            reader_handle: Mutex::new(None),
        });

        tokio::spawn(Arc::clone(&manager).send_loop());
        manager
    }

    /// Start the reader task on `source`. Allowed once per stream.
    pub fn attach_reader(self: &Arc<Self>, source: impl OutputSource) -> Result<()> {
        let writer = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TetherError::StreamClosed);
            }
            if st.reader_attached {
                return Err(TetherError::ReaderAlreadyAttached);
            }
            let writer = self
                .buf
                .take_writer()?
                .notify_on_store(Arc::clone(&self.wake));
            st.reader_attached = true;
            writer
        };

        let handle = tokio::spawn(Arc::clone(self).read_loop(Box::new(source), writer));
        *self.reader_handle.lock() = Some(handle);
        Ok(())
    }

    /// Connect a peer, returning the offset delivery resumes from
    ///
    /// `client_seq` is the offset the peer already holds. Bytes below it are
    /// dropped from the buffer; a claim beyond what was ever buffered is
    /// rejected.
    pub fn client_connected(
        &self,
        stream_id: impl Into<String>,
        sender: Arc<dyn DataSender>,
        rwnd: u64,
        client_seq: u64,
    ) -> Result<u64> {
        let stream_id = stream_id.into();
        let mut st = self.state.lock();
        if st.closed || st.terminal_acked {
            return Err(TetherError::StreamClosed);
        }
        if st.connected {
            return Err(TetherError::AlreadyConnected);
        }

        let head = self.buf.head_pos();
        if client_seq > head {
            let skip = client_seq - head;
            let size = self.buf.size();
            if skip > size as u64 {
                return Err(TetherError::ResumeOutOfRange {
                    client_seq,
                    head,
                    size,
                });
            }
            self.buf.consume(skip as usize)?;
        }

        debug!(stream_id = %stream_id, rwnd, client_seq, head, "stream client connected");
        st.stream_id = stream_id;
        st.sender = Some(sender);
        st.rwnd = rwnd;
        st.connected = true;
        st.sent_not_acked = 0;
        self.buf.set_effective_window(true, self.effective_window(rwnd));
        drop(st);

        self.wake.notify_one();
        Ok(head.max(client_seq))
    }

    /// Disconnect the current peer
    ///
    /// In-flight bytes count as undelivered and are re-sent after the next
    /// connect. The buffer switches to lossy mode at full capacity.
    pub fn client_disconnected(&self) {
        let mut st = self.state.lock();
        if !st.connected {
            return;
        }
        debug!(stream_id = %st.stream_id, sent_not_acked = st.sent_not_acked, "stream client disconnected");
        st.connected = false;
        st.sender = None;
        st.sent_not_acked = 0;
        if !st.terminal_acked {
            st.terminal_sent = false;
        }
        self.buf.set_effective_window(false, self.buf.capacity());
        drop(st);

        self.wake.notify_one();
    }

    /// Apply an ACK from the peer
    ///
    /// ACKs for another stream id, or arriving while disconnected, are
    /// ignored.
    pub fn recv_ack(&self, ack: &StreamAck) {
        let mut st = self.state.lock();
        if !st.connected || ack.id != st.stream_id {
            trace!(ack_id = %ack.id, "ignoring ack for inactive stream");
            return;
        }

        if ack.fin {
            if st.terminal_sent {
                st.terminal_acked = true;
                debug!(stream_id = %st.stream_id, "terminal event acknowledged");
                drop(st);
                self.wake.notify_one();
            }
            return;
        }

        let head = self.buf.head_pos();
        if ack.seq < head {
            return;
        }
        let acked = ack.seq - head;
        if acked > st.sent_not_acked {
            warn!(
                stream_id = %st.stream_id,
                seq = ack.seq,
                head,
                sent_not_acked = st.sent_not_acked,
                "ack beyond sent data"
            );
            return;
        }
        if acked > 0 {
            if let Err(e) = self.buf.consume(acked as usize) {
                warn!(error = %e, "failed to consume acknowledged bytes");
                return;
            }
            st.sent_not_acked -= acked;
        }

        let prev_rwnd = st.rwnd;
        st.rwnd = ack.rwnd;
        self.buf.set_effective_window(true, self.effective_window(ack.rwnd));
        drop(st);

        if ack.rwnd > prev_rwnd || acked > 0 {
            self.wake.notify_one();
        }
    }

    /// Change the peer window outside of an ACK
    pub fn set_rwnd(&self, rwnd: u64) -> Result<()> {
        let mut st = self.state.lock();
        if !st.connected {
            return Err(TetherError::stream("no stream client connected"));
        }
        st.rwnd = rwnd;
        self.buf.set_effective_window(true, self.effective_window(rwnd));
        drop(st);

        self.wake.notify_one();
        Ok(())
    }

    /// Whether the source has ended, and with which error
    pub fn stream_done_info(&self) -> (bool, Option<String>) {
        match &self.state.lock().terminal {
            None => (false, None),
            Some(TerminalEvent::Eof) => (true, None),
            Some(TerminalEvent::Error(e)) => (true, Some(e.clone())),
        }
    }

    /// Stop the send task and any reader blocked on the buffer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cancel.cancel();
        self.wake.notify_one();
    }

    /// Close, then wait for the reader task to finish
    ///
    /// A reader parked inside a blocking read only returns once the source
    /// produces data or ends.
    pub async fn close_and_wait(&self) {
        self.close();
        let handle = self.reader_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn stream_id(&self) -> String {
        self.state.lock().stream_id.clone()
    }

    pub fn head_pos(&self) -> u64 {
        self.buf.head_pos()
    }

    /// Bytes sent to the current peer and not yet acknowledged
    pub fn sent_not_acked(&self) -> u64 {
        self.state.lock().sent_not_acked
    }

    pub fn buffer(&self) -> &Arc<CircularBuffer> {
        &self.buf
    }

    fn effective_window(&self, rwnd: u64) -> usize {
        (self.config.cwnd_size as u64).min(rwnd) as usize
    }

    fn record_terminal(&self, event: TerminalEvent) {
        let mut st = self.state.lock();
        if st.terminal.is_none() {
            debug!(event = ?event, total = self.buf.total_size(), "stream source ended");
            st.terminal = Some(event);
        }
        drop(st);
        self.wake.notify_one();
    }

    async fn read_loop(self: Arc<Self>, mut source: Box<dyn Read + Send>, mut writer: BufferWriter) {
        let chunk_size = self.config.read_chunk_size;
        loop {
            if self.cancel.is_cancelled() {
                debug!("stream closed, reader stopping");
                break;
            }

            let joined = tokio::task::spawn_blocking(move || {
                let mut chunk = vec![0u8; chunk_size];
                let result = loop {
                    if let Some(result) = classify_read(source.read(&mut chunk)) {
                        break result;
                    }
                };
                (source, chunk, result)
            })
            .await;

            let (returned, chunk, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    self.record_terminal(TerminalEvent::Error(format!("reader task failed: {}", e)));
                    break;
                }
            };
            source = returned;

            match result {
                ReadResult::Data(n) => {
                    if let Err(e) = writer.write_with_cancel(&self.cancel, &chunk[..n]).await {
                        debug!(error = %e, "buffer write aborted");
                        break;
                    }
                }
                ReadResult::Eof => {
                    self.record_terminal(TerminalEvent::Eof);
                    break;
                }
                ReadResult::Error(e) => {
                    warn!(error = %e, "stream source read error");
                    self.record_terminal(TerminalEvent::Error(e));
                    break;
                }
            }
        }
    }

    async fn send_loop(self: Arc<Self>) {
        loop {
            match self.prepare_next_packet() {
                NextPacket::Done => break,
                NextPacket::Wait => self.wake.notified().await,
                NextPacket::Send(sender, packet) => {
                    trace!(
                        stream_id = %packet.id,
                        seq = packet.seq,
                        len = packet.data64.len(),
                        terminal = packet.is_terminal(),
                        "sending stream packet"
                    );
                    sender.send_data(packet);
                }
            }
        }
        debug!("stream send loop finished");
    }

    fn prepare_next_packet(&self) -> NextPacket {
        let mut st = self.state.lock();
        if st.closed || st.terminal_acked {
            return NextPacket::Done;
        }
        let sender = match (&st.sender, st.connected) {
            (Some(sender), true) => Arc::clone(sender),
            _ => return NextPacket::Wait,
        };

        let window = self.effective_window(st.rwnd) as u64;
        if window == 0 {
            return NextPacket::Wait;
        }

        let available = self.buf.size() as u64;
        if available == 0 {
            if st.terminal_sent {
                return NextPacket::Wait;
            }
            let head = self.buf.head_pos();
            let packet = match &st.terminal {
                None => return NextPacket::Wait,
                Some(TerminalEvent::Eof) => StreamData::eof(st.stream_id.clone(), head),
                Some(TerminalEvent::Error(e)) => {
                    StreamData::error(st.stream_id.clone(), head, e.clone())
                }
            };
            st.terminal_sent = true;
            return NextPacket::Send(sender, packet);
        }

        if st.sent_not_acked >= window || st.sent_not_acked >= available {
            return NextPacket::Wait;
        }
        let len = (window - st.sent_not_acked)
            .min(self.config.max_packet_size as u64)
            .min(available - st.sent_not_acked) as usize;

        let mut payload = vec![0u8; len];
        let n = self.buf.peek_data_at(st.sent_not_acked as usize, &mut payload);
        payload.truncate(n);
        if n == 0 {
            return NextPacket::Wait;
        }

        let seq = self.buf.head_pos() + st.sent_not_acked;
        st.sent_not_acked += n as u64;
        NextPacket::Send(sender, StreamData::data(st.stream_id.clone(), seq, &payload))
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("StreamManager")
            .field("stream_id", &st.stream_id)
            .field("connected", &st.connected)
            .field("rwnd", &st.rwnd)
            .field("sent_not_acked", &st.sent_not_acked)
            .field("terminal", &st.terminal)
            .field("buffer", &self.buf)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Blocking source fed from a std channel; EOF once the sender drops
    struct ChannelSource {
        rx: std::sync::mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelSource {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(data) => self.pending = data,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn channel_source() -> (std::sync::mpsc::Sender<Vec<u8>>, ChannelSource) {
        let (tx, rx) = std::sync::mpsc::channel();
        (
            tx,
            ChannelSource {
                rx,
                pending: Vec::new(),
            },
        )
    }

    /// Source that fails after producing its data
    struct FailingSource(Option<Vec<u8>>);

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.take() {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                None => Err(std::io::Error::new(std::io::ErrorKind::Other, "device gone")),
            }
        }
    }

    fn test_config(cwnd: usize) -> StreamConfig {
        StreamConfig {
            cwnd_size: cwnd,
            buffer_size: 64 * 1024,
            max_packet_size: 4096,
            read_chunk_size: 4096,
        }
    }

    fn peer() -> (Arc<dyn DataSender>, UnboundedReceiver<StreamData>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    async fn recv(rx: &mut UnboundedReceiver<StreamData>) -> StreamData {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("sender dropped")
    }

    async fn assert_quiet(rx: &mut UnboundedReceiver<StreamData>) {
        let res = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(res.is_err(), "unexpected packet: {:?}", res);
    }

    async fn wait_for_total(sm: &StreamManager, total: u64) {
        for _ in 0..200 {
            if sm.buffer().total_size() >= total {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("buffer never reached {} bytes", total);
    }

    async fn wait_for_done(sm: &StreamManager) {
        for _ in 0..200 {
            if sm.stream_done_info().0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("source never finished");
    }

    // ==================== Delivery Tests ====================

    #[tokio::test]
    async fn test_buffered_data_then_eof_after_ack() {
        let sm = StreamManager::new(test_config(64 * 1024));
        let (src_tx, source) = channel_source();
        sm.attach_reader(source).unwrap();

        src_tx.send(b"hello".to_vec()).unwrap();
        wait_for_total(&sm, 5).await;

        let (sender, mut rx) = peer();
        let seq = sm.client_connected("s1", sender, 64 * 1024, 0).unwrap();
        assert_eq!(seq, 0);

        let pkt = recv(&mut rx).await;
        assert_eq!(pkt.seq, 0);
        assert_eq!(pkt.payload().unwrap(), b"hello");

        // EOF from the source must wait for the ACK
        drop(src_tx);
        wait_for_done(&sm).await;
        assert_quiet(&mut rx).await;

        sm.recv_ack(&StreamAck::new("s1", 5, 64 * 1024));
        let eof = recv(&mut rx).await;
        assert!(eof.eof);
        assert_eq!(eof.seq, 5);
        sm.close();
    }

    #[tokio::test]
    async fn test_flow_control_window() {
        let sm = StreamManager::new(test_config(1024));
        let (sender, mut rx) = peer();
        sm.client_connected("s1", sender, 64 * 1024, 0).unwrap();

        let data: Vec<u8> = (0..1524u32).map(|i| (i % 251) as u8).collect();
        sm.attach_reader(Cursor::new(data.clone())).unwrap();

        let mut received = Vec::new();
        while received.len() < 1024 {
            let pkt = recv(&mut rx).await;
            assert_eq!(pkt.seq, received.len() as u64);
            received.extend(pkt.payload().unwrap());
            assert!(sm.sent_not_acked() <= 1024);
        }
        assert_eq!(received.len(), 1024);
        assert_quiet(&mut rx).await;

        sm.recv_ack(&StreamAck::new("s1", 1024, 64 * 1024));
        while received.len() < 1524 {
            let pkt = recv(&mut rx).await;
            assert_eq!(pkt.seq, received.len() as u64);
            received.extend(pkt.payload().unwrap());
        }
        assert_eq!(received, data);

        sm.recv_ack(&StreamAck::new("s1", 1524, 64 * 1024));
        let eof = recv(&mut rx).await;
        assert!(eof.eof);
        assert_eq!(eof.seq, 1524);
        sm.close();
    }

    #[tokio::test]
    async fn test_chunk_larger_than_window_still_flows() {
        let sm = StreamManager::new(test_config(64 * 1024));
        let (sender, mut rx) = peer();
        sm.client_connected("s1", sender, 100, 0).unwrap();

        // One 300-byte read against a 100-byte window
        sm.attach_reader(Cursor::new(vec![9u8; 300])).unwrap();

        let first = recv(&mut rx).await;
        assert_eq!(first.seq, 0);
        assert_eq!(first.payload().unwrap().len(), 100);
        assert_quiet(&mut rx).await;

        sm.recv_ack(&StreamAck::new("s1", 100, 100));
        let second = recv(&mut rx).await;
        assert_eq!(second.seq, 100);
        assert_eq!(second.payload().unwrap().len(), 100);
        sm.close();
    }

    #[tokio::test]
    async fn test_packets_split_at_max_packet_size() {
        let mut config = test_config(64 * 1024);
        config.max_packet_size = 100;
        let sm = StreamManager::new(config);
        sm.attach_reader(Cursor::new(vec![7u8; 250])).unwrap();
        wait_for_done(&sm).await;

        let (sender, mut rx) = peer();
        sm.client_connected("s1", sender, 64 * 1024, 0).unwrap();

        let sizes: Vec<usize> = [
            recv(&mut rx).await,
            recv(&mut rx).await,
            recv(&mut rx).await,
        ]
        .iter()
        .map(|p| p.payload().unwrap().len())
        .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        sm.close();
    }

    // ==================== Resume Tests ====================

    #[tokio::test]
    async fn test_resume_from_client_seq() {
        let sm = StreamManager::new(test_config(64 * 1024));
        sm.attach_reader(Cursor::new(b"0123456789".to_vec())).unwrap();
        wait_for_done(&sm).await;

        let (sender, mut rx) = peer();
        let seq = sm.client_connected("s1", sender, 64 * 1024, 4).unwrap();
        assert_eq!(seq, 4);

        let pkt = recv(&mut rx).await;
        assert_eq!(pkt.seq, 4);
        assert_eq!(pkt.payload().unwrap(), b"456789");
        sm.close();
    }

    #[tokio::test]
    async fn test_resume_beyond_buffered_rejected() {
        let sm = StreamManager::new(test_config(64 * 1024));
        sm.attach_reader(Cursor::new(b"abc".to_vec())).unwrap();
        wait_for_done(&sm).await;

        let (sender, _rx) = peer();
        let err = sm.client_connected("s1", sender, 1024, 100).unwrap_err();
        assert!(matches!(err, TetherError::ResumeOutOfRange { client_seq: 100, .. }));
        assert!(!sm.is_connected());
        assert_eq!(sm.head_pos(), 0);
        sm.close();
    }

    #[tokio::test]
    async fn test_reconnect_resends_unacked() {
        let sm = StreamManager::new(test_config(64 * 1024));
        sm.attach_reader(Cursor::new(b"abcdef".to_vec())).unwrap();
        wait_for_done(&sm).await;

        let (sender, mut rx) = peer();
        sm.client_connected("s1", sender, 1024, 0).unwrap();
        assert_eq!(recv(&mut rx).await.payload().unwrap(), b"abcdef");

        // Peer got 3 bytes durably, then went away
        sm.recv_ack(&StreamAck::new("s1", 3, 1024));
        sm.client_disconnected();

        let (sender, mut rx2) = peer();
        let seq = sm.client_connected("s2", sender, 1024, 3).unwrap();
        assert_eq!(seq, 3);
        let pkt = recv(&mut rx2).await;
        assert_eq!(pkt.id, "s2");
        assert_eq!(pkt.seq, 3);
        assert_eq!(pkt.payload().unwrap(), b"def");
        sm.close();
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let sm = StreamManager::new(test_config(1024));
        let (sender, _rx) = peer();
        sm.client_connected("s1", Arc::clone(&sender), 1024, 0).unwrap();
        let err = sm.client_connected("s2", sender, 1024, 0).unwrap_err();
        assert!(matches!(err, TetherError::AlreadyConnected));
        assert_eq!(sm.stream_id(), "s1");
        sm.close();
    }

    // ==================== Ack Tests ====================

    #[tokio::test]
    async fn test_stale_stream_ack_ignored() {
        let sm = StreamManager::new(test_config(64 * 1024));
        sm.attach_reader(Cursor::new(b"abcdef".to_vec())).unwrap();
        wait_for_done(&sm).await;

        let (sender, mut rx) = peer();
        sm.client_connected("new", sender, 1024, 0).unwrap();
        recv(&mut rx).await;

        sm.recv_ack(&StreamAck::new("old", 6, 1024));
        assert_eq!(sm.head_pos(), 0);
        assert_eq!(sm.sent_not_acked(), 6);

        // Claims more than was sent
        sm.recv_ack(&StreamAck::new("new", 7, 1024));
        assert_eq!(sm.head_pos(), 0);
        sm.close();
    }

    #[tokio::test]
    async fn test_duplicate_acks_send_single_eof() {
        let sm = StreamManager::new(test_config(64 * 1024));
        sm.attach_reader(Cursor::new(b"xy".to_vec())).unwrap();
        wait_for_done(&sm).await;

        let (sender, mut rx) = peer();
        sm.client_connected("s1", sender, 1024, 0).unwrap();
        recv(&mut rx).await;

        sm.recv_ack(&StreamAck::new("s1", 2, 1024));
        sm.recv_ack(&StreamAck::new("s1", 2, 1024));
        sm.recv_ack(&StreamAck::new("s1", 2, 2048));

        assert!(recv(&mut rx).await.eof);
        assert_quiet(&mut rx).await;
        sm.close();
    }

    // ==================== Terminal Event Tests ====================

    #[tokio::test]
    async fn test_terminal_resent_after_reconnect_until_fin() {
        let sm = StreamManager::new(test_config(64 * 1024));
        sm.attach_reader(Cursor::new(Vec::new())).unwrap();
        wait_for_done(&sm).await;

        let (sender, mut rx) = peer();
        sm.client_connected("s1", sender, 1024, 0).unwrap();
        assert!(recv(&mut rx).await.eof);
        sm.client_disconnected();

        let (sender, mut rx) = peer();
        sm.client_connected("s2", sender, 1024, 0).unwrap();
        let eof = recv(&mut rx).await;
        assert!(eof.eof);
        assert_eq!(eof.id, "s2");

        sm.recv_ack(&StreamAck::fin("s2", 0, 1024));
        sm.client_disconnected();

        let (sender, _rx) = peer();
        let err = sm.client_connected("s3", sender, 1024, 0).unwrap_err();
        assert!(matches!(err, TetherError::StreamClosed));
    }

    #[tokio::test]
    async fn test_read_error_becomes_error_packet() {
        let sm = StreamManager::new(test_config(64 * 1024));
        sm.attach_reader(FailingSource(Some(b"last words".to_vec())))
            .unwrap();
        wait_for_done(&sm).await;

        let (done, err) = sm.stream_done_info();
        assert!(done);
        assert!(err.unwrap().contains("device gone"));

        let (sender, mut rx) = peer();
        sm.client_connected("s1", sender, 1024, 0).unwrap();
        assert_eq!(recv(&mut rx).await.payload().unwrap(), b"last words");
        sm.recv_ack(&StreamAck::new("s1", 10, 1024));

        let pkt = recv(&mut rx).await;
        assert!(!pkt.eof);
        assert_eq!(pkt.seq, 10);
        assert!(pkt.error.unwrap().contains("device gone"));
        sm.close();
    }

    // ==================== Window Tests ====================

    #[tokio::test]
    async fn test_corked_connect_until_rwnd_set() {
        let sm = StreamManager::new(test_config(64 * 1024));
        sm.attach_reader(Cursor::new(b"data".to_vec())).unwrap();
        wait_for_done(&sm).await;

        let (sender, mut rx) = peer();
        sm.client_connected("s1", sender, 0, 0).unwrap();
        assert_quiet(&mut rx).await;

        sm.set_rwnd(1024).unwrap();
        assert_eq!(recv(&mut rx).await.payload().unwrap(), b"data");
        sm.close();
    }

    #[tokio::test]
    async fn test_set_rwnd_requires_connection() {
        let sm = StreamManager::new(test_config(1024));
        assert!(sm.set_rwnd(10).is_err());
        sm.close();
    }

    #[tokio::test]
    async fn test_disconnected_reader_never_blocks() {
        let mut config = test_config(16);
        config.buffer_size = 32;
        let sm = StreamManager::new(config);
        sm.attach_reader(Cursor::new(vec![1u8; 1000])).unwrap();

        // Lossy while nobody is connected: the whole source drains
        wait_for_done(&sm).await;
        assert_eq!(sm.buffer().total_size(), 1000);
        assert_eq!(sm.buffer().size(), 32);
        assert_eq!(sm.head_pos(), 968);
        sm.close();
    }

    #[tokio::test]
    async fn test_resume_below_head_after_eviction() {
        let mut config = test_config(16);
        config.buffer_size = 32;
        let sm = StreamManager::new(config);
        sm.attach_reader(Cursor::new(vec![1u8; 1000])).unwrap();
        wait_for_done(&sm).await;

        // The peer claims offset 10, long since overwritten
        let (sender, mut rx) = peer();
        let seq = sm.client_connected("s1", sender, 64 * 1024, 10).unwrap();
        assert_eq!(seq, 968);

        let pkt = recv(&mut rx).await;
        assert_eq!(pkt.seq, 968);
        assert_eq!(pkt.payload().unwrap().len(), 16);
        sm.close();
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_attach_reader_twice() {
        let sm = StreamManager::new(test_config(1024));
        sm.attach_reader(Cursor::new(Vec::new())).unwrap();
        let err = sm.attach_reader(Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, TetherError::ReaderAlreadyAttached));
        sm.close();
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let mut config = test_config(8);
        config.buffer_size = 8;
        let sm = StreamManager::new(config);

        // Connected with a tiny window, so the reader parks on the buffer
        let (sender, _rx) = peer();
        sm.client_connected("s1", sender, 8, 0).unwrap();
        sm.attach_reader(Cursor::new(vec![0u8; 100])).unwrap();
        wait_for_total(&sm, 8).await;

        tokio::time::timeout(Duration::from_secs(1), sm.close_and_wait())
            .await
            .expect("reader did not stop");

        let (sender, _rx) = peer();
        assert!(matches!(
            sm.client_connected("s2", sender, 8, 0),
            Err(TetherError::StreamClosed)
        ));
    }
}
