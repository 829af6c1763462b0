//! Ring buffer of output that the peer has not acknowledged yet
//!
//! Positions are tracked two ways: `read_pos`/`write_pos` index the backing
//! array, while `total_size` counts every byte ever written. `head_pos()` is
//! the absolute offset of the oldest byte still held, which is what stream
//! sequence numbers are built from.
//!
//! In sync mode a writer blocks once `window_size` bytes are held, until
//! `consume` frees space or the window grows. In async mode writes never
//! block; once the window is full the oldest bytes are overwritten.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use tether_utils::{Result, TetherError};

struct BufferState {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    count: usize,
    total_size: u64,
    sync_mode: bool,
    window_size: usize,
    /// Wakes the single writer parked on a full window
    waiter: Option<oneshot::Sender<()>>,
    writer_taken: bool,
}

impl BufferState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Copy as much of `data` as the current mode allows, returning the count
    fn write_available(&mut self, data: &[u8]) -> usize {
        let n = if self.sync_mode {
            data.len().min(self.window_size.saturating_sub(self.count))
        } else {
            data.len()
        };

        let cap = self.capacity();
        for &byte in &data[..n] {
            self.buf[self.write_pos] = byte;
            self.write_pos = (self.write_pos + 1) % cap;
            if self.count < self.window_size {
                self.count += 1;
            } else {
                // Async overwrite: drop the oldest byte
                self.read_pos = (self.read_pos + 1) % cap;
            }
            self.total_size += 1;
        }
        n
    }

    fn wake_writer(&mut self) {
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(());
        }
    }
}

/// Fixed-capacity ring buffer with absolute offsets
pub struct CircularBuffer {
    state: Mutex<BufferState>,
}

impl CircularBuffer {
    /// Create a buffer whose effective window starts at full capacity
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, sync_mode: bool) -> Self {
        assert!(capacity > 0, "circular buffer capacity must be non-zero");
        Self {
            state: Mutex::new(BufferState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                count: 0,
                total_size: 0,
                sync_mode,
                window_size: capacity,
                waiter: None,
                writer_taken: false,
            }),
        }
    }

    /// Claim the write handle
    ///
    /// Only one [`BufferWriter`] exists at a time, so at most one writer can
    /// ever be parked on a full window. Fails with `WriterBusy` while another
    /// handle is alive.
    pub fn take_writer(self: &Arc<Self>) -> Result<BufferWriter> {
        let mut st = self.state.lock();
        if st.writer_taken {
            return Err(TetherError::WriterBusy);
        }
        st.writer_taken = true;
        Ok(BufferWriter {
            buffer: Arc::clone(self),
            on_stored: None,
        })
    }

    /// Copy up to `dst.len()` bytes starting `offset` bytes past the read
    /// cursor, without consuming them. Returns the number copied.
    pub fn peek_data_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let st = self.state.lock();
        if offset >= st.count {
            return 0;
        }

        let n = dst.len().min(st.count - offset);
        let cap = st.capacity();
        let start = (st.read_pos + offset) % cap;
        let first = n.min(cap - start);
        dst[..first].copy_from_slice(&st.buf[start..start + first]);
        if first < n {
            dst[first..n].copy_from_slice(&st.buf[..n - first]);
        }
        n
    }

    /// Drop `n` bytes from the front and wake a parked writer
    pub fn consume(&self, n: usize) -> Result<()> {
        let mut st = self.state.lock();
        if n > st.count {
            return Err(TetherError::BufferOverConsume {
                requested: n,
                available: st.count,
            });
        }
        st.read_pos = (st.read_pos + n) % st.capacity();
        st.count -= n;
        st.wake_writer();
        Ok(())
    }

    /// Absolute offset of the oldest byte still held
    pub fn head_pos(&self) -> u64 {
        let st = self.state.lock();
        st.total_size - st.count as u64
    }

    /// Bytes currently held
    pub fn size(&self) -> usize {
        self.state.lock().count
    }

    /// Bytes ever written
    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    pub fn window_size(&self) -> usize {
        self.state.lock().window_size
    }

    pub fn is_sync_mode(&self) -> bool {
        self.state.lock().sync_mode
    }

    /// Change flow-control mode and window in one step
    ///
    /// The window is clamped to capacity. Shrinking never discards held
    /// bytes; it only stops new writes until enough is consumed.
    pub fn set_effective_window(&self, sync_mode: bool, window_size: usize) {
        let mut st = self.state.lock();
        let was_sync = st.sync_mode;
        let old_window = st.window_size;

        st.sync_mode = sync_mode;
        st.window_size = window_size.min(st.capacity());

        if was_sync && (st.window_size > old_window || !sync_mode) {
            st.wake_writer();
        }
    }
}

impl std::fmt::Debug for CircularBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("CircularBuffer")
            .field("capacity", &st.capacity())
            .field("count", &st.count)
            .field("total_size", &st.total_size)
            .field("sync_mode", &st.sync_mode)
            .field("window_size", &st.window_size)
            .finish()
    }
}

/// Exclusive write handle for a [`CircularBuffer`]
pub struct BufferWriter {
    buffer: Arc<CircularBuffer>,
    on_stored: Option<Arc<Notify>>,
}

impl BufferWriter {
    /// Signal `notify` whenever a write stores bytes, including the part of
    /// a write that went in before it parked on a full window
    pub fn notify_on_store(mut self, notify: Arc<Notify>) -> Self {
        self.on_stored = Some(notify);
        self
    }

    /// Write all of `data`, waiting for window space in sync mode
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.write_with_cancel(&CancellationToken::new(), data).await
    }

    /// Write all of `data` unless `cancel` fires first
    ///
    /// On cancellation returns `WriteCancelled` carrying the number of bytes
    /// that did make it into the buffer.
    pub async fn write_with_cancel(
        &mut self,
        cancel: &CancellationToken,
        data: &[u8],
    ) -> Result<usize> {
        let mut written = 0;
        loop {
            let (stored, rx) = {
                let mut st = self.buffer.state.lock();
                let stored = st.write_available(&data[written..]);
                written += stored;
                if written == data.len() {
                    (stored, None)
                } else {
                    let (tx, rx) = oneshot::channel();
                    st.waiter = Some(tx);
                    (stored, Some(rx))
                }
            };
            if stored > 0 {
                if let Some(notify) = &self.on_stored {
                    notify.notify_one();
                }
            }
            let Some(rx) = rx else {
                return Ok(written);
            };

            trace!(written, remaining = data.len() - written, "buffer window full");
            tokio::select! {
                _ = rx => {}
                _ = cancel.cancelled() => {
                    self.buffer.state.lock().waiter = None;
                    return Err(TetherError::WriteCancelled { written });
                }
            }
        }
    }

    pub fn buffer(&self) -> &Arc<CircularBuffer> {
        &self.buffer
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        let mut st = self.buffer.state.lock();
        st.writer_taken = false;
        st.waiter = None;
    }
}
