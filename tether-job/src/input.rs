//! Reordering of job input
//!
//! Main servers send input over a socket that may be replaced mid-session, so
//! inputs can arrive slightly out of order. [`ReorderQueue`] restores
//! `seq_num` order within a session, waiting at most a short timeout for a
//! missing item before giving up on it.
//!
//! Sessions are ordered by when they were first seen: everything from an
//! older session sorts before everything from a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use tether_utils::{Result, TetherError};

use crate::config::InputConfig;

/// First sequence number of every session
const FIRST_SEQ: u64 = 1;

struct Held<T> {
    order: (u64, u64),
    session: String,
    seq: u64,
    item: T,
    since: Instant,
}

struct QueueState<T> {
    /// Session id -> first-seen rank
    sessions: HashMap<String, u64>,
    next_rank: u64,
    current_session: Option<String>,
    next_seq: u64,
    held: Vec<Held<T>>,
    tx: Option<mpsc::Sender<T>>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    timeout: Duration,
}

/// Orders items by `(session, seq_num)` with a bounded wait for gaps
pub struct ReorderQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> ReorderQueue<T> {
    /// Create a queue and the receiver ordered items are delivered on
    pub fn new(capacity: usize, timeout: Duration) -> (Self, mpsc::Receiver<T>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                sessions: HashMap::new(),
                next_rank: 0,
                current_session: None,
                next_seq: FIRST_SEQ,
                held: Vec::new(),
                tx: Some(tx),
                timer: None,
            }),
            capacity,
            timeout,
        });
        (Self { inner }, rx)
    }

    pub fn from_config(config: &InputConfig) -> (Self, mpsc::Receiver<T>) {
        Self::new(config.reorder_capacity, config.reorder_timeout())
    }

    /// Queue an item
    ///
    /// Items without a session or with `seq_num == 0` are delivered
    /// immediately. Fails when the queue is closed or full.
    pub fn push(&self, session: Option<&str>, seq_num: u64, item: T) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let Some(tx) = state.tx.as_ref() else {
            return Err(TetherError::internal("input queue is closed"));
        };
        let queued = inner.capacity - tx.capacity();
        if state.held.len() + queued >= inner.capacity {
            return Err(TetherError::internal(format!(
                "input queue is full (capacity {})",
                inner.capacity
            )));
        }

        let session = match session {
            Some(s) if !s.is_empty() && seq_num != 0 => s,
            _ => {
                state.deliver(item);
                return Ok(());
            }
        };

        state.ensure_session(session);
        let order = (state.sessions[session], seq_num);
        let expected = state.expected_order();

        if order < expected {
            trace!(session, seq_num, "late input delivered immediately");
            state.deliver(item);
        } else if order == expected {
            state.deliver(item);
            state.next_seq += 1;
            state.drain_ready();
        } else {
            trace!(session, seq_num, next = state.next_seq, "holding out-of-order input");
            state.held.push(Held {
                order,
                session: session.to_string(),
                seq: seq_num,
                item,
                since: Instant::now(),
            });
            if state.timer.is_none() {
                state.timer = Some(Inner::schedule(Arc::downgrade(inner), inner.timeout));
            }
        }
        Ok(())
    }

    /// Stop accepting items; the receiver ends once drained
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.held.clear();
        state.tx = None;
    }

    /// Number of out-of-order items waiting for a gap to fill
    pub fn held_len(&self) -> usize {
        self.inner.state.lock().held.len()
    }
}

impl<T> Drop for ReorderQueue<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.state.lock().timer.take() {
            timer.abort();
        }
    }
}

impl<T> QueueState<T> {
    fn deliver(&self, item: T) {
        if let Some(tx) = &self.tx {
            // Room is reserved by the capacity check in push
            if tx.try_send(item).is_err() {
                debug!("input receiver gone, dropping input");
            }
        }
    }

    fn expected_order(&self) -> (u64, u64) {
        let rank = self
            .current_session
            .as_ref()
            .and_then(|s| self.sessions.get(s))
            .copied()
            .unwrap_or(0);
        (rank, self.next_seq)
    }

    fn ensure_session(&mut self, session: &str) {
        if self.sessions.contains_key(session) {
            return;
        }
        let rank = self.next_rank;
        self.next_rank += 1;
        self.sessions.insert(session.to_string(), rank);
        self.flush_all();
        debug!(session, "new input session");
        self.current_session = Some(session.to_string());
        self.next_seq = FIRST_SEQ;
    }

    fn sort_held(&mut self) {
        self.held.sort_by_key(|h| h.order);
    }

    fn flush_all(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.sort_held();
        for held in std::mem::take(&mut self.held) {
            self.deliver(held.item);
        }
    }

    /// Deliver held items that continue the current sequence
    fn drain_ready(&mut self) {
        self.sort_held();
        let current = self.current_session.clone();
        let mut ready = 0;
        for held in &self.held {
            if Some(&held.session) == current.as_ref() && held.seq == self.next_seq {
                self.next_seq += 1;
                ready += 1;
            } else {
                break;
            }
        }
        let released: Vec<_> = self.held.drain(..ready).collect();
        for held in released {
            self.deliver(held.item);
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    fn schedule(weak: Weak<Self>, delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout();
            }
        })
    }

    /// Give up on gaps older than the timeout
    fn on_timeout(self: Arc<Self>) {
        let mut state = self.state.lock();
        state.timer = None;
        if state.tx.is_none() || state.held.is_empty() {
            return;
        }

        state.sort_held();
        let now = Instant::now();
        let last_expired = state
            .held
            .iter()
            .rposition(|h| now.duration_since(h.since) >= self.timeout);

        if let Some(last) = last_expired {
            let current = state.current_session.clone();
            let expired: Vec<_> = state.held.drain(..=last).collect();
            for held in expired {
                if Some(&held.session) == current.as_ref() && held.seq >= state.next_seq {
                    state.next_seq = held.seq + 1;
                }
                debug!(session = %held.session, seq_num = held.seq, "input gap timed out");
                state.deliver(held.item);
            }
            state.drain_ready();
        }

        if let Some(oldest) = state.held.iter().map(|h| h.since).min() {
            let delay = self.timeout.saturating_sub(now.duration_since(oldest));
            state.timer = Some(Self::schedule(Arc::downgrade(&self), delay));
        }
    }
}
