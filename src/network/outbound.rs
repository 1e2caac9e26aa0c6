//! Outbound Queue
//!
//! FIFO handoff from the world stage to the I/O thread. Producers push from
//! any thread without waiting on the I/O loop; the loop drains everything
//! queued so far in one non-blocking step per pass.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::network::session::SessionId;

/// Which sessions an outbound message goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One session.
    Session(SessionId),
    /// Every live session.
    All,
    /// An explicit set of sessions.
    List(Vec<SessionId>),
}

/// One unit of data to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Application payload (framed by the I/O loop).
    pub payload: Arc<[u8]>,
    /// Recipients.
    pub target: Target,
}

impl OutboundMessage {
    /// Message for a single session.
    pub fn to_session(id: SessionId, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            payload: payload.into(),
            target: Target::Session(id),
        }
    }

    /// Message for every live session.
    pub fn broadcast(payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            payload: payload.into(),
            target: Target::All,
        }
    }

    /// Message for an explicit list of sessions.
    pub fn to_sessions(ids: Vec<SessionId>, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            payload: payload.into(),
            target: Target::List(ids),
        }
    }
}

struct QueueState {
    messages: VecDeque<OutboundMessage>,
    closed: bool,
}

/// Thread-safe FIFO of pending outbound messages.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    wakeup: Notify,
}

impl OutboundQueue {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            wakeup: Notify::new(),
        }
    }

    /// Enqueue a message and wake the I/O loop.
    ///
    /// Returns the message back if the queue has been closed.
    pub fn put(&self, message: OutboundMessage) -> Result<(), OutboundMessage> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(message);
            }
            state.messages.push_back(message);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Take everything queued so far, oldest first. Never waits.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        let mut state = self.state.lock();
        state.messages.drain(..).collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }

    /// Refuse further puts and discard what is queued.
    ///
    /// Returns the number of discarded messages.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            let n = state.messages.len();
            state.messages.clear();
            n
        };
        self.wakeup.notify_one();
        discarded
    }

    /// Whether [`OutboundQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wake the I/O loop without queuing anything.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Resolves once a put (or wake) happens. A put made while nobody was
    /// waiting is remembered, so none is missed between drain and wait.
    pub async fn notified(&self) {
        self.wakeup.notified().await;
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
