//! Session Registry
//!
//! Maps connection identifiers to per-connection state shared between the I/O
//! thread and the world stage.
//!
//! Readers never get a reference into the registry: [`SessionRegistry::snapshot`]
//! hands out a copy, and the only durable write path for other threads is
//! [`SessionRegistry::modify_field`]. Structural changes (insert, purge) are
//! made by the I/O thread alone. Removal is deferred: a session is first
//! marked dead and only erased by [`SessionRegistry::purge_dead`] between
//! multiplexing passes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::network::outbound::Target;

/// Connection identifier.
///
/// Assigned from a monotonic counter and never reused within the process.
pub type SessionId = u64;

/// Session fields the world stage may update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionField {
    /// Authenticated account name.
    Account,
    /// Active character name.
    Character,
    /// Free-form status line.
    Status,
}

/// Per-session traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Raw bytes read from the socket.
    pub bytes_received: u64,
    /// Raw bytes written to the socket.
    pub bytes_sent: u64,
    /// Framed messages delivered to the world.
    pub messages_received: u64,
    /// Framed messages written to the socket.
    pub messages_sent: u64,
}

/// Server-side state for one connected client.
///
/// Values of this type handed out by the registry are snapshots: changing
/// them has no effect on the live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Connection identifier.
    pub id: SessionId,
    /// Remote address.
    pub peer_addr: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    /// Last inbound traffic (or accept time).
    pub last_activity: DateTime<Utc>,
    /// Traffic counters.
    pub stats: SessionStats,
    fields: BTreeMap<SessionField, String>,
}

impl Session {
    fn new(id: SessionId, peer_addr: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer_addr,
            connected_at: now,
            last_activity: now,
            stats: SessionStats::default(),
            fields: BTreeMap::new(),
        }
    }

    /// Read a modifiable field.
    pub fn field(&self, field: SessionField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    /// All fields that have been set.
    pub fn fields(&self) -> impl Iterator<Item = (SessionField, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// Session registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No live session with this id.
    #[error("Session {0} not found")]
    NotFound(SessionId),
}

struct Entry<S> {
    session: Session,
    socket: Arc<S>,
    dead: bool,
}

struct Inner<S> {
    sessions: BTreeMap<SessionId, Entry<S>>,
    /// Dead-marked ids in marking order; mirrors `Entry::dead`.
    dead: Vec<SessionId>,
    next_id: SessionId,
}

/// Registry of live sessions, generic over the socket type.
pub struct SessionRegistry<S> {
    inner: Mutex<Inner<S>>,
}

impl<S> SessionRegistry<S> {
    /// Create an empty registry. The first session gets id 1.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: BTreeMap::new(),
                dead: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a freshly accepted connection and return its id.
    ///
    /// I/O thread only.
    pub fn add_session(&self, socket: S, peer_addr: SocketAddr) -> SessionId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.insert(
            id,
            Entry {
                session: Session::new(id, peer_addr),
                socket: Arc::new(socket),
                dead: false,
            },
        );
        id
    }

    /// Copy of a live session.
    pub fn snapshot(&self, id: SessionId) -> Result<Session, SessionError> {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(&id)
            .map(|e| e.session.clone())
            .ok_or(SessionError::NotFound(id))
    }

    /// Copies of every live session, in id order.
    pub fn snapshots(&self) -> Vec<Session> {
        let inner = self.inner.lock();
        inner.sessions.values().map(|e| e.session.clone()).collect()
    }

    /// Ids of every session still in the registry, dead-marked ones included.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.lock().sessions.keys().copied().collect()
    }

    /// Socket handle of a session, for the I/O thread.
    pub fn socket(&self, id: SessionId) -> Option<Arc<S>> {
        let inner = self.inner.lock();
        inner.sessions.get(&id).map(|e| Arc::clone(&e.socket))
    }

    /// Ids and sockets of every session not marked dead.
    pub fn live_sockets(&self) -> Vec<(SessionId, Arc<S>)> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|(_, e)| !e.dead)
            .map(|(id, e)| (*id, Arc::clone(&e.socket)))
            .collect()
    }

    /// Queue a session for removal at the next purge.
    ///
    /// Marking twice is a no-op.
    pub fn mark_dead(&self, id: SessionId) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        if !entry.dead {
            entry.dead = true;
            inner.dead.push(id);
        }
        Ok(())
    }

    /// Whether a session is waiting to be purged.
    pub fn is_marked_dead(&self, id: SessionId) -> bool {
        self.inner.lock().sessions.get(&id).is_some_and(|e| e.dead)
    }

    /// Remove every dead-marked session and clear the marker list.
    ///
    /// Dropping the registry's socket handle closes the connection once the
    /// I/O thread holds no other handle. Returns the removed sessions in
    /// marking order. Call only between multiplexing passes.
    pub fn purge_dead(&self) -> Vec<Session> {
        let mut inner = self.inner.lock();
        let dead = std::mem::take(&mut inner.dead);
        dead.into_iter()
            .filter_map(|id| inner.sessions.remove(&id))
            .map(|e| e.session)
            .collect()
    }

    /// Set one field on a live session.
    pub fn modify_field(
        &self,
        id: SessionId,
        field: SessionField,
        value: impl Into<String>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        entry.session.fields.insert(field, value.into());
        Ok(())
    }

    /// Set several fields on a live session in one critical section.
    pub fn modify_fields<I, V>(&self, id: SessionId, updates: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = (SessionField, V)>,
        V: Into<String>,
    {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        for (field, value) in updates {
            entry.session.fields.insert(field, value.into());
        }
        Ok(())
    }

    /// Resolve a target set to live (not dead-marked) session ids.
    ///
    /// Unknown ids in explicit targets are dropped, and duplicates collapse.
    pub fn resolve(&self, target: &Target) -> Vec<SessionId> {
        let inner = self.inner.lock();
        let live = |id: &SessionId| inner.sessions.get(id).is_some_and(|e| !e.dead);

        match target {
            Target::All => inner.sessions.keys().copied().filter(|id| live(id)).collect(),
            Target::Session(id) => Some(*id).filter(|id| live(id)).into_iter().collect(),
            Target::List(ids) => {
                let mut out: Vec<SessionId> = ids.iter().copied().filter(|id| live(id)).collect();
                out.sort_unstable();
                out.dedup();
                out
            }
        }
    }

    /// Account inbound traffic and refresh the activity timestamp.
    pub fn record_inbound(&self, id: SessionId, bytes: usize, messages: usize) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.sessions.get_mut(&id) {
            let stats = &mut entry.session.stats;
            stats.bytes_received += bytes as u64;
            stats.messages_received += messages as u64;
            entry.session.last_activity = Utc::now();
        }
    }

    /// Account outbound traffic.
    pub fn record_outbound(&self, id: SessionId, bytes: usize, messages: usize) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.sessions.get_mut(&id) {
            let stats = &mut entry.session.stats;
            stats.bytes_sent += bytes as u64;
            stats.messages_sent += messages as u64;
        }
    }

    /// Live sessions with no inbound traffic for longer than `timeout`.
    pub fn idle_sessions(&self, timeout: Duration) -> Vec<SessionId> {
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .sessions
            .values()
            .filter(|e| !e.dead)
            .filter(|e| now - e.session.last_activity > timeout)
            .map(|e| e.session.id)
            .collect()
    }

    /// Number of sessions in the registry.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether the registry holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }

    /// Drop every session at shutdown. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.dead.clear();
        let closed = inner.sessions.len();
        inner.sessions.clear();
        closed
    }
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
