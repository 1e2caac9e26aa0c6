//! Network Manager
//!
//! Single-threaded I/O loop that owns the listening socket and every session
//! socket. Each pass runs the same fixed sequence:
//!
//! ```text
//!   interest set ─▶ wait (bounded) ─▶ accept ─▶ read ready sessions
//!        ▲                                            │
//!        │                                            ▼
//!    cancelled? ◀── purge dead ◀── drain outbound ◀── frame + deliver
//! ```
//!
//! Sessions that fail (EOF, socket error, bad envelope, slow reader) are only
//! marked dead during a pass; the registry is mutated structurally in the
//! purge step at the end, once nothing is iterating it.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;

use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::network::framing::{encode_frame, Framer};
use crate::network::outbound::{OutboundMessage, OutboundQueue};
use crate::network::session::{Session, SessionError, SessionField, SessionId, SessionRegistry};
use crate::network::world::WorldSink;

/// Registry type used by the TCP manager.
pub type TcpRegistry = SessionRegistry<TcpStream>;

/// Reads per session per pass before yielding to other sessions.
const MAX_READS_PER_PASS: usize = 16;

/// Name of the dedicated I/O thread.
const IO_THREAD_NAME: &str = "seeqd-net-io";

/// Network manager errors.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: io::Error,
    },

    /// The listening socket failed.
    #[error("Listener failed: {0}")]
    Listener(io::Error),

    /// The readiness wait itself failed (I/O driver gone).
    #[error("Readiness wait failed: {0}")]
    Readiness(io::Error),

    /// The I/O thread or its runtime could not be started.
    #[error("Failed to start I/O thread: {0}")]
    Runtime(io::Error),

    /// The I/O thread panicked.
    #[error("I/O thread panicked")]
    ThreadPanicked,

    /// The manager no longer accepts work.
    #[error("Network manager is shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Session lookup failed.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable, thread-safe access to a running manager.
///
/// This is how the world stage sends messages, reads session snapshots and
/// updates session fields.
#[derive(Clone)]
pub struct NetHandle {
    registry: Arc<TcpRegistry>,
    outbound: Arc<OutboundQueue>,
    canceled: Arc<AtomicBool>,
}

impl NetHandle {
    /// Queue a message for delivery.
    pub fn put_message(&self, message: OutboundMessage) -> Result<(), NetworkError> {
        self.outbound
            .put(message)
            .map_err(|_| NetworkError::ShuttingDown)
    }

    /// Queue a payload for one session.
    pub fn send_to(&self, id: SessionId, payload: impl Into<Arc<[u8]>>) -> Result<(), NetworkError> {
        self.put_message(OutboundMessage::to_session(id, payload))
    }

    /// Queue a payload for every live session.
    pub fn broadcast(&self, payload: impl Into<Arc<[u8]>>) -> Result<(), NetworkError> {
        self.put_message(OutboundMessage::broadcast(payload))
    }

    /// Durably update one field of a live session.
    pub fn modify_session_field(
        &self,
        id: SessionId,
        field: SessionField,
        value: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.registry.modify_field(id, field, value)
    }

    /// Copy of a live session.
    pub fn session_snapshot(&self, id: SessionId) -> Result<Session, SessionError> {
        self.registry.snapshot(id)
    }

    /// Copies of every session in the registry.
    pub fn sessions(&self) -> Vec<Session> {
        self.registry.snapshots()
    }

    /// Number of sessions in the registry.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Disconnect a session at the end of the current pass.
    pub fn kill_session(&self, id: SessionId) -> Result<(), SessionError> {
        self.registry.mark_dead(id)
    }

    /// Ask the I/O loop to stop after its current pass.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.outbound.wake();
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Loop-private per-session state.
struct Link {
    /// Receive buffer.
    framer: Framer,
    /// Framed bytes not yet accepted by the socket.
    backlog: Vec<u8>,
}

/// One socket in the current pass's interest set.
struct Watch {
    id: SessionId,
    socket: Arc<TcpStream>,
    interest: Interest,
}

/// Result of one readiness wait.
#[derive(Default)]
struct Readiness {
    incoming: Vec<(TcpStream, SocketAddr)>,
    ready: Vec<(SessionId, Ready)>,
}

impl Readiness {
    fn record(&mut self, id: SessionId, result: io::Result<Ready>) -> Result<(), NetworkError> {
        let ready = result.map_err(NetworkError::Readiness)?;
        self.ready.push((id, ready));
        Ok(())
    }
}

/// What a read pass decided about a session.
enum ReadOutcome {
    Open,
    Closed(String),
}

/// The network I/O manager.
pub struct NetworkManager<W> {
    config: ServerConfig,
    listener: TcpListener,
    registry: Arc<TcpRegistry>,
    outbound: Arc<OutboundQueue>,
    canceled: Arc<AtomicBool>,
    links: BTreeMap<SessionId, Link>,
    scratch: Vec<u8>,
    world: W,
}

impl<W: WorldSink> NetworkManager<W> {
    /// Validate `config` and bind the listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(config: ServerConfig, world: W) -> Result<Self, NetworkError> {
        config.validate()?;

        let addr = config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })?;
        info!("Listening on {}", listener.local_addr().unwrap_or(addr));

        Ok(Self {
            scratch: vec![0; config.read_chunk_size],
            config,
            listener,
            registry: Arc::new(SessionRegistry::new()),
            outbound: Arc::new(OutboundQueue::new()),
            canceled: Arc::new(AtomicBool::new(false)),
            links: BTreeMap::new(),
            world,
        })
    }

    /// Handle for other threads.
    pub fn handle(&self) -> NetHandle {
        NetHandle {
            registry: Arc::clone(&self.registry),
            outbound: Arc::clone(&self.outbound),
            canceled: Arc::clone(&self.canceled),
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.listener.local_addr().map_err(NetworkError::Listener)
    }

    /// Run passes until cancelled or a fatal error occurs.
    ///
    /// All sockets are closed and pending outbound messages discarded on
    /// return, whatever the outcome.
    #[instrument(skip(self), name = "net_io")]
    pub async fn run(mut self) -> Result<(), NetworkError> {
        info!("Network manager started");

        let result = loop {
            if let Err(e) = self.run_pass().await {
                error!("Fatal network error: {}", e);
                break Err(e);
            }
            if self.canceled.load(Ordering::Acquire) {
                break Ok(());
            }
        };

        self.shutdown();
        result
    }

    /// Execute exactly one pass.
    pub async fn run_pass(&mut self) -> Result<(), NetworkError> {
        let readiness = {
            let interest = self.interest_set();
            self.wait_ready(&interest).await?
        };

        for (stream, peer) in readiness.incoming {
            self.accept_connection(stream, peer);
        }
        for (id, ready) in readiness.ready {
            self.service_session(id, ready);
        }

        self.drain_outbound();
        self.reap_idle();
        self.purge();
        Ok(())
    }

    /// Sockets to watch this pass: every session not already marked dead.
    fn interest_set(&self) -> Vec<Watch> {
        self.registry
            .live_sockets()
            .into_iter()
            .map(|(id, socket)| {
                let pending = self.links.get(&id).is_some_and(|l| !l.backlog.is_empty());
                let interest = if pending {
                    Interest::READABLE.add(Interest::WRITABLE)
                } else {
                    Interest::READABLE
                };
                Watch { id, socket, interest }
            })
            .collect()
    }

    /// Block until something is ready, a message is queued, or the poll
    /// timeout elapses; then collect everything else already ready.
    async fn wait_ready(&self, interest: &[Watch]) -> Result<Readiness, NetworkError> {
        let mut waits: FuturesUnordered<_> = interest
            .iter()
            .map(|w| async move { (w.id, w.socket.ready(w.interest).await) })
            .collect();
        let mut readiness = Readiness::default();

        tokio::select! {
            accepted = self.listener.accept() => {
                if let Some(conn) = self.check_accept(accepted)? {
                    readiness.incoming.push(conn);
                }
            }
            Some((id, result)) = waits.next(), if !waits.is_empty() => {
                readiness.record(id, result)?;
            }
            _ = self.outbound.notified() => {}
            _ = tokio::time::sleep(self.config.poll_timeout()) => {}
        }

        while let Some(Some((id, result))) = waits.next().now_or_never() {
            readiness.record(id, result)?;
        }
        while let Some(accepted) = self.listener.accept().now_or_never() {
            match self.check_accept(accepted)? {
                Some(conn) => readiness.incoming.push(conn),
                None => break,
            }
        }

        Ok(readiness)
    }

    /// Transient accept failures are logged and skipped; anything else means
    /// the listener is unusable.
    fn check_accept(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
    ) -> Result<Option<(TcpStream, SocketAddr)>, NetworkError> {
        match accepted {
            Ok(conn) => Ok(Some(conn)),
            Err(e) if is_descriptor_exhaustion(&e) => {
                warn!("Out of file descriptors, deferring accepts: {}", e);
                Ok(None)
            }
            Err(e) if is_transient_accept_error(&e) => {
                warn!("Accept error: {}", e);
                Ok(None)
            }
            Err(e) => Err(NetworkError::Listener(e)),
        }
    }

    fn accept_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.registry.len() >= self.config.max_connections {
            warn!(%peer, "Connection limit reached, rejecting");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
        }

        let id = self.registry.add_session(stream, peer);
        self.links.insert(
            id,
            Link {
                framer: Framer::new(self.config.max_message_size),
                backlog: Vec::new(),
            },
        );
        info!(session = id, %peer, "New connection");

        if let Ok(snapshot) = self.registry.snapshot(id) {
            self.world.session_opened(&snapshot);
        }
    }

    fn service_session(&mut self, id: SessionId, ready: Ready) {
        let Some(socket) = self.registry.socket(id) else {
            return;
        };

        if let ReadOutcome::Closed(reason) = self.receive(id, &socket) {
            self.kill(id, &reason);
            return;
        }
        if ready.is_writable() {
            if let Err(e) = self.flush(id, &socket) {
                self.kill(id, &format!("write failed: {e}"));
            }
        }
    }

    /// Read what is available, extract complete messages and hand them to
    /// the world. Messages framed before an EOF or a corrupt envelope are
    /// still delivered.
    fn receive(&mut self, id: SessionId, socket: &TcpStream) -> ReadOutcome {
        let Some(link) = self.links.get_mut(&id) else {
            return ReadOutcome::Open;
        };

        let mut bytes = 0;
        let mut outcome = ReadOutcome::Open;
        for _ in 0..MAX_READS_PER_PASS {
            match socket.try_read(&mut self.scratch) {
                Ok(0) => {
                    outcome = ReadOutcome::Closed("peer closed connection".into());
                    break;
                }
                Ok(n) => {
                    bytes += n;
                    link.framer.push(&self.scratch[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    outcome = ReadOutcome::Closed(format!("read failed: {e}"));
                    break;
                }
            }
        }

        let mut messages = 0;
        loop {
            match link.framer.next_message() {
                Ok(Some(payload)) => {
                    messages += 1;
                    self.world.deliver_inbound(id, payload);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session = id, "Integrity failure: {}", e);
                    outcome = ReadOutcome::Closed(format!("bad frame: {e}"));
                    break;
                }
            }
        }

        if bytes > 0 {
            self.registry.record_inbound(id, bytes, messages);
        }
        outcome
    }

    /// Write as much of the session's backlog as the socket takes.
    fn flush(&mut self, id: SessionId, socket: &TcpStream) -> io::Result<()> {
        let Some(link) = self.links.get_mut(&id) else {
            return Ok(());
        };

        let mut written = 0;
        let mut result = Ok(());
        while written < link.backlog.len() {
            match socket.try_write(&link.backlog[written..]) {
                Ok(0) => {
                    result = Err(io::ErrorKind::WriteZero.into());
                    break;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        link.backlog.drain(..written);

        if written > 0 {
            self.registry.record_outbound(id, written, 0);
        }
        result
    }

    /// Deliver every queued outbound message to its live recipients.
    fn drain_outbound(&mut self) {
        for message in self.outbound.drain() {
            let frame = match encode_frame(&message.payload, self.config.max_message_size) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(target_set = ?message.target, "Dropping outbound message: {}", e);
                    continue;
                }
            };

            let recipients = self.registry.resolve(&message.target);
            if recipients.is_empty() {
                debug!(target_set = ?message.target, "No live recipients");
            }
            for id in recipients {
                self.send_frame(id, &frame);
            }
        }
    }

    fn send_frame(&mut self, id: SessionId, frame: &[u8]) {
        let Some(socket) = self.registry.socket(id) else {
            return;
        };
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        link.backlog.extend_from_slice(frame);
        self.registry.record_outbound(id, 0, 1);

        if let Err(e) = self.flush(id, &socket) {
            self.kill(id, &format!("write failed: {e}"));
            return;
        }

        let backlog = self.links.get(&id).map_or(0, |l| l.backlog.len());
        if backlog > self.config.max_send_backlog {
            self.kill(id, &format!("send backlog of {backlog} bytes exceeds limit"));
        }
    }

    fn reap_idle(&self) {
        let Some(limit) = self
            .config
            .idle_timeout()
            .and_then(|t| chrono::Duration::from_std(t).ok())
        else {
            return;
        };

        for id in self.registry.idle_sessions(limit) {
            self.kill(id, "idle timeout");
        }
    }

    fn kill(&self, id: SessionId, reason: &str) {
        if self.registry.mark_dead(id).is_ok() {
            debug!(session = id, "Marked dead: {}", reason);
        }
    }

    /// Erase dead sessions. Only called once the pass's traversals are done.
    fn purge(&mut self) {
        for session in self.registry.purge_dead() {
            self.links.remove(&session.id);
            info!(
                session = session.id,
                peer = %session.peer_addr,
                bytes_in = session.stats.bytes_received,
                bytes_out = session.stats.bytes_sent,
                "Session closed"
            );
            self.world.session_closed(session.id);
        }
    }

    fn shutdown(&mut self) {
        self.canceled.store(true, Ordering::Release);
        let discarded = self.outbound.close();
        self.links.clear();
        let closed = self.registry.close_all();
        info!(closed, discarded, "Network manager stopped");
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Process or system descriptor table full. The listener is still healthy;
/// pending connections wait in the backlog until descriptors free up.
#[cfg(unix)]
fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(not(unix))]
fn is_descriptor_exhaustion(_e: &io::Error) -> bool {
    false
}

// =============================================================================
// DEDICATED THREAD
// =============================================================================

/// A manager running on its own thread.
pub struct RunningServer {
    handle: NetHandle,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<Result<(), NetworkError>>>,
}

impl RunningServer {
    /// Handle for other threads.
    pub fn handle(&self) -> NetHandle {
        self.handle.clone()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel the loop and wait for it to release its sockets.
    pub fn shutdown(mut self) -> Result<(), NetworkError> {
        self.handle.cancel();
        self.join_thread()
    }

    /// Wait for the loop to exit on its own (fatal error or cancellation).
    pub fn join(mut self) -> Result<(), NetworkError> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<(), NetworkError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| NetworkError::ThreadPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.handle.cancel();
            if let Err(e) = self.join_thread() {
                warn!("I/O thread exited with error: {}", e);
            }
        }
    }
}

/// Start a manager on a dedicated thread with its own single-threaded
/// runtime. Returns once the listener is bound.
pub fn spawn<W: WorldSink>(config: ServerConfig, world: W) -> Result<RunningServer, NetworkError> {
    let (started_tx, started_rx) = std_mpsc::sync_channel(1);

    let thread = std::thread::Builder::new()
        .name(IO_THREAD_NAME.into())
        .spawn(move || {
            let startup = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(NetworkError::Runtime)
                .and_then(|runtime| {
                    let manager = runtime.block_on(NetworkManager::bind(config, world))?;
                    let addr = manager.local_addr()?;
                    Ok((runtime, manager, addr))
                });

            match startup {
                Ok((runtime, manager, addr)) => {
                    let _ = started_tx.send(Ok((addr, manager.handle())));
                    runtime.block_on(manager.run())
                }
                Err(e) => {
                    let _ = started_tx.send(Err(e));
                    Ok(())
                }
            }
        })
        .map_err(NetworkError::Runtime)?;

    match started_rx.recv() {
        Ok(Ok((local_addr, handle))) => Ok(RunningServer {
            handle,
            local_addr,
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(NetworkError::ThreadPanicked)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::outbound::Target;
    use crate::network::world::{world_channel, InboundMessage, WorldEvent};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::UnboundedReceiver;

    type TestManager = NetworkManager<tokio::sync::mpsc::UnboundedSender<WorldEvent>>;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            poll_timeout_ms: 10,
            ..Default::default()
        }
    }

    async fn start(config: ServerConfig) -> (TestManager, UnboundedReceiver<WorldEvent>) {
        let (tx, rx) = world_channel();
        let manager = NetworkManager::bind(config, tx).await.unwrap();
        (manager, rx)
    }

    async fn connect(manager: &TestManager) -> TcpStream {
        TcpStream::connect(manager.local_addr().unwrap()).await.unwrap()
    }

    /// Run passes until `done` holds.
    async fn pump_until(manager: &mut TestManager, mut done: impl FnMut(&TestManager) -> bool) {
        for _ in 0..300 {
            if done(manager) {
                return;
            }
            manager.run_pass().await.unwrap();
        }
        panic!("condition not reached");
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        encode_frame(payload, crate::network::framing::DEFAULT_MAX_MESSAGE_SIZE).unwrap()
    }

    fn messages(events: &[WorldEvent]) -> Vec<InboundMessage> {
        events
            .iter()
            .filter_map(|e| match e {
                WorldEvent::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn collect(rx: &mut UnboundedReceiver<WorldEvent>, into: &mut Vec<WorldEvent>) {
        while let Ok(event) = rx.try_recv() {
            into.push(event);
        }
    }

    /// Read `count` frames from a client socket.
    async fn read_frames(client: &mut TcpStream, count: usize) -> Vec<Vec<u8>> {
        let mut framer = Framer::default();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while out.len() < count {
            let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .expect("timed out waiting for frames")
                .unwrap();
            assert!(n > 0, "connection closed early");
            framer.push(&buf[..n]);
            while let Some(msg) = framer.next_message().unwrap() {
                out.push(msg);
            }
        }
        out
    }

    async fn assert_closed(client: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("timed out waiting for close");
        assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let (tx, _rx) = world_channel();
        let config = ServerConfig {
            max_message_size: 0,
            ..test_config()
        };
        let result = NetworkManager::bind(config, tx).await;
        assert!(matches!(result, Err(NetworkError::Config(_))));
    }

    #[tokio::test]
    async fn test_accept_creates_session() {
        let (mut manager, mut rx) = start(test_config()).await;
        let _client = connect(&manager).await;

        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        match rx.try_recv().unwrap() {
            WorldEvent::Connected(session) => assert_eq!(session.id, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_frame_delivered_once() {
        let (mut manager, mut rx) = start(test_config()).await;
        let mut client = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        let wire = frame(b"hi");
        assert_eq!(wire.len(), 10);

        client.write_all(&wire[..3]).await.unwrap();
        pump_until(&mut manager, |m| {
            m.handle().session_snapshot(1).unwrap().stats.bytes_received == 3
        })
        .await;

        let mut events = Vec::new();
        collect(&mut rx, &mut events);
        assert!(messages(&events).is_empty());

        client.write_all(&wire[3..]).await.unwrap();
        pump_until(&mut manager, |m| {
            m.handle().session_snapshot(1).unwrap().stats.messages_received == 1
        })
        .await;

        collect(&mut rx, &mut events);
        assert_eq!(
            messages(&events),
            vec![InboundMessage {
                session_id: 1,
                payload: b"hi".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn test_corrupt_frame_kills_session() {
        let (mut manager, mut rx) = start(test_config()).await;
        let mut client = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        let mut wire = frame(b"tampered");
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        client.write_all(&wire).await.unwrap();

        pump_until(&mut manager, |m| m.handle().session_count() == 0).await;

        let mut events = Vec::new();
        collect(&mut rx, &mut events);
        assert!(messages(&events).is_empty());
        assert!(events.contains(&WorldEvent::Disconnected(1)));
        assert_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_peer_disconnect_purges_session() {
        let (mut manager, mut rx) = start(test_config()).await;
        let client = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        drop(client);
        pump_until(&mut manager, |m| m.handle().session_count() == 0).await;

        let mut events = Vec::new();
        collect(&mut rx, &mut events);
        assert_eq!(events.last(), Some(&WorldEvent::Disconnected(1)));
    }

    #[tokio::test]
    async fn test_broadcast_skips_dead_session() {
        let (mut manager, _rx) = start(test_config()).await;
        let mut a = connect(&manager).await;
        let mut b = connect(&manager).await;
        let mut c = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 3).await;

        let handle = manager.handle();
        // Find which session is `c` by its local port.
        let c_port = c.local_addr().unwrap().port();
        let c_id = handle
            .sessions()
            .into_iter()
            .find(|s| s.peer_addr.port() == c_port)
            .unwrap()
            .id;

        handle.kill_session(c_id).unwrap();
        handle.broadcast(&b"to everyone"[..]).unwrap();
        manager.run_pass().await.unwrap();

        assert_eq!(read_frames(&mut a, 1).await, vec![b"to everyone".to_vec()]);
        assert_eq!(read_frames(&mut b, 1).await, vec![b"to everyone".to_vec()]);
        assert_closed(&mut c).await;

        let sent: Vec<u64> = handle.sessions().iter().map(|s| s.stats.messages_sent).collect();
        assert_eq!(sent, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_targeted_and_list_delivery() {
        let (mut manager, _rx) = start(test_config()).await;
        let mut a = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;
        let mut b = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 2).await;

        let handle = manager.handle();
        handle.send_to(2, &b"for b"[..]).unwrap();
        handle
            .put_message(OutboundMessage::to_sessions(vec![1, 2, 99], &b"both"[..]))
            .unwrap();
        manager.run_pass().await.unwrap();

        assert_eq!(read_frames(&mut a, 1).await, vec![b"both".to_vec()]);
        assert_eq!(read_frames(&mut b, 2).await, vec![b"for b".to_vec(), b"both".to_vec()]);
    }

    #[tokio::test]
    async fn test_concurrent_producers_delivered_exactly_once() {
        const PRODUCERS: u8 = 4;
        const PER_PRODUCER: u8 = 50;

        let (mut manager, _rx) = start(test_config()).await;
        let mut client = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let handle = manager.handle();
                std::thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        handle
                            .put_message(OutboundMessage {
                                payload: vec![p, seq].into(),
                                target: Target::Session(1),
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let total = PRODUCERS as u64 * PER_PRODUCER as u64;
        pump_until(&mut manager, |m| {
            m.handle().session_snapshot(1).unwrap().stats.messages_sent == total
        })
        .await;

        let frames = read_frames(&mut client, total as usize).await;
        let mut per_producer = vec![Vec::new(); PRODUCERS as usize];
        for f in frames {
            per_producer[f[0] as usize].push(f[1]);
        }
        for seqs in per_producer {
            assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_modify_field_from_other_thread() {
        let (mut manager, _rx) = start(test_config()).await;
        let _client = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        let handle = manager.handle();
        let observed = std::thread::spawn(move || {
            handle.modify_session_field(1, SessionField::Status, "v").unwrap();
            handle.session_snapshot(1).unwrap()
        })
        .join()
        .unwrap();
        assert_eq!(observed.field(SessionField::Status), Some("v"));

        // The loop's own bookkeeping does not clobber the field.
        manager.run_pass().await.unwrap();
        let snap = manager.handle().session_snapshot(1).unwrap();
        assert_eq!(snap.field(SessionField::Status), Some("v"));
    }

    #[tokio::test]
    async fn test_slow_reader_killed_others_still_served() {
        let config = ServerConfig {
            max_send_backlog: 64 * 1024,
            ..test_config()
        };
        let (mut manager, mut rx) = start(config).await;
        let mut reader = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;
        let _stalled = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 2).await;

        let handle = manager.handle();
        for _ in 0..400 {
            handle.send_to(2, vec![0xAB; 60_000]).unwrap();
        }
        handle.send_to(1, &b"ok"[..]).unwrap();

        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        assert_eq!(read_frames(&mut reader, 1).await, vec![b"ok".to_vec()]);
        assert!(handle.session_snapshot(2).is_err());
        assert!(handle.session_snapshot(1).is_ok());

        let mut events = Vec::new();
        collect(&mut rx, &mut events);
        assert!(events.contains(&WorldEvent::Disconnected(2)));
        assert!(!events.contains(&WorldEvent::Disconnected(1)));
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_write_to_reset_peer_kills_only_that_session() {
        let (mut manager, _rx) = start(test_config()).await;
        let mut a = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;
        let b = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 2).await;

        // Abortive close: the server side sees a reset, not a FIN.
        b.set_linger(Some(Duration::ZERO)).unwrap();
        drop(b);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Drive the outbound phase directly so the write, not a read,
        // discovers the reset.
        let handle = manager.handle();
        handle.broadcast(&b"still here"[..]).unwrap();
        manager.drain_outbound();
        assert!(manager.registry.is_marked_dead(2));
        assert!(!manager.registry.is_marked_dead(1));

        manager.purge();
        assert_eq!(handle.session_count(), 1);
        assert_eq!(read_frames(&mut a, 1).await, vec![b"still here".to_vec()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_descriptor_exhaustion_is_not_fatal() {
        let (mut manager, _rx) = start(test_config()).await;

        for code in [libc::EMFILE, libc::ENFILE] {
            let accepted = manager.check_accept(Err(io::Error::from_raw_os_error(code)));
            assert!(matches!(accepted, Ok(None)));
        }
        let broken = manager.check_accept(Err(io::Error::new(io::ErrorKind::InvalidInput, "bad")));
        assert!(matches!(broken, Err(NetworkError::Listener(_))));

        // The listener keeps serving afterwards.
        let _client = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let (mut manager, _rx) = start(config).await;
        let _first = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        let mut second = connect(&manager).await;
        for _ in 0..5 {
            manager.run_pass().await.unwrap();
        }
        assert_eq!(manager.handle().session_count(), 1);
        assert_closed(&mut second).await;
    }

    #[tokio::test]
    async fn test_oversized_outbound_dropped() {
        let config = ServerConfig {
            max_message_size: 8,
            ..test_config()
        };
        let (mut manager, _rx) = start(config).await;
        let mut client = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        let handle = manager.handle();
        handle.broadcast(vec![0u8; 9]).unwrap();
        handle.broadcast(&b"small"[..]).unwrap();
        manager.run_pass().await.unwrap();

        assert_eq!(read_frames(&mut client, 1).await, vec![b"small".to_vec()]);
        assert_eq!(handle.session_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_session_reaped() {
        let config = ServerConfig {
            idle_timeout_secs: 1,
            ..test_config()
        };
        let (mut manager, _rx) = start(config).await;
        let _client = connect(&manager).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 1).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        pump_until(&mut manager, |m| m.handle().session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_cancel_stops_loop_and_rejects_puts() {
        let (manager, _rx) = start(test_config()).await;
        let mut client = connect(&manager).await;
        let handle = manager.handle();

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(2), manager.run())
            .await
            .expect("loop should stop after one pass")
            .unwrap();

        assert!(handle.is_canceled());
        assert_eq!(handle.session_count(), 0);
        assert!(matches!(
            handle.broadcast(&b"late"[..]),
            Err(NetworkError::ShuttingDown)
        ));
        assert_closed(&mut client).await;
    }

    #[test]
    fn test_spawn_end_to_end() {
        let (tx, mut rx) = world_channel();
        let server = spawn(test_config(), tx).unwrap();
        let handle = server.handle();
        let addr = server.local_addr();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&frame(b"hello")).await.unwrap();

            let mut got = None;
            while got.is_none() {
                match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                    Ok(Some(WorldEvent::Message(m))) => got = Some(m),
                    Ok(Some(_)) => {}
                    other => panic!("world channel stalled: {other:?}"),
                }
            }
            let msg = got.unwrap();
            assert_eq!(msg.payload, b"hello".to_vec());

            handle.send_to(msg.session_id, &b"welcome"[..]).unwrap();
            assert_eq!(read_frames(&mut client, 1).await, vec![b"welcome".to_vec()]);
        });

        server.shutdown().unwrap();
        assert!(handle.broadcast(&b"after"[..]).is_err());
    }

    #[test]
    fn test_spawn_reports_bind_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            bind_addr: taken.local_addr().unwrap(),
            ..test_config()
        };
        let (tx, _rx) = world_channel();
        assert!(matches!(spawn(config, tx), Err(NetworkError::Bind { .. })));
    }
}
