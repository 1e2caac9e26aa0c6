//! Network Layer
//!
//! Session registry, message framing, the outbound queue and the
//! single-threaded I/O loop that ties them together.

pub mod framing;
pub mod outbound;
pub mod server;
pub mod session;
pub mod world;

pub use framing::{encode_frame, FrameError, Framer, DEFAULT_MAX_MESSAGE_SIZE};
pub use outbound::{OutboundMessage, OutboundQueue, Target};
pub use server::{spawn, NetHandle, NetworkError, NetworkManager, RunningServer};
pub use session::{Session, SessionError, SessionField, SessionId, SessionRegistry, SessionStats};
pub use world::{world_channel, InboundMessage, WorldEvent, WorldSink};
