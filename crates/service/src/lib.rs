//! Channel / Session / Sender / Authorization Table — the stateful core of
//! the board UDP-over-WebSocket proxy.
//!
//! This crate owns everything in the spec's "hard core": parsing and
//! dispatching the wire opcodes (`session`), multiplexing UDP sockets
//! (`channel`), serializing writes onto the one WebSocket a session owns
//! (`sender`), and the per-job board authorization lookup (`auth`). It knows
//! nothing about how a WebSocket was accepted, how a job's board list was
//! obtained, or how the process is configured — those are the embedding
//! binary's job.

pub mod auth;
pub mod channel;
pub mod error;
pub mod sender;
pub mod session;

pub use auth::{AuthorizationTable, BoardCoordinate};
pub use channel::{Channel, ChannelMode};
pub use error::{CloseReason, ProtocolError};
pub use sender::{BinarySink, SendError, WebSocketSender};
pub use session::{Session, SessionOptions};
