//! Command Channel server for the AstroPi Board Agent.
//!
//! Accepts a single Controller connection at a time over TCP, decodes
//! framed JSON commands, dispatches them to a [`Handler`] trait, and
//! manages the connection lifecycle (liveness polling, replacement of a
//! stale connection, graceful shutdown).

mod connection;
mod handler;
mod server;

pub use connection::{ControllerConnection, ControllerMeta, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{AgentServer, ServerConfig};

use astropi_protocol::FramingError;

/// Send buffer capacity.
///
/// A maintenance command can stream many output lines in a short burst; the
/// buffer absorbs them while the socket catches up.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the agent server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("server already running")]
    AlreadyRunning,
}
