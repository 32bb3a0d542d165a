//! Public types for the controller.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use astropi_config_store::ConfigError;
use astropi_data_channel::DataChannelError;
use astropi_protocol::constants::{DEFAULT_COMMAND_PORT, DEFAULT_TRANSFER_PORT};
use astropi_protocol::{
    CamDetails, Config, Framing, FramingError, LogLevel, SessionState, SystemDone, TimingError,
};
use chrono::{DateTime, Local};

/// Errors from the controller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("resolving {0} timed out")]
    ResolveTimeout(String),

    #[error("board did not acknowledge the connection")]
    HandshakeTimeout,

    #[error("request timed out")]
    RequestTimeout,

    #[error("connection closed")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] TimingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("file transfer: {0}")]
    Transfer(#[from] DataChannelError),
}

/// Command Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// TCP connect and handshake in progress.
    Connecting,
    /// Handshake acknowledged by the board.
    Connected,
}

/// Events surfaced to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StateChanged(ConnectionState),
    Log {
        timestamp: DateTime<Local>,
        level: LogLevel,
        text: String,
    },
    CamDetails(CamDetails),
    /// Session progress as reported by the board.
    Status {
        state: SessionState,
        frame: u32,
        total: u32,
        queued: usize,
        eta: Duration,
    },
    FileReceived {
        index: u64,
        path: PathBuf,
        bytes: u64,
    },
    /// The File Transfer Channel ended; `error` is `None` on a clean close.
    TransferClosed {
        error: Option<String>,
    },
    SystemDone(SystemDone),
    Config(Config),
}

/// Where the board lives and where captures go.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub host: String,
    pub command_port: u16,
    pub transfer_port: u16,
    pub framing: Framing,
    pub download_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "astropi.local".into(),
            command_port: DEFAULT_COMMAND_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            framing: Framing::default(),
            download_dir: PathBuf::from("captures"),
        }
    }
}
