//! Error types for the data channel.

use std::time::Duration;

/// Errors produced by the TCP data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversized { len: u64, max: u64 },

    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("write stalled for more than {0:?}")]
    Stalled(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DataChannelError {
    /// Returns `true` if the error means the wire can no longer be trusted.
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::Oversized { .. } | Self::Truncated { .. })
    }
}
