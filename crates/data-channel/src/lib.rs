//! TCP file transfer channel.
//!
//! A dedicated TCP connection carries captured images from the Board Agent
//! to the Controller so bulk data never blocks the Command Channel. The
//! board listens and sends; the controller connects and receives.
//!
//! # Wire format
//!
//! See [`wire`] module for the binary frame layout.

pub mod error;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod wire;

pub use error::DataChannelError;
pub use queue::{QueueError, TransferItem, TransferQueue};
pub use receiver::{ReceivedFile, TransferReceiver};
pub use sender::TransferSender;

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest file accepted in a single frame (4 GiB).
pub const MAX_TRANSFER_LEN: u64 = 4 * 1024 * 1024 * 1024;

/// A single write may block at most this long before the item is failed.
pub const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `enqueue` waits for a free slot before reporting overflow.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of items the transfer queue holds.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
