use std::time::Duration;

/// Default TCP port of the Command Channel.
pub const DEFAULT_COMMAND_PORT: u16 = 2999;

/// Default TCP port of the File Transfer Channel.
pub const DEFAULT_TRANSFER_PORT: u16 = 3000;

/// Time allowed for the TCP connect of either channel.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Time allowed between sending `connect` and receiving the ack.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// How often blocked reads wake up to check liveness and cancellation.
pub const READ_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for request/response exchanges (`get`, `getall`).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single Command Channel frame (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Size of the big-endian length header in length-prefixed framing.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Sentinel terminating a frame in newline framing.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Number of frames to capture in a session.
pub const KEY_IMAGE_COUNT: &str = "image_count";

/// Exposure time per frame, microseconds.
pub const KEY_EXPOSURE_TIME: &str = "ExposureTime";

/// Inter-frame interval, microseconds.
pub const KEY_INTERVAL: &str = "interval";

/// Config keys consumed by the session itself rather than the camera.
pub const SESSION_KEYS: [&str; 3] = [KEY_IMAGE_COUNT, KEY_EXPOSURE_TIME, KEY_INTERVAL];

/// Returns `true` if changing `key` changes the session ETA.
pub fn affects_eta(key: &str) -> bool {
    SESSION_KEYS.contains(&key)
}
