pub mod codec;
pub mod constants;
pub mod eta;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use codec::{
    DecodeResult, Framing, FramingError, Inbound, MalformedFrame, MalformedKind, MessageCodec,
    decode_frame, encode_frame,
};
pub use eta::{SessionTiming, TimingError};
pub use messages::{Command, ConnectionStatus, Event};
pub use types::{
    CamDetails, ChannelRole, Config, ConfigValue, LogLevel, SessionState, StatusUpdate,
    SystemDone, SystemKind, ValueKind,
};
