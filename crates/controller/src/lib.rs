//! AstroPi Controller.
//!
//! Connects to a Board Agent over the Command Channel, receives captures on
//! the File Transfer Channel and exposes both through [`ControllerSession`].

pub mod client;
pub mod eta;
mod pumps;
pub mod session;
pub mod types;

pub use client::CommandClient;
pub use eta::EtaCountdown;
pub use session::ControllerSession;
pub use types::{ClientError, ConnectionState, ControllerConfig, ControllerEvent};
