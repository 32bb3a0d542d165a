//! Board agent configuration.
//!
//! Stored as TOML, by default at `~/.config/astropi/board-agent.toml`.
//! A missing file is created with defaults.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use astropi_board::system::{DEFAULT_PULL_COMMAND, DEFAULT_UPDATE_COMMAND};
use astropi_data_channel::DEFAULT_QUEUE_CAPACITY;
use astropi_protocol::constants::{DEFAULT_COMMAND_PORT, DEFAULT_TRANSFER_PORT};
use astropi_protocol::{Config as Settings, Framing};
use serde::{Deserialize, Serialize};

/// Board agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name reported to the controller (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Address both channels listen on.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    #[serde(default = "default_command_port")]
    pub command_port: u16,

    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,

    #[serde(default)]
    pub framing: Framing,

    /// Where captures wait until they are sent.
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,

    /// Captures that may wait for transfer before capturing blocks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_pull_command")]
    pub pull_command: String,

    #[serde(default = "default_update_command")]
    pub update_command: String,

    #[serde(default)]
    pub camera: CameraConfig,

    /// Initial session and camera settings.
    #[serde(default)]
    pub settings: Settings,
}

/// Simulated camera parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Size of each synthetic frame.
    #[serde(default = "default_frame_bytes")]
    pub frame_bytes: usize,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "AstroPi".into())
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_command_port() -> u16 {
    DEFAULT_COMMAND_PORT
}

fn default_transfer_port() -> u16 {
    DEFAULT_TRANSFER_PORT
}

fn default_capture_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join("astropi").join("captures")
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_pull_command() -> String {
    DEFAULT_PULL_COMMAND.into()
}

fn default_update_command() -> String {
    DEFAULT_UPDATE_COMMAND.into()
}

fn default_model() -> String {
    "simulated".into()
}

fn default_width() -> u32 {
    4056
}

fn default_height() -> u32 {
    3040
}

fn default_frame_bytes() -> usize {
    1024 * 1024
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            width: default_width(),
            height: default_height(),
            frame_bytes: default_frame_bytes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind: default_bind(),
            command_port: default_command_port(),
            transfer_port: default_transfer_port(),
            framing: Framing::default(),
            capture_dir: default_capture_dir(),
            queue_capacity: default_queue_capacity(),
            pull_command: default_pull_command(),
            update_command: default_update_command(),
            camera: CameraConfig::default(),
            settings: Settings::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or creates a default file there if
    /// it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the default configuration file path.
pub fn default_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("astropi")
        .join("board-agent.toml")
}
