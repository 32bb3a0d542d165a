//! Controller configuration.
//!
//! Stored as TOML, by default at `~/.config/astropi/controller.toml`.

use std::path::{Path, PathBuf};

use astropi_controller::ControllerConfig;
use astropi_protocol::constants::{DEFAULT_COMMAND_PORT, DEFAULT_TRANSFER_PORT};
use astropi_protocol::{Config as Settings, Framing};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Board hostname or address.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_command_port")]
    pub command_port: u16,

    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,

    #[serde(default)]
    pub framing: Framing,

    /// Where received captures are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Session and camera settings pushed to the board on connect.
    #[serde(default)]
    pub settings: Settings,
}

fn default_host() -> String {
    ControllerConfig::default().host
}

fn default_command_port() -> u16 {
    DEFAULT_COMMAND_PORT
}

fn default_transfer_port() -> u16 {
    DEFAULT_TRANSFER_PORT
}

fn default_download_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join("astropi").join("downloads")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            command_port: default_command_port(),
            transfer_port: default_transfer_port(),
            framing: Framing::default(),
            download_dir: default_download_dir(),
            settings: Settings::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or returns defaults if the file
    /// does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Connection parameters for the controller session.
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            host: self.host.clone(),
            command_port: self.command_port,
            transfer_port: self.transfer_port,
            framing: self.framing,
            download_dir: self.download_dir.clone(),
        }
    }
}

pub fn default_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("astropi")
        .join("controller.toml")
}
