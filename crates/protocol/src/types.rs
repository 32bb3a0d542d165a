use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A config parameter value.
///
/// Serialized as the bare JSON scalar or array, so `{"key": 1000}` and
/// `{"key": [0, 0, 640, 480]}` are both legal. `null` and objects are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Tuple(Vec<serde_json::Number>),
}

/// Type of a [`ConfigValue`], as declared by a camera control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    String,
    Tuple,
}

/// Mapping of parameter names to values.
pub type Config = BTreeMap<String, ConfigValue>;

impl ConfigValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::String,
            Self::Tuple(_) => ValueKind::Tuple,
        }
    }

    /// Returns `true` if this value is acceptable for a control of `kind`.
    ///
    /// Integers widen to floats; nothing else is coerced.
    pub fn conforms_to(&self, kind: ValueKind) -> bool {
        self.kind() == kind || (kind == ValueKind::Float && matches!(self, Self::Int(_)))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Parses a value typed by an operator (`1000`, `2.5`, `true`,
    /// `[0,0,640,480]`). Anything that is not a legal JSON value becomes
    /// a string.
    pub fn parse_literal(input: &str) -> Self {
        let trimmed = input.trim();
        serde_json::from_str(trimmed).unwrap_or_else(|_| Self::Text(trimmed.to_string()))
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Tuple(v) => {
                let parts: Vec<String> = v.iter().map(|n| n.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Severity attached to `log` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Log,
    #[serde(alias = "warn")]
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Log => "log",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Imaging session lifecycle, owned by the Board Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Configuring,
    Capturing { frame: u32, total: u32 },
    Transferring,
    Aborting,
    Faulted,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Capturing { .. } => "capturing",
            Self::Transferring => "transferring",
            Self::Aborting => "aborting",
            Self::Faulted => "faulted",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capturing { frame, total } => write!(f, "capturing {}/{}", frame + 1, total),
            other => f.write_str(other.name()),
        }
    }
}

/// Snapshot of the board's session, pushed on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(flatten)]
    pub state: SessionState,
    /// Remaining ETA in microseconds.
    pub eta_us: u64,
    /// Transfer items not yet delivered.
    pub queued: usize,
    /// Session id, empty before the first session.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session: String,
}

/// Description of the camera attached to the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamDetails {
    pub model: String,
    pub board: String,
    pub resolution: (u32, u32),
    #[serde(default)]
    pub controls: BTreeMap<String, ValueKind>,
}

/// Which of the two TCP connections a socket carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Command,
    FileTransfer,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str("command"),
            Self::FileTransfer => f.write_str("file-transfer"),
        }
    }
}

/// Maintenance action run on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemKind {
    Pull,
    Update,
}

impl fmt::Display for SystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pull => f.write_str("pull"),
            Self::Update => f.write_str("update"),
        }
    }
}

/// Terminal report of a maintenance action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDone {
    pub kind: SystemKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}
