use serde::{Deserialize, Serialize};

use crate::types::{
    CamDetails, Config, ConfigValue, LogLevel, StatusUpdate, SystemDone, SystemKind,
};

// ---------------------------------------------------------------------------
// Controller -> Board
// ---------------------------------------------------------------------------

/// A request sent by the Controller on the Command Channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "set")]
    Set { key: String, value: ConfigValue },
    #[serde(rename = "setall")]
    SetAll { config: Config },
    #[serde(rename = "get")]
    Get { key: String },
    #[serde(rename = "getall")]
    GetAll,
    #[serde(rename = "system")]
    System {
        #[serde(rename = "type")]
        kind: SystemKind,
    },
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "abortSession")]
    Abort,
    #[serde(rename = "preview")]
    Preview,
    #[serde(rename = "disconnect")]
    Disconnect,
}

impl Command {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Set { .. } => "set",
            Self::SetAll { .. } => "setall",
            Self::Get { .. } => "get",
            Self::GetAll => "getall",
            Self::System { .. } => "system",
            Self::Start => "start",
            Self::Abort => "abortSession",
            Self::Preview => "preview",
            Self::Disconnect => "disconnect",
        }
    }
}

// ---------------------------------------------------------------------------
// Board -> Controller
// ---------------------------------------------------------------------------

/// Payload of the handshake acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
}

/// A notification or reply sent by the Board Agent on the Command Channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Fire-and-forget log line.
    #[serde(rename = "log")]
    Log { data: String, level: LogLevel },
    /// Handshake acknowledgement.
    #[serde(rename = "connection")]
    Connection { data: ConnectionStatus },
    #[serde(rename = "camdetails")]
    CamDetails { data: CamDetails },
    #[serde(rename = "status")]
    Status { data: StatusUpdate },
    /// Reply to `get`.
    #[serde(rename = "value")]
    Value { key: String, value: ConfigValue },
    /// Reply to `getall`.
    #[serde(rename = "config")]
    Config { config: Config },
    /// Terminal message of a `system` command.
    #[serde(rename = "done")]
    Done { data: SystemDone },
}

impl Event {
    pub fn log(level: LogLevel, text: impl Into<String>) -> Self {
        Self::Log {
            data: text.into(),
            level,
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::log(LogLevel::Info, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::log(LogLevel::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::log(LogLevel::Error, text)
    }

    pub fn conn_ack() -> Self {
        Self::Connection {
            data: ConnectionStatus::Connected,
        }
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Connection { .. } => "connection",
            Self::CamDetails { .. } => "camdetails",
            Self::Status { .. } => "status",
            Self::Value { .. } => "value",
            Self::Config { .. } => "config",
            Self::Done { .. } => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionState;
    use serde_json::json;

    #[test]
    fn unit_commands_have_only_tag() {
        assert_eq!(
            serde_json::to_value(Command::Connect).unwrap(),
            json!({"command": "connect"})
        );
        assert_eq!(
            serde_json::to_value(Command::Abort).unwrap(),
            json!({"command": "abortSession"})
        );
    }

    #[test]
    fn set_command_shape() {
        let cmd = Command::Set {
            key: "ExposureTime".into(),
            value: ConfigValue::Int(1000),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"command": "set", "key": "ExposureTime", "value": 1000})
        );
    }

    #[test]
    fn system_command_uses_type_field() {
        let cmd: Command = serde_json::from_value(json!({"command": "system", "type": "pull"}))
            .unwrap();
        assert_eq!(
            cmd,
            Command::System {
                kind: SystemKind::Pull
            }
        );
    }

    #[test]
    fn setall_parses_mixed_values() {
        let cmd: Command = serde_json::from_value(json!({
            "command": "setall",
            "config": {"image_count": 3, "Sharpness": 1.0, "AwbEnable": true, "ScalerCrop": [0, 0, 0, 0]}
        }))
        .unwrap();
        let Command::SetAll { config } = cmd else {
            panic!("expected setall");
        };
        assert_eq!(config["image_count"], ConfigValue::Int(3));
        assert_eq!(config["Sharpness"], ConfigValue::Float(1.0));
        assert_eq!(config["AwbEnable"], ConfigValue::Bool(true));
        assert_eq!(config["ScalerCrop"].kind(), crate::ValueKind::Tuple);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let result = serde_json::from_value::<Command>(json!({"command": "selfDestruct"}));
        assert!(result.is_err());
    }

    #[test]
    fn log_event_shape() {
        let evt = Event::info("hello");
        assert_eq!(
            serde_json::to_value(&evt).unwrap(),
            json!({"type": "log", "data": "hello", "level": "info"})
        );
    }

    #[test]
    fn conn_ack_shape() {
        assert_eq!(
            serde_json::to_value(Event::conn_ack()).unwrap(),
            json!({"type": "connection", "data": "connected"})
        );
    }

    #[test]
    fn status_event_roundtrip() {
        let evt = Event::Status {
            data: StatusUpdate {
                state: SessionState::Transferring,
                eta_us: 0,
                queued: 2,
                session: "abc".into(),
            },
        };
        let json = serde_json::to_string(&evt).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, evt);
    }

    #[test]
    fn names_match_wire_tags() {
        let cmd = Command::Get { key: "k".into() };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command"], cmd.name());

        let evt = Event::Done {
            data: SystemDone {
                kind: SystemKind::Update,
                success: true,
                code: Some(0),
            },
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], evt.name());
    }
}
