fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use astropi_protocol::{
        Command, ConfigValue, DecodeResult, Event, Framing, LogLevel, SessionState, decode_frame,
        encode_frame,
    };
    use bytes::BytesMut;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// The board emits `2.0` where a Rust `f64` is involved and `2` for
    /// integers, and a controller may send either for the same parameter.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    serde_json::json!(f)
                } else {
                    v.clone()
                }
            }
            serde_json::Value::Object(map) => {
                let normalized: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect();
                serde_json::Value::Object(normalized)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  Rust: {reserialized}"
        );
        parsed
    }

    // --- Controller -> Board ---

    #[test]
    fn fixture_command_connect() {
        let cmd = roundtrip_test::<Command>("command_connect.json");
        assert_eq!(cmd, Command::Connect);
    }

    #[test]
    fn fixture_command_set() {
        let cmd = roundtrip_test::<Command>("command_set.json");
        assert_eq!(
            cmd,
            Command::Set {
                key: "ExposureTime".into(),
                value: ConfigValue::Int(2_000_000),
            }
        );
    }

    #[test]
    fn fixture_command_setall() {
        let Command::SetAll { config } = roundtrip_test::<Command>("command_setall.json") else {
            panic!("expected setall");
        };
        assert_eq!(config.len(), 7);
        assert_eq!(config["AnalogueGain"], ConfigValue::Float(1.5));
        assert_eq!(config["AwbEnable"], ConfigValue::Bool(true));
        assert_eq!(config["label"], ConfigValue::Text("m42".into()));
        assert!(matches!(&config["ScalerCrop"], ConfigValue::Tuple(v) if v.len() == 4));
    }

    #[test]
    fn fixture_command_get() {
        roundtrip_test::<Command>("command_get.json");
    }

    #[test]
    fn fixture_command_system() {
        roundtrip_test::<Command>("command_system.json");
    }

    #[test]
    fn fixture_command_abort() {
        let cmd = roundtrip_test::<Command>("command_abort.json");
        assert_eq!(cmd, Command::Abort);
    }

    // --- Board -> Controller ---

    #[test]
    fn fixture_event_log() {
        let evt = roundtrip_test::<Event>("event_log.json");
        assert_eq!(evt, Event::info("Captured frame 2/3"));
    }

    #[test]
    fn fixture_event_connection() {
        let evt = roundtrip_test::<Event>("event_connection.json");
        assert_eq!(evt, Event::conn_ack());
    }

    #[test]
    fn fixture_event_camdetails() {
        let Event::CamDetails { data } = roundtrip_test::<Event>("event_camdetails.json") else {
            panic!("expected camdetails");
        };
        assert_eq!(data.resolution, (4056, 3040));
        assert_eq!(data.controls.len(), 4);
    }

    #[test]
    fn fixture_event_status_capturing() {
        let Event::Status { data } = roundtrip_test::<Event>("event_status_capturing.json") else {
            panic!("expected status");
        };
        assert_eq!(data.state, SessionState::Capturing { frame: 1, total: 3 });
        assert_eq!(data.eta_us, 2000);
    }

    #[test]
    fn fixture_event_status_idle() {
        let Event::Status { data } = roundtrip_test::<Event>("event_status_idle.json") else {
            panic!("expected status");
        };
        assert!(data.state.is_idle());
        assert!(data.session.is_empty());
    }

    #[test]
    fn fixture_event_value() {
        roundtrip_test::<Event>("event_value.json");
    }

    #[test]
    fn fixture_event_config() {
        roundtrip_test::<Event>("event_config.json");
    }

    #[test]
    fn fixture_event_done() {
        roundtrip_test::<Event>("event_done.json");
    }

    // --- Tolerated variants ---

    #[test]
    fn legacy_warn_level() {
        let evt: Event =
            serde_json::from_str(r#"{"type": "log", "data": "disk low", "level": "warn"}"#)
                .unwrap();
        assert_eq!(evt, Event::log(LogLevel::Warning, "disk low"));
    }

    #[test]
    fn done_without_exit_code() {
        let evt: Event =
            serde_json::from_str(r#"{"type": "done", "data": {"kind": "update", "success": true}}"#)
                .unwrap();
        let Event::Done { data } = evt else {
            panic!("expected done");
        };
        assert!(data.success);
        assert_eq!(data.code, None);
    }

    // --- Framing ---

    #[test]
    fn length_prefixed_frame_bytes() {
        let mut buf = BytesMut::new();
        encode_frame(Framing::LengthPrefixed, &Command::Start, &mut buf).unwrap();

        let body = br#"{"command":"start"}"#;
        assert_eq!(&buf[..8], &(body.len() as u64).to_be_bytes());
        assert_eq!(&buf[8..], body);

        match decode_frame::<Command>(Framing::LengthPrefixed, &buf).unwrap() {
            DecodeResult::Complete { message, consumed } => {
                assert_eq!(message, Command::Start);
                assert_eq!(consumed, 8 + body.len());
            }
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn newline_frame_bytes() {
        let mut buf = BytesMut::new();
        encode_frame(Framing::Newline, &Event::conn_ack(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"type\":\"connection\",\"data\":\"connected\"}\n");
    }
}
