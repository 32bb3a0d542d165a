//! End-to-end scenarios: a real board agent on loopback driven by a
//! `ControllerSession`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use astropi_agent_server::{AgentServer, ServerConfig};
use astropi_board::{
    BoardHandler, CameraDevice, CameraStats, ImagingSession, Outbox, ShellRunner, SimulatedCamera,
    shared,
};
use astropi_config_store::ConfigStore;
use astropi_controller::{
    ClientError, ConnectionState, ControllerConfig, ControllerEvent, ControllerSession,
};
use astropi_data_channel::{TransferQueue, TransferSender};
use astropi_protocol::{
    ChannelRole, Command, ConfigValue, Event, Framing, Inbound, LogLevel, MessageCodec,
    SessionState, SystemKind,
};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const FRAME_BYTES: usize = 2048;

struct Board {
    command: SocketAddr,
    transfer: SocketAddr,
    server: Arc<AgentServer<BoardHandler>>,
    stats: Arc<CameraStats>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for Board {
    fn drop(&mut self) {
        self.server.shutdown();
        self.cancel.cancel();
    }
}

async fn board() -> Board {
    let dir = tempfile::tempdir().unwrap();
    let camera = SimulatedCamera::new(dir.path().join("captures")).with_frame_bytes(FRAME_BYTES);
    let stats = camera.stats();
    let details = camera.details();

    let store = ConfigStore::new();
    let queue = TransferQueue::new(64);
    let outbox = Outbox::new();
    let session = ImagingSession::new(store.clone(), shared(camera), queue.clone(), outbox.clone());
    let transfer = TransferSender::new(queue);
    let handler = BoardHandler::new(
        store,
        session,
        details,
        Arc::new(ShellRunner::new("echo pulled", "echo failing >&2; exit 1")),
        outbox,
        transfer.clone(),
    );

    let server = AgentServer::new(
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            framing: Framing::LengthPrefixed,
        },
        Arc::new(handler),
    );
    let command_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let transfer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let command = command_listener.local_addr().unwrap();
    let transfer_addr = transfer_listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let s = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = s.serve(command_listener).await;
    });
    let c = cancel.clone();
    tokio::spawn(async move {
        let _ = transfer.run(transfer_listener, c).await;
    });

    Board {
        command,
        transfer: transfer_addr,
        server,
        stats,
        cancel,
        _dir: dir,
    }
}

fn controller(board: &Board, download: &std::path::Path) -> ControllerSession {
    let config = ControllerConfig {
        host: board.command.ip().to_string(),
        command_port: board.command.port(),
        transfer_port: board.transfer.port(),
        framing: Framing::LengthPrefixed,
        download_dir: download.to_path_buf(),
    };
    ControllerSession::new(config, ConfigStore::new())
}

async fn next_event(events: &mut UnboundedReceiver<ControllerEvent>) -> ControllerEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for controller event")
        .expect("event stream ended")
}

/// Collects events until `done` returns true for the events seen so far.
async fn collect_until(
    events: &mut UnboundedReceiver<ControllerEvent>,
    mut done: impl FnMut(&[ControllerEvent]) -> bool,
) -> Vec<ControllerEvent> {
    let mut seen = Vec::new();
    while !done(&seen) {
        seen.push(next_event(events).await);
    }
    seen
}

fn files(events: &[ControllerEvent]) -> Vec<(u64, std::path::PathBuf, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::FileReceived { index, path, bytes } => {
                Some((*index, path.clone(), *bytes))
            }
            _ => None,
        })
        .collect()
}

fn returned_to_idle(events: &[ControllerEvent]) -> bool {
    let mut ran = false;
    for event in events {
        if let ControllerEvent::Status { state, .. } = event {
            match state {
                SessionState::Transferring => ran = true,
                SessionState::Idle if ran => return true,
                _ => {}
            }
        }
    }
    false
}

fn has_log(events: &[ControllerEvent], needle: &str) -> bool {
    events
        .iter()
        .any(|e| matches!(e, ControllerEvent::Log { text, .. } if text.contains(needle)))
}

fn session_keys(session: &ControllerSession, frames: i64, exposure_us: i64, interval_us: i64) {
    let store = session.store();
    store.set("image_count", ConfigValue::Int(frames));
    store.set("ExposureTime", ConfigValue::Int(exposure_us));
    store.set("interval", ConfigValue::Int(interval_us));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_three_frames() {
    let board = board().await;
    let download = tempfile::tempdir().unwrap();
    let session = controller(&board, download.path());
    let mut events = session.take_events().unwrap();

    session_keys(&session, 3, 1000, 0);
    session.connect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.peer(ChannelRole::Command).await, Some(board.command));
    assert!(session.peer(ChannelRole::FileTransfer).await.is_some());

    let hello = collect_until(&mut events, |seen| {
        seen.iter().any(|e| matches!(e, ControllerEvent::CamDetails(_)))
    })
    .await;
    assert!(has_log(&hello, "Hello World from the AstroPi!"));

    session.start().await.unwrap();
    let seen = collect_until(&mut events, |seen| {
        files(seen).len() == 3 && returned_to_idle(seen)
    })
    .await;

    let received = files(&seen);
    for (i, (index, path, bytes)) in received.iter().enumerate() {
        assert_eq!(*index, i as u64);
        assert_eq!(*bytes, FRAME_BYTES as u64);
        assert_eq!(path.extension().unwrap(), "dng");
        assert_eq!(std::fs::metadata(path).unwrap().len(), FRAME_BYTES as u64);
    }
    assert!(has_log(&seen, "Captured frame 3/3"));
    assert_eq!(board.stats.captures.load(Ordering::SeqCst), 3);
    assert!(board.stats.balanced());

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(session.peer(ChannelRole::Command).await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_after_third_frame() {
    let board = board().await;
    let download = tempfile::tempdir().unwrap();
    let session = controller(&board, download.path());
    let mut events = session.take_events().unwrap();

    session_keys(&session, 10, 1000, 100_000);
    session.connect().await.unwrap();
    session.start().await.unwrap();

    collect_until(&mut events, |seen| has_log(seen, "Captured frame 3/10")).await;
    session.abort().await.unwrap();

    let seen = collect_until(&mut events, |seen| {
        returned_to_idle(seen) && has_log(seen, "aborted")
    })
    .await;
    assert!(has_log(&seen, "Abort requested"));

    let captured = board.stats.captures.load(Ordering::SeqCst);
    assert!((3..=4).contains(&captured), "captured {captured}");
    assert!(board.stats.balanced());

    // Every captured frame still reaches the controller.
    let mut received = seen;
    while files(&received).len() < captured {
        received.push(next_event(&mut events).await);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_when_idle_is_a_noop() {
    let board = board().await;
    let download = tempfile::tempdir().unwrap();
    let session = controller(&board, download.path());
    let mut events = session.take_events().unwrap();

    session.connect().await.unwrap();
    session.abort().await.unwrap();
    collect_until(&mut events, |seen| has_log(seen, "Nothing to abort")).await;
    assert_eq!(session.board_state(), SessionState::Idle);
    assert_eq!(board.stats.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn eta_never_increases_while_running() {
    let board = board().await;
    let download = tempfile::tempdir().unwrap();
    let session = controller(&board, download.path());
    let mut events = session.take_events().unwrap();

    session_keys(&session, 5, 20_000, 20_000);
    assert_eq!(session.eta(), Duration::from_micros(5 * 20_000 + 4 * 20_000));
    session.connect().await.unwrap();
    session.start().await.unwrap();

    let running = |s: SessionState| {
        matches!(
            s,
            SessionState::Configuring | SessionState::Capturing { .. } | SessionState::Aborting
        )
    };
    let mut samples = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let before = session.board_state();
        let eta = session.eta();
        let after = session.board_state();
        if running(before) && running(after) {
            samples.push(eta);
        }
        if !samples.is_empty() && !running(after) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "session never finished");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(samples.windows(2).all(|w| w[1] <= w[0]), "{samples:?}");

    collect_until(&mut events, returned_to_idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_and_get_stay_in_sync() {
    let board = board().await;
    let download = tempfile::tempdir().unwrap();
    let session = controller(&board, download.path());
    let mut events = session.take_events().unwrap();

    session.store().set("label", ConfigValue::Text("M42".into()));
    session.connect().await.unwrap();

    // Pushed on connect.
    assert_eq!(
        session.get("label").await.unwrap(),
        ConfigValue::Text("M42".into())
    );

    session
        .set("AnalogueGain", ConfigValue::Float(2.5))
        .await
        .unwrap();
    assert_eq!(
        session.get("AnalogueGain").await.unwrap(),
        ConfigValue::Float(2.5)
    );

    // Wrong kind for a camera control: rejected by the board, kept locally.
    session
        .set("AeEnable", ConfigValue::Int(7))
        .await
        .unwrap();
    collect_until(&mut events, |seen| {
        seen.iter().any(|e| {
            matches!(e, ControllerEvent::Log { level: LogLevel::Error, text, .. } if text.contains("AeEnable"))
        })
    })
    .await;

    let all = session.get_all().await.unwrap();
    assert_eq!(all.get("AnalogueGain"), Some(&ConfigValue::Float(2.5)));
    assert!(!all.contains_key("AeEnable"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn system_commands_report_done() {
    let board = board().await;
    let download = tempfile::tempdir().unwrap();
    let session = controller(&board, download.path());
    let mut events = session.take_events().unwrap();
    session.connect().await.unwrap();

    session.system(SystemKind::Pull).await.unwrap();
    let seen = collect_until(&mut events, |seen| {
        seen.iter().any(|e| matches!(e, ControllerEvent::SystemDone(_)))
    })
    .await;
    assert!(has_log(&seen, "pulled"));
    let done = seen
        .iter()
        .find_map(|e| match e {
            ControllerEvent::SystemDone(done) => Some(done.clone()),
            _ => None,
        })
        .unwrap();
    assert!(done.success);

    session.system(SystemKind::Update).await.unwrap();
    let seen = collect_until(&mut events, |seen| {
        seen.iter().any(|e| matches!(e, ControllerEvent::SystemDone(_)))
    })
    .await;
    assert!(seen.iter().any(|e| matches!(
        e,
        ControllerEvent::SystemDone(done) if !done.success && done.code == Some(1)
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preview_delivers_one_file() {
    let board = board().await;
    let download = tempfile::tempdir().unwrap();
    let session = controller(&board, download.path());
    let mut events = session.take_events().unwrap();
    session.connect().await.unwrap();

    session.preview().await.unwrap();
    let seen = collect_until(&mut events, |seen| files(seen).len() == 1).await;
    assert_eq!(files(&seen)[0].2, FRAME_BYTES as u64);
    assert!(board.stats.balanced());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_frames_do_not_close_the_channel() {
    let board = board().await;
    let mut stream = TcpStream::connect(board.command).await.unwrap();

    // A well-delimited frame that is not JSON.
    let junk = b"{not json";
    stream.write_all(&(junk.len() as u64).to_be_bytes()).await.unwrap();
    stream.write_all(junk).await.unwrap();

    let mut framed = Framed::new(stream, MessageCodec::<Event, Command>::default());
    framed
        .send(Command::Get {
            key: "missing".into(),
        })
        .await
        .unwrap();

    // An unknown command gets an error reply.
    let unknown = br#"{"command":"selfDestruct"}"#;
    framed
        .get_mut()
        .write_all(&(unknown.len() as u64).to_be_bytes())
        .await
        .unwrap();
    framed.get_mut().write_all(unknown).await.unwrap();

    framed.send(Command::GetAll).await.unwrap();

    let mut errors = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match event {
            Inbound::Message(Event::Log {
                level: LogLevel::Error,
                ..
            }) => errors += 1,
            Inbound::Message(Event::Config { .. }) => break,
            _ => {}
        }
    }
    assert_eq!(errors, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn board_going_away_disconnects() {
    let board = board().await;
    let download = tempfile::tempdir().unwrap();
    let session = controller(&board, download.path());
    let mut events = session.take_events().unwrap();
    session.connect().await.unwrap();

    board.server.disconnect_controller().await;
    collect_until(&mut events, |seen| {
        seen.contains(&ControllerEvent::StateChanged(ConnectionState::Disconnected))
    })
    .await;
    assert!(matches!(session.abort().await, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn refused_connection_reports_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let download = tempfile::tempdir().unwrap();
    let session = ControllerSession::new(
        ControllerConfig {
            host: addr.ip().to_string(),
            command_port: addr.port(),
            transfer_port: addr.port(),
            framing: Framing::LengthPrefixed,
            download_dir: download.path().to_path_buf(),
        },
        ConfigStore::new(),
    );
    let mut events = session.take_events().unwrap();

    assert!(session.connect().await.is_err());
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(
        events.recv().await,
        Some(ControllerEvent::StateChanged(ConnectionState::Connecting))
    );
    assert_eq!(
        events.recv().await,
        Some(ControllerEvent::StateChanged(ConnectionState::Disconnected))
    );
}
