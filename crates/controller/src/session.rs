//! Controller session: the UI-facing front end of a board connection.
//!
//! Owns the local config store, the Command Channel client and the File
//! Transfer receiver, and turns board events into [`ControllerEvent`]s.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use astropi_config_store::ConfigStore;
use astropi_data_channel::{DataChannelError, ReceivedFile, TransferReceiver};
use astropi_protocol::constants::CONNECT_TIMEOUT;
use astropi_protocol::{
    ChannelRole, Command, Config, ConfigValue, Event, SessionState, SessionTiming, StatusUpdate,
    SystemKind,
};

use crate::client::CommandClient;
use crate::eta::EtaCountdown;
use crate::types::{ClientError, ConnectionState, ControllerConfig, ControllerEvent};

struct BoardView {
    session: SessionState,
    eta: EtaCountdown,
}

/// State shared with the background tasks of a connection.
struct Shared {
    store: ConfigStore,
    events: mpsc::UnboundedSender<ControllerEvent>,
    state: watch::Sender<ConnectionState>,
    board: Mutex<BoardView>,
    next_file: AtomicU64,
}

/// One live connection.
struct Link {
    client: Arc<CommandClient>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    transfer: Option<(SocketAddr, JoinHandle<()>)>,
}

pub struct ControllerSession {
    config: ControllerConfig,
    shared: Arc<Shared>,
    link: tokio::sync::Mutex<Option<Link>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ControllerEvent>>>,
}

impl ControllerSession {
    pub fn new(config: ControllerConfig, store: ConfigStore) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            shared: Arc::new(Shared {
                store,
                events: events_tx,
                state,
                board: Mutex::new(BoardView {
                    session: SessionState::Idle,
                    eta: EtaCountdown::new(),
                }),
                next_file: AtomicU64::new(0),
            }),
            link: tokio::sync::Mutex::new(None),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ControllerEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The local settings, pushed to the board on connect and on start.
    pub fn store(&self) -> &ConfigStore {
        &self.shared.store
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Last session state reported by the board.
    pub fn board_state(&self) -> SessionState {
        self.shared.board().session
    }

    /// Time left in the running session, or the predicted duration of the
    /// next one while idle.
    pub fn eta(&self) -> Duration {
        let board = self.shared.board();
        if let Some(remaining) = board.eta.remaining() {
            return remaining;
        }
        match board.session {
            SessionState::Idle => SessionTiming::from_config(&self.shared.store.snapshot())
                .map(|timing| timing.remaining(0))
                .unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    /// Connects to the board, pushes the local settings and opens the File
    /// Transfer Channel. Replaces an existing connection.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut link = self.link.lock().await;
        if let Some(old) = link.take() {
            old.shutdown().await;
        }

        self.shared.set_state(ConnectionState::Connecting);
        match self.open().await {
            Ok(new) => {
                *link = Some(new);
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.config.host, "connect failed: {e}");
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<Link, ClientError> {
        let command_addr = resolve(&self.config.host, self.config.command_port).await?;
        let (client, events) = CommandClient::connect(command_addr, self.config.framing).await?;
        self.shared.set_state(ConnectionState::Connected);

        client
            .send(Command::SetAll {
                config: self.shared.store.snapshot(),
            })
            .await?;

        let cancel = CancellationToken::new();
        let transfer_addr = SocketAddr::new(command_addr.ip(), self.config.transfer_port);
        let transfer = self
            .open_transfer(transfer_addr, cancel.clone())
            .await
            .map(|task| (transfer_addr, task));

        let client = Arc::new(client);
        let dispatcher = tokio::spawn(Arc::clone(&self.shared).dispatch(
            Arc::clone(&client),
            events,
            cancel.clone(),
        ));

        info!(board = %command_addr, "connected");
        Ok(Link {
            client,
            cancel,
            dispatcher,
            transfer,
        })
    }

    async fn open_transfer(
        &self,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        match TransferReceiver::connect(addr).await {
            Ok(stream) => {
                let shared = Arc::clone(&self.shared);
                let dest = self.config.download_dir.clone();
                Some(tokio::spawn(async move {
                    shared.receive_files(stream, dest, cancel).await;
                }))
            }
            Err(e) => {
                warn!(role = %ChannelRole::FileTransfer, %addr, "channel unavailable: {e}");
                self.shared.emit(ControllerEvent::TransferClosed {
                    error: Some(e.to_string()),
                });
                None
            }
        }
    }

    /// Closes the connection. Local settings are kept.
    pub async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.shutdown().await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Peer address of `role`'s connection while it is open.
    pub async fn peer(&self, role: ChannelRole) -> Option<SocketAddr> {
        let link = self.link.lock().await;
        let link = link.as_ref()?;
        match role {
            ChannelRole::Command => link.client.is_open().then(|| link.client.peer()),
            ChannelRole::FileTransfer => link
                .transfer
                .as_ref()
                .filter(|(_, task)| !task.is_finished())
                .map(|(addr, _)| *addr),
        }
    }

    async fn client(&self) -> Result<Arc<CommandClient>, ClientError> {
        match self.link.lock().await.as_ref() {
            Some(link) if link.client.is_open() => Ok(Arc::clone(&link.client)),
            _ => Err(ClientError::NotConnected),
        }
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Stores `value` locally and, when connected, on the board.
    pub async fn set(&self, key: impl Into<String>, value: ConfigValue) -> Result<(), ClientError> {
        let key = key.into();
        self.shared.store.set(key.clone(), value.clone());
        match self.client().await {
            Ok(client) => client.send(Command::Set { key, value }).await,
            Err(ClientError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Replaces the local settings with `config` and, when connected, the
    /// board's. Invalid session timing rejects the whole map.
    pub async fn set_all(&self, config: Config) -> Result<(), ClientError> {
        SessionTiming::from_config(&config)?;
        self.shared.store.set_all(config.clone());
        match self.client().await {
            Ok(client) => client.send(Command::SetAll { config }).await,
            Err(ClientError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reads `key` from the board, or from the local store when offline.
    pub async fn get(&self, key: &str) -> Result<ConfigValue, ClientError> {
        match self.client().await {
            Ok(client) => {
                let value = client.request_value(key).await?;
                self.shared.store.set(key, value.clone());
                Ok(value)
            }
            Err(ClientError::NotConnected) => Ok(self.shared.store.get(key)?),
            Err(e) => Err(e),
        }
    }

    /// Reads the board's whole config and merges it locally.
    pub async fn get_all(&self) -> Result<Config, ClientError> {
        let config = self.client().await?.request_config().await?;
        self.shared.store.merge(config.clone());
        Ok(config)
    }

    // -----------------------------------------------------------------------
    // Board actions
    // -----------------------------------------------------------------------

    /// Asks the board to run a maintenance action. Completion arrives as
    /// [`ControllerEvent::SystemDone`].
    pub async fn system(&self, kind: SystemKind) -> Result<(), ClientError> {
        self.client().await?.send(Command::System { kind }).await
    }

    /// Validates the session settings, pushes them and starts a session.
    pub async fn start(&self) -> Result<(), ClientError> {
        let config = self.shared.store.snapshot();
        let timing = SessionTiming::from_config(&config)?;
        let client = self.client().await?;
        client.send(Command::SetAll { config }).await?;
        client.send(Command::Start).await?;
        info!(
            frames = timing.frames,
            eta_s = timing.total_us() / 1_000_000,
            "session start requested"
        );
        Ok(())
    }

    pub async fn abort(&self) -> Result<(), ClientError> {
        self.client().await?.send(Command::Abort).await
    }

    pub async fn preview(&self) -> Result<(), ClientError> {
        self.client().await?.send(Command::Preview).await
    }
}

impl Link {
    async fn shutdown(self) {
        self.client.close().await;
        self.cancel.cancel();
        let _ = self.dispatcher.await;
        if let Some((_, transfer)) = self.transfer {
            let _ = transfer.await;
        }
    }
}

impl Shared {
    fn board(&self) -> MutexGuard<'_, BoardView> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(?state, "connection state changed");
            self.emit(ControllerEvent::StateChanged(state));
        }
    }

    /// Turns board events into controller events until the connection ends.
    async fn dispatch(
        self: Arc<Self>,
        client: Arc<CommandClient>,
        mut events: mpsc::Receiver<Event>,
        cancel: CancellationToken,
    ) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }

        debug!(board = %client.peer(), "command channel closed");
        cancel.cancel();
        self.board().eta.stop();
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle(&self, event: Event) {
        match event {
            Event::Log { data, level } => self.emit(ControllerEvent::Log {
                timestamp: chrono::Local::now(),
                level,
                text: data,
            }),
            Event::Connection { .. } => {}
            Event::CamDetails { data } => self.emit(ControllerEvent::CamDetails(data)),
            Event::Status { data } => self.on_status(data),
            Event::Value { key, value } => {
                self.store.set(key, value);
            }
            Event::Config { config } => {
                self.store.merge(config.clone());
                self.emit(ControllerEvent::Config(config));
            }
            Event::Done { data } => self.emit(ControllerEvent::SystemDone(data)),
        }
    }

    fn on_status(&self, status: StatusUpdate) {
        let reported = Duration::from_micros(status.eta_us);
        let eta = {
            let mut board = self.board();
            board.session = status.state;
            match status.state {
                SessionState::Configuring | SessionState::Capturing { .. } | SessionState::Aborting => {
                    if board.eta.is_running() {
                        board.eta.resync(reported);
                    } else {
                        board.eta.start(reported);
                    }
                    board.eta.remaining().unwrap_or_default()
                }
                SessionState::Transferring | SessionState::Faulted => {
                    board.eta.stop();
                    Duration::ZERO
                }
                SessionState::Idle => {
                    board.eta.stop();
                    reported
                }
            }
        };
        let (frame, total) = match status.state {
            SessionState::Capturing { frame, total } => (frame, total),
            _ => (0, 0),
        };
        self.emit(ControllerEvent::Status {
            state: status.state,
            frame,
            total,
            queued: status.queued,
            eta,
        });
    }

    async fn receive_files(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        dest: PathBuf,
        cancel: CancellationToken,
    ) {
        let mut receiver =
            TransferReceiver::new(dest).with_start_index(self.next_file.load(Ordering::SeqCst));
        let (files_tx, mut files_rx) = mpsc::channel::<ReceivedFile>(16);

        let forward = async {
            while let Some(file) = files_rx.recv().await {
                self.next_file.store(file.index + 1, Ordering::SeqCst);
                self.emit(ControllerEvent::FileReceived {
                    index: file.index,
                    path: file.path,
                    bytes: file.bytes,
                });
            }
        };
        let (result, ()) = tokio::join!(receiver.receive(stream, cancel, files_tx), forward);

        let error = match result {
            Ok(count) => {
                info!(count, "file transfer channel closed");
                None
            }
            Err(DataChannelError::Cancelled) => None,
            Err(e) => {
                warn!("file transfer channel failed: {e}");
                Some(e.to_string())
            }
        };
        self.emit(ControllerEvent::TransferClosed { error });
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    bounded_lookup(host, tokio::net::lookup_host((host, port)))
        .await?
        .next()
        .ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {host}"),
            ))
        })
}

/// Runs a name lookup for `host` within [`CONNECT_TIMEOUT`].
async fn bounded_lookup<T>(
    host: &str,
    lookup: impl Future<Output = std::io::Result<T>>,
) -> Result<T, ClientError> {
    match tokio::time::timeout(CONNECT_TIMEOUT, lookup).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(%host, "name lookup timed out");
            Err(ClientError::ResolveTimeout(host.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astropi_protocol::LogLevel;

    fn session() -> ControllerSession {
        ControllerSession::new(ControllerConfig::default(), ConfigStore::new())
    }

    #[test]
    fn take_events_once() {
        let s = session();
        assert!(s.take_events().is_some());
        assert!(s.take_events().is_none());
    }

    #[test]
    fn idle_eta_is_predicted_from_local_settings() {
        let s = session();
        s.store().set("image_count", ConfigValue::Int(3));
        s.store().set("ExposureTime", ConfigValue::Int(2_000_000));
        s.store().set("interval", ConfigValue::Int(1_000_000));
        assert_eq!(s.eta(), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn offline_set_and_get_use_local_store() {
        let s = session();
        s.set("Sharpness", ConfigValue::Float(1.5)).await.unwrap();
        assert_eq!(s.get("Sharpness").await.unwrap(), ConfigValue::Float(1.5));
        assert!(matches!(s.get("nope").await, Err(ClientError::Config(_))));
        assert!(matches!(s.abort().await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn set_all_replaces_local_settings() {
        let s = session();
        s.set("stale", ConfigValue::Bool(true)).await.unwrap();

        let config = Config::from([("image_count".to_string(), ConfigValue::Int(3))]);
        s.set_all(config.clone()).await.unwrap();
        assert_eq!(s.store().snapshot(), config);

        let bad = Config::from([
            ("image_count".to_string(), ConfigValue::Text("ten".into())),
            ("label".to_string(), ConfigValue::Text("M31".into())),
        ]);
        assert!(matches!(s.set_all(bad).await, Err(ClientError::InvalidSettings(_))));
        assert_eq!(s.store().snapshot(), config);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_name_lookup_times_out() {
        let lookup = std::future::pending::<std::io::Result<()>>();
        let err = bounded_lookup("astropi.local", lookup).await.unwrap_err();
        assert!(matches!(err, ClientError::ResolveTimeout(host) if host == "astropi.local"));
    }

    #[tokio::test]
    async fn ip_literals_skip_lookup() {
        let addr = resolve("10.0.0.2", 2000).await.unwrap();
        assert_eq!(addr, "10.0.0.2:2000".parse().unwrap());
    }

    #[tokio::test]
    async fn start_validates_settings_first() {
        let s = session();
        s.store().set("image_count", ConfigValue::Text("ten".into()));
        assert!(matches!(s.start().await, Err(ClientError::InvalidSettings(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn status_events_drive_countdown() {
        let s = session();
        let mut events = s.take_events().unwrap();
        let status = |state, eta_us| StatusUpdate {
            state,
            eta_us,
            queued: 0,
            session: String::new(),
        };

        s.shared.handle(Event::Status {
            data: status(SessionState::Configuring, 10_000_000),
        });
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(s.eta(), Duration::from_secs(6));

        // Larger report while running: ignored.
        s.shared.handle(Event::Status {
            data: status(SessionState::Capturing { frame: 1, total: 5 }, 8_000_000),
        });
        assert_eq!(s.eta(), Duration::from_secs(6));

        s.shared.handle(Event::Status {
            data: status(SessionState::Transferring, 0),
        });
        assert_eq!(s.eta(), Duration::ZERO);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(
            seen[1],
            ControllerEvent::Status { frame: 1, total: 5, .. }
        ));

        s.shared.handle(Event::log(LogLevel::Warning, "cold"));
        assert!(matches!(
            events.try_recv().unwrap(),
            ControllerEvent::Log { level: LogLevel::Warning, .. }
        ));
    }
}
