//! Command Channel client.
//!
//! Connects to the board, performs the `connect` handshake and runs the
//! read and write pumps. The protocol carries no request ids, so `get`
//! replies are matched by key in request order and `getall` replies in
//! request order.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use astropi_protocol::constants::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, REQUEST_TIMEOUT};
use astropi_protocol::{Command, Config, ConfigValue, Event, Framing, MessageCodec};

use crate::types::ClientError;

const WRITE_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 1024;

/// Replies awaited by in-flight requests.
#[derive(Default)]
pub(crate) struct Routes {
    ack: Mutex<Option<oneshot::Sender<()>>>,
    values: Mutex<HashMap<String, VecDeque<oneshot::Sender<ConfigValue>>>>,
    configs: Mutex<VecDeque<oneshot::Sender<Config>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Routes {
    pub(crate) fn expect_ack(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.ack) = Some(tx);
        rx
    }

    pub(crate) fn expect_value(&self, key: &str) -> oneshot::Receiver<ConfigValue> {
        let (tx, rx) = oneshot::channel();
        lock(&self.values).entry(key.to_string()).or_default().push_back(tx);
        rx
    }

    pub(crate) fn expect_config(&self) -> oneshot::Receiver<Config> {
        let (tx, rx) = oneshot::channel();
        lock(&self.configs).push_back(tx);
        rx
    }

    /// Hands `event` to a waiting request, or gives it back.
    pub(crate) fn route(&self, event: Event) -> Option<Event> {
        match event {
            Event::Connection { .. } => {
                if let Some(tx) = lock(&self.ack).take() {
                    let _ = tx.send(());
                    return None;
                }
                debug!("unsolicited connection ack");
                None
            }
            Event::Value { key, value } => {
                let mut pending = Some(value);
                let mut values = lock(&self.values);
                if let Some(queue) = values.get_mut(&key) {
                    // Skip waiters that gave up.
                    while let Some(value) = pending.take() {
                        let Some(tx) = queue.pop_front() else {
                            pending = Some(value);
                            break;
                        };
                        if let Err(value) = tx.send(value) {
                            pending = Some(value);
                        }
                    }
                    if queue.is_empty() {
                        values.remove(&key);
                    }
                }
                pending.map(|value| Event::Value { key, value })
            }
            Event::Config { config } => {
                let mut pending = Some(config);
                let mut configs = lock(&self.configs);
                while let Some(config) = pending.take() {
                    let Some(tx) = configs.pop_front() else {
                        pending = Some(config);
                        break;
                    };
                    if let Err(config) = tx.send(config) {
                        pending = Some(config);
                    }
                }
                pending.map(|config| Event::Config { config })
            }
            other => Some(other),
        }
    }

    /// Drops every waiter; their receivers see the channel closed.
    pub(crate) fn fail_all(&self) {
        lock(&self.ack).take();
        lock(&self.values).clear();
        lock(&self.configs).clear();
    }
}

/// Connected Command Channel.
pub struct CommandClient {
    peer: SocketAddr,
    write_tx: mpsc::Sender<Command>,
    routes: Arc<Routes>,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl CommandClient {
    /// Connects to the board and waits for its connection ack.
    ///
    /// Returns the client and the stream of board events that are not
    /// replies to a request. The stream ends when the connection closes.
    pub async fn connect(
        addr: SocketAddr,
        framing: Framing,
    ) -> Result<(Self, mpsc::Receiver<Event>), ClientError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(addr))??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let read = FramedRead::new(read_half, MessageCodec::<Event, Command>::new(framing));
        let write = FramedWrite::new(write_half, MessageCodec::<Event, Command>::new(framing));

        let (write_tx, write_rx) = mpsc::channel(WRITE_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let routes = Arc::new(Routes::default());
        let ack = routes.expect_ack();
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            routes.clone(),
            events_tx,
            cancel.clone(),
        ));

        let client = Self {
            peer: addr,
            write_tx,
            routes,
            cancel,
            read_handle,
            write_handle,
        };

        client.send(Command::Connect).await?;
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, ack).await {
            Ok(Ok(())) => {
                info!(%addr, "board acknowledged connection");
                Ok((client, events_rx))
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::HandshakeTimeout),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Queues a command for the board.
    pub async fn send(&self, command: Command) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        debug!(command = command.name(), "sending command");
        self.write_tx
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Sends `get` and waits for the matching `value` reply.
    pub async fn request_value(&self, key: &str) -> Result<ConfigValue, ClientError> {
        let reply = self.routes.expect_value(key);
        self.send(Command::Get {
            key: key.to_string(),
        })
        .await?;
        match tokio::time::timeout(REQUEST_TIMEOUT, reply).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::RequestTimeout),
        }
    }

    /// Sends `getall` and waits for the `config` reply.
    pub async fn request_config(&self) -> Result<Config, ClientError> {
        let reply = self.routes.expect_config();
        self.send(Command::GetAll).await?;
        match tokio::time::timeout(REQUEST_TIMEOUT, reply).await {
            Ok(Ok(config)) => Ok(config),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::RequestTimeout),
        }
    }

    /// Sends `disconnect`, waits briefly for the board to close the
    /// connection, then tears the pumps down.
    pub async fn close(&self) {
        if self.send(Command::Disconnect).await.is_ok() {
            let _ = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.cancel.cancelled()).await;
        }
        self.cancel.cancel();
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

impl Drop for CommandClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}
