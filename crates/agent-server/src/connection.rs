//! Controller connection management: read/write pumps, liveness, send buffering.

use std::net::SocketAddr;
use std::sync::Arc;

use astropi_protocol::codec::MalformedKind;
use astropi_protocol::constants::READ_POLL_INTERVAL;
use astropi_protocol::{Command, Event, Framing, Inbound, LogLevel, MessageCodec};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

type BoardCodec = MessageCodec<Command, Event>;

/// Metadata about the connected Controller.
#[derive(Debug, Clone)]
pub struct ControllerMeta {
    pub remote_addr: SocketAddr,
}

/// Handle for sending events to the connected Controller.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<Event>,
}

impl Sender {
    /// Queues an event without waiting.
    ///
    /// Returns `Err` if the buffer is full or the Controller disconnected.
    pub fn send_event(&self, event: Event) -> Result<(), SendError> {
        self.tx.try_send(event).map_err(|e| {
            tracing::warn!(event = e.into_inner().name(), "send buffer full or closed, dropping event");
            SendError
        })
    }

    /// Queues an event, waiting for buffer space.
    ///
    /// Used for streams where no event may be dropped.
    pub async fn send(&self, event: Event) -> Result<(), SendError> {
        self.tx.send(event).await.map_err(|_| SendError)
    }

    /// Sends a `log` event.
    pub fn log(&self, level: LogLevel, text: impl Into<String>) -> Result<(), SendError> {
        self.send_event(Event::log(level, text))
    }

    /// Sends a `log` event at error level.
    pub fn send_error(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send_event(Event::error(text))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Creates a sender whose events land in the returned receiver.
    ///
    /// Lets handlers be driven without a socket.
    pub fn detached(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a Controller.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous event delivery.
pub struct ControllerConnection {
    pub meta: ControllerMeta,
    sender: Sender,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl ControllerConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals shutdown without waiting.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Signals shutdown and waits until the read pump and the handler's
    /// disconnect hook have finished.
    pub async fn close_and_wait(self) {
        self.cancel.cancel();
        if let Err(e) = self.reader.await {
            tracing::error!("read pump task failed: {e}");
        }
    }
}

/// Runs the read and write pumps for a Controller connection.
///
/// Returns the [`ControllerConnection`] handle. The pumps run as background
/// tokio tasks and stop when the peer closes, an I/O or fatal framing error
/// occurs, or the cancel token is triggered.
pub fn spawn_connection<R, W, H>(
    reader: R,
    writer: W,
    framing: Framing,
    meta: ControllerMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ControllerConnection
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<Event>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let stream = FramedRead::new(reader, BoardCodec::new(framing));
    let sink = FramedWrite::new(writer, BoardCodec::new(framing));

    // Write pump.
    tokio::spawn(write_pump(sink, rx, cancel.clone()));

    // Read pump.
    let read_cancel = cancel.clone();
    let read_sender = sender.clone();
    let addr = meta.remote_addr;
    let reader = tokio::spawn(async move {
        read_pump(stream, read_sender, handler.clone(), read_cancel.clone()).await;
        // When read pump exits, cancel the write pump too.
        read_cancel.cancel();
        handler.on_controller_disconnected().await;
        tracing::info!(%addr, "controller disconnected");
    });

    ControllerConnection {
        meta,
        sender,
        cancel,
        reader,
    }
}

/// Write pump: drains the send channel into the framed sink.
async fn write_pump<W>(
    mut sink: FramedWrite<W, BoardCodec>,
    mut rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let name = event.name();
                        if let Err(e) = sink.send(event).await {
                            tracing::error!(event = name, "write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }
        }
    }

    // Dropping the receiver marks every Sender as disconnected.
    drop(rx);
    let _ = sink.close().await;
}

/// Read pump: decodes frames and dispatches commands to the handler.
async fn read_pump<R, H>(
    mut stream: FramedRead<R, BoardCodec>,
    sender: Sender,
    handler: Arc<H>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
    H: Handler,
{
    let mut poll = tokio::time::interval(READ_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = poll.tick() => {
                if !sender.is_connected() {
                    tracing::warn!("write side closed, ending connection");
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Inbound::Message(Command::Disconnect))) => {
                        tracing::info!("controller requested disconnect");
                        break;
                    }
                    Some(Ok(Inbound::Message(command))) => {
                        tracing::debug!(command = command.name(), "command received");
                        dispatch(&handler, &sender, command).await;
                    }
                    Some(Ok(Inbound::Malformed(bad))) => match bad.kind {
                        MalformedKind::Syntax => {
                            tracing::warn!("dropping malformed frame: {bad}");
                        }
                        MalformedKind::Unrecognized => {
                            tracing::warn!("unknown command: {}", bad.detail);
                            let _ = sender.send_error(format!("unknown command: {}", bad.detail));
                        }
                    },
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Peer closed.
                }
            }
        }
    }
}

/// Dispatches a command to the matching handler method.
async fn dispatch<H: Handler>(handler: &Arc<H>, sender: &Sender, command: Command) {
    let s = sender.clone();
    match command {
        Command::Connect => handler.on_connect(s).await,
        Command::Set { key, value } => handler.on_set(s, key, value).await,
        Command::SetAll { config } => handler.on_set_all(s, config).await,
        Command::Get { key } => handler.on_get(s, key).await,
        Command::GetAll => handler.on_get_all(s).await,
        Command::System { kind } => handler.on_system(s, kind).await,
        Command::Start => handler.on_start(s).await,
        Command::Abort => handler.on_abort(s).await,
        Command::Preview => handler.on_preview(s).await,
        // Handled by the read pump.
        Command::Disconnect => {}
    }
}
