//! Command Channel write pump: serialises outbound commands.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use astropi_protocol::{Command, FramingError};

/// Writes commands to the board until cancelled or the channel closes.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) where
    S: Sink<Command, Error = FramingError> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = write_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if let Err(e) = write.send(cmd).await {
                            error!("command channel write error: {e}");
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.close().await;
}
