//! Command Channel read pump: routes replies and forwards board events.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use astropi_protocol::constants::READ_POLL_INTERVAL;
use astropi_protocol::{Event, FramingError, Inbound};

use crate::client::Routes;

/// Reads events from the board until the stream ends, errors or is
/// cancelled.
///
/// Replies awaited by a request are handed to it; everything else goes to
/// `events`. On exit, pending requests are failed and `cancel` is fired so
/// the write pump stops too.
pub(crate) async fn read_pump<S>(
    mut read: S,
    routes: Arc<Routes>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Inbound<Event>, FramingError>> + Unpin,
{
    let mut poll = tokio::time::interval(READ_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = poll.tick() => {
                if events.is_closed() {
                    debug!("event consumer gone, closing command channel");
                    break;
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Inbound::Message(event))) => {
                        trace!(event = event.name(), "received event");
                        if let Some(event) = routes.route(event) {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Inbound::Malformed(frame))) => {
                        warn!("dropping malformed frame from board: {frame}");
                    }
                    Some(Err(e)) => {
                        warn!("command channel read error: {e}");
                        break;
                    }
                    None => {
                        debug!("board closed the command channel");
                        break;
                    }
                }
            }
        }
    }

    routes.fail_all();
    cancel.cancel();
}
