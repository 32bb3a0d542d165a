//! Handler trait for processing Controller commands.
//!
//! Implementors provide the board's domain logic (config, session, camera,
//! maintenance) while the server framework handles connection management,
//! framing and routing.

use std::future::Future;
use std::pin::Pin;

use astropi_protocol::{Config, ConfigValue, Event, SystemKind};

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling commands from the Controller.
///
/// The server decodes each frame and calls the matching method with a
/// `sender` for replies and events. Methods are awaited on the read pump,
/// so long-running work must be spawned.
///
/// Default implementations reply with a `log` error so handlers only need
/// to override the commands they support.
pub trait Handler: Send + Sync + 'static {
    /// Called for `connect`. Must reply with the connection ack.
    fn on_connect(&self, sender: Sender) -> HandlerFuture<'_>;

    /// Called for `set`.
    fn on_set(&self, sender: Sender, key: String, value: ConfigValue) -> HandlerFuture<'_> {
        let _ = (key, value);
        unsupported(sender, "set")
    }

    /// Called for `setall`.
    fn on_set_all(&self, sender: Sender, config: Config) -> HandlerFuture<'_> {
        let _ = config;
        unsupported(sender, "setall")
    }

    /// Called for `get`.
    fn on_get(&self, sender: Sender, key: String) -> HandlerFuture<'_> {
        let _ = key;
        unsupported(sender, "get")
    }

    /// Called for `getall`.
    fn on_get_all(&self, sender: Sender) -> HandlerFuture<'_> {
        unsupported(sender, "getall")
    }

    /// Called for `system`.
    fn on_system(&self, sender: Sender, kind: SystemKind) -> HandlerFuture<'_> {
        let _ = kind;
        unsupported(sender, "system")
    }

    /// Called for `start`.
    fn on_start(&self, sender: Sender) -> HandlerFuture<'_> {
        unsupported(sender, "start")
    }

    /// Called for `abortSession`.
    fn on_abort(&self, sender: Sender) -> HandlerFuture<'_> {
        unsupported(sender, "abortSession")
    }

    /// Called for `preview`.
    fn on_preview(&self, sender: Sender) -> HandlerFuture<'_> {
        unsupported(sender, "preview")
    }

    /// Called when the Controller disconnects (cleanup hook).
    fn on_controller_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}

fn unsupported<'a>(sender: Sender, command: &'static str) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _ = sender.send_event(Event::error(format!("{command} not supported")));
    })
}
