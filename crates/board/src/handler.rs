//! Board-side command handling.
//!
//! `BoardHandler` implements the agent server's `Handler` trait and wires
//! commands to the config store, the imaging session and the maintenance
//! runner.

use std::sync::Arc;

use astropi_agent_server::{Handler, HandlerFuture, Sender};
use astropi_config_store::ConfigStore;
use astropi_data_channel::TransferSender;
use astropi_protocol::constants::SESSION_KEYS;
use astropi_protocol::{CamDetails, Config, ConfigValue, Event, SessionTiming, SystemDone, SystemKind};
use tracing::{debug, info, warn};

use crate::outbox::Outbox;
use crate::session::{AbortOutcome, ImagingSession, SessionError};
use crate::system::MaintenanceRunner;

pub const GREETING: &str = "Hello World from the AstroPi!";

/// Queues a reply, noting it when the controller is gone or backed up.
fn reply(sender: &Sender, event: Event) {
    let name = event.name();
    if sender.send_event(event).is_err() {
        debug!(event = name, "reply dropped");
    }
}

pub struct BoardHandler {
    store: ConfigStore,
    session: ImagingSession,
    details: CamDetails,
    runner: Arc<dyn MaintenanceRunner>,
    outbox: Outbox,
    transfer: TransferSender,
}

impl BoardHandler {
    pub fn new(
        store: ConfigStore,
        session: ImagingSession,
        details: CamDetails,
        runner: Arc<dyn MaintenanceRunner>,
        outbox: Outbox,
        transfer: TransferSender,
    ) -> Self {
        Self {
            store,
            session,
            details,
            runner,
            outbox,
            transfer,
        }
    }

    pub fn session(&self) -> &ImagingSession {
        &self.session
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Checks a single entry before it reaches the store.
    ///
    /// Session keys must be integers in range. Camera controls must match
    /// the kind the camera declares. Anything else is stored as is.
    pub fn validate(&self, key: &str, value: &ConfigValue) -> Result<(), String> {
        if SESSION_KEYS.contains(&key) {
            let entry = Config::from([(key.to_string(), value.clone())]);
            return SessionTiming::from_config(&entry)
                .map(|_| ())
                .map_err(|e| e.to_string());
        }
        match self.details.controls.get(key) {
            Some(&kind) if !value.conforms_to(kind) => Err(format!(
                "{key} expects {kind:?}, got {:?} ({value})",
                value.kind()
            )),
            _ => Ok(()),
        }
    }
}

impl Handler for BoardHandler {
    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    fn on_connect(&self, sender: Sender) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.outbox.attach(sender.clone());
            let hello = [
                Event::conn_ack(),
                Event::info(GREETING),
                Event::CamDetails {
                    data: self.details.clone(),
                },
                Event::Status {
                    data: self.session.status(),
                },
            ];
            for event in hello {
                if sender.send(event).await.is_err() {
                    warn!("controller went away during handshake");
                    return;
                }
            }
            info!(model = %self.details.model, "controller handshake complete");
        })
    }

    fn on_controller_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.outbox.detach();
            self.session.shutdown();
            self.transfer.drop_connection();
            info!("controller disconnected; session stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    fn on_set(&self, sender: Sender, key: String, value: ConfigValue) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Err(reason) = self.validate(&key, &value) {
                debug!(%key, %reason, "set rejected");
                reply(&sender, Event::error(format!("Rejected {key}: {reason}")));
                return;
            }
            debug!(%key, %value, "set");
            self.store.set(key, value);
        })
    }

    fn on_set_all(&self, sender: Sender, config: Config) -> HandlerFuture<'_> {
        Box::pin(async move {
            let rejected: Vec<String> = config
                .iter()
                .filter_map(|(key, value)| {
                    let reason = self.validate(key, value).err()?;
                    Some(format!("Rejected {key}: {reason}"))
                })
                .collect();
            if !rejected.is_empty() {
                debug!(rejected = rejected.len(), total = config.len(), "setall rejected");
                for text in rejected {
                    reply(&sender, Event::error(text));
                }
                reply(&sender, Event::error("Settings unchanged"));
                return;
            }
            debug!(total = config.len(), "setall");
            self.store.set_all(config);
        })
    }

    fn on_get(&self, sender: Sender, key: String) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.store.get(&key) {
                Ok(value) => reply(&sender, Event::Value { key, value }),
                Err(e) => reply(&sender, Event::error(e.to_string())),
            }
        })
    }

    fn on_get_all(&self, sender: Sender) -> HandlerFuture<'_> {
        Box::pin(async move {
            reply(
                &sender,
                Event::Config {
                    config: self.store.snapshot(),
                },
            );
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    fn on_system(&self, sender: Sender, kind: SystemKind) -> HandlerFuture<'_> {
        let runner = Arc::clone(&self.runner);
        Box::pin(async move {
            reply(&sender, Event::info(format!("Running {kind}...")));
            tokio::spawn(async move {
                let done = match runner.run(kind, &sender).await {
                    Ok(code) => SystemDone {
                        kind,
                        success: code == Some(0),
                        code,
                    },
                    Err(e) => {
                        warn!(%kind, "maintenance failed: {e}");
                        if sender.send(Event::error(format!("{kind} failed: {e}"))).await.is_err() {
                            debug!(%kind, "failure report dropped");
                        }
                        SystemDone {
                            kind,
                            success: false,
                            code: None,
                        }
                    }
                };
                info!(%kind, success = done.success, code = ?done.code, "maintenance finished");
                if sender.send(Event::Done { data: done }).await.is_err() {
                    debug!(%kind, "done dropped; controller gone");
                }
            });
        })
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    fn on_start(&self, sender: Sender) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.session.start() {
                Ok(id) => debug!(session = %id, "start accepted"),
                // Already reported by the session as a fault.
                Err(SessionError::InvalidParameters(_)) => {}
                Err(e) => {
                    reply(&sender, Event::error(format!("Cannot start session: {e}")));
                }
            }
        })
    }

    fn on_abort(&self, sender: Sender) -> HandlerFuture<'_> {
        Box::pin(async move {
            let text = match self.session.abort() {
                AbortOutcome::Requested => "Abort requested",
                AbortOutcome::NothingToAbort => "Nothing to abort",
            };
            reply(&sender, Event::info(text));
        })
    }

    fn on_preview(&self, sender: Sender) -> HandlerFuture<'_> {
        let session = self.session.clone();
        Box::pin(async move {
            tokio::spawn(async move {
                match session.preview().await {
                    Ok(item) => reply(&sender, Event::info(format!("Preview queued as #{}", item.seq))),
                    Err(e) => reply(&sender, Event::error(format!("Preview failed: {e}"))),
                }
            });
        })
    }
}
