use std::sync::{Arc, Mutex, PoisonError};

use astropi_agent_server::Sender;
use astropi_protocol::Event;

/// Route to whichever Controller is currently attached.
///
/// Events emitted while no Controller is attached are dropped.
#[derive(Clone, Default)]
pub struct Outbox {
    current: Arc<Mutex<Option<Sender>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sender: Sender) {
        *self.lock() = Some(sender);
    }

    pub fn detach(&self) {
        *self.lock() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().as_ref().is_some_and(Sender::is_connected)
    }

    /// Queues an event for the attached Controller. Returns `false` if it
    /// was dropped.
    pub fn emit(&self, event: Event) -> bool {
        match self.lock().as_ref() {
            Some(sender) => sender.send_event(event).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Sender>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
