//! Imaging session state machine.
//!
//! ```text
//! Idle -> Configuring -> Capturing -> Transferring -> Idle
//!              |             |  \
//!              v             v   Aborting -> Transferring
//!           Faulted  <-  Faulted
//!              |
//!              v
//!            Idle
//! ```
//!
//! The capture loop runs on a blocking thread and holds the camera for the
//! whole session. Abort is checked before every frame and cuts the
//! inter-frame wait short. Every transition is pushed to the Controller as
//! a `status` event.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use astropi_config_store::ConfigStore;
use astropi_data_channel::{QueueError, TransferItem, TransferQueue};
use astropi_protocol::constants::SESSION_KEYS;
use astropi_protocol::{Config, Event, SessionState, SessionTiming, StatusUpdate, TimingError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::camera::{CameraError, CameraSession, SharedCamera};
use crate::outbox::Outbox;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session busy ({0})")]
    Busy(SessionState),

    #[error("invalid session parameters: {0}")]
    InvalidParameters(#[from] TimingError),

    #[error("camera: {0}")]
    Camera(#[from] CameraError),

    #[error("transfer queue: {0}")]
    Queue(#[from] QueueError),

    #[error("capture task failed: {0}")]
    Task(String),
}

/// Result of an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    Requested,
    /// Idle, already aborting, past the last frame or transferring.
    NothingToAbort,
}

enum CaptureOutcome {
    Completed(u64),
    Aborted(u64),
}

struct Progress {
    state: SessionState,
    session_id: String,
    timing: SessionTiming,
    frames_done: u64,
    abort: CancellationToken,
    /// Cancelled when the Controller goes away; ends the transfer wait.
    halt: CancellationToken,
}

struct Inner {
    store: ConfigStore,
    camera: SharedCamera,
    queue: TransferQueue,
    outbox: Outbox,
    progress: Mutex<Progress>,
    states: watch::Sender<SessionState>,
}

/// Board-side imaging session. Cloning yields another handle.
#[derive(Clone)]
pub struct ImagingSession {
    inner: Arc<Inner>,
}

impl ImagingSession {
    pub fn new(store: ConfigStore, camera: SharedCamera, queue: TransferQueue, outbox: Outbox) -> Self {
        let (states, _) = watch::channel(SessionState::Idle);
        let inner = Arc::new(Inner {
            store: store.clone(),
            camera,
            queue,
            outbox,
            progress: Mutex::new(Progress {
                state: SessionState::Idle,
                session_id: String::new(),
                timing: SessionTiming::default(),
                frames_done: 0,
                abort: CancellationToken::new(),
                halt: CancellationToken::new(),
            }),
            states,
        });

        // Republish the ETA when session keys change while idle.
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        store.subscribe(move |change| {
            if !SESSION_KEYS.iter().any(|key| change.touches(key)) {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let p = inner.lock();
                if p.state.is_idle() {
                    inner.outbox.emit(Event::Status {
                        data: inner.status_of(&p),
                    });
                }
            }
        });

        Self { inner }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn status(&self) -> StatusUpdate {
        let p = self.inner.lock();
        self.inner.status_of(&p)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.states.subscribe()
    }

    /// Waits until the session is idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(SessionState::is_idle).await;
    }

    /// Starts a session from the current config. Returns the session id.
    pub fn start(&self) -> Result<String, SessionError> {
        let runtime = Handle::try_current().map_err(|e| SessionError::Task(e.to_string()))?;

        let (id, timing, config, abort, halt) = {
            let mut p = self.inner.lock();
            if !p.state.is_idle() {
                return Err(SessionError::Busy(p.state));
            }
            p.session_id = Uuid::new_v4().to_string();
            p.frames_done = 0;
            p.abort = CancellationToken::new();
            p.halt = CancellationToken::new();

            let config = self.inner.store.snapshot();
            let timing = SessionTiming::from_config(&config);
            p.timing = match &timing {
                Ok(timing) => *timing,
                Err(_) => SessionTiming {
                    frames: 0,
                    ..SessionTiming::default()
                },
            };
            self.inner.transition(&mut p, SessionState::Configuring);
            if let Err(e) = timing {
                let err = SessionError::from(e);
                self.inner.fault(&mut p, &err);
                return Err(err);
            }
            (
                p.session_id.clone(),
                p.timing,
                config,
                p.abort.clone(),
                p.halt.clone(),
            )
        };

        info!(
            session = %id,
            frames = timing.frames,
            exposure_us = timing.exposure_us,
            interval_us = timing.interval_us,
            eta_us = timing.total_us(),
            "session starting"
        );
        self.inner.outbox.emit(Event::info(format!(
            "Session started at {}: {} frame(s), ETA {:.1}s",
            chrono::Local::now().format("%H:%M:%S"),
            timing.frames,
            timing.total_us() as f64 / 1e6
        )));

        let inner = self.inner.clone();
        runtime.spawn(inner.run(timing, config, abort, halt));
        Ok(id)
    }

    /// Requests that the running session stop after the frame in flight.
    pub fn abort(&self) -> AbortOutcome {
        let mut p = self.inner.lock();
        let running = matches!(
            p.state,
            SessionState::Configuring | SessionState::Capturing { .. }
        );
        if !running || p.frames_done >= p.timing.frames {
            debug!(state = %p.state, "abort ignored");
            return AbortOutcome::NothingToAbort;
        }
        p.abort.cancel();
        self.inner.transition(&mut p, SessionState::Aborting);
        info!(session = %p.session_id, frames_done = p.frames_done, "session abort requested");
        AbortOutcome::Requested
    }

    /// Stops any running session and stops waiting for its transfers.
    /// Called when the Controller disconnects.
    pub fn shutdown(&self) {
        let mut p = self.inner.lock();
        p.abort.cancel();
        p.halt.cancel();
        if matches!(
            p.state,
            SessionState::Configuring | SessionState::Capturing { .. }
        ) {
            warn!(session = %p.session_id, "controller gone; aborting session");
            self.inner.transition(&mut p, SessionState::Aborting);
        }
    }

    /// Captures a single frame outside a session and queues it.
    pub async fn preview(&self) -> Result<TransferItem, SessionError> {
        {
            let p = self.inner.lock();
            if matches!(
                p.state,
                SessionState::Configuring | SessionState::Capturing { .. } | SessionState::Aborting
            ) {
                return Err(SessionError::Busy(p.state));
            }
        }

        let inner = self.inner.clone();
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || -> Result<TransferItem, SessionError> {
            let config = inner.store.snapshot();
            let file = {
                let mut camera = CameraSession::try_acquire(&inner.camera, &config)?;
                camera.capture()?
            };
            debug!(path = %file.path.display(), "preview captured");
            Ok(runtime.block_on(inner.queue.enqueue(file.path, file.len))?)
        })
        .await
        .map_err(|e| SessionError::Task(e.to_string()))?
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_of(&self, p: &Progress) -> StatusUpdate {
        let eta_us = match p.state {
            SessionState::Idle => SessionTiming::from_config(&self.store.snapshot())
                .map(|t| t.total_us())
                .unwrap_or(0),
            SessionState::Configuring | SessionState::Capturing { .. } => {
                p.timing.remaining_us(p.frames_done)
            }
            SessionState::Aborting | SessionState::Transferring | SessionState::Faulted => 0,
        };
        StatusUpdate {
            state: p.state,
            eta_us,
            queued: self.queue.pending(),
            session: p.session_id.clone(),
        }
    }

    fn publish(&self, p: &Progress) {
        self.outbox.emit(Event::Status {
            data: self.status_of(p),
        });
    }

    fn transition(&self, p: &mut Progress, state: SessionState) {
        debug!(from = %p.state, to = %state, "session transition");
        p.state = state;
        self.states.send_replace(state);
        self.publish(p);
    }

    /// Reports `err` and returns to idle.
    fn fault(&self, p: &mut Progress, err: &SessionError) {
        warn!(session = %p.session_id, error = %err, "session faulted");
        self.transition(p, SessionState::Faulted);
        self.outbox.emit(Event::error(format!("Session failed: {err}")));
        self.transition(p, SessionState::Idle);
    }

    async fn run(
        self: Arc<Self>,
        timing: SessionTiming,
        config: Config,
        abort: CancellationToken,
        halt: CancellationToken,
    ) {
        let worker = self.clone();
        let runtime = Handle::current();
        let result = tokio::task::spawn_blocking(move || {
            worker.capture_frames(&runtime, timing, &config, &abort)
        })
        .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let mut p = self.lock();
                self.fault(&mut p, &e);
                return;
            }
            Err(e) => {
                let mut p = self.lock();
                self.fault(&mut p, &SessionError::Task(e.to_string()));
                return;
            }
        };

        match outcome {
            CaptureOutcome::Completed(n) => {
                info!(frames = n, "capture complete");
                self.outbox
                    .emit(Event::info(format!("Session complete: {n} frame(s) captured")));
            }
            CaptureOutcome::Aborted(n) => {
                info!(frames = n, total = timing.frames, "capture aborted");
                self.outbox.emit(Event::warning(format!(
                    "Session aborted after {n} of {} frame(s)",
                    timing.frames
                )));
            }
        }

        {
            let mut p = self.lock();
            self.transition(&mut p, SessionState::Transferring);
        }
        self.drain(&halt).await;
        {
            let mut p = self.lock();
            self.transition(&mut p, SessionState::Idle);
        }
    }

    /// Waits for the transfer queue to empty, publishing progress.
    async fn drain(&self, halt: &CancellationToken) {
        let mut pending = self.queue.subscribe();
        loop {
            if *pending.borrow_and_update() == 0 {
                break;
            }
            tokio::select! {
                _ = halt.cancelled() => {
                    info!(pending = self.queue.pending(), "controller gone; captures kept for next connection");
                    break;
                }
                changed = pending.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let p = self.lock();
                    self.publish(&p);
                }
            }
        }
    }

    /// Runs on a blocking thread. The camera is released before any error
    /// is returned.
    fn capture_frames(
        &self,
        runtime: &Handle,
        timing: SessionTiming,
        config: &Config,
        abort: &CancellationToken,
    ) -> Result<CaptureOutcome, SessionError> {
        let mut camera = CameraSession::acquire(&self.camera, config)?;
        let total = timing.frames;

        for frame in 0..total {
            if abort.is_cancelled() {
                return Ok(CaptureOutcome::Aborted(frame));
            }
            {
                let mut p = self.lock();
                if p.state != SessionState::Aborting {
                    self.transition(
                        &mut p,
                        SessionState::Capturing {
                            frame: u32::try_from(frame).unwrap_or(u32::MAX),
                            total: u32::try_from(total).unwrap_or(u32::MAX),
                        },
                    );
                }
            }

            let started = Instant::now();
            let file = camera.capture()?;
            let path = file.path.clone();
            if let Err(e) = runtime.block_on(self.queue.enqueue(file.path, file.len)) {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }

            {
                let mut p = self.lock();
                p.frames_done = frame + 1;
                self.publish(&p);
            }
            self.outbox
                .emit(Event::info(format!("Captured frame {}/{total}", frame + 1)));

            if frame + 1 < total {
                let overhead = started.elapsed().saturating_sub(timing.exposure());
                let wait = timing.interval().saturating_sub(overhead);
                if !wait.is_zero() {
                    runtime.block_on(async {
                        tokio::select! {
                            _ = abort.cancelled() => {}
                            _ = tokio::time::sleep(wait) => {}
                        }
                    });
                }
            }
        }

        Ok(CaptureOutcome::Completed(total))
    }
}
