//! AstroPi Board Agent domain.
//!
//! Exclusive camera access, the imaging session state machine, maintenance
//! actions and the command handler plugged into the agent server.

pub mod camera;
pub mod handler;
pub mod outbox;
pub mod session;
pub mod system;

pub use camera::{
    CameraDevice, CameraError, CameraSession, CameraStats, CapturedFile, SharedCamera,
    SimulatedCamera, shared,
};
pub use handler::BoardHandler;
pub use outbox::Outbox;
pub use session::{AbortOutcome, ImagingSession, SessionError};
pub use system::{MaintenanceRunner, ShellRunner, SystemError};
