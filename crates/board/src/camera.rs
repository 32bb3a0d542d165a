//! Camera capability and scoped exclusive access.
//!
//! The physical driver sits behind [`CameraDevice`]. All calls block, so they
//! run on blocking threads. [`CameraSession`] holds the device lock for the
//! lifetime of a session and stops the camera when dropped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use astropi_protocol::constants::KEY_EXPOSURE_TIME;
use astropi_protocol::{CamDetails, Config, ValueKind};
use tracing::{debug, warn};

/// Errors reported by a camera device.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera busy")]
    Busy,

    #[error("configure failed: {0}")]
    Configure(String),

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame written to disk by the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFile {
    pub path: PathBuf,
    pub len: u64,
}

/// Blocking camera driver.
pub trait CameraDevice: Send {
    fn details(&self) -> CamDetails;

    /// Controls the camera accepts, with their value kinds.
    fn controls(&self) -> BTreeMap<String, ValueKind> {
        self.details().controls
    }

    /// Applies the keys it recognizes from `config`; others are ignored.
    fn configure(&mut self, config: &Config) -> Result<(), CameraError>;

    fn start(&mut self) -> Result<(), CameraError>;

    /// Exposes one frame and writes it to disk.
    fn capture(&mut self) -> Result<CapturedFile, CameraError>;

    fn stop(&mut self);
}

/// The board's single camera, shared between sessions and previews.
pub type SharedCamera = Arc<Mutex<Box<dyn CameraDevice>>>;

pub fn shared(device: impl CameraDevice + 'static) -> SharedCamera {
    Arc::new(Mutex::new(Box::new(device)))
}

/// Exclusive, started camera. Stops the device on drop.
pub struct CameraSession<'a> {
    device: MutexGuard<'a, Box<dyn CameraDevice>>,
}

impl<'a> CameraSession<'a> {
    /// Waits for the camera, configures and starts it.
    pub fn acquire(camera: &'a SharedCamera, config: &Config) -> Result<Self, CameraError> {
        let device = camera.lock().unwrap_or_else(PoisonError::into_inner);
        Self::open(device, config)
    }

    /// Like [`acquire`](Self::acquire) but fails with
    /// [`CameraError::Busy`] if the camera is in use.
    pub fn try_acquire(camera: &'a SharedCamera, config: &Config) -> Result<Self, CameraError> {
        let device = match camera.try_lock() {
            Ok(device) => device,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(CameraError::Busy),
        };
        Self::open(device, config)
    }

    fn open(
        mut device: MutexGuard<'a, Box<dyn CameraDevice>>,
        config: &Config,
    ) -> Result<Self, CameraError> {
        device.configure(config)?;
        device.start()?;
        debug!("camera started");
        Ok(Self { device })
    }

    pub fn capture(&mut self) -> Result<CapturedFile, CameraError> {
        self.device.capture()
    }
}

impl Drop for CameraSession<'_> {
    fn drop(&mut self) {
        self.device.stop();
        debug!("camera stopped");
    }
}

/// Counters exposed by [`SimulatedCamera`].
#[derive(Debug, Default)]
pub struct CameraStats {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub captures: AtomicUsize,
}

impl CameraStats {
    /// Returns `true` if every start has a matching stop.
    pub fn balanced(&self) -> bool {
        self.starts.load(Ordering::SeqCst) == self.stops.load(Ordering::SeqCst)
    }
}

/// Camera that writes synthetic frames to a directory.
///
/// Honours `ExposureTime` (microseconds) by sleeping for the exposure.
/// Frames start with a little-endian TIFF header, like the DNG files the
/// real sensor produces.
pub struct SimulatedCamera {
    dir: PathBuf,
    model: String,
    resolution: (u32, u32),
    frame_bytes: usize,
    exposure: Duration,
    started: bool,
    counter: u64,
    fail_on_capture: Option<u64>,
    fail_configure: bool,
    stats: Arc<CameraStats>,
}

impl SimulatedCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            model: "simulated".into(),
            resolution: (640, 480),
            frame_bytes: 4096,
            exposure: Duration::from_micros(1000),
            started: false,
            counter: 0,
            fail_on_capture: None,
            fail_configure: false,
            stats: Arc::new(CameraStats::default()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    /// Size of each synthetic frame in bytes.
    pub fn with_frame_bytes(mut self, bytes: usize) -> Self {
        self.frame_bytes = bytes.max(8);
        self
    }

    /// Fails the `n`th capture (0-based, counted across sessions).
    pub fn fail_on_capture(mut self, n: u64) -> Self {
        self.fail_on_capture = Some(n);
        self
    }

    /// Makes every `configure` call fail.
    pub fn fail_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn stats(&self) -> Arc<CameraStats> {
        self.stats.clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn frame(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.frame_bytes);
        data.extend_from_slice(b"II*\0");
        data.extend_from_slice(&(self.counter as u32).to_le_bytes());
        let seed = self.counter as usize;
        data.extend((data.len()..self.frame_bytes).map(|i| ((i + seed) % 251) as u8));
        data
    }
}

impl CameraDevice for SimulatedCamera {
    fn details(&self) -> CamDetails {
        CamDetails {
            model: self.model.clone(),
            board: String::new(),
            resolution: self.resolution,
            controls: BTreeMap::from([
                ("AeEnable".to_string(), ValueKind::Bool),
                ("AnalogueGain".to_string(), ValueKind::Float),
                ("AwbEnable".to_string(), ValueKind::Bool),
                ("ExposureTime".to_string(), ValueKind::Int),
                ("ScalerCrop".to_string(), ValueKind::Tuple),
                ("Sharpness".to_string(), ValueKind::Float),
            ]),
        }
    }

    fn configure(&mut self, config: &Config) -> Result<(), CameraError> {
        if self.fail_configure {
            return Err(CameraError::Configure("simulated configure failure".into()));
        }
        if let Some(value) = config.get(KEY_EXPOSURE_TIME) {
            let us = value
                .as_i64()
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| CameraError::Configure(format!("bad ExposureTime: {value}")))?;
            self.exposure = Duration::from_micros(us);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if self.started {
            warn!("simulated camera started twice");
        }
        std::fs::create_dir_all(&self.dir)?;
        self.started = true;
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capture(&mut self) -> Result<CapturedFile, CameraError> {
        if !self.started {
            return Err(CameraError::Capture("camera not started".into()));
        }
        let index = self.counter;
        self.counter += 1;
        if self.fail_on_capture == Some(index) {
            return Err(CameraError::Capture(format!("simulated failure on frame {index}")));
        }

        std::thread::sleep(self.exposure);
        let path = self.dir.join(format!("frame_{index:06}.dng"));
        let data = self.frame();
        std::fs::write(&path, &data)?;
        self.stats.captures.fetch_add(1, Ordering::SeqCst);
        Ok(CapturedFile {
            path,
            len: data.len() as u64,
        })
    }

    fn stop(&mut self) {
        if self.started {
            self.started = false;
            self.stats.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astropi_protocol::ConfigValue;

    #[test]
    fn session_stops_camera_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedCamera::new(dir.path());
        let stats = sim.stats();
        let camera = shared(sim);

        {
            let mut session = CameraSession::acquire(&camera, &Config::new()).unwrap();
            let file = session.capture().unwrap();
            assert!(file.path.exists());
            assert_eq!(file.len, 4096);
            assert_eq!(stats.starts.load(Ordering::SeqCst), 1);
        }
        assert!(stats.balanced());
    }

    #[test]
    fn stops_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedCamera::new(dir.path()).fail_on_capture(0);
        let stats = sim.stats();
        let camera = shared(sim);

        let result = (|| -> Result<CapturedFile, CameraError> {
            let mut session = CameraSession::acquire(&camera, &Config::new())?;
            session.capture()
        })();
        assert!(matches!(result, Err(CameraError::Capture(_))));
        assert!(stats.balanced());
    }

    #[test]
    fn configure_failure_never_starts() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedCamera::new(dir.path()).fail_configure();
        let stats = sim.stats();
        let camera = shared(sim);

        assert!(CameraSession::acquire(&camera, &Config::new()).is_err());
        assert_eq!(stats.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn try_acquire_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let camera = shared(SimulatedCamera::new(dir.path()));

        let _held = CameraSession::acquire(&camera, &Config::new()).unwrap();
        assert!(matches!(
            CameraSession::try_acquire(&camera, &Config::new()),
            Err(CameraError::Busy)
        ));
    }

    #[test]
    fn configure_reads_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = SimulatedCamera::new(dir.path());
        let config = Config::from([("ExposureTime".to_string(), ConfigValue::Int(20))]);
        sim.configure(&config).unwrap();
        assert_eq!(sim.exposure, Duration::from_micros(20));

        let bad = Config::from([("ExposureTime".to_string(), ConfigValue::Bool(true))]);
        assert!(sim.configure(&bad).is_err());
    }

    #[test]
    fn frames_look_like_tiff() {
        let dir = tempfile::tempdir().unwrap();
        let camera = shared(SimulatedCamera::new(dir.path()).with_frame_bytes(64));
        let mut session = CameraSession::acquire(&camera, &Config::new()).unwrap();
        let file = session.capture().unwrap();
        let data = std::fs::read(&file.path).unwrap();
        assert_eq!(&data[..4], b"II*\0");
        assert_eq!(data.len(), 64);
    }
}
