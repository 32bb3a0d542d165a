//! Session timing and ETA arithmetic.
//!
//! All inputs are microseconds; the ETA of a session with `N` frames,
//! exposure `E` and interval `I` is `N*E + (N-1)*I`.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::constants::{KEY_EXPOSURE_TIME, KEY_IMAGE_COUNT, KEY_INTERVAL};
use crate::types::{Config, ConfigValue};

/// Frames captured when `image_count` is absent.
pub const DEFAULT_IMAGE_COUNT: u64 = 1;

/// Exposure used when `ExposureTime` is absent, microseconds.
pub const DEFAULT_EXPOSURE_US: u64 = 1000;

/// Interval used when `interval` is absent, microseconds.
pub const DEFAULT_INTERVAL_US: u64 = 0;

/// Largest `image_count` a session accepts; frame numbers travel as `u32`.
pub const MAX_IMAGE_COUNT: i64 = u32::MAX as i64;

/// Invalid session parameter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimingError {
    #[error("{key} must be an integer, got {value}")]
    NotAnInteger { key: &'static str, value: String },

    #[error("{key} must be at least {min}, got {value}")]
    OutOfRange {
        key: &'static str,
        min: i64,
        value: i64,
    },

    #[error("{key} must be at most {max}, got {value}")]
    TooLarge {
        key: &'static str,
        max: i64,
        value: i64,
    },
}

/// Session parameters relevant to timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub frames: u64,
    pub exposure_us: u64,
    pub interval_us: u64,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            frames: DEFAULT_IMAGE_COUNT,
            exposure_us: DEFAULT_EXPOSURE_US,
            interval_us: DEFAULT_INTERVAL_US,
        }
    }
}

impl SessionTiming {
    /// Extracts and validates the session keys from a config snapshot.
    pub fn from_config(config: &Config) -> Result<Self, TimingError> {
        let defaults = Self::default();
        Ok(Self {
            frames: read_key(config, KEY_IMAGE_COUNT, 1..=MAX_IMAGE_COUNT, defaults.frames)?,
            exposure_us: read_key(config, KEY_EXPOSURE_TIME, 0..=i64::MAX, defaults.exposure_us)?,
            interval_us: read_key(config, KEY_INTERVAL, 0..=i64::MAX, defaults.interval_us)?,
        })
    }

    pub fn exposure(&self) -> Duration {
        Duration::from_micros(self.exposure_us)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }

    /// ETA of the whole session, in microseconds.
    pub fn total_us(&self) -> u64 {
        self.remaining_us(0)
    }

    /// ETA once `completed` frames are done: `r*E + (r-1)*I` with
    /// `r = frames - completed`, zero when nothing remains.
    pub fn remaining_us(&self, completed: u64) -> u64 {
        let r = self.frames.saturating_sub(completed);
        if r == 0 {
            return 0;
        }
        r.saturating_mul(self.exposure_us)
            .saturating_add((r - 1).saturating_mul(self.interval_us))
    }

    pub fn remaining(&self, completed: u64) -> Duration {
        Duration::from_micros(self.remaining_us(completed))
    }
}

fn read_key(
    config: &Config,
    key: &'static str,
    range: RangeInclusive<i64>,
    default: u64,
) -> Result<u64, TimingError> {
    match config.get(key) {
        None => Ok(default),
        Some(ConfigValue::Int(v)) if v < range.start() => Err(TimingError::OutOfRange {
            key,
            min: *range.start(),
            value: *v,
        }),
        Some(ConfigValue::Int(v)) if v > range.end() => Err(TimingError::TooLarge {
            key,
            max: *range.end(),
            value: *v,
        }),
        Some(ConfigValue::Int(v)) => Ok(v.unsigned_abs()),
        Some(other) => Err(TimingError::NotAnInteger {
            key,
            value: other.to_string(),
        }),
    }
}
