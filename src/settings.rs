//! Run configuration.
//!
//! [`Settings`] is the immutable snapshot a run is started with.
//! [`SettingsOverrides`] holds the recognized options a caller may supply
//! (from a JSON file or the command line); [`Settings::merge`] validates them
//! against documented bounds and produces a new snapshot.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::errors::SpeedTestError;
use crate::retry::RetryPolicy;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

pub const DEFAULT_MAX_DURATION_SECONDS: f64 = 15.0;
pub const DEFAULT_GRACE_TIME_SECONDS: f64 = 0.3;
pub const DEFAULT_CONCURRENCY: usize = 16;
pub const DEFAULT_STAGGER_DELAY_MS: u64 = 30;
pub const DEFAULT_OVERHEAD_COMPENSATION: f64 = 1.08;
pub const DEFAULT_MIN_CHUNK_BYTES: u64 = MIB;
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 8 * MIB;
pub const DEFAULT_PING_PROBE_COUNT: usize = 10;
pub const DEFAULT_TOP_FRACTION: f64 = 0.5;

const MAX_DURATION_BOUNDS: (f64, f64) = (1.0, 120.0);
const GRACE_TIME_BOUNDS: (f64, f64) = (0.0, 10.0);
const CONCURRENCY_BOUNDS: (usize, usize) = (1, 32);
const STAGGER_DELAY_BOUNDS: (u64, u64) = (0, 1000);
const OVERHEAD_BOUNDS: (f64, f64) = (1.0, 1.5);
const CHUNK_BOUNDS: (u64, u64) = (64 * KIB, 64 * MIB);
const PING_PROBE_BOUNDS: (usize, usize) = (2, 100);
const TOP_FRACTION_BOUNDS: (f64, f64) = (0.05, 1.0);

/// Immutable configuration snapshot for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Upper bound on a transfer phase, measured from the grace reset.
    pub max_duration: Duration,
    /// Warm-up interval whose samples are excluded from the estimate.
    pub grace_time: Duration,
    /// Shorten transfer phases on fast links.
    pub auto_shorten: bool,
    /// Number of concurrent download streams. Uploads use at most 10.
    pub concurrency: usize,
    /// Start offset between consecutive workers.
    pub stagger_delay: Duration,
    /// Multiplier (>= 1.0) for protocol overhead not counted in payload bytes.
    pub overhead_compensation_factor: f64,
    /// Smallest chunk a worker will request or send.
    pub min_chunk_bytes: u64,
    /// Largest chunk a worker will request or send.
    pub max_chunk_bytes: u64,
    /// Sequential probes issued by the ping phase.
    pub ping_probe_count: usize,
    /// Fraction of the highest speed samples averaged into the result.
    pub top_fraction: f64,
    /// Retry behavior for failed chunks and probes.
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs_f64(DEFAULT_MAX_DURATION_SECONDS),
            grace_time: Duration::from_secs_f64(DEFAULT_GRACE_TIME_SECONDS),
            auto_shorten: true,
            concurrency: DEFAULT_CONCURRENCY,
            stagger_delay: Duration::from_millis(DEFAULT_STAGGER_DELAY_MS),
            overhead_compensation_factor: DEFAULT_OVERHEAD_COMPENSATION,
            min_chunk_bytes: DEFAULT_MIN_CHUNK_BYTES,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            ping_probe_count: DEFAULT_PING_PROBE_COUNT,
            top_fraction: DEFAULT_TOP_FRACTION,
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Apply `overrides` on top of this snapshot.
    ///
    /// Out-of-range values are clamped to their bounds (with a warning);
    /// non-finite numbers, a chunk range with `min > max`, and a grace period
    /// that is not shorter than the max duration are rejected.
    pub fn merge(
        &self,
        overrides: &SettingsOverrides,
    ) -> Result<Settings, SpeedTestError> {
        let mut merged = self.clone();

        if let Some(secs) = overrides.max_duration_seconds {
            let secs = clamp_f64("maxDurationSeconds", secs, MAX_DURATION_BOUNDS)?;
            merged.max_duration = Duration::from_secs_f64(secs);
        }

        if let Some(secs) = overrides.grace_time_seconds {
            let secs = clamp_f64("graceTimeSeconds", secs, GRACE_TIME_BOUNDS)?;
            merged.grace_time = Duration::from_secs_f64(secs);
        }

        if let Some(auto_shorten) = overrides.auto_shorten {
            merged.auto_shorten = auto_shorten;
        }

        if let Some(concurrency) = overrides.concurrency {
            merged.concurrency =
                clamp_ord("concurrency", concurrency, CONCURRENCY_BOUNDS);
        }

        if let Some(ms) = overrides.stagger_delay_ms {
            let ms = clamp_ord("staggerDelayMs", ms, STAGGER_DELAY_BOUNDS);
            merged.stagger_delay = Duration::from_millis(ms);
        }

        if let Some(factor) = overrides.overhead_compensation_factor {
            merged.overhead_compensation_factor =
                clamp_f64("overheadCompensationFactor", factor, OVERHEAD_BOUNDS)?;
        }

        if let Some(bytes) = overrides.min_chunk_bytes {
            merged.min_chunk_bytes =
                clamp_ord("minChunkBytes", bytes, CHUNK_BOUNDS);
        }

        if let Some(bytes) = overrides.max_chunk_bytes {
            merged.max_chunk_bytes =
                clamp_ord("maxChunkBytes", bytes, CHUNK_BOUNDS);
        }

        if let Some(count) = overrides.ping_probe_count {
            merged.ping_probe_count =
                clamp_ord("pingProbeCount", count, PING_PROBE_BOUNDS);
        }

        if let Some(fraction) = overrides.top_fraction {
            merged.top_fraction =
                clamp_f64("topFraction", fraction, TOP_FRACTION_BOUNDS)?;
        }

        merged.validate()?;

        Ok(merged)
    }

    /// Cross-field checks that clamping cannot repair.
    fn validate(&self) -> Result<(), SpeedTestError> {
        if self.min_chunk_bytes > self.max_chunk_bytes {
            return Err(SpeedTestError::config(format!(
                "minChunkBytes ({}) must not exceed maxChunkBytes ({})",
                self.min_chunk_bytes, self.max_chunk_bytes
            )));
        }

        if self.grace_time >= self.max_duration {
            return Err(SpeedTestError::config(format!(
                "graceTimeSeconds ({:.2}) must be shorter than \
                 maxDurationSeconds ({:.2})",
                self.grace_time.as_secs_f64(),
                self.max_duration.as_secs_f64()
            )));
        }

        Ok(())
    }
}

/// Recognized configuration options. Every field is optional; unset fields
/// keep the value of the snapshot they are merged into.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsOverrides {
    pub max_duration_seconds: Option<f64>,
    pub grace_time_seconds: Option<f64>,
    pub auto_shorten: Option<bool>,
    pub concurrency: Option<usize>,
    pub stagger_delay_ms: Option<u64>,
    pub overhead_compensation_factor: Option<f64>,
    pub min_chunk_bytes: Option<u64>,
    pub max_chunk_bytes: Option<u64>,
    pub ping_probe_count: Option<usize>,
    pub top_fraction: Option<f64>,
}

impl SettingsOverrides {
    /// Parse overrides from a JSON object.
    pub fn from_json(text: &str) -> Result<Self, SpeedTestError> {
        serde_json::from_str(text).map_err(|e| {
            SpeedTestError::config(format!("invalid settings: {}", e))
                .with_source(e)
        })
    }

    /// Read overrides from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, SpeedTestError> {
        let text = fs::read_to_string(path).map_err(|e| {
            SpeedTestError::config(format!(
                "cannot read settings file {}: {}",
                path.display(),
                e
            ))
            .with_source(e)
        })?;

        Self::from_json(&text)
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn layered(self, other: SettingsOverrides) -> Self {
        Self {
            max_duration_seconds: other
                .max_duration_seconds
                .or(self.max_duration_seconds),
            grace_time_seconds: other.grace_time_seconds.or(self.grace_time_seconds),
            auto_shorten: other.auto_shorten.or(self.auto_shorten),
            concurrency: other.concurrency.or(self.concurrency),
            stagger_delay_ms: other.stagger_delay_ms.or(self.stagger_delay_ms),
            overhead_compensation_factor: other
                .overhead_compensation_factor
                .or(self.overhead_compensation_factor),
            min_chunk_bytes: other.min_chunk_bytes.or(self.min_chunk_bytes),
            max_chunk_bytes: other.max_chunk_bytes.or(self.max_chunk_bytes),
            ping_probe_count: other.ping_probe_count.or(self.ping_probe_count),
            top_fraction: other.top_fraction.or(self.top_fraction),
        }
    }
}

fn clamp_f64(
    name: &str,
    value: f64,
    (min, max): (f64, f64),
) -> Result<f64, SpeedTestError> {
    if !value.is_finite() {
        return Err(SpeedTestError::config(format!(
            "{} must be a finite number, got {}",
            name, value
        )));
    }

    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{} = {} is outside [{}, {}], using {}", name, value, min, max, clamped);
    }

    Ok(clamped)
}

fn clamp_ord<T>(name: &str, value: T, (min, max): (T, T)) -> T
where
    T: Ord + Copy + std::fmt::Display,
{
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{} = {} is outside [{}, {}], using {}", name, value, min, max, clamped);
    }

    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_duration, Duration::from_secs(15));
        assert_eq!(settings.grace_time, Duration::from_millis(300));
        assert!(settings.auto_shorten);
        assert_eq!(settings.concurrency, 16);
        assert_eq!(settings.stagger_delay, Duration::from_millis(30));
        assert!((settings.overhead_compensation_factor - 1.08).abs() < 1e-9);
        assert_eq!(settings.ping_probe_count, 10);
    }

    #[test]
    fn test_merge_empty_overrides_is_identity() {
        let settings = Settings::default();
        let merged = settings.merge(&SettingsOverrides::default()).unwrap();
        assert_eq!(merged, settings);
    }

    #[test]
    fn test_merge_applies_recognized_options() {
        let overrides = SettingsOverrides {
            max_duration_seconds: Some(10.0),
            grace_time_seconds: Some(1.0),
            auto_shorten: Some(false),
            concurrency: Some(4),
            stagger_delay_ms: Some(0),
            ping_probe_count: Some(5),
            ..Default::default()
        };

        let merged = Settings::default().merge(&overrides).unwrap();
        assert_eq!(merged.max_duration, Duration::from_secs(10));
        assert_eq!(merged.grace_time, Duration::from_secs(1));
        assert!(!merged.auto_shorten);
        assert_eq!(merged.concurrency, 4);
        assert_eq!(merged.stagger_delay, Duration::ZERO);
        assert_eq!(merged.ping_probe_count, 5);
    }

    #[test]
    fn test_merge_clamps_out_of_range_values() {
        let overrides = SettingsOverrides {
            concurrency: Some(500),
            overhead_compensation_factor: Some(0.5),
            ping_probe_count: Some(1),
            top_fraction: Some(2.0),
            ..Default::default()
        };

        let merged = Settings::default().merge(&overrides).unwrap();
        assert_eq!(merged.concurrency, 32);
        assert_eq!(merged.overhead_compensation_factor, 1.0);
        assert_eq!(merged.ping_probe_count, 2);
        assert_eq!(merged.top_fraction, 1.0);
    }

    #[test]
    fn test_merge_rejects_non_finite() {
        let overrides = SettingsOverrides {
            overhead_compensation_factor: Some(f64::NAN),
            ..Default::default()
        };

        let err = Settings::default().merge(&overrides).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message.contains("overheadCompensationFactor"));
    }

    #[test]
    fn test_merge_rejects_inverted_chunk_range() {
        let overrides = SettingsOverrides {
            min_chunk_bytes: Some(4 * MIB),
            max_chunk_bytes: Some(2 * MIB),
            ..Default::default()
        };

        let err = Settings::default().merge(&overrides).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn test_merge_rejects_grace_longer_than_duration() {
        let overrides = SettingsOverrides {
            max_duration_seconds: Some(2.0),
            grace_time_seconds: Some(5.0),
            ..Default::default()
        };

        let err = Settings::default().merge(&overrides).unwrap_err();
        assert!(err.message.contains("graceTimeSeconds"));
    }

    #[test]
    fn test_overrides_from_json_camel_case() {
        let overrides = SettingsOverrides::from_json(
            r#"{"maxDurationSeconds": 8, "autoShorten": false, "concurrency": 6}"#,
        )
        .unwrap();

        assert_eq!(overrides.max_duration_seconds, Some(8.0));
        assert_eq!(overrides.auto_shorten, Some(false));
        assert_eq!(overrides.concurrency, Some(6));
        assert_eq!(overrides.grace_time_seconds, None);
    }

    #[test]
    fn test_overrides_from_json_rejects_unknown_keys() {
        let err = SettingsOverrides::from_json(r#"{"url_dl": "x"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn test_layered_prefers_later_source() {
        let file = SettingsOverrides {
            concurrency: Some(4),
            ping_probe_count: Some(20),
            ..Default::default()
        };
        let cli = SettingsOverrides {
            concurrency: Some(8),
            ..Default::default()
        };

        let layered = file.layered(cli);
        assert_eq!(layered.concurrency, Some(8));
        assert_eq!(layered.ping_probe_count, Some(20));
    }
}
