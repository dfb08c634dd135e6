//! Result data structures for speed test output.
//!
//! Everything here implements Serialize for JSON output. A failed run is
//! reported through [`FailureReport`], never as a result with zero speeds.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::SpeedTestError;
use crate::measurements::duration_ms;
use crate::speedtest::engine::{CompletedPhases, SpeedTestOutput};
use crate::speedtest::ping::PingResult;
use crate::speedtest::session::BandwidthResult;

/// Complete results from a speed test run.
///
/// # Example
/// ```ignore
/// let results = SpeedTestResults::from_engine_output(&output, server);
/// let json = serde_json::to_string_pretty(&results)?;
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct SpeedTestResults {
    /// Timestamp when the test was completed
    pub timestamp: DateTime<Utc>,
    /// Speed server base URL
    pub server: String,
    pub ping: PingResults,
    pub download: BandwidthResults,
    pub upload: BandwidthResults,
}

impl SpeedTestResults {
    /// Create SpeedTestResults from engine output.
    pub fn from_engine_output(
        output: &SpeedTestOutput,
        server: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            server: server.into(),
            ping: PingResults::from_engine(&output.ping),
            download: BandwidthResults::from_engine(&output.download),
            upload: BandwidthResults::from_engine(&output.upload),
        }
    }
}

/// Latency measurement results.
#[derive(Debug, Clone, Serialize)]
pub struct PingResults {
    /// Minimum round trip in milliseconds
    pub ping_ms: f64,
    /// Smoothed round-trip variation in milliseconds
    pub jitter_ms: f64,
    /// Probes that completed
    pub probes: usize,
}

impl PingResults {
    pub fn from_engine(engine: &PingResult) -> Self {
        Self {
            ping_ms: engine.ping_ms,
            jitter_ms: engine.jitter_ms,
            probes: engine.probes,
        }
    }
}

/// Bandwidth measurement results (download or upload).
#[derive(Debug, Clone, Serialize)]
pub struct BandwidthResults {
    /// Final speed in Mbps, overhead compensation included
    pub speed_mbps: f64,
    /// Post-grace speed samples the estimate was reduced from
    pub samples: usize,
    /// Post-grace payload bytes
    pub bytes: u64,
    /// Measured interval in milliseconds
    pub duration_ms: f64,
    /// Concurrent streams used
    pub streams: usize,
    /// Whether auto-shortening ended the phase early
    pub early_terminated: bool,
}

impl BandwidthResults {
    pub fn from_engine(engine: &BandwidthResult) -> Self {
        Self {
            speed_mbps: engine.speed_mbps,
            samples: engine.samples,
            bytes: engine.bytes,
            duration_ms: duration_ms(engine.duration),
            streams: engine.streams,
            early_terminated: engine.early_terminated,
        }
    }
}

/// JSON body written when a run does not complete.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub timestamp: DateTime<Utc>,
    pub server: String,
    /// Phase that failed, absent for errors raised before any phase ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Stable error identifier, e.g. `no_data` or `aborted`
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Set when ping finished before the failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingResults>,
    /// Set when download finished before the failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<BandwidthResults>,
}

impl FailureReport {
    pub fn from_error(error: &SpeedTestError, server: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            server: server.into(),
            phase: error.phase.map(|phase| phase.to_string()),
            kind: error.kind.as_str().to_string(),
            message: error.message.clone(),
            suggestion: error.suggestion.clone(),
            ping: None,
            download: None,
        }
    }

    /// Attach the results of phases that finished before the failure.
    pub fn with_completed(mut self, completed: &CompletedPhases) -> Self {
        self.ping = completed.ping.as_ref().map(PingResults::from_engine);
        self.download = completed.download.as_ref().map(BandwidthResults::from_engine);
        self
    }
}
