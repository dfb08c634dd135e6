//! Latency and jitter.
//!
//! Probes are strictly sequential; overlapping them would measure queueing
//! instead of the path. Ping is the minimum round trip. Jitter follows
//! successive round-trip deltas with asymmetric smoothing: increases are
//! picked up quickly, decreases decay slowly.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;

use super::progress::{ProgressCallback, ProgressEvent, ProgressUpdate, TestPhase};
use super::{AbortSignal, Transport};
use crate::errors::SpeedTestError;
use crate::measurements::duration_ms;
use crate::retry::{retry_async, RetryPolicy, RetryResult};

/// Pause between consecutive probes.
pub const INTER_PROBE_DELAY: Duration = Duration::from_millis(100);

/// Weight of the new delta when it exceeds the current jitter.
const RISING_WEIGHT: f64 = 0.7;
/// Weight of the new delta when it is at or below the current jitter.
const FALLING_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingRecord {
    pub sequence: usize,
    pub round_trip_ms: f64,
}

/// Running minimum and jitter over a sequence of round trips.
#[derive(Debug, Clone, Default)]
pub struct JitterTracker {
    min_ms: Option<f64>,
    previous_ms: Option<f64>,
    jitter_ms: Option<f64>,
}

impl JitterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, round_trip_ms: f64) {
        self.min_ms = Some(match self.min_ms {
            Some(min) => min.min(round_trip_ms),
            None => round_trip_ms,
        });

        if let Some(previous) = self.previous_ms {
            let delta = (round_trip_ms - previous).abs();
            self.jitter_ms = Some(match self.jitter_ms {
                None => delta,
                Some(jitter) if delta > jitter => {
                    jitter * (1.0 - RISING_WEIGHT) + delta * RISING_WEIGHT
                }
                Some(jitter) => {
                    jitter * (1.0 - FALLING_WEIGHT) + delta * FALLING_WEIGHT
                }
            });
        }

        self.previous_ms = Some(round_trip_ms);
    }

    pub fn ping_ms(&self) -> Option<f64> {
        self.min_ms
    }

    /// Zero until two round trips have been seen.
    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ms.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    pub ping_ms: f64,
    pub jitter_ms: f64,
    /// Probes that completed.
    pub probes: usize,
    pub records: Vec<PingRecord>,
}

pub struct PingJitterEstimator<T: Transport> {
    transport: Arc<T>,
    retry: RetryPolicy,
    interval: Duration,
    abort: AbortSignal,
}

impl<T: Transport> PingJitterEstimator<T> {
    pub fn new(transport: Arc<T>, retry: RetryPolicy, abort: AbortSignal) -> Self {
        Self { transport, retry, interval: INTER_PROBE_DELAY, abort }
    }

    /// Issue `probe_count` probes one after another.
    ///
    /// A probe that still fails after retries is skipped. Fails with
    /// no-data only when every probe failed.
    pub async fn measure(
        &self,
        probe_count: usize,
        progress: &dyn ProgressCallback,
    ) -> Result<PingResult, SpeedTestError> {
        let aborted = || SpeedTestError::aborted().in_phase(TestPhase::Ping);
        let mut tracker = JitterTracker::new();
        let mut records = Vec::with_capacity(probe_count);

        for i in 0..probe_count {
            if i > 0 {
                tokio::select! {
                    _ = sleep(self.interval) => {}
                    _ = self.abort.aborted() => return Err(aborted()),
                }
            } else if self.abort.is_aborted() {
                return Err(aborted());
            }

            let name = format!("ping probe {}/{}", i + 1, probe_count);
            let outcome = tokio::select! {
                outcome = retry_async(&self.retry, &name, || self.transport.probe()) => outcome,
                _ = self.abort.aborted() => return Err(aborted()),
            };

            match outcome {
                RetryResult::Success(rtt) => {
                    let round_trip_ms = duration_ms(rtt);
                    tracker.observe(round_trip_ms);
                    records.push(PingRecord { sequence: i, round_trip_ms });
                    debug!("{}: {:.2} ms", name, round_trip_ms);

                    progress.on_progress(ProgressEvent::Progress(ProgressUpdate::ping(
                        (i + 1) as f64 / probe_count as f64,
                        tracker.ping_ms().unwrap_or(round_trip_ms),
                        tracker.jitter_ms(),
                    )));
                }
                RetryResult::Failed { last_error, attempts } => {
                    warn!("{} skipped after {} attempts: {}", name, attempts, last_error);
                }
            }
        }

        let Some(ping_ms) = tracker.ping_ms() else {
            return Err(SpeedTestError::no_data(TestPhase::Ping));
        };

        let result = PingResult {
            ping_ms,
            jitter_ms: tracker.jitter_ms(),
            probes: records.len(),
            records,
        };
        info!(
            "ping: {:.2} ms, jitter: {:.2} ms ({}/{} probes)",
            result.ping_ms, result.jitter_ms, result.probes, probe_count
        );

        Ok(result)
    }
}
