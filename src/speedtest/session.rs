//! Per-phase run state.
//!
//! A [`TestSession`] is owned by exactly one task, the collector in
//! [`super::scheduler`]. Workers never touch it; they send samples over a
//! channel and read the deadline it publishes.
//!
//! Each speed sample is the sum of the per-stream rates, every stream
//! measured over its own completed interval. Dividing total completed bytes
//! by the elapsed time instead would count the time spent on chunks still in
//! flight but not their bytes, which reads low by up to one chunk per stream.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info};
use tokio::time::Instant;

use super::aggregate::SpeedAggregator;
use super::deadline::{AdaptiveDeadlineController, BonusPolicy};
use super::grace::{GraceDecision, GraceWindowFilter};
use super::progress::ProgressUpdate;
use super::{TestMode, TransferSample};
use crate::errors::SpeedTestError;
use crate::measurements::calculate_speed_mbps;
use crate::settings::Settings;

/// Outcome of a completed download or upload phase.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthResult {
    /// Aggregated speed with overhead compensation applied.
    pub speed_mbps: f64,
    /// Post-grace speed samples the estimate was reduced from.
    pub samples: usize,
    /// Post-grace bytes.
    pub bytes: u64,
    /// Measured interval, from the grace reset to the last sample.
    pub duration: Duration,
    pub streams: usize,
    /// True when auto-shortening ended the phase before the max duration.
    pub early_terminated: bool,
}

/// Post-origin accounting for one stream.
#[derive(Debug, Clone, Copy)]
struct StreamWindow {
    bytes: u64,
    /// Origin, or the stream's first chunk start if that came later.
    start: Instant,
    last_completed: Instant,
    last_chunk: Duration,
}

impl StreamWindow {
    /// How long a stream may go without reporting before the silence counts
    /// against its rate, in multiples of its last chunk's duration.
    const STALL_FACTOR: u32 = 2;

    fn new(origin: Instant, sample: &TransferSample) -> Self {
        Self {
            bytes: 0,
            start: origin.max(sample.started_at),
            last_completed: sample.completed_at,
            last_chunk: Duration::ZERO,
        }
    }

    fn record(&mut self, sample: &TransferSample, bytes: u64) {
        self.bytes += bytes;
        self.last_completed = self.last_completed.max(sample.completed_at);
        self.last_chunk = sample.completed_at.saturating_duration_since(sample.started_at);
    }

    /// Rate at `now`. A stream that has been silent for longer than
    /// [`Self::STALL_FACTOR`] chunk durations is charged for the excess.
    fn mbps_at(&self, now: Instant) -> f64 {
        let stall_cutoff = now
            .checked_sub(self.last_chunk * Self::STALL_FACTOR)
            .unwrap_or(self.start);
        let end = self.last_completed.max(stall_cutoff);

        calculate_speed_mbps(self.bytes, end.saturating_duration_since(self.start))
    }
}

#[derive(Debug)]
pub struct TestSession {
    mode: TestMode,
    streams: usize,
    phase_start: Instant,
    origin: Instant,
    grace: GraceWindowFilter,
    deadline: AdaptiveDeadlineController,
    aggregator: SpeedAggregator,
    overhead_factor: f64,
    samples: Vec<TransferSample>,
    cumulative_bytes: u64,
    speed_samples_mbps: Vec<f64>,
    streams_by_worker: HashMap<usize, StreamWindow>,
    /// Bonus accrues only once every stream has been launched.
    ramp_end: Instant,
    last_incorporated: Option<Instant>,
    finished_at: Option<Instant>,
}

impl TestSession {
    pub fn new(mode: TestMode, settings: &Settings, phase_start: Instant) -> Self {
        let streams = mode.stream_count(settings);
        let last_launch = settings
            .stagger_delay
            .saturating_mul(streams.saturating_sub(1) as u32);

        Self {
            mode,
            streams,
            phase_start,
            origin: phase_start,
            grace: GraceWindowFilter::new(settings.grace_time),
            deadline: AdaptiveDeadlineController::new(
                BonusPolicy::for_mode(mode),
                settings.max_duration,
                settings.auto_shorten,
            ),
            aggregator: SpeedAggregator::from_settings(settings),
            overhead_factor: settings.overhead_compensation_factor,
            samples: Vec::new(),
            cumulative_bytes: 0,
            speed_samples_mbps: Vec::new(),
            streams_by_worker: HashMap::new(),
            ramp_end: phase_start + last_launch,
            last_incorporated: None,
            finished_at: None,
        }
    }

    pub fn mode(&self) -> TestMode {
        self.mode
    }

    /// Every sample received, including warm-up and late ones.
    pub fn samples(&self) -> &[TransferSample] {
        &self.samples
    }

    pub fn cumulative_bytes(&self) -> u64 {
        self.cumulative_bytes
    }

    pub fn speed_samples(&self) -> &[f64] {
        &self.speed_samples_mbps
    }

    pub fn grace_elapsed(&self) -> bool {
        self.grace.has_elapsed()
    }

    pub fn bonus(&self) -> Duration {
        self.deadline.bonus()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// The instant workers must stop starting new chunks.
    pub fn deadline(&self) -> Instant {
        match self.finished_at {
            Some(at) => at,
            None => self.origin + self.deadline.remaining(),
        }
    }

    /// Log `sample` and, if it counts, fold it into the estimate.
    ///
    /// Returns a progress snapshot for every incorporated sample.
    pub fn record(&mut self, sample: TransferSample) -> Option<ProgressUpdate> {
        self.samples.push(sample);

        if self.finished_at.is_some() {
            return None;
        }

        let since_start = sample.completed_at.saturating_duration_since(self.phase_start);

        match self.grace.observe(since_start, self.cumulative_bytes) {
            GraceDecision::WarmUp => {
                self.cumulative_bytes += sample.bytes;
                None
            }
            GraceDecision::Reset => {
                debug!(
                    "{}: grace elapsed after {:?}, discarding {} warm-up bytes",
                    self.mode, since_start, self.cumulative_bytes
                );
                self.origin = sample.completed_at;
                self.cumulative_bytes = 0;
                self.speed_samples_mbps.clear();
                self.streams_by_worker.clear();
                self.deadline.reset();
                None
            }
            GraceDecision::Include => self.incorporate(sample),
        }
    }

    fn incorporate(&mut self, sample: TransferSample) -> Option<ProgressUpdate> {
        let elapsed = sample.completed_at.saturating_duration_since(self.origin);
        if elapsed.is_zero() {
            return None;
        }

        let bytes = sample.bytes_after(self.origin);
        self.cumulative_bytes += bytes;
        self.last_incorporated = Some(sample.completed_at);

        let origin = self.origin;
        self.streams_by_worker
            .entry(sample.worker_id)
            .or_insert_with(|| StreamWindow::new(origin, &sample))
            .record(&sample, bytes);

        let mbps = self.aggregate_mbps(sample.completed_at);
        if sample.completed_at >= self.ramp_end {
            self.deadline.update(elapsed, mbps);
        } else {
            self.deadline.hold(elapsed);
        }
        self.speed_samples_mbps.push(mbps);

        if self.deadline.is_expired(elapsed) {
            info!(
                "{}: finishing after {:.2}s with {:.2}s bonus",
                self.mode,
                elapsed.as_secs_f64(),
                self.deadline.bonus().as_secs_f64()
            );
            self.finished_at = Some(sample.completed_at);
        }

        Some(ProgressUpdate::transfer(
            self.mode.phase(),
            self.deadline.progress(elapsed),
            mbps * self.overhead_factor,
        ))
    }

    fn aggregate_mbps(&self, now: Instant) -> f64 {
        self.streams_by_worker
            .values()
            .map(|stream| stream.mbps_at(now))
            .sum()
    }

    /// Reduce the post-grace history to the phase result.
    pub fn finish(&self) -> Result<BandwidthResult, SpeedTestError> {
        if !self.grace.has_elapsed() || self.cumulative_bytes == 0 {
            return Err(SpeedTestError::no_data(self.mode.phase()));
        }

        let speed_mbps = self
            .aggregator
            .reduce(&self.speed_samples_mbps)
            .map_err(|e| e.in_phase(self.mode.phase()))?;

        let duration = self
            .last_incorporated
            .map(|at| at.saturating_duration_since(self.origin))
            .unwrap_or_default();

        let early_terminated = self
            .finished_at
            .is_some_and(|at| at < self.origin + self.deadline.max_duration());

        Ok(BandwidthResult {
            speed_mbps,
            samples: self.speed_samples_mbps.len(),
            bytes: self.cumulative_bytes,
            duration,
            streams: self.streams,
            early_terminated,
        })
    }
}
