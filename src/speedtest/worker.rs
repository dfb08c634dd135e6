//! A single transfer stream.
//!
//! Each worker staggers its start, then moves chunks back to back until the
//! session deadline passes or an abort is requested. Chunk sizes adapt to
//! the throughput of the previous chunk. Failures are retried locally with
//! backoff; a worker that runs out of retries stops on its own without
//! affecting the others.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

use super::payload::PayloadPool;
use super::{AbortSignal, TestMode, TransferError, TransferSample, Transport};
use crate::errors::ErrorKind;
use crate::measurements::calculate_speed_mbps;
use crate::retry::RetryPolicy;
use crate::settings::Settings;

/// A stream faster than this grows its next chunk.
pub const FAST_STREAM_THRESHOLD_MBPS: f64 = 25.0;

/// Shrink factor applied after a slow chunk.
pub const CHUNK_DECAY_FACTOR: f64 = 0.9;

/// Chunk sizing rule for one phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkPolicy {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub growth: f64,
    pub decay: f64,
    pub fast_threshold_mbps: f64,
}

impl ChunkPolicy {
    pub fn for_mode(mode: TestMode, settings: &Settings) -> Self {
        let growth = match mode {
            TestMode::Download => 1.3,
            TestMode::Upload => 1.2,
        };

        Self {
            min_bytes: settings.min_chunk_bytes,
            max_bytes: settings.max_chunk_bytes,
            growth,
            decay: CHUNK_DECAY_FACTOR,
            fast_threshold_mbps: FAST_STREAM_THRESHOLD_MBPS,
        }
    }

    pub fn initial(&self) -> u64 {
        self.min_bytes
    }

    /// Size of the chunk following one of `current` bytes that ran at
    /// `last_mbps`.
    pub fn next(&self, current: u64, last_mbps: f64) -> u64 {
        let factor = if last_mbps > self.fast_threshold_mbps {
            self.growth
        } else {
            self.decay
        };

        ((current as f64 * factor).round() as u64)
            .clamp(self.min_bytes, self.max_bytes)
    }

    pub fn after_failure(&self) -> u64 {
        self.min_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Staggering,
    Active,
    Done,
}

/// What a worker moves.
#[derive(Debug, Clone)]
pub enum Direction {
    Download,
    Upload(PayloadPool),
}

impl Direction {
    pub fn mode(&self) -> TestMode {
        match self {
            Direction::Download => TestMode::Download,
            Direction::Upload(_) => TestMode::Upload,
        }
    }
}

/// Everything the workers of one phase share.
pub struct WorkerContext<T: Transport> {
    pub direction: Direction,
    pub transport: Arc<T>,
    pub chunks: ChunkPolicy,
    pub retry: RetryPolicy,
    pub stagger: Duration,
    pub deadline: watch::Receiver<Instant>,
    pub abort: AbortSignal,
    pub samples: mpsc::UnboundedSender<TransferSample>,
}

impl<T: Transport> Clone for WorkerContext<T> {
    fn clone(&self) -> Self {
        Self {
            direction: self.direction.clone(),
            transport: Arc::clone(&self.transport),
            chunks: self.chunks,
            retry: self.retry.clone(),
            stagger: self.stagger,
            deadline: self.deadline.clone(),
            abort: self.abort.clone(),
            samples: self.samples.clone(),
        }
    }
}

/// Totals for one worker, returned when it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub id: usize,
    pub chunks: u64,
    pub bytes: u64,
    pub failures: u32,
    /// Stopped early because consecutive failures used up the retry budget.
    pub exhausted: bool,
}

pub struct TransferWorker<T: Transport> {
    id: usize,
    ctx: WorkerContext<T>,
    state: WorkerState,
}

impl<T: Transport> TransferWorker<T> {
    pub fn new(id: usize, ctx: WorkerContext<T>) -> Self {
        Self { id, ctx, state: WorkerState::Idle }
    }

    fn transition(&mut self, next: WorkerState) {
        trace!(
            "{} worker {}: {:?} -> {:?}",
            self.ctx.direction.mode(),
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    fn before_deadline(&self) -> bool {
        Instant::now() < *self.ctx.deadline.borrow()
    }

    /// Sleep for `delay`, returning false if an abort arrived first.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.ctx.abort.is_aborted();
        }

        tokio::select! {
            _ = sleep(delay) => true,
            _ = self.ctx.abort.aborted() => false,
        }
    }

    pub async fn run(mut self) -> WorkerReport {
        let mut report = WorkerReport { id: self.id, ..Default::default() };

        self.transition(WorkerState::Staggering);
        let offset = self.ctx.stagger.saturating_mul(self.id as u32);
        if !self.pause(offset).await {
            self.transition(WorkerState::Done);
            return report;
        }

        self.transition(WorkerState::Active);

        let mut chunk = self.ctx.chunks.initial();
        let mut consecutive_failures = 0u32;

        while !self.ctx.abort.is_aborted() && self.before_deadline() {
            let started_at = Instant::now();

            match self.transfer(chunk).await {
                Ok(bytes) => {
                    let completed_at = Instant::now();
                    consecutive_failures = 0;
                    report.chunks += 1;
                    report.bytes += bytes;

                    let sample = TransferSample {
                        worker_id: self.id,
                        bytes,
                        started_at,
                        completed_at,
                        cumulative_bytes: report.bytes,
                    };
                    if self.ctx.samples.send(sample).is_err() {
                        break;
                    }

                    let mbps =
                        calculate_speed_mbps(bytes, completed_at - started_at);
                    chunk = self.ctx.chunks.next(chunk, mbps);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    report.failures += 1;

                    if self.ctx.retry.is_exhausted(consecutive_failures) {
                        warn!(
                            "{} worker {}: giving up after {} consecutive failures: {}",
                            self.ctx.direction.mode(),
                            self.id,
                            consecutive_failures,
                            e
                        );
                        report.exhausted = true;
                        break;
                    }

                    let delay = self
                        .ctx
                        .retry
                        .delay_for_attempt(consecutive_failures - 1);
                    debug!(
                        "{} worker {}: chunk of {} bytes failed ({}), retrying in {:?}",
                        self.ctx.direction.mode(),
                        self.id,
                        chunk,
                        e,
                        delay
                    );

                    chunk = self.ctx.chunks.after_failure();
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }

        self.transition(WorkerState::Done);
        report
    }

    async fn transfer(&self, chunk: u64) -> Result<u64, TransferError> {
        let bytes = match &self.ctx.direction {
            Direction::Download => self.ctx.transport.request_chunk(chunk).await?,
            Direction::Upload(payload) => {
                let body = payload.chunk(chunk);
                let len = body.len() as u64;
                self.ctx.transport.send_chunk(body).await?;
                len
            }
        };

        if bytes == 0 {
            return Err(TransferError::new(
                ErrorKind::Api,
                "server returned an empty body",
            ));
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedtest::testing::SimulatedTransport;
    use crate::speedtest::AbortHandle;

    fn policy() -> ChunkPolicy {
        ChunkPolicy {
            min_bytes: 1000,
            max_bytes: 4000,
            growth: 1.3,
            decay: 0.9,
            fast_threshold_mbps: 25.0,
        }
    }

    #[test]
    fn test_chunk_grows_on_fast_stream() {
        let policy = policy();
        assert_eq!(policy.initial(), 1000);
        assert_eq!(policy.next(1000, 100.0), 1300);
        assert_eq!(policy.next(3500, 100.0), 4000);
    }

    #[test]
    fn test_chunk_decays_on_slow_stream() {
        let policy = policy();
        assert_eq!(policy.next(2000, 5.0), 1800);
        assert_eq!(policy.next(1050, 5.0), 1000);
        assert_eq!(policy.after_failure(), 1000);
    }

    #[test]
    fn test_chunk_policy_per_mode() {
        let settings = Settings::default();
        let download = ChunkPolicy::for_mode(TestMode::Download, &settings);
        let upload = ChunkPolicy::for_mode(TestMode::Upload, &settings);

        assert_eq!(download.growth, 1.3);
        assert_eq!(upload.growth, 1.2);
        assert_eq!(download.min_bytes, settings.min_chunk_bytes);
        assert_eq!(upload.max_bytes, settings.max_chunk_bytes);
    }

    fn context(
        transport: SimulatedTransport,
        direction: Direction,
        run_for: Duration,
        abort: &AbortHandle,
    ) -> (
        WorkerContext<SimulatedTransport>,
        watch::Sender<Instant>,
        mpsc::UnboundedReceiver<TransferSample>,
    ) {
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + run_for);
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();

        let ctx = WorkerContext {
            direction,
            transport: Arc::new(transport),
            chunks: policy(),
            retry: RetryPolicy::new(3, 100, 1000),
            stagger: Duration::from_millis(30),
            deadline: deadline_rx,
            abort: abort.signal(),
            samples: samples_tx,
        };

        (ctx, deadline_tx, samples_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_at_deadline() {
        let abort = AbortHandle::new();
        let (ctx, _deadline, mut samples) = context(
            SimulatedTransport::constant(8.0),
            Direction::Download,
            Duration::from_secs(1),
            &abort,
        );
        let start = Instant::now();

        let report = TransferWorker::new(0, ctx).run().await;

        assert!(report.chunks > 0);
        assert!(!report.exhausted);
        // The last 1 ms chunk may start just before the deadline
        assert!(start.elapsed() < Duration::from_millis(1010));

        let mut previous = 0;
        let mut count = 0;
        while let Ok(sample) = samples.try_recv() {
            assert!(sample.cumulative_bytes > previous);
            assert!(sample.completed_at >= sample.started_at);
            previous = sample.cumulative_bytes;
            count += 1;
        }
        assert_eq!(count, report.chunks);
        assert_eq!(previous, report.bytes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_staggers_start() {
        let abort = AbortHandle::new();
        let (ctx, _deadline, mut samples) = context(
            SimulatedTransport::constant(8.0),
            Direction::Download,
            Duration::from_millis(200),
            &abort,
        );
        let start = Instant::now();

        TransferWorker::new(3, ctx).run().await;

        let first = samples.try_recv().unwrap();
        assert_eq!(first.worker_id, 3);
        assert!(first.started_at - start >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_exhausts_retries() {
        let abort = AbortHandle::new();
        let (ctx, _deadline, mut samples) = context(
            SimulatedTransport::failing(),
            Direction::Download,
            Duration::from_secs(30),
            &abort,
        );

        let report = TransferWorker::new(0, ctx).run().await;

        assert!(report.exhausted);
        assert_eq!(report.failures, 4);
        assert_eq!(report.bytes, 0);
        assert!(samples.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_treats_empty_body_as_failure() {
        let abort = AbortHandle::new();
        let (ctx, _deadline, _samples) = context(
            SimulatedTransport::empty(),
            Direction::Download,
            Duration::from_secs(30),
            &abort,
        );

        let report = TransferWorker::new(0, ctx).run().await;
        assert!(report.exhausted);
        assert_eq!(report.chunks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_worker_sends_payload_slices() {
        let abort = AbortHandle::new();
        let (ctx, _deadline, mut samples) = context(
            SimulatedTransport::constant(8.0),
            Direction::Upload(PayloadPool::new(4000)),
            Duration::from_millis(100),
            &abort,
        );

        let report = TransferWorker::new(0, ctx).run().await;
        assert!(report.chunks > 0);

        let first = samples.try_recv().unwrap();
        assert_eq!(first.bytes, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_on_abort() {
        let abort = AbortHandle::new();
        let (ctx, _deadline, _samples) = context(
            SimulatedTransport::constant(8.0),
            Direction::Download,
            Duration::from_secs(60),
            &abort,
        );
        let start = Instant::now();

        let handle = tokio::spawn(TransferWorker::new(0, ctx).run());
        sleep(Duration::from_millis(500)).await;
        abort.abort();

        let report = handle.await.unwrap();
        assert!(report.chunks > 0);
        assert!(start.elapsed() < Duration::from_millis(510));
    }
}
