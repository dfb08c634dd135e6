//! Worker pool for one transfer phase.
//!
//! The pool spawns the workers, then turns into the single writer of the
//! phase's [`TestSession`]: samples arrive over an unbounded channel in
//! whatever order the workers finish, and every update to the deadline is
//! published back through a watch channel.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::payload::PayloadPool;
use super::progress::{ProgressCallback, ProgressEvent};
use super::session::{BandwidthResult, TestSession};
use super::worker::{ChunkPolicy, Direction, TransferWorker, WorkerContext, WorkerReport};
use super::{AbortSignal, TestMode, TransferSample, Transport};
use crate::errors::SpeedTestError;
use crate::settings::Settings;

pub struct WorkerPool<T: Transport> {
    transport: Arc<T>,
    settings: Settings,
    abort: AbortSignal,
}

impl<T: Transport> WorkerPool<T> {
    pub fn new(transport: Arc<T>, settings: Settings, abort: AbortSignal) -> Self {
        Self { transport, settings, abort }
    }

    /// Run one download or upload phase to completion.
    ///
    /// Waits for every worker before aggregating. An abort returns
    /// immediately; workers still in flight finish their current chunk and
    /// exit on their own.
    pub async fn run(
        &self,
        mode: TestMode,
        progress: &dyn ProgressCallback,
    ) -> Result<BandwidthResult, SpeedTestError> {
        let mut session = TestSession::new(mode, &self.settings, Instant::now());
        let (deadline_tx, deadline_rx) = watch::channel(session.deadline());
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();

        let direction = match mode {
            TestMode::Download => Direction::Download,
            TestMode::Upload => {
                let pool = PayloadPool::new(self.settings.max_chunk_bytes);
                debug!("{}: generated {} byte payload", mode, pool.capacity());
                Direction::Upload(pool)
            }
        };

        let ctx = WorkerContext {
            direction,
            transport: Arc::clone(&self.transport),
            chunks: ChunkPolicy::for_mode(mode, &self.settings),
            retry: self.settings.retry.clone(),
            stagger: self.settings.stagger_delay,
            deadline: deadline_rx,
            abort: self.abort.clone(),
            samples: samples_tx,
        };

        let streams = mode.stream_count(&self.settings);
        info!("{}: launching {} streams", mode, streams);

        let handles: Vec<_> = (0..streams)
            .map(|id| tokio::spawn(TransferWorker::new(id, ctx.clone()).run()))
            .collect();

        // Only the workers hold senders now; the channel closes when the
        // last one exits.
        drop(ctx);

        collect(&mut session, samples_rx, &deadline_tx, &self.abort, progress)
            .await?;

        debug!(
            "{}: {} samples received, {} after grace ({} bytes), \
             grace elapsed: {}, shortened: {}, bonus {:.2}s",
            mode,
            session.samples().len(),
            session.speed_samples().len(),
            session.cumulative_bytes(),
            session.grace_elapsed(),
            session.is_finished(),
            session.bonus().as_secs_f64()
        );

        let reports: Vec<WorkerReport> = join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("{}: worker task failed: {}", mode, e);
                    None
                }
            })
            .collect();

        log_reports(mode, &reports);

        let result = session.finish()?;
        info!(
            "{}: {:.2} Mbps from {} samples ({} bytes in {:.2}s)",
            mode,
            result.speed_mbps,
            result.samples,
            result.bytes,
            result.duration.as_secs_f64()
        );

        Ok(result)
    }
}

/// Drain `samples` into `session` until every sender is gone.
///
/// Publishes the session deadline after each sample and reports progress
/// for each incorporated one. Returns as soon as `abort` fires.
pub(crate) async fn collect(
    session: &mut TestSession,
    mut samples: mpsc::UnboundedReceiver<TransferSample>,
    deadline: &watch::Sender<Instant>,
    abort: &AbortSignal,
    progress: &dyn ProgressCallback,
) -> Result<(), SpeedTestError> {
    loop {
        tokio::select! {
            biased;

            _ = abort.aborted() => {
                info!("{}: aborted", session.mode());
                return Err(SpeedTestError::aborted().in_phase(session.mode().phase()));
            }
            next = samples.recv() => match next {
                Some(sample) => {
                    if let Some(update) = session.record(sample) {
                        progress.on_progress(ProgressEvent::Progress(update));
                    }
                    deadline.send_replace(session.deadline());
                }
                None => return Ok(()),
            },
        }
    }
}

fn log_reports(mode: TestMode, reports: &[WorkerReport]) {
    for report in reports {
        debug!(
            "{} worker {}: {} chunks, {} bytes, {} failures{}",
            mode,
            report.id,
            report.chunks,
            report.bytes,
            report.failures,
            if report.exhausted { " (gave up)" } else { "" }
        );
    }

    let exhausted = reports.iter().filter(|r| r.exhausted).count();
    if exhausted > 0 {
        warn!(
            "{}: {} of {} workers stopped early after repeated failures",
            mode,
            exhausted,
            reports.len()
        );
    }
}
