//! Orchestrates a full run: ping, then download, then upload.
//!
//! The sequence halts at the first phase that fails or is aborted; the
//! returned error names that phase and later phases are not attempted.
//! Results of the phases that did finish travel with the error.

use std::sync::Arc;

use log::info;

use super::ping::{PingJitterEstimator, PingResult};
use super::progress::{ProgressCallback, ProgressEvent, TestPhase};
use super::scheduler::WorkerPool;
use super::session::BandwidthResult;
use super::{AbortHandle, TestMode, Transport};
use crate::errors::{format_error_for_display, SpeedTestError};
use crate::settings::Settings;

/// Complete results from a speed test run.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedTestOutput {
    pub ping: PingResult,
    pub download: BandwidthResult,
    pub upload: BandwidthResult,
}

/// Phases a run finished before it stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedPhases {
    pub ping: Option<PingResult>,
    pub download: Option<BandwidthResult>,
}

impl CompletedPhases {
    fn stopped(&self, error: SpeedTestError) -> RunFailure {
        RunFailure { error, completed: self.clone() }
    }
}

/// A run that did not make it through upload.
#[derive(Debug)]
pub struct RunFailure {
    pub error: SpeedTestError,
    pub completed: CompletedPhases,
}

impl From<SpeedTestError> for RunFailure {
    fn from(error: SpeedTestError) -> Self {
        Self { error, completed: CompletedPhases::default() }
    }
}

/// The test engine that orchestrates all network measurements.
///
/// # Example
/// ```ignore
/// let engine = TestEngine::new(Arc::new(transport), Settings::default());
/// let abort = engine.abort_handle();
/// let results = engine.run(&NoProgress).await?;
/// println!("Download: {:.2} Mbps", results.download.speed_mbps);
/// ```
pub struct TestEngine<T: Transport> {
    transport: Arc<T>,
    settings: Settings,
    abort: AbortHandle,
}

impl<T: Transport> TestEngine<T> {
    pub fn new(transport: Arc<T>, settings: Settings) -> Self {
        Self { transport, settings, abort: AbortHandle::new() }
    }

    /// Handle for cancelling the run from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run the complete sequence, reporting through `progress`.
    pub async fn run(
        &self,
        progress: &dyn ProgressCallback,
    ) -> Result<SpeedTestOutput, RunFailure> {
        info!("Starting speed test sequence");
        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Initializing));

        let result = self.run_phases(progress).await;

        match &result {
            Ok(output) => {
                info!(
                    "Speed test complete: ping={:.2} ms, download={:.2} Mbps, upload={:.2} Mbps",
                    output.ping.ping_ms,
                    output.download.speed_mbps,
                    output.upload.speed_mbps
                );
                progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Complete));
                progress.on_progress(ProgressEvent::Complete);
            }
            Err(failure) => {
                info!("Speed test stopped: {}", failure.error.message);
                progress.on_progress(ProgressEvent::Error(format_error_for_display(
                    &failure.error,
                )));
            }
        }

        result
    }

    async fn run_phases(
        &self,
        progress: &dyn ProgressCallback,
    ) -> Result<SpeedTestOutput, RunFailure> {
        let mut completed = CompletedPhases::default();

        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Ping));
        let ping = PingJitterEstimator::new(
            Arc::clone(&self.transport),
            self.settings.retry.clone(),
            self.abort.signal(),
        )
        .measure(self.settings.ping_probe_count, progress)
        .await
        .map_err(|e| completed.stopped(e.in_phase(TestPhase::Ping)))?;
        progress.on_progress(ProgressEvent::PhaseComplete {
            phase: TestPhase::Ping,
            value: ping.ping_ms,
        });
        completed.ping = Some(ping.clone());

        let pool = WorkerPool::new(
            Arc::clone(&self.transport),
            self.settings.clone(),
            self.abort.signal(),
        );

        let download = self
            .run_transfer(&pool, TestMode::Download, progress)
            .await
            .map_err(|e| completed.stopped(e))?;
        completed.download = Some(download.clone());

        let upload = self
            .run_transfer(&pool, TestMode::Upload, progress)
            .await
            .map_err(|e| completed.stopped(e))?;

        Ok(SpeedTestOutput { ping, download, upload })
    }

    async fn run_transfer(
        &self,
        pool: &WorkerPool<T>,
        mode: TestMode,
        progress: &dyn ProgressCallback,
    ) -> Result<BandwidthResult, SpeedTestError> {
        let phase = mode.phase();
        progress.on_progress(ProgressEvent::PhaseChange(phase));

        let result = pool
            .run(mode, progress)
            .await
            .map_err(|e| e.in_phase(phase))?;

        progress.on_progress(ProgressEvent::PhaseComplete {
            phase,
            value: result.speed_mbps,
        });

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::speedtest::testing::SimulatedTransport;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct PhaseLog {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl PhaseLog {
        fn phases(&self) -> Vec<TestPhase> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    ProgressEvent::PhaseChange(phase) => Some(*phase),
                    _ => None,
                })
                .collect()
        }
    }

    impl ProgressCallback for PhaseLog {
        fn on_progress(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn settings() -> Settings {
        Settings {
            concurrency: 4,
            max_duration: Duration::from_secs(4),
            grace_time: Duration::from_millis(500),
            min_chunk_bytes: 64 * 1024,
            max_chunk_bytes: 512 * 1024,
            ping_probe_count: 3,
            ..Settings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sequences_phases() {
        let transport = SimulatedTransport::constant(50.0)
            .with_probes(&[Some(25.0), Some(20.0), Some(30.0)]);
        let engine = TestEngine::new(Arc::new(transport), settings());
        let log = PhaseLog::default();

        let output = engine.run(&log).await.unwrap();

        assert!((output.ping.ping_ms - 20.0).abs() < 1e-6);
        assert!(output.download.speed_mbps > 0.0);
        assert!(output.upload.speed_mbps > 0.0);
        assert_eq!(
            log.phases(),
            vec![
                TestPhase::Initializing,
                TestPhase::Ping,
                TestPhase::Download,
                TestPhase::Upload,
                TestPhase::Complete,
            ]
        );

        let events = log.events.lock().unwrap();
        assert_eq!(events.last(), Some(&ProgressEvent::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_phase_halts_sequence() {
        let engine =
            TestEngine::new(Arc::new(SimulatedTransport::failing()), settings());
        let log = PhaseLog::default();

        let failure = engine.run(&log).await.unwrap_err();

        assert_eq!(failure.error.kind, ErrorKind::NoData);
        assert_eq!(failure.error.phase, Some(TestPhase::Download));
        assert!(!log.phases().contains(&TestPhase::Upload));

        // Ping finished before download failed and is kept
        let ping = failure.completed.ping.as_ref().unwrap();
        assert!((ping.ping_ms - 10.0).abs() < 1e-6);
        assert!(failure.completed.download.is_none());

        let events = log.events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Error(message)) if message.contains("download")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_download() {
        let engine = Arc::new(TestEngine::new(
            Arc::new(SimulatedTransport::constant(50.0)),
            Settings { max_duration: Duration::from_secs(60), ..settings() },
        ));
        let abort = engine.abort_handle();

        let runner = Arc::clone(&engine);
        let task = tokio::spawn(async move {
            let log = PhaseLog::default();
            let result = runner.run(&log).await;
            (result, log.phases())
        });

        // Ping takes roughly 230 ms; download is well underway at 3 s.
        tokio::time::sleep(Duration::from_secs(3)).await;
        abort.abort();

        let (result, phases) = task.await.unwrap();
        let failure = result.unwrap_err();
        assert!(failure.error.is_aborted());
        assert_eq!(failure.error.phase, Some(TestPhase::Download));
        assert!(failure.completed.ping.is_some());
        assert!(!phases.contains(&TestPhase::Upload));
    }
}
