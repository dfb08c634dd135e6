//! TUI state management.
//!
//! Holds everything the renderer needs: the server, the current phase,
//! live values per phase and the final headline numbers.

use crate::speedtest::progress::{ProgressEvent, ProgressUpdate, TestPhase};

/// Error information for display.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub message: String,
    /// Optional suggestion for resolution
    pub suggestion: Option<String>,
}

/// Ping phase state.
#[derive(Debug, Clone, Default)]
pub struct PingState {
    /// Fraction of probes issued, in `0.0..=1.0`
    pub progress: f64,
    /// Running minimum round trip in ms
    pub current_ping_ms: Option<f64>,
    pub current_jitter_ms: Option<f64>,
    /// Ping reported when the phase completed
    pub final_ping_ms: Option<f64>,
    pub completed: bool,
}

/// Download or upload phase state.
#[derive(Debug, Clone, Default)]
pub struct BandwidthState {
    /// Fraction of the (possibly shortened) phase elapsed
    pub progress: f64,
    pub current_speed_mbps: Option<f64>,
    /// Highest live speed seen this phase
    pub peak_speed_mbps: f64,
    pub final_speed_mbps: Option<f64>,
    pub completed: bool,
}

impl BandwidthState {
    fn apply(&mut self, update: &ProgressUpdate) {
        self.progress = self.progress.max(update.progress);
        self.current_speed_mbps = Some(update.current_speed_mbps);
        self.peak_speed_mbps = self.peak_speed_mbps.max(update.current_speed_mbps);
    }

    fn complete(&mut self, speed_mbps: f64) {
        self.progress = 1.0;
        self.final_speed_mbps = Some(speed_mbps);
        self.completed = true;
    }
}

/// State for the TUI display.
#[derive(Debug, Clone)]
pub struct TuiState {
    /// Current test phase
    pub phase: TestPhase,
    /// Speed server being measured against
    pub server: Option<String>,
    pub ping: PingState,
    pub download: BandwidthState,
    pub upload: BandwidthState,
    /// Error message if any
    pub error: Option<ErrorInfo>,
    /// Set once the engine reported the end of the run
    pub finished: bool,
}

impl Default for TuiState {
    fn default() -> Self {
        Self {
            phase: TestPhase::Initializing,
            server: None,
            ping: PingState::default(),
            download: BandwidthState::default(),
            upload: BandwidthState::default(),
            error: None,
            finished: false,
        }
    }
}

impl TuiState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_server(&mut self, server: impl Into<String>) {
        self.server = Some(server.into());
    }

    /// Set an error state with optional suggestion.
    ///
    /// Partial results collected before the error are kept.
    pub fn set_error(&mut self, message: String, suggestion: Option<String>) {
        self.error = Some(ErrorInfo { message, suggestion });
        self.finished = true;
    }

    /// Update state from a progress event.
    ///
    /// Progress within a phase never moves backwards, even if updates are
    /// delivered out of order.
    pub fn update_from_event(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PhaseChange(phase) => {
                self.phase = *phase;
            }
            ProgressEvent::Progress(update) => match update.phase {
                TestPhase::Ping => {
                    self.ping.progress = self.ping.progress.max(update.progress);
                    if update.current_ping_ms.is_some() {
                        self.ping.current_ping_ms = update.current_ping_ms;
                    }
                    if update.current_jitter_ms.is_some() {
                        self.ping.current_jitter_ms = update.current_jitter_ms;
                    }
                }
                TestPhase::Download => self.download.apply(update),
                TestPhase::Upload => self.upload.apply(update),
                TestPhase::Initializing | TestPhase::Complete => {}
            },
            ProgressEvent::PhaseComplete { phase, value } => match phase {
                TestPhase::Ping => {
                    self.ping.progress = 1.0;
                    self.ping.final_ping_ms = Some(*value);
                    self.ping.completed = true;
                }
                TestPhase::Download => self.download.complete(*value),
                TestPhase::Upload => self.upload.complete(*value),
                TestPhase::Initializing | TestPhase::Complete => {}
            },
            ProgressEvent::Complete => {
                self.finished = true;
            }
            ProgressEvent::Error(message) => {
                self.set_error(message.clone(), None);
            }
        }
    }

    /// Progress of the phase currently running, for the main gauge.
    pub fn phase_progress(&self) -> f64 {
        match self.phase {
            TestPhase::Initializing => 0.0,
            TestPhase::Ping => self.ping.progress,
            TestPhase::Download => self.download.progress,
            TestPhase::Upload => self.upload.progress,
            TestPhase::Complete => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn transfer(phase: TestPhase, progress: f64, speed: f64) -> ProgressEvent {
        ProgressEvent::Progress(ProgressUpdate::transfer(phase, progress, speed))
    }

    #[test]
    fn test_set_server() {
        let mut state = TuiState::new();
        state.set_server("https://speed.cloudflare.com/");
        assert_eq!(state.server.as_deref(), Some("https://speed.cloudflare.com/"));
    }

    #[test]
    fn test_set_error() {
        let mut state = TuiState::new();
        state.set_error(
            "Network timeout".to_string(),
            Some("Check your connection".to_string()),
        );

        let error = state.error.as_ref().unwrap();
        assert_eq!(error.message, "Network timeout");
        assert_eq!(error.suggestion.as_deref(), Some("Check your connection"));
        assert!(state.finished);
    }

    #[test]
    fn test_update_from_phase_change() {
        let mut state = TuiState::new();
        assert_eq!(state.phase, TestPhase::Initializing);

        state.update_from_event(&ProgressEvent::PhaseChange(TestPhase::Download));
        assert_eq!(state.phase, TestPhase::Download);
    }

    #[test]
    fn test_update_from_ping_progress() {
        let mut state = TuiState::new();
        state.update_from_event(&ProgressEvent::Progress(ProgressUpdate::ping(
            0.3, 18.5, 2.25,
        )));

        assert_eq!(state.ping.current_ping_ms, Some(18.5));
        assert_eq!(state.ping.current_jitter_ms, Some(2.25));
        assert!((state.ping.progress - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_update_from_transfer_progress() {
        let mut state = TuiState::new();
        state.update_from_event(&transfer(TestPhase::Upload, 0.4, 95.5));
        state.update_from_event(&transfer(TestPhase::Upload, 0.5, 80.0));

        assert_eq!(state.upload.current_speed_mbps, Some(80.0));
        assert_eq!(state.upload.peak_speed_mbps, 95.5);
        assert!(state.download.current_speed_mbps.is_none());
    }

    #[test]
    fn test_update_from_phase_complete() {
        let mut state = TuiState::new();
        state.update_from_event(&ProgressEvent::PhaseComplete {
            phase: TestPhase::Ping,
            value: 12.0,
        });
        state.update_from_event(&transfer(TestPhase::Download, 0.6, 410.0));
        state.update_from_event(&ProgressEvent::PhaseComplete {
            phase: TestPhase::Download,
            value: 432.0,
        });

        assert_eq!(state.ping.final_ping_ms, Some(12.0));
        assert!(state.ping.completed);
        assert_eq!(state.download.final_speed_mbps, Some(432.0));
        assert_eq!(state.download.progress, 1.0);
        assert!(!state.upload.completed);
    }

    #[test]
    fn test_update_from_complete() {
        let mut state = TuiState::new();
        state.update_from_event(&ProgressEvent::PhaseChange(TestPhase::Complete));
        state.update_from_event(&ProgressEvent::Complete);

        assert!(state.finished);
        assert_eq!(state.phase_progress(), 1.0);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_update_from_error() {
        let mut state = TuiState::new();
        state.update_from_event(&ProgressEvent::Error("no data".to_string()));

        assert_eq!(state.error.as_ref().unwrap().message, "no data");
        assert!(state.finished);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Gauge progress never moves backwards within a phase, whatever
        /// order the updates arrive in.
        #[test]
        fn bandwidth_progress_monotonicity(
            progress in prop::collection::vec(0.0f64..=1.0, 1..50),
            upload in any::<bool>()
        ) {
            let phase = if upload { TestPhase::Upload } else { TestPhase::Download };
            let mut state = TuiState::new();
            state.update_from_event(&ProgressEvent::PhaseChange(phase));
            let mut last = 0.0;

            for (i, p) in progress.iter().enumerate() {
                state.update_from_event(&transfer(phase, *p, 50.0 + i as f64));

                let current = state.phase_progress();
                prop_assert!(current >= last, "{} < {}", current, last);
                last = current;
            }
        }

        #[test]
        fn ping_progress_monotonicity(
            progress in prop::collection::vec(0.0f64..=1.0, 1..20)
        ) {
            let mut state = TuiState::new();
            state.update_from_event(&ProgressEvent::PhaseChange(TestPhase::Ping));
            let mut last = 0.0;

            for p in progress {
                state.update_from_event(&ProgressEvent::Progress(
                    ProgressUpdate::ping(p, 10.0, 1.0),
                ));
                prop_assert!(state.ping.progress >= last);
                last = state.ping.progress;
            }
        }

        /// An error keeps every value collected before it.
        #[test]
        fn error_state_preservation(
            ping_ms in 1.0f64..200.0,
            download_mbps in 1.0f64..2000.0,
            upload_updates in prop::collection::vec(1.0f64..500.0, 0..10),
            error_message in "[a-zA-Z0-9 ]{1,50}"
        ) {
            let mut state = TuiState::new();
            state.update_from_event(&ProgressEvent::PhaseComplete {
                phase: TestPhase::Ping,
                value: ping_ms,
            });
            state.update_from_event(&ProgressEvent::PhaseComplete {
                phase: TestPhase::Download,
                value: download_mbps,
            });
            let total = upload_updates.len().max(1) as f64;
            for (i, speed) in upload_updates.iter().enumerate() {
                state.update_from_event(&transfer(
                    TestPhase::Upload,
                    (i + 1) as f64 / total,
                    *speed,
                ));
            }

            let upload_before = state.upload.current_speed_mbps;
            let upload_progress_before = state.upload.progress;

            state.update_from_event(&ProgressEvent::Error(error_message.clone()));

            prop_assert_eq!(&state.error.as_ref().unwrap().message, &error_message);
            prop_assert_eq!(state.ping.final_ping_ms, Some(ping_ms));
            prop_assert_eq!(state.download.final_speed_mbps, Some(download_mbps));
            prop_assert_eq!(state.upload.current_speed_mbps, upload_before);
            prop_assert_eq!(state.upload.progress, upload_progress_before);
            prop_assert!(state.upload.final_speed_mbps.is_none());
        }
    }
}
