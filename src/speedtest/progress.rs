//! Progress event types and callback interface.
//!
//! Defines the events the engine emits while a run is in flight and the
//! callback trait that receives them.

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;

/// Test phases during speed test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    /// Initializing the test
    Initializing,
    /// Running latency probes
    Ping,
    /// Running download streams
    Download,
    /// Running upload streams
    Upload,
    /// All tests complete
    Complete,
}

impl TestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestPhase::Initializing => "initializing",
            TestPhase::Ping => "ping",
            TestPhase::Download => "download",
            TestPhase::Upload => "upload",
            TestPhase::Complete => "complete",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published after every incorporated sample or probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: TestPhase,
    /// Fraction of the phase completed, in `0.0..=1.0`.
    pub progress: f64,
    /// Current speed including overhead compensation. Zero during ping.
    pub current_speed_mbps: f64,
    pub current_ping_ms: Option<f64>,
    pub current_jitter_ms: Option<f64>,
}

impl ProgressUpdate {
    pub fn transfer(phase: TestPhase, progress: f64, speed_mbps: f64) -> Self {
        Self {
            phase,
            progress: progress.clamp(0.0, 1.0),
            current_speed_mbps: speed_mbps,
            current_ping_ms: None,
            current_jitter_ms: None,
        }
    }

    pub fn ping(progress: f64, ping_ms: f64, jitter_ms: f64) -> Self {
        Self {
            phase: TestPhase::Ping,
            progress: progress.clamp(0.0, 1.0),
            current_speed_mbps: 0.0,
            current_ping_ms: Some(ping_ms),
            current_jitter_ms: Some(jitter_ms),
        }
    }
}

/// Progress events emitted during test execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Test phase has changed
    PhaseChange(TestPhase),
    /// Live measurement update
    Progress(ProgressUpdate),
    /// Phase finished with its headline value (ms for ping, Mbps otherwise)
    PhaseComplete { phase: TestPhase, value: f64 },
    /// All phases finished
    Complete,
    /// The run stopped with an error
    Error(String),
}

/// Callback interface for progress updates.
///
/// Implementations must be non-blocking to avoid affecting
/// measurement accuracy.
pub trait ProgressCallback: Send + Sync {
    /// Called when a progress event occurs.
    fn on_progress(&self, event: ProgressEvent);
}

/// Callback that ignores every event.
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Forwards events over a channel to whatever owns the display.
///
/// Sending never blocks; events are dropped once the receiver is gone.
pub struct ChannelProgress {
    sender: UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressCallback for ChannelProgress {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}
