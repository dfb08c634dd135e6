//! Adaptive throughput estimation.
//!
//! Workers move chunks through a [`Transport`] and report each completed
//! chunk as a [`TransferSample`] over a channel. A single collector owns the
//! [`session::TestSession`] for the phase, gates samples through the grace
//! window, feeds the adaptive deadline, and reduces the post-grace speed
//! history to one number when the phase ends.

pub mod aggregate;
pub mod deadline;
pub mod engine;
pub mod grace;
pub mod http;
pub mod payload;
pub mod ping;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::errors::{classify_error, ErrorKind};
use crate::settings::Settings;
use progress::TestPhase;

/// Upload never opens more streams than this, whatever the concurrency.
pub const MAX_UPLOAD_STREAMS: usize = 10;

/// Direction of a transfer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    Download,
    Upload,
}

impl TestMode {
    pub fn phase(&self) -> TestPhase {
        match self {
            TestMode::Download => TestPhase::Download,
            TestMode::Upload => TestPhase::Upload,
        }
    }

    /// Number of concurrent workers launched for this mode.
    pub fn stream_count(&self, settings: &Settings) -> usize {
        let streams = settings.concurrency.max(1);
        match self {
            TestMode::Download => streams,
            TestMode::Upload => streams.min(MAX_UPLOAD_STREAMS),
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.phase().fmt(f)
    }
}

/// A single chunk request that failed.
///
/// These are recovered inside the worker that saw them and never reach the
/// caller individually.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)
    }
}

impl Error for TransferError {}

impl From<reqwest::Error> for TransferError {
    fn from(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ErrorKind::Timeout
        } else if error.status().is_some() {
            ErrorKind::Api
        } else {
            classify_error(&error)
        };

        Self::new(kind, error.to_string())
    }
}

/// Moves bytes to and from a speed server.
///
/// Every call must bypass caches so its duration reflects a real transfer.
pub trait Transport: Send + Sync + 'static {
    /// Download roughly `bytes` bytes and return how many actually arrived.
    fn request_chunk(
        &self,
        bytes: u64,
    ) -> impl Future<Output = Result<u64, TransferError>> + Send;

    /// Upload `payload` and wait for the server to acknowledge it.
    fn send_chunk(
        &self,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// One minimal round trip; returns its duration.
    fn probe(&self) -> impl Future<Output = Result<Duration, TransferError>> + Send;
}

/// One completed chunk, as reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSample {
    pub worker_id: usize,
    /// Bytes moved by this chunk.
    pub bytes: u64,
    /// When the chunk request was issued.
    pub started_at: Instant,
    /// When the chunk finished.
    pub completed_at: Instant,
    /// Total bytes this worker has moved so far, this chunk included.
    pub cumulative_bytes: u64,
}

impl TransferSample {
    /// Bytes of this chunk attributed to the interval after `origin`.
    ///
    /// A chunk that straddles `origin` is prorated linearly over its
    /// transfer interval.
    pub fn bytes_after(&self, origin: Instant) -> u64 {
        if self.completed_at <= origin {
            return 0;
        }
        if self.started_at >= origin {
            return self.bytes;
        }

        let span = self.completed_at - self.started_at;
        let after = self.completed_at - origin;
        let fraction = after.as_secs_f64() / span.as_secs_f64();

        (self.bytes as f64 * fraction).round() as u64
    }
}

/// Owner side of a cooperative abort.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender: Arc::new(sender) }
    }

    /// Ask every worker and the collector to stop.
    pub fn abort(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal { receiver: self.sender.subscribe() }
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cooperative abort, checked at loop boundaries.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    receiver: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once an abort has been requested. Never resolves if the
    /// handle is dropped without aborting.
    pub async fn aborted(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
