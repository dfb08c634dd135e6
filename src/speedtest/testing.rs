//! Simulated transports for exercising the estimator under tokio's paused
//! clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;

use super::{Transport, TransferError};
use crate::errors::ErrorKind;

/// Time needed to move `bytes` at `mbps`.
fn transfer_time(bytes: u64, mbps: f64) -> Duration {
    if mbps <= 0.0 {
        return Duration::MAX;
    }

    Duration::from_secs_f64((bytes as f64 * 8.0) / (mbps * 1_000_000.0))
}

/// How the simulated link behaves.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LinkBehavior {
    /// Every stream moves bytes at this rate.
    Constant { mbps_per_stream: f64 },
    /// Every chunk fails after `after`.
    Failing { after: Duration },
    /// Every chunk "succeeds" with an empty body after `after`.
    Empty { after: Duration },
}

#[derive(Debug)]
pub(crate) struct SimulatedTransport {
    behavior: LinkBehavior,
    probes: Mutex<VecDeque<Result<Duration, TransferError>>>,
    chunk_calls: AtomicU64,
}

impl SimulatedTransport {
    pub(crate) fn constant(mbps_per_stream: f64) -> Self {
        Self::new(LinkBehavior::Constant { mbps_per_stream })
    }

    pub(crate) fn failing() -> Self {
        Self::new(LinkBehavior::Failing { after: Duration::from_millis(20) })
    }

    pub(crate) fn empty() -> Self {
        Self::new(LinkBehavior::Empty { after: Duration::from_millis(20) })
    }

    fn new(behavior: LinkBehavior) -> Self {
        Self {
            behavior,
            probes: Mutex::new(VecDeque::new()),
            chunk_calls: AtomicU64::new(0),
        }
    }

    /// Queue probe outcomes, given as round-trip milliseconds; `None` fails.
    pub(crate) fn with_probes(self, rtts_ms: &[Option<f64>]) -> Self {
        {
            let mut probes = self.probes.lock().unwrap();
            probes.extend(rtts_ms.iter().map(|rtt| match rtt {
                Some(ms) => Ok(Duration::from_secs_f64(ms / 1000.0)),
                None => Err(TransferError::new(
                    ErrorKind::Timeout,
                    "simulated probe timeout",
                )),
            }));
        }
        self
    }

    pub(crate) fn chunk_calls(&self) -> u64 {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    async fn move_bytes(&self, bytes: u64) -> Result<u64, TransferError> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            LinkBehavior::Constant { mbps_per_stream } => {
                sleep(transfer_time(bytes, mbps_per_stream)).await;
                Ok(bytes)
            }
            LinkBehavior::Failing { after } => {
                sleep(after).await;
                Err(TransferError::new(
                    ErrorKind::Network,
                    "simulated connection reset",
                ))
            }
            LinkBehavior::Empty { after } => {
                sleep(after).await;
                Ok(0)
            }
        }
    }
}

impl Transport for SimulatedTransport {
    async fn request_chunk(&self, bytes: u64) -> Result<u64, TransferError> {
        self.move_bytes(bytes).await
    }

    async fn send_chunk(&self, payload: Bytes) -> Result<(), TransferError> {
        self.move_bytes(payload.len() as u64).await.map(|_| ())
    }

    async fn probe(&self) -> Result<Duration, TransferError> {
        let next = self.probes.lock().unwrap().pop_front();
        let outcome = next.unwrap_or(Ok(Duration::from_millis(10)));

        match outcome {
            Ok(rtt) => {
                sleep(rtt).await;
                Ok(rtt)
            }
            Err(e) => {
                sleep(Duration::from_millis(50)).await;
                Err(e)
            }
        }
    }
}
