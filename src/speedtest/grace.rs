//! Warm-up gating.
//!
//! Throughput measured while connections are still being set up and TCP is
//! in slow start runs low. Samples inside the grace window are kept for
//! bookkeeping only; when the window closes the session re-bases its timing
//! origin and drops everything accumulated so far.

use std::time::Duration;

/// What the session should do with one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceDecision {
    /// Still warming up; record but do not measure.
    WarmUp,
    /// Grace just elapsed with bytes on the books: re-base to this sample's
    /// time and clear counters. The sample itself is not counted.
    Reset,
    /// Measure this sample.
    Include,
}

#[derive(Debug, Clone)]
pub struct GraceWindowFilter {
    grace: Duration,
    elapsed: bool,
}

impl GraceWindowFilter {
    pub fn new(grace: Duration) -> Self {
        Self { grace, elapsed: false }
    }

    pub fn has_elapsed(&self) -> bool {
        self.elapsed
    }

    /// Classify a sample seen `since_start` after the phase began, with
    /// `accumulated_bytes` recorded so far in the phase.
    pub fn observe(
        &mut self,
        since_start: Duration,
        accumulated_bytes: u64,
    ) -> GraceDecision {
        if self.elapsed {
            return GraceDecision::Include;
        }

        if since_start <= self.grace {
            return GraceDecision::WarmUp;
        }

        self.elapsed = true;

        // Nothing to discard: the crossing sample is the first real one.
        if accumulated_bytes == 0 {
            GraceDecision::Include
        } else {
            GraceDecision::Reset
        }
    }
}
