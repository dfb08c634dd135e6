//! Unit conversions shared by the throughput estimator.

use std::time::Duration;

/// Bits in one megabit. Speeds are reported in decimal megabits.
const BITS_PER_MEGABIT: f64 = 1_000_000.0;

/// Throughput in Mbps for `bytes` moved over `elapsed`.
///
/// Returns 0.0 for a zero-length interval instead of dividing by zero.
pub fn calculate_speed_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }

    (bytes as f64 * 8.0) / secs / BITS_PER_MEGABIT
}

pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
