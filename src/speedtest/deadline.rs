//! Auto-shortening of transfer phases.
//!
//! Every incorporated sample adds a speed-proportional bonus to the elapsed
//! time. The phase ends once `elapsed + bonus` passes the max duration, so
//! fast links finish early while slow links run the full duration. The total
//! bonus never exceeds [`MAX_BONUS_SHARE`] of the max duration, so even the
//! fastest link is measured for at least half the configured time.

use std::time::Duration;

use super::TestMode;

/// Largest fraction of the max duration the accumulated bonus may reach.
pub const MAX_BONUS_SHARE: f64 = 0.5;

/// How much bonus a given throughput earns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BonusPolicy {
    /// Milliseconds of bonus per Mbps for each second of transfer.
    pub rate_ms_per_mbps_second: f64,
    /// Ceiling on the bonus added by a single update.
    pub max_step: Duration,
}

impl BonusPolicy {
    pub fn for_mode(mode: TestMode) -> Self {
        match mode {
            TestMode::Download => Self {
                rate_ms_per_mbps_second: 1.0,
                max_step: Duration::from_millis(3000),
            },
            TestMode::Upload => Self {
                rate_ms_per_mbps_second: 0.6,
                max_step: Duration::from_millis(2000),
            },
        }
    }

    /// Bonus earned by running at `mbps` for `interval`, capped at
    /// `max_step`.
    pub fn increment(&self, mbps: f64, interval: Duration) -> Duration {
        if mbps.is_nan() || mbps <= 0.0 || interval.is_zero() {
            return Duration::ZERO;
        }

        let max_ms = self.max_step.as_secs_f64() * 1000.0;
        let ms = (self.rate_ms_per_mbps_second
            * mbps
            * interval.as_secs_f64())
        .min(max_ms);

        Duration::from_secs_f64(ms / 1000.0)
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveDeadlineController {
    policy: BonusPolicy,
    enabled: bool,
    max_duration: Duration,
    max_bonus: Duration,
    bonus: Duration,
    last_elapsed: Duration,
}

impl AdaptiveDeadlineController {
    pub fn new(
        policy: BonusPolicy,
        max_duration: Duration,
        auto_shorten: bool,
    ) -> Self {
        Self {
            policy,
            enabled: auto_shorten,
            max_duration,
            max_bonus: max_duration.mul_f64(MAX_BONUS_SHARE),
            bonus: Duration::ZERO,
            last_elapsed: Duration::ZERO,
        }
    }

    pub fn bonus(&self) -> Duration {
        self.bonus
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Account for throughput `mbps` observed `elapsed` after the origin.
    /// Returns the bonus added by this update.
    pub fn update(&mut self, elapsed: Duration, mbps: f64) -> Duration {
        let interval = self.advance(elapsed);

        if !self.enabled {
            return Duration::ZERO;
        }

        let step = self
            .policy
            .increment(mbps, interval)
            .min(self.max_bonus.saturating_sub(self.bonus));
        self.bonus += step;
        step
    }

    /// Move the clock to `elapsed` without earning bonus for the interval.
    ///
    /// Used while streams are still being launched, when the aggregate
    /// throughput is not yet representative.
    pub fn hold(&mut self, elapsed: Duration) {
        self.advance(elapsed);
    }

    fn advance(&mut self, elapsed: Duration) -> Duration {
        let interval = elapsed.saturating_sub(self.last_elapsed);
        self.last_elapsed = self.last_elapsed.max(elapsed);
        interval
    }

    /// Fraction of the phase budget used at `elapsed`, capped at 1.
    pub fn progress(&self, elapsed: Duration) -> f64 {
        let used = (elapsed + self.bonus).as_secs_f64();
        (used / self.max_duration.as_secs_f64()).min(1.0)
    }

    pub fn is_expired(&self, elapsed: Duration) -> bool {
        elapsed + self.bonus > self.max_duration
    }

    /// Time left before the phase ends, measured from the origin.
    pub fn remaining(&self) -> Duration {
        self.max_duration.saturating_sub(self.bonus)
    }

    /// Forget all bonus; used when the session re-bases its origin.
    pub fn reset(&mut self) {
        self.bonus = Duration::ZERO;
        self.last_elapsed = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller(auto_shorten: bool) -> AdaptiveDeadlineController {
        AdaptiveDeadlineController::new(
            BonusPolicy::for_mode(TestMode::Download),
            Duration::from_secs(10),
            auto_shorten,
        )
    }

    #[test]
    fn test_increment_proportional_to_speed_and_interval() {
        let policy = BonusPolicy::for_mode(TestMode::Download);
        // 100 Mbps for 0.5 s at 1 ms/Mbps/s = 50 ms
        let step = policy.increment(100.0, Duration::from_millis(500));
        assert!((step.as_secs_f64() - 0.05).abs() < 1e-9);

        assert_eq!(policy.increment(0.0, Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(policy.increment(f64::NAN, Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(policy.increment(500.0, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_upload_policy_is_gentler() {
        let download = BonusPolicy::for_mode(TestMode::Download);
        let upload = BonusPolicy::for_mode(TestMode::Upload);
        let interval = Duration::from_millis(100);

        assert!(upload.increment(50.0, interval) < download.increment(50.0, interval));
        assert!(upload.max_step < download.max_step);
    }

    #[test]
    fn test_fast_link_expires_early() {
        let mut deadline = controller(true);

        let mut elapsed = Duration::ZERO;
        while !deadline.is_expired(elapsed) {
            elapsed += Duration::from_millis(100);
            deadline.update(elapsed, 400.0);
        }

        // 400 Mbps earns 0.4 s of bonus per second: expiry near 7.15 s
        assert!(elapsed > Duration::from_secs(7));
        assert!(elapsed < Duration::from_millis(7500));
        assert_eq!(deadline.progress(elapsed), 1.0);
    }

    #[test]
    fn test_total_bonus_capped_at_half_the_duration() {
        let mut deadline = controller(true);

        let mut elapsed = Duration::ZERO;
        while !deadline.is_expired(elapsed) {
            elapsed += Duration::from_millis(100);
            deadline.update(elapsed, 100_000.0);
        }

        assert_eq!(deadline.bonus(), Duration::from_secs(5));
        assert!(elapsed > Duration::from_secs(5));
        assert!(elapsed <= Duration::from_millis(5100));
        assert_eq!(deadline.update(elapsed, 100_000.0), Duration::ZERO);
    }

    #[test]
    fn test_hold_skips_the_interval() {
        let mut held = controller(true);
        held.hold(Duration::from_secs(2));
        held.update(Duration::from_millis(2500), 200.0);

        let mut running = controller(true);
        running.update(Duration::from_millis(2500), 200.0);

        // Only the 0.5 s after the hold earns bonus
        assert!((held.bonus().as_secs_f64() - 0.1).abs() < 1e-9);
        assert!((running.bonus().as_secs_f64() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_controller_runs_full_duration() {
        let mut deadline = controller(false);
        deadline.update(Duration::from_secs(5), 10_000.0);

        assert_eq!(deadline.bonus(), Duration::ZERO);
        assert!(!deadline.is_expired(Duration::from_secs(10)));
        assert!(deadline.is_expired(Duration::from_millis(10_001)));
        assert_eq!(deadline.remaining(), Duration::from_secs(10));
    }

    #[test]
    fn test_reset_clears_bonus() {
        let mut deadline = controller(true);
        deadline.update(Duration::from_secs(1), 100.0);
        assert!(deadline.bonus() > Duration::ZERO);

        deadline.reset();
        assert_eq!(deadline.bonus(), Duration::ZERO);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_bonus_never_decreases(
            speeds in prop::collection::vec(0.0f64..10_000.0, 1..200),
            steps_ms in prop::collection::vec(0u64..500, 1..200),
        ) {
            let mut deadline = controller(true);
            let mut elapsed = Duration::ZERO;
            let mut previous = deadline.bonus();

            for (speed, step) in speeds.iter().zip(steps_ms.iter()) {
                elapsed += Duration::from_millis(*step);
                deadline.update(elapsed, *speed);
                prop_assert!(deadline.bonus() >= previous);
                prop_assert!(deadline.bonus() <= Duration::from_secs(5));
                previous = deadline.bonus();
            }
        }

        #[test]
        fn prop_increment_never_exceeds_ceiling(
            speed in 0.0f64..1e12,
            interval_ms in 0u64..60_000,
        ) {
            for mode in [TestMode::Download, TestMode::Upload] {
                let policy = BonusPolicy::for_mode(mode);
                let step = policy.increment(speed, Duration::from_millis(interval_ms));
                prop_assert!(step <= policy.max_step);
            }
        }
    }

    #[test]
    fn test_infinite_speed_hits_ceiling() {
        let policy = BonusPolicy::for_mode(TestMode::Upload);
        let step = policy.increment(f64::INFINITY, Duration::from_millis(10));
        assert_eq!(step, policy.max_step);
    }
}
