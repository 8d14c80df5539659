//! # Retry Backoff
//!
//! Delay schedule between failed sync cycles.
//!
//! ## Schedule
//! ```text
//!   nominal:  base, base·m, base·m², ... capped at max
//!
//!   failure:     1        2          3          4
//!   nominal:   2s ──►   4s  ──►    8s   ──►   16s ...  ──► 300s
//!   delay:   [1s,2s]  [2s,4s]    [4s,8s]    [8s,16s]      300s
//!                ▲       ▲
//!                └───────┴── jitter never goes below the previous nominal
//! ```
//!
//! Jitter only shaves time off inside the gap between two consecutive
//! nominal values, so consecutive delays are non-decreasing and never exceed
//! the cap, whatever the random draw.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rand::Rng;

use crate::config::BackoffSettings;

/// Parameters of the retry schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// 0.0 disables jitter, 1.0 allows the whole gap to be used.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::from(&BackoffSettings::default())
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(settings: &BackoffSettings) -> Self {
        BackoffPolicy {
            base: settings.base(),
            max: settings.max(),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }
}

/// Stateful backoff clock: one instance per pipeline.
#[derive(Debug)]
pub struct RetryBackoff {
    policy: BackoffPolicy,
    schedule: ExponentialBackoff,
    last_nominal: Option<Duration>,
    failures: u32,
}

impl RetryBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        RetryBackoff {
            schedule: Self::schedule(&policy),
            policy,
            last_nominal: None,
            failures: 0,
        }
    }

    /// Nominal (jitter-free) exponential schedule.
    fn schedule(policy: &BackoffPolicy) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: policy.base,
            initial_interval: policy.base,
            randomization_factor: 0.0,
            multiplier: policy.multiplier,
            max_interval: policy.max,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Records one more consecutive failure and returns how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);

        let nominal = self
            .schedule
            .next_backoff()
            .unwrap_or(self.policy.max)
            .min(self.policy.max);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let floor = self
            .last_nominal
            .unwrap_or_else(|| nominal.mul_f64(1.0 - jitter))
            .min(nominal);
        self.last_nominal = Some(nominal);

        let gap = nominal - floor;
        if gap.is_zero() || jitter == 0.0 {
            return nominal;
        }

        let draw: f64 = rand::thread_rng().gen();
        nominal - gap.mul_f64(jitter * draw)
    }

    /// Back to the first step after a successful cycle.
    pub fn reset(&mut self) {
        self.schedule.reset();
        self.last_nominal = None;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_schedule_without_jitter() {
        let mut backoff = RetryBackoff::new(policy(0.0));
        let delays: Vec<u64> = (0..10).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
        assert_eq!(backoff.failures(), 10);
    }

    #[test]
    fn test_jittered_delays_non_decreasing_and_bounded() {
        for _ in 0..200 {
            let mut backoff = RetryBackoff::new(policy(1.0));
            let mut previous = Duration::ZERO;
            for _ in 0..15 {
                let delay = backoff.next_delay();
                assert!(delay >= previous, "{delay:?} < {previous:?}");
                assert!(delay <= Duration::from_secs(300));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_first_delay_within_jitter_band() {
        let mut backoff = RetryBackoff::new(policy(0.5));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(2));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = RetryBackoff::new(policy(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
