//! # Capture Filter
//!
//! Decides whether a raw fix is worth a queue slot.
//!
//! ```text
//!   fix ──► invalid? ──────────────► Invalid
//!       ──► accuracy > max? ───────► SkipInaccurate
//!       ──► too soon after last? ──► SkipInterval
//!       ──► too close to last? ────► SkipDisplacement
//!       ──► Accept (becomes the new reference fix)
//! ```
//!
//! Skips are not failures: nothing was lost, the fix simply added no
//! information. The reference point is always the last *accepted* fix, so a
//! slow drift still produces a sample once it adds up to the threshold.

use std::time::Duration;

use crate::geo::haversine_m;
use crate::types::Position;
use crate::validation::validate_position;

/// Outcome of running a fix through the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Invalid,
    SkipInaccurate,
    SkipInterval,
    SkipDisplacement,
}

impl FilterDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, FilterDecision::Accept)
    }
}

/// Stateful filter remembering the last accepted fix.
#[derive(Debug, Clone)]
pub struct CaptureFilter {
    max_accuracy_m: f64,
    min_interval: Duration,
    min_displacement_m: f64,
    last: Option<Position>,
}

impl CaptureFilter {
    pub fn new(max_accuracy_m: f64, min_interval: Duration, min_displacement_m: f64) -> Self {
        CaptureFilter {
            max_accuracy_m,
            min_interval,
            min_displacement_m,
            last: None,
        }
    }

    /// Evaluates `fix`; accepted fixes become the new reference.
    pub fn evaluate(&mut self, fix: &Position) -> FilterDecision {
        let decision = self.decide(fix);
        if decision.is_accept() {
            self.last = Some(fix.clone());
        }
        decision
    }

    fn decide(&self, fix: &Position) -> FilterDecision {
        if validate_position(fix).is_err() {
            return FilterDecision::Invalid;
        }

        if fix.accuracy_m > self.max_accuracy_m {
            return FilterDecision::SkipInaccurate;
        }

        let Some(last) = &self.last else {
            return FilterDecision::Accept;
        };

        // A fix stamped earlier than the reference counts as "too soon".
        let elapsed = (fix.captured_at - last.captured_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed < self.min_interval {
            return FilterDecision::SkipInterval;
        }

        if self.min_displacement_m > 0.0 {
            let moved = haversine_m(last.latitude, last.longitude, fix.latitude, fix.longitude);
            if moved < self.min_displacement_m {
                return FilterDecision::SkipDisplacement;
            }
        }

        FilterDecision::Accept
    }

    /// The reference fix, if any was accepted yet.
    pub fn last_accepted(&self) -> Option<&Position> {
        self.last.as_ref()
    }

    /// Forgets the reference, e.g. after sampling restarts.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64, lat: f64, accuracy: f64) -> Position {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        Position::new(base + chrono::Duration::seconds(secs), lat, 2.35, accuracy)
    }

    #[test]
    fn test_first_fix_accepted() {
        let mut filter = CaptureFilter::new(50.0, Duration::from_secs(60), 100.0);
        assert_eq!(filter.evaluate(&at(0, 48.85, 10.0)), FilterDecision::Accept);
        assert!(filter.last_accepted().is_some());
    }

    #[test]
    fn test_inaccurate_fix_dropped() {
        let mut filter = CaptureFilter::new(50.0, Duration::ZERO, 0.0);
        assert_eq!(filter.evaluate(&at(0, 48.85, 80.0)), FilterDecision::SkipInaccurate);
        assert!(filter.last_accepted().is_none());
    }

    #[test]
    fn test_interval_and_displacement() {
        let mut filter = CaptureFilter::new(50.0, Duration::from_secs(60), 100.0);
        assert!(filter.evaluate(&at(0, 48.8500, 10.0)).is_accept());

        // 30 s later, far away: too soon
        assert_eq!(filter.evaluate(&at(30, 48.8600, 10.0)), FilterDecision::SkipInterval);
        // 2 min later but ~55 m away: too close
        assert_eq!(filter.evaluate(&at(120, 48.8505, 10.0)), FilterDecision::SkipDisplacement);
        // 3 min later, ~1.1 km away
        assert_eq!(filter.evaluate(&at(180, 48.8600, 10.0)), FilterDecision::Accept);
    }

    #[test]
    fn test_drift_measured_from_last_accepted() {
        let mut filter = CaptureFilter::new(50.0, Duration::ZERO, 100.0);
        assert!(filter.evaluate(&at(0, 48.8500, 5.0)).is_accept());
        // each step ~67 m, never far enough from its neighbour
        assert!(!filter.evaluate(&at(1, 48.8506, 5.0)).is_accept());
        assert!(filter.evaluate(&at(2, 48.8512, 5.0)).is_accept());
    }

    #[test]
    fn test_invalid_fix() {
        let mut filter = CaptureFilter::new(50.0, Duration::ZERO, 0.0);
        assert_eq!(filter.evaluate(&at(0, 123.0, 5.0)), FilterDecision::Invalid);
    }
}
