//! # Domain Errors
//!
//! Failures that come from the sample model itself, before any storage or
//! network is involved.
//!
//! ```text
//!   validation.rs ── ValidationError ─┐
//!                                     ├──► CoreError ──► SyncError (geotrack-sync)
//!   types.rs ── InvalidTransition ────┘
//!               UnknownState
//! ```
//!
//! Storage failures live in `geotrack_db::DbError`, pipeline failures in
//! `geotrack_sync::SyncError`.

use thiserror::Error;

use crate::types::DeliveryState;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A delivery state change that the sample lifecycle does not allow.
    ///
    /// ## When This Occurs
    /// - Marking a Pending sample Delivered without selecting it first
    /// - Touching a sample that already reached Delivered or Failed
    #[error("Sample {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: i64,
        from: DeliveryState,
        to: DeliveryState,
    },

    /// Unknown textual state (e.g. from a hand-edited database row).
    #[error("Unknown delivery state: {0}")]
    UnknownState(String),

    #[error("invalid fix: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors for raw fixes and configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Coordinate or accuracy outside its physical range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: String,
        min: f64,
        max: f64,
        value: f64,
    },

    /// NaN or infinity where a real number was expected.
    #[error("{field} must be a finite number")]
    NotFinite { field: String },

    /// Zero or negative where only a positive value makes sense
    /// (accuracy radius, batch size, intervals).
    #[error("{field} must be greater than zero")]
    MustBePositive { field: String },
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_and_range_messages() {
        let err = CoreError::InvalidTransition {
            id: 7,
            from: DeliveryState::Delivered,
            to: DeliveryState::Pending,
        };
        assert_eq!(
            err.to_string(),
            "Sample 7 cannot move from Delivered to Pending"
        );

        let err = ValidationError::OutOfRange {
            field: "latitude".to_string(),
            min: -90.0,
            max: 90.0,
            value: 91.5,
        };
        assert_eq!(
            err.to_string(),
            "latitude must be between -90 and 90, got 91.5"
        );
    }

    #[test]
    fn test_bad_fix_wraps_into_core_error() {
        let err: CoreError = ValidationError::NotFinite {
            field: "longitude".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(err.to_string(), "invalid fix: longitude must be a finite number");
    }
}
