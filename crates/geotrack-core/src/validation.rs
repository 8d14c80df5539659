//! # Validation Module
//!
//! Checks applied to raw fixes before they are allowed anywhere near the
//! queue, and to numeric configuration values.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Where validation happens                             │
//! │                                                                         │
//! │  Provider fix ──► validate_position() ──► CaptureFilter ──► enqueue    │
//! │                        │                                                │
//! │                        └── invalid: dropped + counted, never stored    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use chrono::Utc;
//! use geotrack_core::types::Position;
//! use geotrack_core::validation::validate_position;
//!
//! let ok = Position::new(Utc::now(), 45.76, 4.83, 12.0);
//! assert!(validate_position(&ok).is_ok());
//!
//! let bad = Position::new(Utc::now(), 95.0, 4.83, 12.0);
//! assert!(validate_position(&bad).is_err());
//! ```

use crate::error::ValidationError;
use crate::types::Position;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Numeric Validators
// =============================================================================

fn finite(field: &str, value: f64) -> ValidationResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::NotFinite {
            field: field.to_string(),
        })
    }
}

fn in_range(field: &str, value: f64, min: f64, max: f64) -> ValidationResult<()> {
    finite(field, value)?;
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min,
            max,
            value,
        });
    }
    Ok(())
}

/// Validates a latitude in decimal degrees.
pub fn validate_latitude(lat: f64) -> ValidationResult<()> {
    in_range("latitude", lat, -90.0, 90.0)
}

/// Validates a longitude in decimal degrees.
pub fn validate_longitude(lng: f64) -> ValidationResult<()> {
    in_range("longitude", lng, -180.0, 180.0)
}

/// Validates an accuracy radius. Zero is allowed (some mock providers emit it).
pub fn validate_accuracy(accuracy_m: f64) -> ValidationResult<()> {
    finite("accuracy", accuracy_m)?;
    if accuracy_m < 0.0 {
        return Err(ValidationError::MustBePositive {
            field: "accuracy".to_string(),
        });
    }
    Ok(())
}

/// Validates a configuration value that must be strictly positive.
pub fn validate_positive(field: &str, value: f64) -> ValidationResult<()> {
    finite(field, value)?;
    if value <= 0.0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Position Validator
// =============================================================================

/// Validates every numeric field of a raw fix.
///
/// ## Rules
/// - Latitude within [-90, 90], longitude within [-180, 180]
/// - Accuracy finite and non-negative
/// - Optional speed/altitude/bearing finite when present
pub fn validate_position(position: &Position) -> ValidationResult<()> {
    validate_latitude(position.latitude)?;
    validate_longitude(position.longitude)?;
    validate_accuracy(position.accuracy_m)?;

    if let Some(speed) = position.speed_mps {
        finite("speed", speed)?;
    }
    if let Some(altitude) = position.altitude_m {
        finite("altitude", altitude)?;
    }
    if let Some(bearing) = position.bearing_deg {
        in_range("bearing", bearing, 0.0, 360.0)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_coordinates() {
        assert!(validate_latitude(90.0).is_ok());
        assert!(validate_latitude(-90.0).is_ok());
        assert!(validate_latitude(90.0001).is_err());
        assert!(validate_longitude(-180.0).is_ok());
        assert!(validate_longitude(180.5).is_err());
        assert!(validate_latitude(f64::NAN).is_err());
    }

    #[test]
    fn test_accuracy() {
        assert!(validate_accuracy(0.0).is_ok());
        assert!(validate_accuracy(35.5).is_ok());
        assert!(validate_accuracy(-1.0).is_err());
        assert!(validate_accuracy(f64::INFINITY).is_err());
    }

    #[test]
    fn test_position_optionals() {
        let p = Position::new(Utc::now(), 10.0, 10.0, 5.0).with_bearing(400.0);
        assert!(validate_position(&p).is_err());

        let p = Position::new(Utc::now(), 10.0, 10.0, 5.0)
            .with_speed(3.2)
            .with_altitude(-20.0)
            .with_bearing(359.0);
        assert!(validate_position(&p).is_ok());
    }

    #[test]
    fn test_positive() {
        assert!(validate_positive("multiplier", 2.0).is_ok());
        assert!(validate_positive("multiplier", 0.0).is_err());
    }
}
