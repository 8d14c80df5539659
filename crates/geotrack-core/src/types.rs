//! # Domain Types
//!
//! Core domain types used throughout the location pipeline.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Position     │   │ LocationSample  │   │   Credential    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  captured_at    │──►│  id (sequence)  │   │  token          │       │
//! │  │  lat / lng      │   │  position data  │   │  expires_at     │       │
//! │  │  accuracy_m     │   │  delivery_state │   │  subject        │       │
//! │  └─────────────────┘   │  attempts       │   └─────────────────┘       │
//! │     (raw fix)          └─────────────────┘                              │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  DeliveryState  │   │     Batch       │   │   SyncCursor    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Pending        │   │  ids (asc)      │   │  last delivered │       │
//! │  │  InFlight       │   │  one cycle only │   │  id watermark   │       │
//! │  │  Delivered      │   └─────────────────┘   └─────────────────┘       │
//! │  │  Failed         │                                                    │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sample Lifecycle
//! ```text
//!   enqueue ──► Pending ──select──► InFlight ──accepted──► Delivered ──► purge
//!                  ▲                   │
//!                  └──transport error──┤ (attempts + 1)
//!                                      ├──rejected──────► Failed(BackendRejection)
//!                                      └──budget spent──► Failed(RetryExhausted)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Local sequence number of a sample, assigned by the Durable Queue.
pub type SampleId = i64;

// =============================================================================
// Position (raw fix)
// =============================================================================

/// A raw fix as reported by the platform location capability.
///
/// Nothing is persisted yet; a `Position` becomes a [`LocationSample`] once
/// the queue assigns it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Capture instant according to the source clock.
    pub captured_at: DateTime<Utc>,

    /// Latitude in decimal degrees (WGS84).
    pub latitude: f64,

    /// Longitude in decimal degrees (WGS84).
    pub longitude: f64,

    /// Radius of 68% confidence, in meters.
    pub accuracy_m: f64,

    /// Name of the provider that produced the fix ("gps", "fused", ...).
    #[serde(default)]
    pub provider: Option<String>,

    /// Ground speed in m/s, when known.
    #[serde(default)]
    pub speed_mps: Option<f64>,

    /// Altitude above the WGS84 ellipsoid, when known.
    #[serde(default)]
    pub altitude_m: Option<f64>,

    /// Bearing in degrees, when known.
    #[serde(default)]
    pub bearing_deg: Option<f64>,
}

impl Position {
    /// Creates a fix with only the mandatory fields.
    pub fn new(captured_at: DateTime<Utc>, latitude: f64, longitude: f64, accuracy_m: f64) -> Self {
        Position {
            captured_at,
            latitude,
            longitude,
            accuracy_m,
            provider: None,
            speed_mps: None,
            altitude_m: None,
            bearing_deg: None,
        }
    }

    /// Sets the provider name.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the ground speed.
    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    /// Sets the altitude.
    pub fn with_altitude(mut self, altitude_m: f64) -> Self {
        self.altitude_m = Some(altitude_m);
        self
    }

    /// Sets the bearing.
    pub fn with_bearing(mut self, bearing_deg: f64) -> Self {
        self.bearing_deg = Some(bearing_deg);
        self
    }
}

// =============================================================================
// Delivery State
// =============================================================================

/// Where a sample is in its delivery lifecycle.
///
/// Only `delivery_state` (and its bookkeeping columns) ever changes on a
/// sample once it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting for a sync cycle.
    Pending,
    /// Selected by exactly one sync cycle, not reconciled yet.
    InFlight,
    /// Accepted by the backend.
    Delivered,
    /// Given up on; see `failure_reason`.
    Failed,
}

impl DeliveryState {
    /// Textual form used in storage and logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
        }
    }

    /// Delivered and Failed never change again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Failed)
    }

    /// Returns true if the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Pending, InFlight) | (InFlight, Pending) | (InFlight, Delivered) | (InFlight, Failed)
        )
    }

    /// Checks a transition, producing a typed error when it is not allowed.
    pub fn transition(self, id: SampleId, next: DeliveryState) -> Result<DeliveryState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                id,
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "in_flight" => Ok(DeliveryState::InFlight),
            "delivered" => Ok(DeliveryState::Delivered),
            "failed" => Ok(DeliveryState::Failed),
            other => Err(CoreError::UnknownState(other.to_string())),
        }
    }
}

// =============================================================================
// Failure Reason
// =============================================================================

/// Why a sample ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend looked at the sample and refused it (e.g. malformed).
    BackendRejection,
    /// Transport kept failing until the attempt budget ran out.
    RetryExhausted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::BackendRejection => write!(f, "backend_rejection"),
            FailureReason::RetryExhausted => write!(f, "retry_exhausted"),
        }
    }
}

// =============================================================================
// Location Sample
// =============================================================================

/// A captured position persisted in the Durable Queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    /// Monotonically increasing local sequence number.
    pub id: SampleId,

    /// Capture instant (source clock).
    pub captured_at: DateTime<Utc>,

    /// Latitude in decimal degrees.
    pub latitude: f64,

    /// Longitude in decimal degrees.
    pub longitude: f64,

    /// Accuracy radius in meters.
    pub accuracy_m: f64,

    /// Provider name, if reported.
    pub provider: Option<String>,

    /// Ground speed in m/s, if reported.
    pub speed_mps: Option<f64>,

    /// Altitude in meters, if reported.
    pub altitude_m: Option<f64>,

    /// Bearing in degrees, if reported.
    pub bearing_deg: Option<f64>,

    /// Current lifecycle state.
    pub delivery_state: DeliveryState,

    /// Number of failed transport attempts so far.
    pub attempts: u32,

    /// Set once the sample is `Failed`.
    pub failure_reason: Option<FailureReason>,

    /// Last error or backend reason recorded against the sample.
    pub last_error: Option<String>,

    /// When the sample was enqueued (local clock).
    pub created_at: DateTime<Utc>,

    /// Last state change.
    pub updated_at: DateTime<Utc>,

    /// When the backend confirmed it.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl LocationSample {
    /// The raw fix this sample was created from.
    pub fn position(&self) -> Position {
        Position {
            captured_at: self.captured_at,
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_m: self.accuracy_m,
            provider: self.provider.clone(),
            speed_mps: self.speed_mps,
            altitude_m: self.altitude_m,
            bearing_deg: self.bearing_deg,
        }
    }

    /// Returns true if the sample can still be handed to a sync cycle.
    pub fn is_deliverable(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }
}

// =============================================================================
// Batch
// =============================================================================

/// The ids selected for one delivery attempt, ascending.
///
/// A batch owns no samples; it only names them, and it is dropped at the end
/// of the cycle that selected it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ids: Vec<SampleId>,
}

impl Batch {
    /// Builds a batch from selected samples, keeping ascending id order.
    pub fn from_samples(samples: &[LocationSample]) -> Self {
        let mut ids: Vec<SampleId> = samples.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        ids.dedup();
        Batch { ids }
    }

    pub fn ids(&self) -> &[SampleId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: SampleId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub fn first_id(&self) -> Option<SampleId> {
        self.ids.first().copied()
    }

    pub fn last_id(&self) -> Option<SampleId> {
        self.ids.last().copied()
    }
}

// =============================================================================
// Credential
// =============================================================================

/// Bearer token plus expiry, owned by the auth provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Opaque bearer token.
    pub token: String,

    /// Absolute expiry instant.
    pub expires_at: DateTime<Utc>,

    /// Identity the token belongs to.
    pub subject: String,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>, subject: impl Into<String>) -> Self {
        Credential {
            token: token.into(),
            expires_at,
            subject: subject.into(),
        }
    }

    /// True when the token is expired or will be within `margin`.
    pub fn needs_refresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(margin)
            .ok()
            .and_then(|margin| now.checked_add_signed(margin))
        {
            Some(deadline) => deadline >= self.expires_at,
            None => true,
        }
    }

    /// True when the token can no longer be used at all.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining validity, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("subject", &self.subject)
            .finish()
    }
}

// =============================================================================
// Sync Cursor
// =============================================================================

/// Persisted watermark: every sample with `id <= last_delivered_id` is in a
/// terminal state, and `last_delivered_id` itself was Delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub last_delivered_id: SampleId,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Queue Bookkeeping
// =============================================================================

/// Sample counts per delivery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub in_flight: i64,
    pub delivered: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.in_flight + self.delivered + self.failed
    }
}

/// Result of returning a failed batch to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Back to Pending with one more attempt recorded.
    pub requeued: Vec<SampleId>,
    /// Budget spent, now `Failed(RetryExhausted)`.
    pub exhausted: Vec<SampleId>,
}
