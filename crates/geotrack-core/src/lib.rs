//! # geotrack-core: Pure Domain Logic for the Location Pipeline
//!
//! This crate holds everything about location samples that can be decided
//! without touching a disk, a socket or a platform API.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Location Pipeline Architecture                      │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │          Platform location capability (JSON feed, OS API)       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ Position                               │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               geotrack-sync (source, engine, supervisor)        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ geotrack-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │    geo    │  │  filter   │  │ validation│  │   │
//! │  │   │  Sample   │  │ haversine │  │ accuracy  │  │  lat/lng  │  │   │
//! │  │   │ Credential│  │           │  │ distance  │  │  accuracy │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 geotrack-db (Durable Queue, cursor)             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (LocationSample, DeliveryState, Credential, ...)
//! - [`geo`] - Great-circle distance
//! - [`filter`] - Decides whether a raw fix becomes a sample
//! - [`validation`] - Coordinate and accuracy checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use geotrack_core::geo::haversine_m;
//!
//! // Paris -> London is roughly 343 km
//! let d = haversine_m(48.8566, 2.3522, 51.5074, -0.1278);
//! assert!((d - 343_500.0).abs() < 2_000.0);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod filter;
pub mod geo;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, ValidationError};
pub use filter::{CaptureFilter, FilterDecision};
pub use types::*;

// =============================================================================
// Crate-Level Defaults
// =============================================================================
// The backend never published batch or retry limits. These are starting
// points; every one of them is overridable from configuration.

/// Maximum number of samples submitted in one delivery attempt.
pub const DEFAULT_BATCH_SIZE: u32 = 50;

/// A partial batch is released once its oldest sample waited this long.
pub const DEFAULT_BATCH_MAX_AGE_SECS: u64 = 60;

/// Transport attempts a sample gets before it is marked `RetryExhausted`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// First backoff delay after a failed cycle.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;

/// Upper bound for any backoff delay.
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Growth factor between consecutive backoff delays.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Refresh a credential this long before it expires.
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 300;

/// Delivered samples older than this are purged.
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 3600;

/// Fixes reporting a worse accuracy radius than this are dropped.
pub const DEFAULT_MAX_ACCURACY_M: f64 = 100.0;
