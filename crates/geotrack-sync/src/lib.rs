//! # geotrack-sync: Capture, Delivery and Supervision
//!
//! Everything in the location pipeline that waits on something: the platform
//! location capability, the identity service, the backend and the clock.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Location Pipeline                                 │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 Supervisor (control loop + handle)               │  │
//! │  │  start/stop sampling • connectivity • suspension • retention     │  │
//! │  └───────────────┬───────────────────────────────┬──────────────────┘  │
//! │                  │                               │                      │
//! │                  ▼                               ▼                      │
//! │  ┌────────────────────────┐        ┌────────────────────────────────┐  │
//! │  │     SampleSource       │        │          SyncEngine            │  │
//! │  │                        │        │                                │  │
//! │  │ LocationProvider ──►   │        │ select_batch ─► AuthProvider   │  │
//! │  │ CaptureFilter ──►      │        │      │             │           │  │
//! │  │ SampleStream           │        │      ▼             ▼           │  │
//! │  └───────────┬────────────┘        │ DeliveryEndpoint ─► BatchAck   │  │
//! │              │ enqueue             │      │                         │  │
//! │              ▼                     │      ▼ mark / backoff          │  │
//! │  ┌──────────────────────────────────────────────────────────────┐  │  │
//! │  │               geotrack-db  (Durable Queue, cursor)           │◄─┘  │
//! │  └──────────────────────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`source`] - Location provider seam and the filtered sample stream
//! - [`auth`] - Credential cache with single-flight refresh
//! - [`firebase`] - Identity Toolkit credential source
//! - [`endpoint`] - Batch-submit seam and the callable-function client
//! - [`protocol`] - Wire payloads and per-sample reconciliation
//! - [`backoff`] - Retry delay schedule
//! - [`engine`] - One sync cycle at a time
//! - [`supervisor`] - Task lifecycle, triggers and status
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use geotrack_sync::{Supervisor, TrackerConfig};
//!
//! let config = TrackerConfig::load(None)?;
//! let handle = Supervisor::builder(config, db)
//!     .with_provider(provider)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! handle.start_sampling().await?;
//! handle.trigger_sync().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod backoff;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod firebase;
pub mod protocol;
pub mod source;
pub mod supervisor;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use auth::{AuthProvider, CredentialSource, IssuedCredential};
pub use backoff::{BackoffPolicy, RetryBackoff};
pub use config::TrackerConfig;
pub use endpoint::{CallableEndpoint, DeliveryEndpoint};
pub use engine::{CycleOutcome, CycleReport, EngineConfig, EngineState, SkipReason, SyncEngine};
pub use error::{AuthError, CaptureError, SyncError, SyncResult, TransportError};
pub use firebase::FirebaseAuthSource;
pub use protocol::{BatchAck, OutcomeStatus, SampleOutcome};
pub use source::{
    LocationProvider, LocationRequest, Permission, Priority, ProviderEvent, SampleSource,
    SampleStream,
};
pub use supervisor::{
    NoOpEmitter, PipelineEventEmitter, PipelineStatus, SamplingState, Supervisor,
    SupervisorBuilder, SupervisorHandle, TerminalCondition,
};
