//! # Sync Error Types
//!
//! Error types for capture, authentication, delivery and supervision.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Pipeline Error Categories                         │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  CaptureError   │  │   AuthError     │  │   TransportError        │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  PermissionDen. │  │  Unavailable ↻  │  │  Timeout ↻              │ │
//! │  │  PermissionRev. │  │  SessionExpired │  │  Connection ↻           │ │
//! │  │  ProviderUnav.↻ │  │  Revoked ✖      │  │  Server (5xx) ↻         │ │
//! │  └────────┬────────┘  └────────┬────────┘  │  Unauthorized ↻         │ │
//! │           │                    │           └────────────┬────────────┘ │
//! │           └────────────┬───────┴────────────────────────┘              │
//! │                        ▼                                                │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ SyncError  + Persistence(DbError) ↻ + BackendRejection (per id) │   │
//! │  │            + Config / Channel / ShuttingDown / Suspended        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ↻ retryable (converted to a state transition or a backoff)            │
//! │  ✖ terminal  (surfaces as PipelineStatus.terminal)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use thiserror::Error;

use geotrack_db::DbError;

/// Result type alias for pipeline operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Capture Errors
// =============================================================================

/// Failures of the platform location capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Location permission was never granted.
    #[error("Location permission denied")]
    PermissionDenied,

    /// Permission was withdrawn while sampling.
    ///
    /// ## When This Occurs
    /// - User revokes location access in system settings
    /// - MDM policy removes the grant
    #[error("Location permission revoked")]
    PermissionRevoked,

    /// The provider is temporarily not producing fixes.
    #[error("Location provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider closed its channel.
    #[error("Location provider stopped")]
    Stopped,
}

impl CaptureError {
    /// Permission problems stop sampling until the user intervenes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureError::PermissionDenied | CaptureError::PermissionRevoked
        )
    }
}

// =============================================================================
// Auth Errors
// =============================================================================

/// Failures obtaining a credential.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The credential source could not be reached or answered with a server
    /// error. Retry later.
    #[error("Authentication unavailable: {0}")]
    Unavailable(String),

    /// The stored session can no longer be refreshed; a new sign-in is
    /// needed. The provider handles this itself.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// The account is disabled or deleted. Nothing will fix this without
    /// user action.
    #[error("Account revoked: {0}")]
    Revoked(String),
}

impl AuthError {
    /// Only revocation is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AuthError::Revoked(_))
    }
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Failures delivering a batch. All of them leave the batch pending.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response within the per-request deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// DNS, TCP or TLS failure.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The backend refused the bearer token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 5xx or another non-success status.
    #[error("Backend error {status}: {message}")]
    Server { status: u16, message: String },

    /// A 2xx response that could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// True when the credential should be dropped before the next attempt.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            TransportError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Server {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

// =============================================================================
// Pipeline Error
// =============================================================================

/// Umbrella error for the pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid endpoint URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Component Errors
    // =========================================================================
    /// Location capture failed.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Credential could not be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Batch could not be delivered.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local storage failed. The affected operation is retried later.
    #[error("Persistence error: {0}")]
    Persistence(#[from] DbError),

    /// The backend refused one sample. Never retried.
    #[error("Sample {id} rejected by backend: {reason}")]
    BackendRejection { id: i64, reason: String },

    /// Payload could not be encoded.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The pipeline is shutting down.
    #[error("Pipeline is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The supervisor gave up after repeated terminal failures.
    #[error("Pipeline suspended: {0}")]
    Suspended(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.into())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried on a later cycle.
    ///
    /// ## Retryable Errors
    /// - Transport failures of any kind
    /// - Auth failures other than revocation
    /// - Storage failures (nothing was lost, the operation is repeated)
    /// - Temporary provider outages
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Persistence(_) => true,
            SyncError::Auth(e) => e.is_retryable(),
            SyncError::Capture(e) => !e.is_terminal(),
            _ => false,
        }
    }

    /// Returns true for conditions that must reach the user.
    pub fn is_terminal(&self) -> bool {
        match self {
            SyncError::Auth(e) => !e.is_retryable(),
            SyncError::Capture(e) => e.is_terminal(),
            SyncError::Suspended(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
