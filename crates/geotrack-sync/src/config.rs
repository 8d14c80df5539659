//! # Tracker Configuration
//!
//! Configuration for sampling, delivery, backoff, auth and retention.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     GEOTRACK_API_KEY=AIza...                                           │
//! │     GEOTRACK_BATCH_SIZE=20                                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/geotrack/tracker.toml (Linux)                            │
//! │     ~/Library/Application Support/dev.geotrack.geotrack/tracker.toml   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │                                                                         │
//! │  Read once at startup. Nothing changes it while the pipeline runs.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! label = "Pixel 7"
//!
//! [sampling]
//! interval_secs = 300
//! min_displacement_m = 100.0
//!
//! [sync]
//! batch_size = 50
//! max_attempts = 5
//!
//! [auth]
//! api_key = "AIza..."
//!
//! [backend]
//! functions_url = "https://us-central1-my-project.cloudfunctions.net"
//! function_name = "onCallCreateOne"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use geotrack_core::validation::validate_positive;
use geotrack_core::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MULTIPLIER,
    DEFAULT_BATCH_MAX_AGE_SECS, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ACCURACY_M, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_REFRESH_MARGIN_SECS, DEFAULT_RETENTION_SECS,
};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device
// =============================================================================

/// Identity of this installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Installation id (UUID v4), generated on first run.
    pub id: String,

    /// Label sent with every document (manufacturer/model on phones).
    #[serde(default = "default_device_label")]
    pub label: String,
}

fn default_device_label() -> String {
    "geotrack-device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            label: default_device_label(),
        }
    }
}

// =============================================================================
// Sampling
// =============================================================================

/// How often and how precisely to sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    /// Desired time between fixes.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Fixes arriving sooner than this after the last emitted one are skipped.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    /// Fixes closer than this to the last emitted one are skipped.
    #[serde(default = "default_min_displacement")]
    pub min_displacement_m: f64,

    /// Fixes with a worse accuracy radius are dropped.
    #[serde(default = "default_max_accuracy")]
    pub max_accuracy_m: f64,

    /// Trade battery for precision.
    #[serde(default = "default_true")]
    pub high_accuracy: bool,

    /// Ask the provider to hold the first fix until it is accurate.
    #[serde(default)]
    pub wait_for_accurate: bool,

    /// Capacity of the channel between provider callbacks and the stream.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_interval() -> u64 {
    300
}
fn default_min_interval() -> u64 {
    60
}
fn default_min_displacement() -> f64 {
    100.0
}
fn default_max_accuracy() -> f64 {
    DEFAULT_MAX_ACCURACY_M
}
fn default_true() -> bool {
    true
}
fn default_channel_capacity() -> usize {
    64
}

impl Default for SamplingSettings {
    fn default() -> Self {
        SamplingSettings {
            interval_secs: default_interval(),
            min_interval_secs: default_min_interval(),
            min_displacement_m: default_min_displacement(),
            max_accuracy_m: default_max_accuracy(),
            high_accuracy: true,
            wait_for_accurate: false,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl SamplingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

// =============================================================================
// Sync
// =============================================================================

/// Batch and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Maximum samples per delivery attempt.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// A partial batch goes out once its oldest sample waited this long.
    #[serde(default = "default_batch_max_age")]
    pub batch_max_age_secs: u64,

    /// Transport attempts per sample before `RetryExhausted`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Deadline for one submit call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Time between scheduled cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}
fn default_batch_max_age() -> u64 {
    DEFAULT_BATCH_MAX_AGE_SECS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_request_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            batch_size: default_batch_size(),
            batch_max_age_secs: default_batch_max_age(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl SyncSettings {
    pub fn batch_max_age(&self) -> Duration {
        Duration::from_secs(self.batch_max_age_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Delay schedule after failed cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_base")]
    pub base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Fraction of each step that may be shaved off at random (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_backoff_base() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_backoff_max() -> u64 {
    DEFAULT_BACKOFF_MAX_SECS
}
fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}
fn default_jitter() -> f64 {
    0.5
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings {
            base_ms: default_backoff_base(),
            max_secs: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffSettings {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }
}

// =============================================================================
// Auth
// =============================================================================

/// Credential source settings (Firebase Authentication REST API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Web API key of the Firebase project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Refresh the token this long before it expires.
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,

    /// Identity Toolkit base URL (sign-in).
    #[serde(default = "default_identity_url")]
    pub identity_url: String,

    /// Secure Token base URL (refresh).
    #[serde(default = "default_secure_token_url")]
    pub secure_token_url: String,
}

fn default_refresh_margin() -> u64 {
    DEFAULT_REFRESH_MARGIN_SECS
}
fn default_identity_url() -> String {
    "https://identitytoolkit.googleapis.com".to_string()
}
fn default_secure_token_url() -> String {
    "https://securetoken.googleapis.com".to_string()
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            api_key: None,
            refresh_margin_secs: default_refresh_margin(),
            identity_url: default_identity_url(),
            secure_token_url: default_secure_token_url(),
        }
    }
}

impl AuthSettings {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Remote delivery endpoint (a Firebase callable function).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Functions base URL, e.g. `https://<region>-<project>.cloudfunctions.net`.
    #[serde(default = "default_functions_url")]
    pub functions_url: String,

    /// Callable function receiving batches.
    #[serde(default = "default_function_name")]
    pub function_name: String,

    /// Collection the documents are written to.
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_functions_url() -> String {
    "http://127.0.0.1:5001".to_string()
}
fn default_function_name() -> String {
    "onCallCreateOne".to_string()
}
fn default_collection() -> String {
    "locations".to_string()
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            functions_url: default_functions_url(),
            function_name: default_function_name(),
            collection: default_collection(),
        }
    }
}

impl BackendSettings {
    /// Full URL of the callable function.
    pub fn endpoint_url(&self) -> SyncResult<Url> {
        let mut base = Url::parse(&self.functions_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(&self.function_name)?)
    }
}

// =============================================================================
// Retention / Supervisor
// =============================================================================

/// Garbage collection of delivered samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Delivered samples older than this are deleted.
    #[serde(default = "default_retention")]
    pub horizon_secs: u64,

    /// How often the purge runs.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

fn default_retention() -> u64 {
    DEFAULT_RETENTION_SECS
}
fn default_purge_interval() -> u64 {
    3600
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings {
            horizon_secs: default_retention(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl RetentionSettings {
    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

/// Restart and suspension policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Consecutive revoked-account cycles before the pipeline suspends.
    #[serde(default = "default_max_auth_revocations")]
    pub max_auth_revocations: u32,

    /// Resume tracking at boot if it was running before.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Buffer of the in-process sample broadcast.
    #[serde(default = "default_observer_capacity")]
    pub observer_capacity: usize,
}

fn default_max_auth_revocations() -> u32 {
    3
}
fn default_observer_capacity() -> usize {
    32
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            max_auth_revocations: default_max_auth_revocations(),
            auto_start: true,
            observer_capacity: default_observer_capacity(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete tracker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub sampling: SamplingSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub backoff: BackoffSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

impl TrackerConfig {
    /// Defaults, then `tracker.toml` if it exists, then `GEOTRACK_*`
    /// variables. The result is validated before it is returned.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let file = config_path
            .or_else(Self::default_config_path)
            .filter(|path| path.is_file());

        let mut config = match file {
            Some(path) => {
                info!(path = %path.display(), "Reading tracker config");
                toml::from_str(&std::fs::read_to_string(&path)?)?
            }
            None => {
                debug!("No tracker config on disk, starting from defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but a broken file or override falls back
    /// to defaults with a warning.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|err| {
            warn!(%err, "Tracker config unusable, falling back to defaults");
            Self::default()
        })
    }

    /// Writes the whole config, including the generated device id, as TOML.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let Some(path) = config_path.or_else(Self::default_config_path) else {
            return Err(SyncError::ConfigSaveFailed(
                "no config directory on this platform".into(),
            ));
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, toml::to_string_pretty(self)?)?;

        debug!(path = %path.display(), "Tracker config written");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.batch_size must be greater than 0".into(),
            ));
        }
        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_attempts must be greater than 0".into(),
            ));
        }
        if self.sync.request_timeout_secs == 0 || self.sync.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.request_timeout_secs and sync.poll_interval_secs must be greater than 0"
                    .into(),
            ));
        }

        if self.backoff.base_ms == 0 || self.backoff.base() > self.backoff.max() {
            return Err(SyncError::InvalidConfig(
                "backoff.base_ms must be positive and not exceed backoff.max_secs".into(),
            ));
        }
        if self.backoff.multiplier < 1.0 || !self.backoff.multiplier.is_finite() {
            return Err(SyncError::InvalidConfig(
                "backoff.multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(SyncError::InvalidConfig(
                "backoff.jitter must be between 0.0 and 1.0".into(),
            ));
        }

        validate_positive("sampling.max_accuracy_m", self.sampling.max_accuracy_m)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        if self.sampling.min_displacement_m < 0.0 || self.sampling.channel_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "sampling.min_displacement_m must be >= 0 and channel_capacity > 0".into(),
            ));
        }

        if self.supervisor.max_auth_revocations == 0 || self.supervisor.observer_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "supervisor.max_auth_revocations and observer_capacity must be greater than 0"
                    .into(),
            ));
        }

        for (name, url) in [
            ("backend.functions_url", &self.backend.functions_url),
            ("auth.identity_url", &self.auth.identity_url),
            ("auth.secure_token_url", &self.auth.secure_token_url),
        ] {
            let parsed = Url::parse(url).map_err(|e| SyncError::InvalidUrl(format!("{name}: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.backend.function_name.is_empty() {
            return Err(SyncError::InvalidConfig(
                "backend.function_name must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Applies `GEOTRACK_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("GEOTRACK_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device id from environment");
            self.device.id = id;
        }

        if let Some(label) = lookup("GEOTRACK_DEVICE_LABEL") {
            self.device.label = label;
        }

        if let Some(key) = lookup("GEOTRACK_API_KEY") {
            self.auth.api_key = Some(key);
        }

        if let Some(url) = lookup("GEOTRACK_FUNCTIONS_URL") {
            debug!(url = %url, "Overriding functions URL from environment");
            self.backend.functions_url = url;
        }

        if let Some(name) = lookup("GEOTRACK_FUNCTION_NAME") {
            self.backend.function_name = name;
        }

        parse_override(&lookup, "GEOTRACK_BATCH_SIZE", &mut self.sync.batch_size);
        parse_override(&lookup, "GEOTRACK_MAX_ATTEMPTS", &mut self.sync.max_attempts);
        parse_override(&lookup, "GEOTRACK_POLL_INTERVAL_SECS", &mut self.sync.poll_interval_secs);
        parse_override(&lookup, "GEOTRACK_SAMPLING_INTERVAL_SECS", &mut self.sampling.interval_secs);
        parse_override(&lookup, "GEOTRACK_AUTO_START", &mut self.supervisor.auto_start);
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "geotrack", "geotrack")
            .map(|dirs| dirs.config_dir().join("tracker.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device id.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the device label.
    pub fn device_label(&self) -> &str {
        &self.device.label
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(value) => {
                debug!(key, "Overriding from environment");
                *target = value;
            }
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.backoff.base(), Duration::from_secs(2));
        assert_eq!(config.backoff.max(), Duration::from_secs(300));
        assert_eq!(config.sampling.interval(), Duration::from_secs(300));
        assert_eq!(config.retention.horizon(), Duration::from_secs(7 * 24 * 3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TrackerConfig::default();

        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
        config.sync.batch_size = 10;

        config.backoff.jitter = 1.5;
        assert!(config.validate().is_err());
        config.backoff.jitter = 0.2;

        config.backend.functions_url = "ftp://example.com".into();
        assert!(config.validate().is_err());

        config.backend.functions_url = "https://europe-west1-demo.cloudfunctions.net".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_url() {
        let mut backend = BackendSettings::default();
        backend.functions_url = "https://europe-west1-demo.cloudfunctions.net".into();
        assert_eq!(
            backend.endpoint_url().unwrap().as_str(),
            "https://europe-west1-demo.cloudfunctions.net/onCallCreateOne"
        );

        backend.functions_url = "http://127.0.0.1:5001/demo/us-central1".into();
        assert_eq!(
            backend.endpoint_url().unwrap().as_str(),
            "http://127.0.0.1:5001/demo/us-central1/onCallCreateOne"
        );
    }

    #[test]
    fn test_env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = [
            ("GEOTRACK_BATCH_SIZE", "20"),
            ("GEOTRACK_API_KEY", "key-123"),
            ("GEOTRACK_AUTO_START", "false"),
            ("GEOTRACK_MAX_ATTEMPTS", "lots"),
        ]
        .into_iter()
        .collect();

        let mut config = TrackerConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.sync.batch_size, 20);
        assert_eq!(config.auth.api_key.as_deref(), Some("key-123"));
        assert!(!config.supervisor.auto_start);
        // unparsable value left the default in place
        assert_eq!(config.sync.max_attempts, 5);
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let config: TrackerConfig = toml::from_str(
            r#"
            [device]
            id = "abc"

            [sync]
            batch_size = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.device.id, "abc");
        assert_eq!(config.device.label, "geotrack-device");
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.backend.function_name, "onCallCreateOne");
    }

    #[test]
    fn test_unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.toml");
        std::fs::write(&path, "[sync]\nbatch_size = \"many\"\n").unwrap();

        assert!(TrackerConfig::load(Some(path.clone())).is_err());
        let config = TrackerConfig::load_or_default(Some(path));
        assert_eq!(config.sync.batch_size, 50);
    }

    #[test]
    fn test_saved_config_keeps_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracker.toml");

        let mut config = TrackerConfig::default();
        config.sync.batch_size = 12;
        config.save(Some(path.clone())).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[device]"));
        assert!(written.contains("[backoff]"));

        let loaded = TrackerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.id, config.device.id);
        assert_eq!(loaded.sync.batch_size, 12);
    }
}
