//! # Sample Source
//!
//! Bridges the push-style platform location capability into a pull-style
//! [`Stream`] of filtered fixes.
//!
//! ## Flow
//! ```text
//! ┌───────────────────────┐  ProviderEvent   ┌──────────────┐   Position
//! │  LocationProvider     │ ───────────────► │ bounded mpsc │ ─────────────►  SampleStream
//! │  (platform callbacks) │   try_send/send  │  (capacity)  │   CaptureFilter   (poll_next)
//! └───────────────────────┘                  └──────────────┘
//!           ▲
//!           └── remove_updates() when the Subscription guard drops
//! ```
//!
//! - Skipped fixes (inaccurate, too soon, too close) are counted, never
//!   yielded.
//! - Provider outages are logged once and swallowed; fixes resume by
//!   themselves.
//! - Permission revocation yields one `Err(PermissionRevoked)` and ends the
//!   stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use geotrack_core::{CaptureFilter, FilterDecision, Position};

use crate::config::SamplingSettings;
use crate::error::CaptureError;

// =============================================================================
// Provider Contract
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    HighAccuracy,
    Balanced,
}

/// What the platform is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRequest {
    pub priority: Priority,
    /// Desired cadence.
    pub interval: Duration,
    /// Fastest cadence the pipeline accepts.
    pub min_interval: Duration,
    pub min_displacement_m: f64,
    pub wait_for_accurate: bool,
}

impl From<&SamplingSettings> for LocationRequest {
    fn from(settings: &SamplingSettings) -> Self {
        LocationRequest {
            priority: if settings.high_accuracy {
                Priority::HighAccuracy
            } else {
                Priority::Balanced
            },
            interval: settings.interval(),
            min_interval: settings.min_interval(),
            min_displacement_m: settings.min_displacement_m,
            wait_for_accurate: settings.wait_for_accurate,
        }
    }
}

/// Events pushed by the platform capability.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Fix(Position),
    Unavailable(String),
    Available,
    PermissionRevoked,
}

/// Platform location capability.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current permission state; queried before every start.
    async fn permission(&self) -> Permission;

    /// Starts pushing events into `events` until [`remove_updates`] is called.
    ///
    /// [`remove_updates`]: LocationProvider::remove_updates
    async fn request_updates(
        &self,
        request: &LocationRequest,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<(), CaptureError>;

    /// Releases the platform subscription. Must be idempotent.
    fn remove_updates(&self);
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct SourceStats {
    received: AtomicU64,
    emitted: AtomicU64,
    skipped: AtomicU64,
    invalid: AtomicU64,
    outages: AtomicU64,
}

/// Point-in-time copy of [`SourceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStatsSnapshot {
    pub received: u64,
    pub emitted: u64,
    pub skipped: u64,
    pub invalid: u64,
    pub outages: u64,
}

impl SourceStats {
    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            outages: self.outages.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Sample Source
// =============================================================================

/// Starts sampling sessions against one provider.
pub struct SampleSource {
    provider: Arc<dyn LocationProvider>,
    settings: SamplingSettings,
    stats: Arc<SourceStats>,
}

impl SampleSource {
    pub fn new(provider: Arc<dyn LocationProvider>, settings: SamplingSettings) -> Self {
        SampleSource {
            provider,
            settings,
            stats: Arc::new(SourceStats::default()),
        }
    }

    /// Checks permission, subscribes, and returns the stream of accepted
    /// fixes. Dropping the stream (or calling [`SampleStream::stop`])
    /// releases the subscription.
    pub async fn start(&self) -> Result<SampleStream, CaptureError> {
        if self.provider.permission().await == Permission::Denied {
            error!("Location permission denied, not starting");
            return Err(CaptureError::PermissionDenied);
        }

        let request = LocationRequest::from(&self.settings);
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));

        self.provider.request_updates(&request, tx).await?;
        info!(
            priority = ?request.priority,
            interval_secs = request.interval.as_secs(),
            min_displacement_m = request.min_displacement_m,
            "Location updates requested"
        );

        Ok(SampleStream {
            events: rx,
            filter: CaptureFilter::new(
                self.settings.max_accuracy_m,
                self.settings.min_interval(),
                self.settings.min_displacement_m,
            ),
            stats: self.stats.clone(),
            subscription: Some(Subscription {
                provider: self.provider.clone(),
            }),
            in_outage: false,
        })
    }

    pub fn stats(&self) -> SourceStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Holds the platform subscription; releasing it is tied to drop.
struct Subscription {
    provider: Arc<dyn LocationProvider>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!("Removing location updates");
        self.provider.remove_updates();
    }
}

/// Lazy, unbounded sequence of accepted fixes.
pub struct SampleStream {
    events: mpsc::Receiver<ProviderEvent>,
    filter: CaptureFilter,
    stats: Arc<SourceStats>,
    subscription: Option<Subscription>,
    in_outage: bool,
}

impl SampleStream {
    /// Ends the session and releases the platform subscription.
    pub fn stop(&mut self) {
        if self.subscription.take().is_some() {
            self.events.close();
            info!("Sampling stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_some()
    }

    fn on_fix(&mut self, fix: Position) -> Option<Position> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        match self.filter.evaluate(&fix) {
            FilterDecision::Accept => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
                Some(fix)
            }
            FilterDecision::Invalid => {
                self.stats.invalid.fetch_add(1, Ordering::Relaxed);
                warn!(lat = fix.latitude, lng = fix.longitude, "Dropping invalid fix");
                None
            }
            skip => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(decision = ?skip, accuracy_m = fix.accuracy_m, "Fix skipped");
                None
            }
        }
    }
}

impl Stream for SampleStream {
    type Item = Result<Position, CaptureError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.subscription.is_none() {
                return Poll::Ready(None);
            }

            match ready!(this.events.poll_recv(cx)) {
                Some(ProviderEvent::Fix(fix)) => {
                    if let Some(accepted) = this.on_fix(fix) {
                        return Poll::Ready(Some(Ok(accepted)));
                    }
                }
                Some(ProviderEvent::Unavailable(reason)) => {
                    if !this.in_outage {
                        this.stats.outages.fetch_add(1, Ordering::Relaxed);
                        warn!(%reason, "Location provider unavailable");
                        this.in_outage = true;
                    }
                }
                Some(ProviderEvent::Available) => {
                    if this.in_outage {
                        info!("Location provider available again");
                        this.in_outage = false;
                    }
                }
                Some(ProviderEvent::PermissionRevoked) => {
                    error!("Location permission revoked while sampling");
                    this.stop();
                    return Poll::Ready(Some(Err(CaptureError::PermissionRevoked)));
                }
                None => {
                    warn!("Location provider closed its channel");
                    this.stop();
                    return Poll::Ready(Some(Err(CaptureError::Stopped)));
                }
            }
        }
    }
}
