//! # Sync Engine
//!
//! Drains the Durable Queue in batches and reconciles what the backend says.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          One sync cycle                                 │
//! │                                                                         │
//! │  Idle ──► Selecting ──► Transmitting ──► Reconciling ──► Idle           │
//! │               │              │                                          │
//! │               │              └── transport / auth failure               │
//! │               │                      │                                  │
//! │               │                      ▼                                  │
//! │               │                  BackingOff ──(deadline passes)──► Idle │
//! │               └── nothing ready ──► Idle                                │
//! │                                                                         │
//! │  Reconciling, per id:                                                  │
//! │    accepted  → markDelivered (cursor advances in the same transaction)  │
//! │    rejected  → markFailed(BackendRejection, reason)                     │
//! │    retry /   → attempts + 1, Pending again (Failed(RetryExhausted)      │
//! │    missing     once the budget is spent)                                │
//! │                                                                         │
//! │  Shutdown ──► Stopped (terminal)                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Single Flight
//! `cycle_lock` is only ever `try_lock`ed by a cycle: a second caller gets
//! `Skipped(CycleInProgress)` instead of waiting. While a backoff deadline is
//! pending every cycle is `Skipped(BackingOff)`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use geotrack_core::{Batch, FailureReason, LocationSample};
use geotrack_db::{DbError, SampleQueueRepository};

use crate::auth::AuthProvider;
use crate::backoff::{BackoffPolicy, RetryBackoff};
use crate::config::TrackerConfig;
use crate::endpoint::DeliveryEndpoint;
use crate::error::{AuthError, TransportError};
use crate::protocol::{BatchAck, SampleOutcome};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub batch_size: u32,
    pub batch_max_age: Duration,
    pub max_attempts: u32,
    /// Deadline for one submit call, credential included.
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl From<&TrackerConfig> for EngineConfig {
    fn from(config: &TrackerConfig) -> Self {
        EngineConfig {
            batch_size: config.sync.batch_size,
            batch_max_age: config.sync.batch_max_age(),
            max_attempts: config.sync.max_attempts,
            request_timeout: config.sync.request_timeout(),
            backoff: BackoffPolicy::from(&config.backoff),
        }
    }
}

// =============================================================================
// State & Reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Selecting,
    Transmitting,
    Reconciling,
    BackingOff,
    /// Terminal, reached only through [`SyncEngine::shutdown`].
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Selecting => "selecting",
            EngineState::Transmitting => "transmitting",
            EngineState::Reconciling => "reconciling",
            EngineState::BackingOff => "backing_off",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CycleInProgress,
    BackingOff { remaining: Duration },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No batch was ready.
    Empty,
    /// The backend answered; individual samples may still have failed.
    Completed,
    /// Transport or retryable auth failure; a backoff is now pending.
    TransportFailed,
    /// The account is gone; the batch was released untouched.
    AuthRevoked,
    /// Local storage failed; nothing was lost.
    PersistenceFailed,
    Skipped(SkipReason),
}

/// What one call to [`SyncEngine::run_cycle`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub selected: usize,
    pub delivered: usize,
    pub rejected: usize,
    pub requeued: usize,
    pub exhausted: usize,
    pub next_attempt_in: Option<Duration>,
    pub error: Option<String>,
}

impl CycleReport {
    fn new(outcome: CycleOutcome) -> Self {
        CycleReport {
            outcome,
            selected: 0,
            delivered: 0,
            rejected: 0,
            requeued: 0,
            exhausted: 0,
            next_attempt_in: None,
            error: None,
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        CycleReport::new(CycleOutcome::Skipped(reason))
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.outcome,
            CycleOutcome::TransportFailed | CycleOutcome::AuthRevoked | CycleOutcome::PersistenceFailed
        )
    }
}

struct BackoffClock {
    schedule: RetryBackoff,
    deadline: Option<Instant>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct SyncEngine {
    queue: SampleQueueRepository,
    auth: Arc<AuthProvider>,
    endpoint: Arc<dyn DeliveryEndpoint>,
    config: EngineConfig,
    cycle_lock: Mutex<()>,
    backoff: Mutex<BackoffClock>,
    state: watch::Sender<EngineState>,
    stopped: AtomicBool,
    /// A reconciliation could not be written; InFlight rows may be stranded.
    needs_recovery: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        queue: SampleQueueRepository,
        auth: Arc<AuthProvider>,
        endpoint: Arc<dyn DeliveryEndpoint>,
        config: EngineConfig,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        SyncEngine {
            queue,
            auth,
            endpoint,
            backoff: Mutex::new(BackoffClock {
                schedule: RetryBackoff::new(config.backoff),
                deadline: None,
            }),
            config,
            cycle_lock: Mutex::new(()),
            state,
            stopped: AtomicBool::new(false),
            needs_recovery: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: EngineState) {
        self.state.send_if_modified(|current| {
            // Stopped is terminal
            if *current == next || *current == EngineState::Stopped {
                return false;
            }
            debug!(from = %current, to = %next, "Engine state");
            *current = next;
            true
        });
    }

    /// Time left before the next cycle may run, if a backoff is pending.
    pub async fn backoff_remaining(&self) -> Option<Duration> {
        let clock = self.backoff.lock().await;
        clock
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Consecutive failed cycles since the last successful one.
    pub async fn consecutive_failures(&self) -> u32 {
        self.backoff.lock().await.schedule.failures()
    }

    /// Lets the next cycle run immediately (e.g. connectivity came back).
    /// The failure count is kept, so another failure backs off further.
    pub async fn interrupt_backoff(&self) {
        let mut clock = self.backoff.lock().await;
        if clock.deadline.take().is_some() {
            debug!("Backoff interrupted");
            self.set_state(EngineState::Idle);
        }
    }

    /// Runs one cycle with the configured release rule.
    pub async fn run_cycle(&self) -> CycleReport {
        self.cycle(self.config.batch_max_age).await
    }

    /// Runs cycles back to back, releasing partial batches, until the queue
    /// has nothing left, a cycle fails, or `max_cycles` ran.
    pub async fn drain(&self, max_cycles: usize) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        for _ in 0..max_cycles {
            let report = self.cycle(Duration::ZERO).await;
            let keep_going = report.outcome == CycleOutcome::Completed;
            reports.push(report);
            if !keep_going {
                break;
            }
        }
        reports
    }

    async fn cycle(&self, max_age: Duration) -> CycleReport {
        if self.stopped.load(Ordering::Acquire) {
            return CycleReport::skipped(SkipReason::Stopped);
        }

        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!("Cycle already running");
            return CycleReport::skipped(SkipReason::CycleInProgress);
        };

        if let Some(remaining) = self.backoff_remaining().await {
            return CycleReport::skipped(SkipReason::BackingOff { remaining });
        }

        if self.needs_recovery.load(Ordering::Acquire) {
            // no other cycle can hold samples while we own cycle_lock
            match self.queue.recover_on_startup().await {
                Ok(recovered) => {
                    info!(count = recovered, "Released stranded in-flight samples");
                    self.needs_recovery.store(false, Ordering::Release);
                }
                Err(err) => return self.persistence_failed(err),
            }
        }

        self.set_state(EngineState::Selecting);
        let samples = match self
            .queue
            .select_batch(self.config.batch_size, max_age)
            .await
        {
            Ok(samples) => samples,
            Err(err) => return self.persistence_failed(err),
        };

        if samples.is_empty() {
            self.set_state(EngineState::Idle);
            return CycleReport::new(CycleOutcome::Empty);
        }

        let batch = Batch::from_samples(&samples);
        let mut report = CycleReport::new(CycleOutcome::Completed);
        report.selected = batch.len();

        info!(
            count = batch.len(),
            first_id = batch.first_id(),
            last_id = batch.last_id(),
            "Sync cycle started"
        );

        self.set_state(EngineState::Transmitting);
        match self.transmit(&samples).await {
            Ok(outcomes) => {
                self.set_state(EngineState::Reconciling);
                let ack = BatchAck::reconcile(&batch, outcomes);
                if let Err(err) = self.reconcile(&ack, &mut report).await {
                    self.needs_recovery.store(true, Ordering::Release);
                    return self.persistence_failed(err);
                }
                self.backoff.lock().await.schedule.reset();
                self.set_state(EngineState::Idle);
                info!(
                    delivered = report.delivered,
                    rejected = report.rejected,
                    requeued = report.requeued,
                    exhausted = report.exhausted,
                    "Sync cycle completed"
                );
                report
            }
            Err(TransmitFailure::Revoked(reason)) => {
                error!(%reason, "Account revoked, releasing batch");
                if let Err(err) = self.queue.release_in_flight(batch.ids()).await {
                    self.needs_recovery.store(true, Ordering::Release);
                    warn!(?err, "Could not release batch");
                }
                report.outcome = CycleOutcome::AuthRevoked;
                report.error = Some(reason);
                self.set_state(EngineState::Idle);
                report
            }
            Err(TransmitFailure::Retryable(message)) => {
                self.fail_batch(&batch, message, report).await
            }
        }
    }

    /// Credential plus submit, under one deadline.
    async fn transmit(
        &self,
        samples: &[LocationSample],
    ) -> Result<Vec<SampleOutcome>, TransmitFailure> {
        let timeout = self.config.request_timeout;
        let attempt = async {
            let credential = self.auth.current_credential().await?;
            let outcomes = self.endpoint.submit(samples, &credential).await?;
            Ok::<_, CycleError>(outcomes)
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(outcomes)) => Ok(outcomes),
            Ok(Err(CycleError::Revoked(reason))) => Err(TransmitFailure::Revoked(reason)),
            Ok(Err(CycleError::Unauthorized(message))) => {
                self.auth.invalidate().await;
                Err(TransmitFailure::Retryable(message))
            }
            Ok(Err(CycleError::Retryable(message))) => Err(TransmitFailure::Retryable(message)),
            Err(_) => {
                warn!(timeout_ms = millis(timeout), "Transmit deadline exceeded");
                Err(TransmitFailure::Retryable(TransportError::Timeout(timeout).to_string()))
            }
        }
    }

    async fn reconcile(&self, ack: &BatchAck, report: &mut CycleReport) -> Result<(), DbError> {
        report.delivered = self.queue.mark_delivered(&ack.accepted).await? as usize;

        for (id, reason) in &ack.rejected {
            warn!(sample_id = id, %reason, "Sample rejected by backend");
            report.rejected +=
                self.queue.mark_failed(&[*id], FailureReason::BackendRejection, Some(reason)).await? as usize;
        }

        for (id, reason) in &ack.retry {
            let outcome = self
                .queue
                .record_transport_failure(&[*id], reason, self.config.max_attempts)
                .await?;
            report.requeued += outcome.requeued.len();
            report.exhausted += outcome.exhausted.len();
        }

        Ok(())
    }

    async fn fail_batch(&self, batch: &Batch, message: String, mut report: CycleReport) -> CycleReport {
        warn!(error = %message, count = batch.len(), "Sync cycle failed");

        match self
            .queue
            .record_transport_failure(batch.ids(), &message, self.config.max_attempts)
            .await
        {
            Ok(outcome) => {
                report.requeued = outcome.requeued.len();
                report.exhausted = outcome.exhausted.len();
            }
            Err(err) => {
                error!(?err, "Could not record transport failure");
                self.needs_recovery.store(true, Ordering::Release);
            }
        }

        let delay = {
            let mut clock = self.backoff.lock().await;
            let delay = clock.schedule.next_delay();
            clock.deadline = Some(Instant::now() + delay);
            delay
        };
        info!(delay_ms = millis(delay), "Backing off");

        self.set_state(EngineState::BackingOff);
        report.outcome = CycleOutcome::TransportFailed;
        report.next_attempt_in = Some(delay);
        report.error = Some(message);
        report
    }

    fn persistence_failed(&self, err: DbError) -> CycleReport {
        error!(?err, "Queue operation failed, cycle abandoned");
        self.set_state(EngineState::Idle);
        let mut report = CycleReport::new(CycleOutcome::PersistenceFailed);
        report.error = Some(err.to_string());
        report
    }

    /// Refuses new cycles and waits up to `grace` for the running one.
    ///
    /// Returns false if the running cycle did not finish in time; its samples
    /// stay InFlight until the next startup recovery.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.stopped.store(true, Ordering::Release);
        let finished = tokio::time::timeout(grace, self.cycle_lock.lock()).await.is_ok();
        if !finished {
            warn!(grace_ms = millis(grace), "Cycle still running at shutdown");
        }
        self.set_state(EngineState::Stopped);
        info!("Sync engine stopped");
        finished
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// What the cycle does after a failed transmit.
#[derive(Debug)]
enum TransmitFailure {
    /// Release the batch untouched.
    Revoked(String),
    /// Count an attempt and back off.
    Retryable(String),
}

/// Raw failure of the credential or submit step.
#[derive(Debug)]
enum CycleError {
    Revoked(String),
    Unauthorized(String),
    Retryable(String),
}

impl From<AuthError> for CycleError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Revoked(reason) => CycleError::Revoked(reason),
            other => CycleError::Retryable(other.to_string()),
        }
    }
}

impl From<TransportError> for CycleError {
    fn from(err: TransportError) -> Self {
        if err.is_auth_failure() {
            CycleError::Unauthorized(err.to_string())
        } else {
            CycleError::Retryable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialSource, IssuedCredential};
    use async_trait::async_trait;
    use chrono::Utc;
    use geotrack_core::{Credential, DeliveryState, Position};
    use geotrack_db::{Database, DbConfig};
    use std::sync::Mutex as StdMutex;

    struct StaticSource;

    #[async_trait]
    impl CredentialSource for StaticSource {
        async fn sign_in(&self) -> Result<IssuedCredential, AuthError> {
            Ok(IssuedCredential {
                credential: Credential::new("tok", Utc::now() + chrono::Duration::hours(1), "uid"),
                refresh_token: None,
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<IssuedCredential, AuthError> {
            self.sign_in().await
        }
    }

    type Responder = Box<dyn Fn(&[LocationSample]) -> Result<Vec<SampleOutcome>, TransportError> + Send + Sync>;

    struct FakeEndpoint {
        responder: StdMutex<Responder>,
        sent: StdMutex<Vec<Vec<i64>>>,
    }

    impl FakeEndpoint {
        fn new(responder: Responder) -> Arc<Self> {
            Arc::new(FakeEndpoint {
                responder: StdMutex::new(responder),
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn accept_all() -> Arc<Self> {
            Self::new(Box::new(|samples| {
                Ok(samples.iter().map(|s| SampleOutcome::accepted(s.id)).collect())
            }))
        }

        fn set(&self, responder: Responder) {
            *self.responder.lock().unwrap() = responder;
        }
    }

    #[async_trait]
    impl DeliveryEndpoint for FakeEndpoint {
        async fn submit(
            &self,
            samples: &[LocationSample],
            _credential: &Credential,
        ) -> Result<Vec<SampleOutcome>, TransportError> {
            self.sent.lock().unwrap().push(samples.iter().map(|s| s.id).collect());
            (self.responder.lock().unwrap())(samples)
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            batch_size: 10,
            batch_max_age: Duration::ZERO,
            max_attempts: 3,
            request_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                base: Duration::from_secs(2),
                max: Duration::from_secs(300),
                multiplier: 2.0,
                jitter: 0.0,
            },
        }
    }

    async fn setup(endpoint: Arc<FakeEndpoint>) -> (Database, SyncEngine) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let auth = Arc::new(AuthProvider::new(Arc::new(StaticSource), Duration::from_secs(60)));
        let engine = SyncEngine::new(db.samples(), auth, endpoint, config());
        (db, engine)
    }

    async fn enqueue(db: &Database, n: usize) {
        for i in 0..n {
            let position = Position::new(Utc::now(), 45.0 + i as f64 * 0.01, 5.0, 10.0);
            db.samples().enqueue(&position).await.unwrap();
        }
    }

    #[test]
    fn test_log_millis_saturate() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (_db, engine) = setup(FakeEndpoint::accept_all()).await;
        assert_eq!(engine.run_cycle().await.outcome, CycleOutcome::Empty);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_mixed_outcome_scenario() {
        let endpoint = FakeEndpoint::new(Box::new(|_| {
            Ok(vec![
                SampleOutcome::accepted(1),
                SampleOutcome::accepted(2),
                SampleOutcome::accepted(3),
                SampleOutcome::rejected(4, "malformed"),
                SampleOutcome::retry(5, "timeout"),
            ])
        }));
        let (db, engine) = setup(endpoint).await;
        enqueue(&db, 5).await;

        let report = engine.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!((report.delivered, report.rejected, report.requeued), (3, 1, 1));

        let repo = db.samples();
        for id in 1..=3 {
            assert_eq!(repo.get(id).await.unwrap().delivery_state, DeliveryState::Delivered);
        }
        let rejected = repo.get(4).await.unwrap();
        assert_eq!(rejected.delivery_state, DeliveryState::Failed);
        assert_eq!(rejected.failure_reason, Some(FailureReason::BackendRejection));
        let retried = repo.get(5).await.unwrap();
        assert_eq!(retried.delivery_state, DeliveryState::Pending);
        assert_eq!(retried.attempts, 1);

        assert_eq!(db.cursor().get().await.unwrap().last_delivered_id, 3);
    }

    #[tokio::test]
    async fn test_transport_failure_backs_off() {
        let endpoint = FakeEndpoint::new(Box::new(|_| {
            Err(TransportError::Server { status: 503, message: "busy".into() })
        }));
        let (db, engine) = setup(endpoint.clone()).await;
        enqueue(&db, 2).await;

        let report = engine.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::TransportFailed);
        assert_eq!(report.next_attempt_in, Some(Duration::from_secs(2)));
        assert_eq!(report.requeued, 2);
        assert_eq!(engine.state(), EngineState::BackingOff);

        let skipped = engine.run_cycle().await;
        assert!(matches!(
            skipped.outcome,
            CycleOutcome::Skipped(SkipReason::BackingOff { .. })
        ));

        assert!(engine.backoff_remaining().await.is_some());
        engine.interrupt_backoff().await;
        assert_eq!(engine.state(), EngineState::Idle);
        endpoint.set(Box::new(|samples| {
            Ok(samples.iter().map(|s| SampleOutcome::accepted(s.id)).collect())
        }));
        let report = engine.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.delivered, 2);
        assert_eq!(engine.consecutive_failures().await, 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let endpoint = FakeEndpoint::new(Box::new(|_| {
            Err(TransportError::Connection("reset".into()))
        }));
        let (db, engine) = setup(endpoint.clone()).await;
        enqueue(&db, 1).await;

        for _ in 0..3 {
            engine.interrupt_backoff().await;
            assert_eq!(engine.run_cycle().await.outcome, CycleOutcome::TransportFailed);
        }

        let sample = db.samples().get(1).await.unwrap();
        assert_eq!(sample.delivery_state, DeliveryState::Failed);
        assert_eq!(sample.failure_reason, Some(FailureReason::RetryExhausted));

        engine.interrupt_backoff().await;
        assert_eq!(engine.run_cycle().await.outcome, CycleOutcome::Empty);
        assert_eq!(endpoint.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unauthorized_drops_credential_and_retries() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let auth = Arc::new(AuthProvider::new(Arc::new(StaticSource), Duration::from_secs(60)));
        let endpoint = FakeEndpoint::new(Box::new(|_| {
            Err(TransportError::Unauthorized("token expired".into()))
        }));
        let engine = SyncEngine::new(db.samples(), auth.clone(), endpoint.clone(), config());
        enqueue(&db, 1).await;

        let report = engine.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::TransportFailed);
        assert_eq!(report.requeued, 1);
        assert_eq!(auth.refresh_count(), 1);

        engine.interrupt_backoff().await;
        endpoint.set(Box::new(|samples| {
            Ok(samples.iter().map(|s| SampleOutcome::accepted(s.id)).collect())
        }));
        assert_eq!(engine.run_cycle().await.outcome, CycleOutcome::Completed);
        // the rejected token was not reused
        assert_eq!(auth.refresh_count(), 2);
    }

    /// Answers correctly, but only after `delay`.
    struct SlowEndpoint {
        delay: Duration,
    }

    #[async_trait]
    impl DeliveryEndpoint for SlowEndpoint {
        async fn submit(
            &self,
            samples: &[LocationSample],
            _credential: &Credential,
        ) -> Result<Vec<SampleOutcome>, TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(samples.iter().map(|s| SampleOutcome::accepted(s.id)).collect())
        }
    }

    #[tokio::test]
    async fn test_slow_submit_counts_as_transport_failure() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let auth = Arc::new(AuthProvider::new(Arc::new(StaticSource), Duration::from_secs(60)));
        let endpoint = Arc::new(SlowEndpoint {
            delay: Duration::from_millis(200),
        });
        let mut engine_config = config();
        engine_config.request_timeout = Duration::from_millis(50);
        let engine = SyncEngine::new(db.samples(), auth, endpoint, engine_config);
        enqueue(&db, 2).await;

        let report = engine.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::TransportFailed);
        assert_eq!(report.requeued, 2);
        assert!(report.error.unwrap().contains("timed out"));
        assert_eq!(engine.state(), EngineState::BackingOff);

        for id in 1..=2 {
            let sample = db.samples().get(id).await.unwrap();
            assert_eq!(sample.delivery_state, DeliveryState::Pending);
            assert_eq!(sample.attempts, 1);
        }
        assert_eq!(db.cursor().get().await.unwrap().last_delivered_id, 0);
    }

    #[tokio::test]
    async fn test_drain_releases_partial_batches() {
        let (db, mut engine) = setup(FakeEndpoint::accept_all()).await;
        engine.config.batch_max_age = Duration::from_secs(3600);
        engine.config.batch_size = 4;
        enqueue(&db, 10).await;

        let reports = engine.drain(10).await;
        let delivered: usize = reports.iter().map(|r| r.delivered).sum();
        assert_eq!(delivered, 10);
        assert_eq!(reports.last().unwrap().outcome, CycleOutcome::Empty);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let (db, engine) = setup(FakeEndpoint::accept_all()).await;
        enqueue(&db, 1).await;

        assert!(engine.shutdown(Duration::from_secs(1)).await);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(
            engine.run_cycle().await.outcome,
            CycleOutcome::Skipped(SkipReason::Stopped)
        );
        assert_eq!(db.samples().count_pending().await.unwrap(), 1);
    }
}
