//! # Pipeline Supervisor
//!
//! Owns the lifecycle of sampling and sync, and the restart policy.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Supervisor                                    │
//! │                                                                         │
//! │   SupervisorHandle ──Command──► control loop ──┬── purge timer          │
//! │   (clone anywhere)                 │           │                        │
//! │                                    │           └── PipelineStatus       │
//! │                 start/stop         │ trigger / gate (online, suspended) │
//! │                    ▼               ▼                                    │
//! │   ┌──────────────────────┐   ┌──────────────────────┐                  │
//! │   │   sampling task      │   │     sync task        │                  │
//! │   │  SampleStream.next() │   │  poll timer/backoff  │                  │
//! │   │  queue.enqueue()     │   │  engine.run_cycle()  │                  │
//! │   │  observers.send()    │   │                      │                  │
//! │   └──────────┬───────────┘   └──────────┬───────────┘                  │
//! │              └────────── Durable Queue ─┘                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Policies
//! - Timer cycles are skipped while offline; explicit triggers still run.
//! - Regaining connectivity cuts the current backoff short and triggers a
//!   cycle.
//! - `max_auth_revocations` consecutive revocations suspend the pipeline
//!   until [`SupervisorHandle::resume`].
//! - A fix that could not be enqueued stays in a bounded in-memory backlog
//!   and is retried.
//! - Sampling that fails to start, or whose stream ends without a permission
//!   problem, is restarted on the backoff schedule until it runs again or
//!   tracking is stopped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use geotrack_core::{LocationSample, Position};
use geotrack_db::{Database, SampleQueueRepository, ServicePreferencesRepository};

use crate::auth::{AuthProvider, CredentialSource};
use crate::backoff::{BackoffPolicy, RetryBackoff};
use crate::config::TrackerConfig;
use crate::endpoint::{CallableEndpoint, DeliveryEndpoint};
use crate::engine::{millis, CycleOutcome, CycleReport, EngineConfig, EngineState, SyncEngine};
use crate::error::{CaptureError, SyncError, SyncResult};
use crate::firebase::FirebaseAuthSource;
use crate::source::{LocationProvider, SampleSource, SampleStream};

/// Unpersisted fixes kept while storage is failing.
const BACKLOG_LIMIT: usize = 1024;

/// How often a non-empty backlog is retried.
const BACKLOG_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How long the sampling task gets to flush when stopped.
const SAMPLING_STOP_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingState {
    Stopped,
    Running,
}

/// Conditions that need the user; they never clear by themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalCondition {
    PermissionDenied,
    PermissionRevoked,
    AccountRevoked { reason: String },
}

/// Snapshot of the pipeline for the user-facing layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub sampling: SamplingState,
    pub engine: EngineState,
    pub online: bool,
    pub suspended: bool,
    pub pending: i64,
    pub in_flight: i64,
    pub delivered: i64,
    pub failed: i64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub terminal: Option<TerminalCondition>,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        PipelineStatus {
            sampling: SamplingState::Stopped,
            engine: EngineState::Idle,
            online: true,
            suspended: false,
            pending: 0,
            in_flight: 0,
            delivered: 0,
            failed: 0,
            last_cycle_at: None,
            last_error: None,
            consecutive_failures: 0,
            terminal: None,
        }
    }
}

// =============================================================================
// Event Emitter
// =============================================================================

/// Receives pipeline events (notification area, IPC bridge, tests).
pub trait PipelineEventEmitter: Send + Sync {
    fn emit_status(&self, status: &PipelineStatus);
    fn emit_progress(&self, pending: i64, delivered: i64);
    fn emit_error(&self, message: &str, retryable: bool);
    fn emit_cycle(&self, report: &CycleReport);
}

/// Emitter that ignores everything.
pub struct NoOpEmitter;

impl PipelineEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &PipelineStatus) {}
    fn emit_progress(&self, _pending: i64, _delivered: i64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
    fn emit_cycle(&self, _report: &CycleReport) {}
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Supervisor`].
///
/// Only the location provider is mandatory; credentials and delivery default
/// to the Firebase implementations built from the configuration.
pub struct SupervisorBuilder {
    config: TrackerConfig,
    db: Database,
    provider: Option<Arc<dyn LocationProvider>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    endpoint: Option<Arc<dyn DeliveryEndpoint>>,
    emitter: Option<Arc<dyn PipelineEventEmitter>>,
}

impl SupervisorBuilder {
    pub fn new(config: TrackerConfig, db: Database) -> Self {
        SupervisorBuilder {
            config,
            db,
            provider: None,
            credentials: None,
            endpoint: None,
            emitter: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn LocationProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    pub fn with_endpoint(mut self, endpoint: Arc<dyn DeliveryEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn PipelineEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> SyncResult<Supervisor> {
        self.config.validate()?;

        let provider = self
            .provider
            .ok_or_else(|| SyncError::InvalidConfig("Location provider required".into()))?;

        let credentials: Arc<dyn CredentialSource> = match self.credentials {
            Some(source) => source,
            None => Arc::new(FirebaseAuthSource::new(
                &self.config.auth,
                self.config.sync.request_timeout(),
            )?),
        };

        let endpoint: Arc<dyn DeliveryEndpoint> = match self.endpoint {
            Some(endpoint) => endpoint,
            None => Arc::new(CallableEndpoint::new(&self.config)?),
        };

        let auth = Arc::new(AuthProvider::new(
            credentials,
            self.config.auth.refresh_margin(),
        ));
        let engine = Arc::new(SyncEngine::new(
            self.db.samples(),
            auth,
            endpoint,
            EngineConfig::from(&self.config),
        ));

        Ok(Supervisor {
            source: Arc::new(SampleSource::new(provider, self.config.sampling.clone())),
            engine,
            queue: self.db.samples(),
            preferences: self.db.preferences(),
            emitter: self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
            config: Arc::new(self.config),
        })
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// A configured, not yet running pipeline.
pub struct Supervisor {
    config: Arc<TrackerConfig>,
    queue: SampleQueueRepository,
    preferences: ServicePreferencesRepository,
    source: Arc<SampleSource>,
    engine: Arc<SyncEngine>,
    emitter: Arc<dyn PipelineEventEmitter>,
}

enum Command {
    TriggerSync,
    Connectivity(bool),
    StartSampling(oneshot::Sender<SyncResult<()>>),
    StopTracking(oneshot::Sender<SyncResult<()>>),
    Resume(oneshot::Sender<SyncResult<()>>),
    Shutdown(oneshot::Sender<()>),
}

enum Event {
    Cycle(CycleReport),
    SamplingEnded {
        session: u64,
        error: Option<CaptureError>,
    },
}

#[derive(Debug, Clone, Copy)]
struct SyncGate {
    online: bool,
    suspended: bool,
}

impl Supervisor {
    pub fn builder(config: TrackerConfig, db: Database) -> SupervisorBuilder {
        SupervisorBuilder::new(config, db)
    }

    /// Recovers interrupted work, then spawns the control loop and the sync
    /// task. Sampling does not start until asked to.
    pub async fn start(self) -> SyncResult<SupervisorHandle> {
        let recovered = self.queue.recover_on_startup().await?;
        if recovered > 0 {
            info!(count = recovered, "Interrupted deliveries returned to the queue");
        }

        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(32);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (gate_tx, gate_rx) = watch::channel(SyncGate {
            online: true,
            suspended: false,
        });
        let (observers, _) = broadcast::channel(self.config.supervisor.observer_capacity);
        let status = Arc::new(RwLock::new(PipelineStatus::default()));
        let sampling_retry = RetryBackoff::new(BackoffPolicy::from(&self.config.backoff));

        let sync_task = tokio::spawn(run_sync(
            self.engine.clone(),
            self.config.sync.poll_interval(),
            self.config.sync.batch_size,
            trigger_rx,
            gate_rx,
            event_tx.clone(),
        ));

        let handle = SupervisorHandle {
            commands: command_tx,
            status: status.clone(),
            engine: self.engine.clone(),
            queue: self.queue.clone(),
            observers: observers.clone(),
        };

        let control = ControlLoop {
            config: self.config,
            queue: self.queue,
            preferences: self.preferences,
            source: self.source,
            engine: self.engine,
            emitter: self.emitter,
            status,
            observers,
            gate: gate_tx,
            triggers: Some(trigger_tx),
            events: event_tx,
            sync_task: Some(sync_task),
            sampling: None,
            sampling_retry,
            sampling_retry_at: None,
            session: 0,
            revocations: 0,
        };
        tokio::spawn(control.run(command_rx, event_rx));

        info!("Supervisor started");
        Ok(handle)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable control surface of a running pipeline.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    status: Arc<RwLock<PipelineStatus>>,
    engine: Arc<SyncEngine>,
    queue: SampleQueueRepository,
    observers: broadcast::Sender<LocationSample>,
}

impl SupervisorHandle {
    async fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Asks for a sync cycle as soon as possible.
    pub async fn trigger_sync(&self) -> SyncResult<()> {
        self.send(Command::TriggerSync).await
    }

    /// Reports a connectivity change.
    pub async fn connectivity_changed(&self, online: bool) -> SyncResult<()> {
        self.send(Command::Connectivity(online)).await
    }

    /// Starts sampling and remembers that tracking is on.
    pub async fn start_sampling(&self) -> SyncResult<()> {
        self.request(Command::StartSampling).await?
    }

    /// Explicit user stop: sampling ends and will not come back on boot.
    /// Queued samples keep being delivered.
    pub async fn stop_tracking(&self) -> SyncResult<()> {
        self.request(Command::StopTracking).await?
    }

    /// Leaves suspension and restarts whatever was running before.
    pub async fn resume(&self) -> SyncResult<()> {
        self.request(Command::Resume).await?
    }

    /// Current status, with fresh queue counts.
    pub async fn status(&self) -> SyncResult<PipelineStatus> {
        snapshot(&self.status, &self.engine, &self.queue).await
    }

    /// Receiver of every sample enqueued from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LocationSample> {
        self.observers.subscribe()
    }

    /// Same as [`subscribe`](Self::subscribe), as a `Stream`. Lagging
    /// observers get a `Lagged` item and lose notifications, never samples.
    pub fn observe(&self) -> BroadcastStream<LocationSample> {
        BroadcastStream::new(self.observers.subscribe())
    }

    /// Stops sampling, lets a running transmit finish (bounded by the
    /// request timeout) and ends all tasks.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(Command::Shutdown).await
    }
}

async fn snapshot(
    status: &RwLock<PipelineStatus>,
    engine: &SyncEngine,
    queue: &SampleQueueRepository,
) -> SyncResult<PipelineStatus> {
    let mut current = status.read().await.clone();
    let stats = queue.stats().await?;
    current.engine = engine.state();
    current.consecutive_failures = engine.consecutive_failures().await;
    current.pending = stats.pending;
    current.in_flight = stats.in_flight;
    current.delivered = stats.delivered;
    current.failed = stats.failed;
    Ok(current)
}

// =============================================================================
// Control Loop
// =============================================================================

struct SamplingTask {
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

struct ControlLoop {
    config: Arc<TrackerConfig>,
    queue: SampleQueueRepository,
    preferences: ServicePreferencesRepository,
    source: Arc<SampleSource>,
    engine: Arc<SyncEngine>,
    emitter: Arc<dyn PipelineEventEmitter>,
    status: Arc<RwLock<PipelineStatus>>,
    observers: broadcast::Sender<LocationSample>,
    gate: watch::Sender<SyncGate>,
    triggers: Option<mpsc::Sender<()>>,
    events: mpsc::Sender<Event>,
    sync_task: Option<JoinHandle<()>>,
    sampling: Option<SamplingTask>,
    sampling_retry: RetryBackoff,
    /// When the next sampling restart is due; `None` when none is pending.
    sampling_retry_at: Option<Instant>,
    session: u64,
    revocations: u32,
}

impl ControlLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: mpsc::Receiver<Event>) {
        let mut purge = tokio::time::interval(self.config.retention.purge_interval());
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.sampling_retry_at;
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All handles dropped");
                        self.shutdown().await;
                        break;
                    };
                    if !self.handle(command).await {
                        break;
                    }
                }
                Some(event) = events.recv() => self.on_event(event).await,
                _ = purge.tick() => self.purge().await,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_sampling().await;
                }
            }
        }

        info!("Supervisor stopped");
    }

    /// Returns false once the loop has to end.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::TriggerSync => self.trigger(),
            Command::Connectivity(online) => self.set_online(online).await,
            Command::StartSampling(reply) => {
                let _ = reply.send(self.start_sampling().await);
            }
            Command::StopTracking(reply) => {
                let _ = reply.send(self.stop_tracking().await);
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume().await);
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn trigger(&self) {
        if let Some(triggers) = &self.triggers {
            // a full channel means a cycle is already requested
            let _ = triggers.try_send(());
        }
    }

    async fn set_online(&mut self, online: bool) {
        let was_online = self.gate.borrow().online;
        self.gate.send_modify(|gate| gate.online = online);
        self.status.write().await.online = online;

        if online && !was_online {
            info!("Connectivity regained");
            self.engine.interrupt_backoff().await;
            self.trigger();
        } else if !online && was_online {
            info!("Connectivity lost, timer cycles paused");
        }
    }

    // =========================================================================
    // Sampling
    // =========================================================================

    async fn start_sampling(&mut self) -> SyncResult<()> {
        if self.gate.borrow().suspended {
            return Err(SyncError::Suspended("pipeline is suspended".into()));
        }
        if self.sampling.is_some() {
            return Ok(());
        }

        let stream = match self.source.start().await {
            Ok(stream) => stream,
            Err(err) => {
                let terminal = match err {
                    CaptureError::PermissionDenied => Some(TerminalCondition::PermissionDenied),
                    CaptureError::PermissionRevoked => Some(TerminalCondition::PermissionRevoked),
                    _ => None,
                };
                {
                    let mut status = self.status.write().await;
                    status.last_error = Some(err.to_string());
                    if terminal.is_some() {
                        status.terminal = terminal;
                    }
                }
                if err.is_terminal() {
                    self.sampling_retry_at = None;
                } else {
                    self.schedule_sampling_retry();
                }
                self.emitter.emit_error(&err.to_string(), !err.is_terminal());
                return Err(err.into());
            }
        };

        if let Err(err) = self.preferences.set_service_running(true).await {
            warn!(?err, "Could not persist service_running");
        }

        self.session += 1;
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(run_sampling(
            self.session,
            stream,
            self.queue.clone(),
            self.observers.clone(),
            self.events.clone(),
            stop_rx,
        ));
        self.sampling = Some(SamplingTask { stop: stop_tx, join });
        self.sampling_retry.reset();
        self.sampling_retry_at = None;

        {
            let mut status = self.status.write().await;
            status.sampling = SamplingState::Running;
            if matches!(
                status.terminal,
                Some(TerminalCondition::PermissionDenied | TerminalCondition::PermissionRevoked)
            ) {
                status.terminal = None;
            }
        }
        self.publish().await;
        info!(session = self.session, "Sampling started");
        Ok(())
    }

    async fn stop_sampling(&mut self) {
        let Some(task) = self.sampling.take() else {
            return;
        };
        let _ = task.stop.send(());
        if tokio::time::timeout(SAMPLING_STOP_GRACE, task.join).await.is_err() {
            warn!("Sampling task did not stop in time");
        }
        self.status.write().await.sampling = SamplingState::Stopped;
    }

    /// Arms the restart timer after a capture failure that is not a
    /// permission problem.
    fn schedule_sampling_retry(&mut self) {
        let delay = self.sampling_retry.next_delay();
        self.sampling_retry_at = Some(Instant::now() + delay);
        info!(
            delay_ms = millis(delay),
            attempt = self.sampling_retry.failures(),
            "Sampling restart scheduled"
        );
    }

    async fn retry_sampling(&mut self) {
        self.sampling_retry_at = None;
        debug!(attempt = self.sampling_retry.failures(), "Restarting sampling");
        // a failure reschedules itself
        if let Err(err) = self.start_sampling().await {
            debug!(%err, "Sampling restart failed");
        }
    }

    async fn stop_tracking(&mut self) -> SyncResult<()> {
        self.sampling_retry_at = None;
        self.sampling_retry.reset();
        self.stop_sampling().await;
        self.preferences.set_service_running(false).await?;
        self.publish().await;
        info!("Tracking stopped by user");
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Cycle(report) => self.on_cycle(report).await,
            Event::SamplingEnded { session, error } => {
                if session != self.session {
                    return;
                }
                // stop_sampling takes the task first, so a task still held
                // here means the stream ended on its own
                if self.sampling.take().is_none() {
                    return;
                }
                let err = error.unwrap_or(CaptureError::Stopped);
                {
                    let mut status = self.status.write().await;
                    status.sampling = SamplingState::Stopped;
                    status.last_error = Some(err.to_string());
                    if err == CaptureError::PermissionRevoked {
                        status.terminal = Some(TerminalCondition::PermissionRevoked);
                    }
                }
                if err.is_terminal() {
                    error!(%err, "Sampling ended");
                } else {
                    warn!(%err, "Sampling ended");
                }
                self.emitter.emit_error(&err.to_string(), !err.is_terminal());
                if !err.is_terminal() && !self.gate.borrow().suspended {
                    self.schedule_sampling_retry();
                }
                self.publish().await;
            }
        }
    }

    async fn on_cycle(&mut self, report: CycleReport) {
        self.emitter.emit_cycle(&report);

        if matches!(report.outcome, CycleOutcome::Skipped(_)) {
            return;
        }

        {
            let mut status = self.status.write().await;
            status.last_cycle_at = Some(Utc::now());
            if let Some(err) = &report.error {
                status.last_error = Some(err.clone());
            }
        }

        match report.outcome {
            CycleOutcome::AuthRevoked => {
                self.revocations += 1;
                let reason = report.error.clone().unwrap_or_default();
                self.status.write().await.terminal = Some(TerminalCondition::AccountRevoked {
                    reason: reason.clone(),
                });
                self.emitter.emit_error(&format!("Account revoked: {reason}"), false);

                if self.revocations >= self.config.supervisor.max_auth_revocations {
                    self.suspend().await;
                }
            }
            CycleOutcome::TransportFailed | CycleOutcome::PersistenceFailed => {
                if let Some(err) = &report.error {
                    self.emitter.emit_error(err, true);
                }
            }
            CycleOutcome::Completed => {
                self.revocations = 0;
                let mut status = self.status.write().await;
                if matches!(status.terminal, Some(TerminalCondition::AccountRevoked { .. })) {
                    status.terminal = None;
                }
            }
            CycleOutcome::Empty | CycleOutcome::Skipped(_) => {}
        }

        if let Ok(stats) = self.queue.stats().await {
            self.emitter.emit_progress(stats.pending, stats.delivered);
        }
        self.publish().await;
    }

    async fn suspend(&mut self) {
        error!(
            revocations = self.revocations,
            "Repeated account revocation, suspending pipeline"
        );
        self.sampling_retry_at = None;
        self.stop_sampling().await;
        self.gate.send_modify(|gate| gate.suspended = true);
        self.status.write().await.suspended = true;
        self.emitter.emit_error("Pipeline suspended", false);
    }

    async fn resume(&mut self) -> SyncResult<()> {
        let was_suspended = self.gate.borrow().suspended;
        self.revocations = 0;
        self.gate.send_modify(|gate| gate.suspended = false);
        {
            let mut status = self.status.write().await;
            status.suspended = false;
            status.terminal = None;
        }
        info!(was_suspended, "Pipeline resumed");

        if self.preferences.get().await?.service_running {
            self.start_sampling().await?;
        }
        self.engine.interrupt_backoff().await;
        self.trigger();
        self.publish().await;
        Ok(())
    }

    async fn purge(&self) {
        match self.queue.purge_delivered(self.config.retention.horizon()).await {
            Ok(purged) => debug!(purged, "Retention purge done"),
            Err(err) => warn!(?err, "Retention purge failed"),
        }
    }

    async fn publish(&self) {
        match snapshot(&self.status, &self.engine, &self.queue).await {
            Ok(status) => self.emitter.emit_status(&status),
            Err(err) => debug!(?err, "Status snapshot unavailable"),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down pipeline");
        self.sampling_retry_at = None;
        self.stop_sampling().await;

        let grace = self.config.sync.request_timeout();
        self.engine.shutdown(grace).await;

        // closing the trigger channel ends the sync task
        self.triggers.take();
        if let Some(task) = self.sync_task.take() {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Sync task did not stop in time");
            }
        }

        self.publish().await;
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

async fn run_sync(
    engine: Arc<SyncEngine>,
    poll_interval: Duration,
    batch_size: u32,
    mut triggers: mpsc::Receiver<()>,
    gate: watch::Receiver<SyncGate>,
    events: mpsc::Sender<Event>,
) {
    let mut more_ready = false;

    loop {
        let explicit = if more_ready {
            true
        } else {
            let wait = engine.backoff_remaining().await.unwrap_or(poll_interval);
            tokio::select! {
                trigger = triggers.recv() => match trigger {
                    Some(()) => true,
                    None => break,
                },
                _ = tokio::time::sleep(wait) => false,
            }
        };

        let current = *gate.borrow();
        if current.suspended {
            debug!("Pipeline suspended, cycle skipped");
            more_ready = false;
            continue;
        }
        if !explicit && !current.online {
            debug!("Offline, timer cycle skipped");
            continue;
        }

        let report = engine.run_cycle().await;
        if engine.is_stopped() {
            break;
        }

        // a full batch usually means more is waiting
        more_ready = report.outcome == CycleOutcome::Completed
            && report.selected >= batch_size as usize;

        if events.send(Event::Cycle(report)).await.is_err() {
            break;
        }
    }

    debug!("Sync task stopped");
}

async fn run_sampling(
    session: u64,
    mut stream: SampleStream,
    queue: SampleQueueRepository,
    observers: broadcast::Sender<LocationSample>,
    events: mpsc::Sender<Event>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut backlog: VecDeque<Position> = VecDeque::new();
    let mut retry = tokio::time::interval(BACKLOG_RETRY_INTERVAL);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let error = loop {
        tokio::select! {
            _ = &mut stop => break None,
            item = stream.next() => match item {
                Some(Ok(position)) => {
                    backlog.push_back(position);
                    flush_backlog(&queue, &observers, &mut backlog).await;
                }
                Some(Err(err)) => break Some(err),
                None => break None,
            },
            _ = retry.tick(), if !backlog.is_empty() => {
                flush_backlog(&queue, &observers, &mut backlog).await;
            }
        }
    };

    stream.stop();
    flush_backlog(&queue, &observers, &mut backlog).await;
    if !backlog.is_empty() {
        error!(count = backlog.len(), "Storage unavailable, unpersisted fixes lost");
    }

    let _ = events.send(Event::SamplingEnded { session, error }).await;
}

async fn flush_backlog(
    queue: &SampleQueueRepository,
    observers: &broadcast::Sender<LocationSample>,
    backlog: &mut VecDeque<Position>,
) {
    while let Some(position) = backlog.front() {
        match queue.enqueue(position).await {
            Ok(sample) => {
                backlog.pop_front();
                // no observers is fine
                let _ = observers.send(sample);
            }
            Err(err) => {
                warn!(?err, buffered = backlog.len(), "Enqueue failed, fix kept in memory");
                break;
            }
        }
    }

    while backlog.len() > BACKLOG_LIMIT {
        backlog.pop_front();
        error!(limit = BACKLOG_LIMIT, "Backlog full, oldest unpersisted fix dropped");
    }
}
