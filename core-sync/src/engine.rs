//! # Sync Engine
//!
//! Drains the change ledger against the remote store, one cycle at a time.
//!
//! ## Overview
//!
//! A sync cycle snapshots the pending set in drain order and pushes each
//! change through a fetch-resolve-push pipeline:
//!
//! 1. Fetch the entity's current remote snapshot
//! 2. Route on `(operation, snapshot present)` — deletes are pushed
//!    directly, creates and updates that collide with server-side state go
//!    through conflict resolution first
//! 3. Write the resulting server snapshot back into the local entity cache
//!
//! Every remote call runs through the retry executor, so transient faults
//! back off and a consistently-failing endpoint trips its circuit breaker
//! instead of burning the whole retry ladder per change.
//!
//! ## Concurrency
//!
//! At most one cycle runs at a time. A trigger that arrives mid-cycle is
//! coalesced: `sync` returns [`CycleOutcome::AlreadyRunning`] and the caller
//! (normally the scheduler) re-triggers once the running cycle finishes.
//!
//! ## Status
//!
//! Cycle state is published on a `watch` channel: `Idle` until the first
//! cycle, `Syncing` while draining, then `Success` or `Error` until the next
//! cycle begins. Subscribers always see the latest value on subscribe.

use bridge_traits::remote::{Payload, Snapshot};
use bridge_traits::{Clock, EntityCache, NetworkMonitor, RemoteStore};
use core_runtime::events::{ChangeEvent, CoreEvent, SyncEvent};
use core_runtime::EventBus;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::change::{ChangeId, ChangeOperation, ChangePriority, ChangeStatus, PendingChange};
use crate::conflict::{self, ConflictStrategy};
use crate::error::{Result, SyncError};
use crate::ledger::ChangeLedger;
use crate::retry::{BreakerSnapshot, CircuitBreaker, RetryExecutor, RetryPolicy};

/// Observable state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncStatus {
    /// No cycle has run yet, or the last cycle was interrupted
    #[default]
    Idle,
    /// A cycle is draining the pending queue
    Syncing,
    /// The last cycle brought every processed change to a terminal state
    Success,
    /// The last cycle aborted on an engine-level error
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// How urgently a cycle should run, assigned by whoever triggers it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncUrgency {
    /// Conservative background cadence (metered connections)
    Low,
    /// Regular background cadence
    Normal,
    /// Favorable conditions or explicit user intent
    High,
}

impl SyncUrgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// What initiated a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Explicit request from the host application
    Manual,
    /// Periodic trigger from the adaptive scheduler
    Scheduled(SyncUrgency),
    /// Connectivity returned after an offline period, at the urgency the
    /// new transport warrants
    Connectivity(SyncUrgency),
    /// A change was recorded while connected
    ChangeRecorded,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled(_) => "scheduled",
            Self::Connectivity(_) => "connectivity",
            Self::ChangeRecorded => "change_recorded",
        }
    }

    /// Urgency attached to the cycle this trigger starts.
    ///
    /// Scheduler-driven cycles carry the cadence urgency of the current
    /// network conditions; manual and record-time triggers reflect direct
    /// intent and run high.
    pub fn urgency(&self) -> SyncUrgency {
        match self {
            Self::Scheduled(urgency) | Self::Connectivity(urgency) => *urgency,
            Self::Manual | Self::ChangeRecorded => SyncUrgency::High,
        }
    }
}

/// Tunables for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How create/update collisions with server-side state are settled
    pub conflict_strategy: ConflictStrategy,
    /// Retry behavior for each remote call
    pub retry_policy: RetryPolicy,
    /// Consecutive failures before an operation's breaker opens
    pub breaker_threshold: u32,
    /// How long an open breaker rejects calls before admitting a trial
    pub breaker_cooldown: Duration,
    /// How long synced ledger rows are kept before the end-of-cycle purge
    pub retention: Duration,
    /// Failed attempts a change may accumulate before it is dropped
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::default(),
            retry_policy: RetryPolicy::default(),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_retries: crate::ledger::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Per-cycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Changes that reached the remote store
    pub synced: u64,
    /// Changes that failed and remain queued for retry
    pub failed: u64,
    /// Changes dropped after exhausting their retry budget
    pub dropped: u64,
    /// Changes skipped because their operation's breaker was open
    pub skipped: u64,
}

/// Result of asking the engine to run a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A cycle ran to completion (possibly over an empty queue)
    Completed(CycleStats),
    /// Another cycle was already running; the trigger was coalesced
    AlreadyRunning,
}

/// Lifetime counters exposed to the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    /// Changes currently waiting for a cycle
    pub pending: u64,
    /// Changes synced since the engine was created
    pub synced_total: u64,
    /// Failed attempts that left changes queued for retry
    pub failed_total: u64,
    /// Changes dropped after exhausting their retry budget
    pub dropped_total: u64,
    /// Unix timestamp of the last completed cycle
    pub last_cycle_at: Option<i64>,
}

/// Offline-first sync engine
pub struct SyncEngine {
    ledger: Arc<ChangeLedger>,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn EntityCache>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    executor: RetryExecutor,
    config: SyncConfig,
    status_tx: watch::Sender<SyncStatus>,
    /// Held for the duration of a cycle; `try_lock` failure means a cycle
    /// is in flight and the trigger is coalesced.
    cycle_guard: Mutex<()>,
    synced_total: AtomicU64,
    failed_total: AtomicU64,
    dropped_total: AtomicU64,
    last_cycle_at: AtomicI64,
}

impl SyncEngine {
    /// Create a new engine.
    ///
    /// Without a network monitor, recorded changes never trigger an eager
    /// cycle; sync must be driven manually or by the scheduler.
    pub fn new(
        ledger: Arc<ChangeLedger>,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn EntityCache>,
        network_monitor: Option<Arc<dyn NetworkMonitor>>,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        config: SyncConfig,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            config.breaker_cooldown,
            Arc::clone(&clock),
        ));
        let (status_tx, _) = watch::channel(SyncStatus::Idle);

        Self {
            ledger,
            remote,
            cache,
            network_monitor,
            clock,
            event_bus,
            executor: RetryExecutor::new(breaker),
            config,
            status_tx,
            cycle_guard: Mutex::new(()),
            synced_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            last_cycle_at: AtomicI64::new(0),
        }
    }

    /// The ledger this engine drains
    pub fn ledger(&self) -> &Arc<ChangeLedger> {
        &self.ledger
    }

    /// Current engine status
    pub fn status(&self) -> SyncStatus {
        *self.status_tx.borrow()
    }

    /// Observe status transitions.
    ///
    /// The receiver holds the latest status; new subscribers see the current
    /// value immediately.
    pub fn observe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Diagnostic view of one operation's circuit breaker
    pub fn breaker_snapshot(&self, operation: &str) -> Option<BreakerSnapshot> {
        self.executor.breaker().snapshot(operation)
    }

    /// Clear one operation's breaker state, e.g. after the host learns the
    /// backend recovered out of band
    pub fn reset_breaker(&self, operation: &str) {
        self.executor.breaker().reset(operation);
    }

    /// Lifetime counters plus the current pending count
    pub async fn stats(&self) -> Result<SyncStats> {
        Ok(SyncStats {
            pending: self.ledger.pending_count().await?,
            synced_total: self.synced_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            last_cycle_at: match self.last_cycle_at.load(Ordering::Relaxed) {
                0 => None,
                ts => Some(ts),
            },
        })
    }

    /// Record a local mutation and eagerly start a cycle when connected.
    ///
    /// This is the ingest path host applications call on every offline-capable
    /// mutation. The write to the ledger always succeeds offline; the eager
    /// cycle is best-effort and coalesces with any cycle already running.
    pub async fn record_change(
        self: &Arc<Self>,
        entity_type: &str,
        entity_id: &str,
        operation: ChangeOperation,
        payload: Payload,
        priority: ChangePriority,
    ) -> Result<PendingChange> {
        let (change, _) = self
            .ledger
            .record(entity_type, entity_id, operation, payload, priority)
            .await?;

        if let Some(monitor) = &self.network_monitor {
            if monitor.is_connected().await {
                self.spawn_sync(SyncTrigger::ChangeRecorded, CancellationToken::new());
            }
        }

        Ok(change)
    }

    /// Run a cycle on a background task
    pub fn spawn_sync(self: &Arc<Self>, trigger: SyncTrigger, token: CancellationToken) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.sync(trigger, &token).await {
                error!(error = %err, trigger = trigger.as_str(), "Background sync cycle failed");
            }
        });
    }

    /// Run one sync cycle.
    ///
    /// Returns immediately with [`CycleOutcome::AlreadyRunning`] when a
    /// cycle is already in flight. Per-change failures are absorbed into the
    /// cycle stats; only engine-level errors (ledger unavailable) abort the
    /// cycle and surface as `Err`.
    #[instrument(skip(self, token), fields(trigger = trigger.as_str()))]
    pub async fn sync(&self, trigger: SyncTrigger, token: &CancellationToken) -> Result<CycleOutcome> {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            debug!("Cycle already running; trigger coalesced");
            return Ok(CycleOutcome::AlreadyRunning);
        };

        let started_ms = self.clock.unix_timestamp_millis();
        let pending = match self.ledger.list_pending(None).await {
            Ok(pending) => pending,
            Err(err) => {
                self.abort_cycle(&err, 0);
                return Err(err);
            }
        };

        self.status_tx.send_replace(SyncStatus::Syncing);
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::CycleStarted {
                trigger: trigger.as_str().to_string(),
                urgency: trigger.urgency().as_str().to_string(),
                pending: pending.len() as u64,
            }))
            .ok();

        info!(
            pending = pending.len(),
            urgency = trigger.urgency().as_str(),
            "Sync cycle started"
        );

        let mut stats = CycleStats::default();
        let mut processed: u64 = 0;
        let mut cancelled = false;

        for change in &pending {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            processed += 1;

            match self.process_change(change, token).await {
                Ok(()) => {
                    stats.synced += 1;
                    self.synced_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(SyncError::Cancelled) => {
                    if let Err(err) = self.ledger.requeue(change.id).await {
                        self.abort_cycle(&err, processed);
                        return Err(err);
                    }
                    cancelled = true;
                    break;
                }
                Err(SyncError::CircuitOpen { operation }) => {
                    debug!(
                        change_id = %change.id,
                        operation,
                        "Breaker open; leaving change pending for a later cycle"
                    );
                    if let Err(err) = self.ledger.requeue(change.id).await {
                        self.abort_cycle(&err, processed);
                        return Err(err);
                    }
                    stats.skipped += 1;
                }
                Err(err) => {
                    match self.settle_failed_change(change, &err).await {
                        Ok(true) => {
                            stats.dropped += 1;
                            self.dropped_total.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {
                            stats.failed += 1;
                            self.failed_total.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(ledger_err) => {
                            self.abort_cycle(&ledger_err, processed);
                            return Err(ledger_err);
                        }
                    }
                }
            }
        }

        let cutoff = self.clock.unix_timestamp() - self.config.retention.as_secs() as i64;
        if let Err(err) = self.ledger.purge_synced_before(cutoff).await {
            warn!(error = %err, "Retention purge failed; will retry next cycle");
        }

        let duration_ms = (self.clock.unix_timestamp_millis() - started_ms).max(0) as u64;
        self.last_cycle_at
            .store(self.clock.unix_timestamp(), Ordering::Relaxed);

        // An interrupted cycle made no promise about the remaining queue, so
        // it parks back at Idle instead of claiming success.
        if cancelled {
            info!(?stats, "Sync cycle cancelled");
            self.status_tx.send_replace(SyncStatus::Idle);
        } else {
            info!(?stats, duration_ms, "Sync cycle completed");
            self.status_tx.send_replace(SyncStatus::Success);
        }

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::CycleCompleted {
                synced: stats.synced,
                failed: stats.failed,
                dropped: stats.dropped,
                duration_ms,
            }))
            .ok();

        Ok(CycleOutcome::Completed(stats))
    }

    /// Record a failed attempt against the ledger; returns `true` when the
    /// change exhausted its budget and was dropped.
    async fn settle_failed_change(&self, change: &PendingChange, err: &SyncError) -> Result<bool> {
        let updated = self.ledger.mark_failed(change.id, &err.to_string()).await?;

        if updated.status == ChangeStatus::Failed {
            self.ledger.remove(updated.id).await?;

            warn!(
                change_id = %updated.id,
                retry_count = updated.retry_count,
                error = %err,
                "Change dropped after exhausting retry budget"
            );

            self.event_bus
                .emit(CoreEvent::Change(ChangeEvent::Dropped {
                    change_id: updated.id.as_str(),
                    entity_type: updated.entity_type.clone(),
                    entity_id: updated.entity_id.clone(),
                    error: err.to_string(),
                    retry_count: updated.retry_count,
                }))
                .ok();

            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn abort_cycle(&self, err: &SyncError, processed: u64) {
        error!(error = %err, processed, "Sync cycle aborted");
        self.status_tx.send_replace(SyncStatus::Error);
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::CycleFailed {
                message: err.to_string(),
                processed,
            }))
            .ok();
    }

    #[instrument(
        skip(self, change, token),
        fields(
            change_id = %change.id,
            entity_type = %change.entity_type,
            entity_id = %change.entity_id,
            operation = change.operation.as_str(),
        )
    )]
    async fn process_change(&self, change: &PendingChange, token: &CancellationToken) -> Result<()> {
        self.ledger.mark_syncing(change.id).await?;

        let snapshot = self.fetch_remote(change, token).await?;

        match (change.operation, snapshot) {
            (ChangeOperation::Delete, None) => {
                // Already gone remotely; the delete is trivially complete.
                debug!("Entity absent remotely; delete needs no call");
            }
            (ChangeOperation::Delete, Some(_)) => {
                self.push_delete(change, token).await?;
                self.cache
                    .remove(&change.entity_type, &change.entity_id)
                    .await
                    .map_err(SyncError::from)?;
            }
            (ChangeOperation::Create, None) => {
                let created = self.push_create(change, &change.payload, token).await?;
                self.apply_to_cache(&created).await?;
            }
            (ChangeOperation::Update, None) => {
                info!("Entity vanished remotely; converting update to create");
                let created = self.push_create(change, &change.payload, token).await?;
                self.apply_to_cache(&created).await?;
            }
            (ChangeOperation::Create | ChangeOperation::Update, Some(remote_snapshot)) => {
                let resolution =
                    conflict::resolve(change, &remote_snapshot, self.config.conflict_strategy)?;

                debug!(
                    strategy = resolution.strategy.as_str(),
                    "Resolved collision with remote state"
                );

                match resolution.outgoing_payload {
                    // Server wins: overwrite the local cache, push nothing.
                    None => self.apply_to_cache(&remote_snapshot).await?,
                    Some(payload) => {
                        let updated = self.push_update(change, &payload, token).await?;
                        self.apply_to_cache(&updated).await?;
                    }
                }
            }
        }

        self.ledger.mark_synced(change.id).await?;
        Ok(())
    }

    async fn apply_to_cache(&self, snapshot: &Snapshot) -> Result<()> {
        self.cache
            .apply_snapshot(snapshot)
            .await
            .map_err(SyncError::from)
    }

    async fn fetch_remote(
        &self,
        change: &PendingChange,
        token: &CancellationToken,
    ) -> Result<Option<Snapshot>> {
        let operation = format!("fetch:{}", change.entity_type);
        let remote = Arc::clone(&self.remote);
        let entity_type = change.entity_type.clone();
        let entity_id = change.entity_id.clone();

        self.executor
            .execute(&operation, &self.config.retry_policy, token, move || {
                let remote = Arc::clone(&remote);
                let entity_type = entity_type.clone();
                let entity_id = entity_id.clone();
                async move {
                    remote
                        .fetch(&entity_type, &entity_id)
                        .await
                        .map_err(SyncError::from)
                }
            })
            .await
    }

    async fn push_create(
        &self,
        change: &PendingChange,
        payload: &Payload,
        token: &CancellationToken,
    ) -> Result<Snapshot> {
        let operation = format!("create:{}", change.entity_type);
        let remote = Arc::clone(&self.remote);
        let entity_type = change.entity_type.clone();
        let entity_id = change.entity_id.clone();
        let payload = payload.clone();

        self.executor
            .execute(&operation, &self.config.retry_policy, token, move || {
                let remote = Arc::clone(&remote);
                let entity_type = entity_type.clone();
                let entity_id = entity_id.clone();
                let payload = payload.clone();
                async move {
                    remote
                        .create(&entity_type, &entity_id, &payload)
                        .await
                        .map_err(SyncError::from)
                }
            })
            .await
    }

    async fn push_update(
        &self,
        change: &PendingChange,
        payload: &Payload,
        token: &CancellationToken,
    ) -> Result<Snapshot> {
        let operation = format!("update:{}", change.entity_type);
        let remote = Arc::clone(&self.remote);
        let entity_type = change.entity_type.clone();
        let entity_id = change.entity_id.clone();
        let payload = payload.clone();

        self.executor
            .execute(&operation, &self.config.retry_policy, token, move || {
                let remote = Arc::clone(&remote);
                let entity_type = entity_type.clone();
                let entity_id = entity_id.clone();
                let payload = payload.clone();
                async move {
                    remote
                        .update(&entity_type, &entity_id, &payload)
                        .await
                        .map_err(SyncError::from)
                }
            })
            .await
    }

    async fn push_delete(&self, change: &PendingChange, token: &CancellationToken) -> Result<()> {
        let operation = format!("delete:{}", change.entity_type);
        let remote = Arc::clone(&self.remote);
        let entity_type = change.entity_type.clone();
        let entity_id = change.entity_id.clone();

        self.executor
            .execute(&operation, &self.config.retry_policy, token, move || {
                let remote = Arc::clone(&remote);
                let entity_type = entity_type.clone();
                let entity_id = entity_id.clone();
                async move {
                    remote
                        .delete(&entity_type, &entity_id)
                        .await
                        .map_err(SyncError::from)
                }
            })
            .await
    }

    /// Resurrect a failed change and run an eager cycle
    pub async fn retry_change(self: &Arc<Self>, id: ChangeId) -> Result<PendingChange> {
        let change = self.ledger.requeue(id).await?;
        self.spawn_sync(SyncTrigger::Manual, CancellationToken::new());
        Ok(change)
    }
}
