//! # Change Ledger
//!
//! Durable, priority-ordered queue of pending local mutations.
//!
//! ## Overview
//!
//! The ledger persists every offline mutation to SQLite so queued work
//! survives process restarts. It enforces the core invariant of the sync
//! queue: **at most one pending change per entity**. Recording a mutation
//! for an entity that already has a pending row folds the new mutation into
//! that row (see [`crate::change::merged_operation`]) instead of appending.
//!
//! ## Features
//!
//! - **Persistence**: ledger state survives restarts; a partial unique index
//!   backstops the one-pending-row-per-entity invariant at the schema level
//! - **Merge-on-write**: successive mutations collapse to their net effect
//! - **Prioritization**: draining order is priority descending, then FIFO
//! - **Observability**: a `watch` channel publishes the pending set after
//!   every mutation so UI badges update without polling
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::{ChangeLedger, ChangeOperation, ChangePriority};
//!
//! # async fn example(pool: sqlx::SqlitePool, clock: std::sync::Arc<dyn bridge_traits::Clock>, bus: core_runtime::EventBus) -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = ChangeLedger::new(pool, clock, bus, 5).await?;
//!
//! let change = ledger
//!     .record("event", "e1", ChangeOperation::Update, payload, ChangePriority::Normal)
//!     .await?;
//!
//! for change in ledger.list_pending(None).await? {
//!     // push to the remote store...
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bridge_traits::remote::Payload;
use bridge_traits::Clock;
use core_runtime::events::{ChangeEvent, CoreEvent};
use core_runtime::EventBus;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::change::{ChangeId, ChangeOperation, ChangePriority, ChangeStatus, PendingChange};
use crate::error::{Result, SyncError};

/// Default retry budget for a pending change
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Repository trait for persisting the change ledger
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Insert a pending change
    async fn insert(&self, change: &PendingChange) -> Result<()>;

    /// Update a pending change
    async fn update(&self, change: &PendingChange) -> Result<()>;

    /// Find a change by ID
    async fn find_by_id(&self, id: ChangeId) -> Result<Option<PendingChange>>;

    /// Find the pending change for an entity, if one exists
    async fn find_pending_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<PendingChange>>;

    /// List pending changes, highest priority first, FIFO within a priority.
    ///
    /// With `min_priority` set, rows below that priority are filtered out.
    async fn list_pending(
        &self,
        min_priority: Option<ChangePriority>,
    ) -> Result<Vec<PendingChange>>;

    /// List changes that exhausted their retry budget
    async fn list_failed(&self) -> Result<Vec<PendingChange>>;

    /// Count changes in a given status
    async fn count_by_status(&self, status: ChangeStatus) -> Result<u64>;

    /// Delete a change by ID
    async fn delete(&self, id: ChangeId) -> Result<()>;

    /// Delete synced changes last updated before the cutoff timestamp
    async fn delete_synced_before(&self, cutoff: i64) -> Result<u64>;
}

/// SQLite implementation of the change store
pub struct SqliteChangeStore {
    pool: SqlitePool,
}

impl SqliteChangeStore {
    /// Create a new store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database tables if they don't exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_ledger (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_attempt_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        // Schema-level backstop for the one-pending-row-per-entity invariant
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_change_ledger_pending_entity
            ON change_ledger(entity_type, entity_id)
            WHERE status = 'pending'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        // Index for efficient drain-order queries
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_change_ledger_status_priority
            ON change_ledger(status, priority DESC, created_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        self.recover_interrupted().await?;

        Ok(())
    }

    /// Return rows stranded in `syncing` by a process death to the queue.
    ///
    /// A stranded row whose entity gained a newer pending row in between is
    /// dropped, the same way a settled attempt drops a superseded row.
    async fn recover_interrupted(&self) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM change_ledger
            WHERE status = 'syncing' AND EXISTS (
                SELECT 1 FROM change_ledger AS newer
                WHERE newer.entity_type = change_ledger.entity_type
                  AND newer.entity_id = change_ledger.entity_id
                  AND newer.status = 'pending'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        let recovered =
            sqlx::query("UPDATE change_ledger SET status = 'pending' WHERE status = 'syncing'")
                .execute(&self.pool)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;

        if recovered.rows_affected() > 0 {
            info!(
                recovered = recovered.rows_affected(),
                "Recovered sync attempts interrupted by a previous shutdown"
            );
        }

        Ok(())
    }

    fn row_to_change(row: &sqlx::sqlite::SqliteRow) -> Result<PendingChange> {
        let payload: Payload = serde_json::from_str(&row.get::<String, _>("payload"))
            .map_err(|e| SyncError::Database(format!("Corrupt payload column: {}", e)))?;

        Ok(PendingChange {
            id: ChangeId::from_string(&row.get::<String, _>("id"))?,
            entity_type: row.get("entity_type"),
            entity_id: row.get("entity_id"),
            operation: row.get::<String, _>("operation").parse()?,
            payload,
            status: row.get::<String, _>("status").parse()?,
            priority: ChangePriority::from_i32(row.get("priority"))?,
            retry_count: row.get::<i32, _>("retry_count") as u32,
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_attempt_at: row.get("last_attempt_at"),
        })
    }

    fn payload_to_column(payload: &Payload) -> Result<String> {
        serde_json::to_string(payload)
            .map_err(|e| SyncError::Database(format!("Unserializable payload: {}", e)))
    }
}

const SELECT_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, status, priority, \
                              retry_count, error_message, created_at, updated_at, last_attempt_at";

#[async_trait]
impl ChangeStore for SqliteChangeStore {
    async fn insert(&self, change: &PendingChange) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO change_ledger (
                id, entity_type, entity_id, operation, payload, status, priority,
                retry_count, error_message, created_at, updated_at, last_attempt_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(change.id.as_str())
        .bind(&change.entity_type)
        .bind(&change.entity_id)
        .bind(change.operation.as_str())
        .bind(Self::payload_to_column(&change.payload)?)
        .bind(change.status.as_str())
        .bind(change.priority.as_i32())
        .bind(change.retry_count as i32)
        .bind(&change.error_message)
        .bind(change.created_at)
        .bind(change.updated_at)
        .bind(change.last_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, change: &PendingChange) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE change_ledger SET
                operation = ?,
                payload = ?,
                status = ?,
                priority = ?,
                retry_count = ?,
                error_message = ?,
                updated_at = ?,
                last_attempt_at = ?
            WHERE id = ?
            "#,
        )
        .bind(change.operation.as_str())
        .bind(Self::payload_to_column(&change.payload)?)
        .bind(change.status.as_str())
        .bind(change.priority.as_i32())
        .bind(change.retry_count as i32)
        .bind(&change.error_message)
        .bind(change.updated_at)
        .bind(change.last_attempt_at)
        .bind(change.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_by_id(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM change_ledger WHERE id = ?",
            SELECT_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(Self::row_to_change).transpose()
    }

    async fn find_pending_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<PendingChange>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM change_ledger
            WHERE entity_type = ? AND entity_id = ? AND status = 'pending'
            "#,
            SELECT_COLUMNS
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(Self::row_to_change).transpose()
    }

    async fn list_pending(
        &self,
        min_priority: Option<ChangePriority>,
    ) -> Result<Vec<PendingChange>> {
        let floor = min_priority.unwrap_or(ChangePriority::Low).as_i32();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM change_ledger
            WHERE status = 'pending' AND priority >= ?
            ORDER BY priority DESC, created_at ASC
            "#,
            SELECT_COLUMNS
        ))
        .bind(floor)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_change).collect()
    }

    async fn list_failed(&self) -> Result<Vec<PendingChange>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM change_ledger
            WHERE status = 'failed'
            ORDER BY updated_at DESC
            "#,
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_change).collect()
    }

    async fn count_by_status(&self, status: ChangeStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM change_ledger WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count as u64)
    }

    async fn delete(&self, id: ChangeId) -> Result<()> {
        sqlx::query("DELETE FROM change_ledger WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn delete_synced_before(&self, cutoff: i64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM change_ledger WHERE status = 'synced' AND updated_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

/// Outcome of recording a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new pending row was created
    Recorded,
    /// The mutation was folded into an existing pending row
    Merged,
}

/// Durable queue of pending local mutations
pub struct ChangeLedger {
    store: Arc<dyn ChangeStore>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    max_retries: u32,
    /// Serializes read-merge-write in `record` so concurrent recorders
    /// cannot both miss the existing pending row.
    record_lock: Mutex<()>,
    pending_tx: watch::Sender<Vec<PendingChange>>,
}

impl ChangeLedger {
    /// Create a ledger backed by SQLite, creating tables as needed
    pub async fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        max_retries: u32,
    ) -> Result<Self> {
        let store = SqliteChangeStore::new(pool);
        store.initialize().await?;

        let ledger = Self::with_store(Arc::new(store), clock, event_bus, max_retries);
        // Surface rows that survived a restart to observers immediately.
        ledger.refresh_observers().await?;
        Ok(ledger)
    }

    /// Create a ledger with a custom store
    pub fn with_store(
        store: Arc<dyn ChangeStore>,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        max_retries: u32,
    ) -> Self {
        let (pending_tx, _) = watch::channel(Vec::new());

        Self {
            store,
            clock,
            event_bus,
            max_retries,
            record_lock: Mutex::new(()),
            pending_tx,
        }
    }

    /// Retry budget applied to changes in this ledger
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record a local mutation.
    ///
    /// If the entity already has a pending change, the mutation is folded
    /// into it and the surviving row is returned; otherwise a new row is
    /// inserted. Either way the pending set observers are notified.
    pub async fn record(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: ChangeOperation,
        payload: Payload,
        priority: ChangePriority,
    ) -> Result<(PendingChange, RecordOutcome)> {
        let _guard = self.record_lock.lock().await;
        let now = self.clock.unix_timestamp();

        let (change, outcome) = match self
            .store
            .find_pending_by_entity(entity_type, entity_id)
            .await?
        {
            Some(mut existing) => {
                existing.absorb(operation, payload, priority, now);
                self.store.update(&existing).await?;

                debug!(
                    change_id = %existing.id,
                    entity_type,
                    entity_id,
                    operation = existing.operation.as_str(),
                    "Merged mutation into pending change"
                );

                self.event_bus
                    .emit(CoreEvent::Change(ChangeEvent::Merged {
                        change_id: existing.id.as_str(),
                        entity_type: existing.entity_type.clone(),
                        entity_id: existing.entity_id.clone(),
                        operation: existing.operation.as_str().to_string(),
                    }))
                    .ok();

                (existing, RecordOutcome::Merged)
            }
            None => {
                let change = PendingChange::with_priority(
                    entity_type,
                    entity_id,
                    operation,
                    payload,
                    priority,
                    now,
                );
                self.store.insert(&change).await?;

                info!(
                    change_id = %change.id,
                    entity_type,
                    entity_id,
                    operation = change.operation.as_str(),
                    priority = ?change.priority,
                    "Recorded pending change"
                );

                self.event_bus
                    .emit(CoreEvent::Change(ChangeEvent::Recorded {
                        change_id: change.id.as_str(),
                        entity_type: change.entity_type.clone(),
                        entity_id: change.entity_id.clone(),
                        operation: change.operation.as_str().to_string(),
                    }))
                    .ok();

                (change, RecordOutcome::Recorded)
            }
        };

        self.refresh_observers().await?;
        Ok((change, outcome))
    }

    /// List pending changes in drain order
    pub async fn list_pending(
        &self,
        min_priority: Option<ChangePriority>,
    ) -> Result<Vec<PendingChange>> {
        self.store.list_pending(min_priority).await
    }

    /// Mark a change as being pushed and return the updated row
    pub async fn mark_syncing(&self, id: ChangeId) -> Result<PendingChange> {
        let mut change = self.get(id).await?;
        change.start_attempt(self.clock.unix_timestamp());
        self.store.update(&change).await?;
        self.refresh_observers().await?;
        Ok(change)
    }

    /// Mark a change as successfully synced
    pub async fn mark_synced(&self, id: ChangeId) -> Result<PendingChange> {
        let mut change = self.get(id).await?;
        change.complete(self.clock.unix_timestamp());
        self.store.update(&change).await?;

        self.event_bus
            .emit(CoreEvent::Change(ChangeEvent::Synced {
                change_id: change.id.as_str(),
            }))
            .ok();

        self.refresh_observers().await?;
        Ok(change)
    }

    /// Record a failed attempt.
    ///
    /// The change goes back to pending while retry budget remains (emitting
    /// a retry event), and to failed once the budget is spent. The caller
    /// decides what to do with exhausted rows.
    ///
    /// If a newer pending row was recorded for the same entity while this
    /// one was in flight, the failed row is dropped instead: the newer row
    /// already carries the net mutation, and only one pending row per
    /// entity may exist.
    pub async fn mark_failed(&self, id: ChangeId, error: &str) -> Result<PendingChange> {
        let mut change = self.get(id).await?;

        if let Some(superseding) = self.superseding_row(&change).await? {
            return self.drop_superseded(change, superseding).await;
        }

        change.fail(
            Some(error.to_string()),
            self.max_retries,
            self.clock.unix_timestamp(),
        );
        self.store.update(&change).await?;

        if change.status == ChangeStatus::Pending {
            warn!(
                change_id = %change.id,
                retry_count = change.retry_count,
                error,
                "Sync attempt failed; change queued for retry"
            );

            self.event_bus
                .emit(CoreEvent::Change(ChangeEvent::RetryScheduled {
                    change_id: change.id.as_str(),
                    retry_count: change.retry_count,
                    error: error.to_string(),
                }))
                .ok();
        }

        self.refresh_observers().await?;
        Ok(change)
    }

    /// Return a change to pending without counting an attempt.
    ///
    /// As with [`mark_failed`](Self::mark_failed), a row superseded by a
    /// newer pending row for the same entity is dropped rather than
    /// requeued next to it.
    pub async fn requeue(&self, id: ChangeId) -> Result<PendingChange> {
        let mut change = self.get(id).await?;

        if let Some(superseding) = self.superseding_row(&change).await? {
            return self.drop_superseded(change, superseding).await;
        }

        change.requeue(self.clock.unix_timestamp());
        self.store.update(&change).await?;
        self.refresh_observers().await?;
        Ok(change)
    }

    /// Find the pending row that superseded this one, if any.
    ///
    /// A mutation recorded while a row is mid-attempt lands as a fresh
    /// pending row for the same entity; once the attempt settles, the old
    /// row must not return to pending beside it.
    async fn superseding_row(&self, change: &PendingChange) -> Result<Option<PendingChange>> {
        let existing = self
            .store
            .find_pending_by_entity(&change.entity_type, &change.entity_id)
            .await?;
        Ok(existing.filter(|row| row.id != change.id))
    }

    async fn drop_superseded(
        &self,
        change: PendingChange,
        superseding: PendingChange,
    ) -> Result<PendingChange> {
        debug!(
            change_id = %change.id,
            superseded_by = %superseding.id,
            entity_type = %change.entity_type,
            entity_id = %change.entity_id,
            "Dropping in-flight change superseded by a newer pending row"
        );
        self.store.delete(change.id).await?;
        self.refresh_observers().await?;
        Ok(superseding)
    }

    /// Remove a change from the ledger entirely
    pub async fn remove(&self, id: ChangeId) -> Result<()> {
        self.store.delete(id).await?;
        self.refresh_observers().await
    }

    /// Delete synced rows last touched before the cutoff timestamp
    pub async fn purge_synced_before(&self, cutoff: i64) -> Result<u64> {
        let purged = self.store.delete_synced_before(cutoff).await?;
        if purged > 0 {
            debug!(purged, "Purged synced ledger rows");
        }
        Ok(purged)
    }

    /// Look up a change by id
    pub async fn find_by_id(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        self.store.find_by_id(id).await
    }

    /// Number of changes waiting for the next cycle
    pub async fn pending_count(&self) -> Result<u64> {
        self.store.count_by_status(ChangeStatus::Pending).await
    }

    /// Changes that exhausted their retry budget
    pub async fn failed_changes(&self) -> Result<Vec<PendingChange>> {
        self.store.list_failed().await
    }

    /// Observe the pending set.
    ///
    /// The receiver holds the latest pending list (drain order) and is
    /// updated after every ledger mutation. New subscribers see the current
    /// value immediately.
    pub fn observe_pending(&self) -> watch::Receiver<Vec<PendingChange>> {
        self.pending_tx.subscribe()
    }

    async fn get(&self, id: ChangeId) -> Result<PendingChange> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::ChangeNotFound {
                change_id: id.to_string(),
            })
    }

    async fn refresh_observers(&self) -> Result<()> {
        let pending = self.store.list_pending(None).await?;
        self.pending_tx.send_replace(pending);
        Ok(())
    }
}
