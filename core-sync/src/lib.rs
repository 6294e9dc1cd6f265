//! # Offline Sync Module
//!
//! Offline-first synchronization core for host applications.
//!
//! ## Overview
//!
//! This crate keeps local mutations flowing to a remote backend across
//! unreliable mobile connectivity:
//! - Capturing every offline mutation in a durable change ledger
//! - Collapsing successive mutations per entity to their net effect
//! - Draining the queue in priority order, one cycle at a time
//! - Resolving collisions with server-side state deterministically
//! - Retrying transient faults with backoff behind a circuit breaker
//! - Adapting sync cadence to network type and cost
//!
//! ## Components
//!
//! - **Change Model** (`change`): Pending-change types and the merge rules
//!   applied when mutations stack on one entity
//! - **Change Ledger** (`ledger`): SQLite-backed queue with merge-on-write
//!   and priority-ordered draining
//! - **Retry & Breaker** (`retry`): Backoff policies and per-operation
//!   circuit breakers around remote calls
//! - **Conflict Resolution** (`conflict`): Deterministic local/remote
//!   reconciliation strategies
//! - **Sync Engine** (`engine`): Drains the ledger against the remote store,
//!   one observable cycle at a time
//! - **Adaptive Scheduler** (`scheduler`): Network-aware cycle timing with
//!   debounced connectivity triggers
//! - **Bootstrap** (`bootstrap`): One-call wiring of ledger, engine and
//!   scheduler from a validated `CoreConfig`

pub mod bootstrap;
pub mod change;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod retry;
pub mod scheduler;

pub use bootstrap::SyncCore;
pub use change::{
    merged_operation, ChangeId, ChangeOperation, ChangePriority, ChangeStatus, PendingChange,
};
pub use conflict::{merge_payloads, resolve, ConflictResolution, ConflictStrategy};
pub use engine::{
    CycleOutcome, CycleStats, SyncConfig, SyncEngine, SyncStats, SyncStatus, SyncTrigger,
    SyncUrgency,
};
pub use error::{Result, SyncError};
pub use ledger::{
    ChangeLedger, ChangeStore, RecordOutcome, SqliteChangeStore, DEFAULT_MAX_RETRIES,
};
pub use retry::{
    BackoffStrategy, BreakerSnapshot, BreakerState, CircuitBreaker, RetryExecutor, RetryPolicy,
};
pub use scheduler::{cadence_for, AdaptiveScheduler, SchedulerConfig, SyncCadence};
