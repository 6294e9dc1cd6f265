//! # Pending Change Model
//!
//! Domain types for the change ledger: the identifier, operation, priority
//! and status of a queued local mutation, plus the merge rules applied when
//! a second mutation targets an entity that already has a pending change.
//!
//! ## Overview
//!
//! Every local mutation made while offline (or ahead of the next sync cycle)
//! is captured as a [`PendingChange`]. The ledger guarantees at most one
//! pending change per `(entity_type, entity_id)`; successive mutations are
//! folded into the existing row via [`PendingChange::absorb`] so the queue
//! carries the net effect, not the edit history.
//!
//! ## Merge Rules
//!
//! | queued  | incoming | result                                   |
//! |---------|----------|------------------------------------------|
//! | CREATE  | UPDATE   | CREATE with the new payload              |
//! | CREATE  | DELETE   | DELETE (payload discarded)               |
//! | UPDATE  | UPDATE   | UPDATE with the new payload              |
//! | UPDATE  | DELETE   | DELETE (payload discarded)               |
//! | DELETE  | any      | DELETE (a queued delete is authoritative)|
//! | same op | same op  | keep op, replace payload                 |

use bridge_traits::remote::Payload;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Type-safe change identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Create a new random change ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a change ID from a string
    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::InvalidChangeId(e.to_string()))
    }

    /// Get the string representation
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of mutation a change carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    /// Entity was created locally and does not exist remotely yet
    Create,
    /// Entity exists remotely and was modified locally
    Update,
    /// Entity was deleted locally
    Delete,
}

impl ChangeOperation {
    /// Convert operation to database string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for ChangeOperation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(SyncError::InvalidOperation(s.to_string())),
        }
    }
}

/// Priority level for pending changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum ChangePriority {
    /// Low priority - background bookkeeping mutations
    Low = 0,
    /// Normal priority - regular user edits
    #[default]
    Normal = 1,
    /// High priority - user-visible changes that should land quickly
    High = 2,
    /// Critical priority - must reach the server before anything else
    Critical = 3,
}

impl ChangePriority {
    /// Convert priority to database integer
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Parse priority from database integer
    pub fn from_i32(i: i32) -> Result<Self> {
        match i {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Critical),
            _ => Err(SyncError::InvalidStatus(format!("Invalid priority: {}", i))),
        }
    }
}

/// Lifecycle status of a pending change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    /// Queued and waiting for the next sync cycle
    Pending,
    /// Currently being pushed to the remote store
    Syncing,
    /// Reached the remote store successfully
    Synced,
    /// Exhausted its retry budget
    Failed,
}

impl ChangeStatus {
    /// Convert status to database string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Check if status is terminal (synced or failed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced | Self::Failed)
    }

    /// Check if status is active (pending or syncing)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Syncing)
    }
}

impl std::str::FromStr for ChangeStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

/// Resolve the operation a pending row carries after a new mutation lands on
/// the same entity.
pub fn merged_operation(queued: ChangeOperation, incoming: ChangeOperation) -> ChangeOperation {
    use ChangeOperation::*;

    match (queued, incoming) {
        // A queued delete is authoritative; later edits to a locally-deleted
        // entity have nothing to apply to.
        (Delete, _) => Delete,
        (_, Delete) => Delete,
        // The server has never seen the entity, so the edit folds into the
        // creation.
        (Create, Update) => Create,
        (_, incoming) => incoming,
    }
}

/// A queued local mutation awaiting push to the remote store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    /// Unique identifier
    pub id: ChangeId,
    /// Entity type, e.g. "event" or "note"
    pub entity_type: String,
    /// Entity identifier within its type
    pub entity_id: String,
    /// The net operation to replay against the remote store
    pub operation: ChangeOperation,
    /// Mutation body; empty for deletes
    pub payload: Payload,
    /// Current status
    pub status: ChangeStatus,
    /// Priority level
    pub priority: ChangePriority,
    /// Number of failed sync attempts
    pub retry_count: u32,
    /// Error message from the last failed attempt
    pub error_message: Option<String>,
    /// Unix timestamp when first recorded
    pub created_at: i64,
    /// Unix timestamp when last updated
    pub updated_at: i64,
    /// Unix timestamp when the last sync attempt started
    pub last_attempt_at: Option<i64>,
}

impl PendingChange {
    /// Create a new pending change at normal priority
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: ChangeOperation,
        payload: Payload,
        now: i64,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload: if operation == ChangeOperation::Delete {
                Payload::new()
            } else {
                payload
            },
            status: ChangeStatus::Pending,
            priority: ChangePriority::Normal,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
        }
    }

    /// Create a new pending change with the given priority
    pub fn with_priority(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: ChangeOperation,
        payload: Payload,
        priority: ChangePriority,
        now: i64,
    ) -> Self {
        let mut change = Self::new(entity_type, entity_id, operation, payload, now);
        change.priority = priority;
        change
    }

    /// Fold a new mutation on the same entity into this pending row.
    ///
    /// The operation follows the merge table in the module docs, the payload
    /// is replaced by the incoming one (or cleared when the result is a
    /// delete), and the priority is raised to whichever is higher. The retry
    /// budget resets: the row now represents a different mutation.
    pub fn absorb(
        &mut self,
        incoming: ChangeOperation,
        payload: Payload,
        priority: ChangePriority,
        now: i64,
    ) {
        let merged = merged_operation(self.operation, incoming);

        self.payload = if merged == ChangeOperation::Delete {
            Payload::new()
        } else {
            payload
        };
        self.operation = merged;
        self.priority = self.priority.max(priority);
        self.retry_count = 0;
        self.error_message = None;
        self.updated_at = now;
    }

    /// Check if the change has retry budget left
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    /// Mark the change as being pushed
    pub(crate) fn start_attempt(&mut self, now: i64) {
        self.status = ChangeStatus::Syncing;
        self.last_attempt_at = Some(now);
        self.updated_at = now;
    }

    /// Mark the change as successfully synced
    pub(crate) fn complete(&mut self, now: i64) {
        self.status = ChangeStatus::Synced;
        self.error_message = None;
        self.updated_at = now;
    }

    /// Record a failed attempt.
    ///
    /// The change returns to `Pending` while budget remains so the next cycle
    /// picks it up again, and lands in `Failed` once the budget is spent.
    pub(crate) fn fail(&mut self, error_message: Option<String>, max_retries: u32, now: i64) {
        self.retry_count += 1;
        self.error_message = error_message;
        self.updated_at = now;

        if self.can_retry(max_retries) {
            self.status = ChangeStatus::Pending;
        } else {
            self.status = ChangeStatus::Failed;
        }
    }

    /// Return the change to `Pending` without counting an attempt.
    ///
    /// Used when a cycle is interrupted (cancellation, open breaker) before
    /// the remote call could run, and to resurrect failed rows on request.
    pub(crate) fn requeue(&mut self, now: i64) {
        self.status = ChangeStatus::Pending;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_with(key: &str, value: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert(key.to_string(), json!(value));
        payload
    }

    #[test]
    fn test_change_id_roundtrip() {
        let id = ChangeId::new();
        let parsed = ChangeId::from_string(&id.as_str()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_change_id_rejects_garbage() {
        assert!(matches!(
            ChangeId::from_string("not-a-uuid"),
            Err(SyncError::InvalidChangeId(_))
        ));
    }

    #[test]
    fn test_status_codec() {
        for status in [
            ChangeStatus::Pending,
            ChangeStatus::Syncing,
            ChangeStatus::Synced,
            ChangeStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ChangeStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ChangeStatus>().is_err());
    }

    #[test]
    fn test_priority_ordering_and_codec() {
        assert!(ChangePriority::Critical > ChangePriority::High);
        assert!(ChangePriority::High > ChangePriority::Normal);
        assert!(ChangePriority::Normal > ChangePriority::Low);

        for priority in [
            ChangePriority::Low,
            ChangePriority::Normal,
            ChangePriority::High,
            ChangePriority::Critical,
        ] {
            assert_eq!(
                ChangePriority::from_i32(priority.as_i32()).unwrap(),
                priority
            );
        }
        assert!(ChangePriority::from_i32(9).is_err());
    }

    #[test]
    fn test_merge_table() {
        use ChangeOperation::*;

        assert_eq!(merged_operation(Create, Update), Create);
        assert_eq!(merged_operation(Create, Delete), Delete);
        assert_eq!(merged_operation(Update, Update), Update);
        assert_eq!(merged_operation(Update, Delete), Delete);
        assert_eq!(merged_operation(Delete, Create), Delete);
        assert_eq!(merged_operation(Delete, Update), Delete);
        assert_eq!(merged_operation(Delete, Delete), Delete);
        assert_eq!(merged_operation(Create, Create), Create);
        assert_eq!(merged_operation(Update, Create), Create);
    }

    #[test]
    fn test_absorb_create_then_update_keeps_create() {
        let mut change = PendingChange::new(
            "event",
            "e1",
            ChangeOperation::Create,
            payload_with("name", "A"),
            100,
        );

        change.absorb(
            ChangeOperation::Update,
            payload_with("name", "B"),
            ChangePriority::Normal,
            200,
        );

        assert_eq!(change.operation, ChangeOperation::Create);
        assert_eq!(change.payload, payload_with("name", "B"));
        assert_eq!(change.updated_at, 200);
    }

    #[test]
    fn test_absorb_delete_discards_payload() {
        let mut change = PendingChange::new(
            "event",
            "e1",
            ChangeOperation::Update,
            payload_with("name", "A"),
            100,
        );

        change.absorb(
            ChangeOperation::Delete,
            Payload::new(),
            ChangePriority::Normal,
            200,
        );

        assert_eq!(change.operation, ChangeOperation::Delete);
        assert!(change.payload.is_empty());
    }

    #[test]
    fn test_absorb_after_delete_stays_delete() {
        // CREATE -> DELETE -> UPDATE must end as DELETE: a later edit cannot
        // resurrect a locally-deleted entity through the same row.
        let mut change = PendingChange::new(
            "event",
            "e1",
            ChangeOperation::Create,
            payload_with("name", "A"),
            100,
        );

        change.absorb(
            ChangeOperation::Delete,
            Payload::new(),
            ChangePriority::Normal,
            200,
        );
        change.absorb(
            ChangeOperation::Update,
            payload_with("name", "B"),
            ChangePriority::Normal,
            300,
        );

        assert_eq!(change.operation, ChangeOperation::Delete);
        assert!(change.payload.is_empty());
    }

    #[test]
    fn test_absorb_raises_priority_never_lowers() {
        let mut change = PendingChange::with_priority(
            "event",
            "e1",
            ChangeOperation::Update,
            payload_with("name", "A"),
            ChangePriority::High,
            100,
        );

        change.absorb(
            ChangeOperation::Update,
            payload_with("name", "B"),
            ChangePriority::Low,
            200,
        );
        assert_eq!(change.priority, ChangePriority::High);

        change.absorb(
            ChangeOperation::Update,
            payload_with("name", "C"),
            ChangePriority::Critical,
            300,
        );
        assert_eq!(change.priority, ChangePriority::Critical);
    }

    #[test]
    fn test_absorb_resets_retry_budget() {
        let mut change = PendingChange::new(
            "event",
            "e1",
            ChangeOperation::Update,
            payload_with("name", "A"),
            100,
        );
        change.fail(Some("network down".to_string()), 5, 150);
        assert_eq!(change.retry_count, 1);

        change.absorb(
            ChangeOperation::Update,
            payload_with("name", "B"),
            ChangePriority::Normal,
            200,
        );
        assert_eq!(change.retry_count, 0);
        assert!(change.error_message.is_none());
    }

    #[test]
    fn test_fail_exhausts_budget() {
        let mut change = PendingChange::new(
            "event",
            "e1",
            ChangeOperation::Update,
            Payload::new(),
            100,
        );

        change.fail(Some("boom".to_string()), 2, 110);
        assert_eq!(change.status, ChangeStatus::Pending);

        change.fail(Some("boom".to_string()), 2, 120);
        assert_eq!(change.status, ChangeStatus::Failed);
        assert!(!change.can_retry(2));
    }

    #[test]
    fn test_delete_change_has_empty_payload() {
        let change = PendingChange::new(
            "event",
            "e1",
            ChangeOperation::Delete,
            payload_with("ignored", "x"),
            100,
        );
        assert!(change.payload.is_empty());
    }
}
