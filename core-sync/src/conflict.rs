//! # Conflict Resolution
//!
//! Deterministic resolution of a pending local change against the current
//! remote snapshot of the same entity.
//!
//! ## Overview
//!
//! A conflict exists whenever the engine is about to push a create or update
//! and the entity already has server-side state. Resolution is a pure
//! function of the local change, the remote snapshot, and the configured
//! [`ConflictStrategy`] — no timestamps are compared and no heuristics run,
//! so resolving the same inputs always yields the same outcome.
//!
//! Deletes never reach the resolver: a queued delete wins over remote edits
//! by construction (see the ledger merge rules), and the engine pushes it
//! directly.

use bridge_traits::remote::{Payload, Snapshot};
use serde::{Deserialize, Serialize};

use crate::change::{ChangeOperation, PendingChange};
use crate::error::{Result, SyncError};

/// How a local/remote conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConflictStrategy {
    /// Local change overwrites the remote state
    #[default]
    UseLocal,
    /// Remote state wins; the local change is discarded and the local cache
    /// is overwritten with the server snapshot
    UseServer,
    /// Field-wise merge: local non-null fields take precedence, remote
    /// fields fill in everything absent locally
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UseLocal => "use_local",
            Self::UseServer => "use_server",
            Self::Merge => "merge",
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "use_local" => Ok(Self::UseLocal),
            "use_server" => Ok(Self::UseServer),
            "merge" => Ok(Self::Merge),
            _ => Err(SyncError::InvalidStatus(format!(
                "Invalid conflict strategy: {}",
                s
            ))),
        }
    }
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    /// The strategy that was applied
    pub strategy: ConflictStrategy,
    /// The payload to push to the remote store; `None` when the server
    /// state wins and nothing is pushed
    pub outgoing_payload: Option<Payload>,
}

/// Resolve a pending change against the remote snapshot it collided with.
///
/// Pure and deterministic. Returns an error for delete changes, which have
/// no payload to reconcile and must not be routed here.
pub fn resolve(
    change: &PendingChange,
    remote: &Snapshot,
    strategy: ConflictStrategy,
) -> Result<ConflictResolution> {
    if change.operation == ChangeOperation::Delete {
        return Err(SyncError::ConflictUnresolvable {
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            reason: "delete changes carry no payload to reconcile".to_string(),
        });
    }

    let outgoing_payload = match strategy {
        ConflictStrategy::UseLocal => Some(change.payload.clone()),
        ConflictStrategy::UseServer => None,
        ConflictStrategy::Merge => Some(merge_payloads(&change.payload, &remote.payload)),
    };

    Ok(ConflictResolution {
        strategy,
        outgoing_payload,
    })
}

/// Field-wise merge of a local payload over a remote one.
///
/// Local non-null fields win; remote values survive where the local field
/// is null or absent. Key iteration order never affects the result.
pub fn merge_payloads(local: &Payload, remote: &Payload) -> Payload {
    let mut merged = remote.clone();

    for (key, value) in local {
        if !value.is_null() || !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }

    merged
}
