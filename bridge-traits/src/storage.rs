//! Local Storage Abstractions
//!
//! The sync core treats the app's local read model as an opaque keyed store.
//! When a conflict resolution decides the server wins (or produces a merged
//! payload), the engine writes the winning state back through this trait so
//! the UI layer reflects it without a refetch.

use async_trait::async_trait;

use crate::error::Result;
use crate::remote::Snapshot;

/// Local entity cache trait
///
/// Implemented by the host app over whatever durable table backs its read
/// model (Room, Core Data, sqlite, ...). Writes must be crash-safe; the
/// engine assumes a returned `Ok` means the state is durable.
#[async_trait]
pub trait EntityCache: Send + Sync {
    /// Overwrite the locally cached entity with a snapshot.
    async fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Remove the locally cached entity, if present.
    async fn remove(&self, entity_type: &str, entity_id: &str) -> Result<()>;
}
