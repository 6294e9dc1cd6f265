//! Remote Store Abstraction
//!
//! Narrow interface to the backend the sync core reconciles against. The
//! concrete transport (HTTP, gRPC, whatever the host app uses) lives behind
//! this trait; the core only sees entity snapshots keyed by type and id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Opaque string-keyed mutation body.
///
/// The core never interprets payload fields beyond the field-wise merge in
/// conflict resolution; serialization to the wire format is the transport
/// layer's concern.
pub type Payload = Map<String, Value>;

/// Server-side state of one entity at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Payload,
    /// Unix timestamp of the last server-side modification, if known.
    pub modified_at: Option<i64>,
}

impl Snapshot {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            modified_at: None,
        }
    }
}

/// Remote store trait
///
/// All operations are assumed idempotent-safe to retry; the retry wrapper in
/// the core repeats failed calls without coordination with the transport.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::remote::RemoteStore;
///
/// async fn exists(store: &dyn RemoteStore, id: &str) -> bool {
///     matches!(store.fetch("event", id).await, Ok(Some(_)))
/// }
/// ```
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the current snapshot for an entity.
    ///
    /// Returns `None` when the entity does not exist remotely; transport
    /// failures are errors, absence is not.
    async fn fetch(&self, entity_type: &str, entity_id: &str) -> Result<Option<Snapshot>>;

    /// Create an entity remotely and return its snapshot.
    async fn create(&self, entity_type: &str, entity_id: &str, payload: &Payload)
        -> Result<Snapshot>;

    /// Overwrite an existing entity's payload and return the new snapshot.
    async fn update(&self, entity_type: &str, entity_id: &str, payload: &Payload)
        -> Result<Snapshot>;

    /// Delete an entity remotely.
    async fn delete(&self, entity_type: &str, entity_id: &str) -> Result<()>;
}
