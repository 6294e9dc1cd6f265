use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Remote rejected the payload: {0}")]
    RemoteValidation(String),

    #[error("Permission denied by remote: {0}")]
    Permission(String),

    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Circuit breaker open for operation {operation}")]
    CircuitOpen { operation: String },

    #[error("Conflict on {entity_type}/{entity_id} could not be resolved: {reason}")]
    ConflictUnresolvable {
        entity_type: String,
        entity_id: String,
        reason: String,
    },

    #[error("Change {change_id} not found")]
    ChangeNotFound { change_id: String },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Invalid change ID: {0}")]
    InvalidChangeId(String),

    #[error("Invalid change status: {0}")]
    InvalidStatus(String),

    #[error("Invalid change operation: {0}")]
    InvalidOperation(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Whether a failed attempt may succeed if repeated.
    ///
    /// Only transient network faults are worth another attempt; validation
    /// and permission failures are deterministic, and an open breaker means
    /// the attempt was never made.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

impl From<BridgeError> for SyncError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Network(msg) => SyncError::TransientNetwork(msg),
            BridgeError::Timeout(secs) => {
                SyncError::TransientNetwork(format!("timed out after {} seconds", secs))
            }
            BridgeError::Validation(msg) => SyncError::RemoteValidation(msg),
            BridgeError::Permission(msg) => SyncError::Permission(msg),
            other => SyncError::Remote(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::TransientNetwork("reset".into()).is_retryable());
        assert!(!SyncError::RemoteValidation("bad field".into()).is_retryable());
        assert!(!SyncError::Permission("denied".into()).is_retryable());
        assert!(!SyncError::CircuitOpen {
            operation: "update:event".into()
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_bridge_error_mapping() {
        let err: SyncError = BridgeError::Network("reset".into()).into();
        assert!(matches!(err, SyncError::TransientNetwork(_)));

        let err: SyncError = BridgeError::Timeout(30).into();
        assert!(err.is_retryable());

        let err: SyncError = BridgeError::Validation("missing name".into()).into();
        assert!(matches!(err, SyncError::RemoteValidation(_)));

        let err: SyncError = BridgeError::Permission("read-only".into()).into();
        assert!(matches!(err, SyncError::Permission(_)));

        let err: SyncError = BridgeError::OperationFailed("oops".into()).into();
        assert!(matches!(err, SyncError::Remote(_)));
        assert!(!err.is_retryable());
    }
}
