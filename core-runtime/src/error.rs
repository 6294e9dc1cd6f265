//! Runtime-level errors: configuration validation, missing capabilities and
//! logging setup. Sync-specific failures live in `core-sync`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required bridge implementation was not injected at startup.
    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    /// The tracing subscriber could not be installed, usually because one is
    /// already registered for this process.
    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
