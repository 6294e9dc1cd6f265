//! # Core Configuration Module
//!
//! Provides configuration management for the offline sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `CoreConfig` instance holding all collaborator bridges and settings the
//! core needs. It enforces fail-fast validation so a missing capability is
//! reported at startup, not at first use. There is exactly one `CoreConfig`
//! per process; every component receives it (or pieces of it) explicitly —
//! no ambient/global state.
//!
//! ## Required Dependencies
//!
//! - `RemoteStore` - the backend the engine reconciles against
//! - `EntityCache` - the local read model overwritten on server-wins
//!   resolutions
//!
//! ## Optional Dependencies
//!
//! - `NetworkMonitor` - connectivity detection; without it the adaptive
//!   scheduler cannot run and sync must be triggered manually
//! - `Clock` - time source (defaults to the system clock)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/sync.db")
//!     .remote_store(Arc::new(MyApiClient::new()))
//!     .entity_cache(Arc::new(MyLocalCache::new()))
//!     .network_monitor(Arc::new(MyNetworkMonitor::new()))
//!     .build()?;
//! # Ok::<(), core_runtime::Error>(())
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, EntityCache, NetworkMonitor, RemoteStore, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Core configuration for the offline sync core.
///
/// This struct holds all dependencies and settings required to initialize
/// the core. Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file backing the change ledger
    pub database_path: PathBuf,

    /// Remote store the engine syncs against (required)
    pub remote_store: Arc<dyn RemoteStore>,

    /// Local entity cache for server-wins write-backs (required)
    pub entity_cache: Arc<dyn EntityCache>,

    /// Network connectivity monitor (optional; required for adaptive scheduling)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Time source (defaults to the system clock)
    pub clock: Arc<dyn Clock>,

    /// Buffer size of the broadcast event bus
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("remote_store", &"RemoteStore { ... }")
            .field("entity_cache", &"EntityCache { ... }")
            .field(
                "network_monitor",
                &self.network_monitor.as_ref().map(|_| "NetworkMonitor { ... }"),
            )
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path is not empty
    /// - Event buffer size is non-zero
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    remote_store: Option<Arc<dyn RemoteStore>>,
    entity_cache: Option<Arc<dyn EntityCache>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    /// Set the ledger database path.
    pub fn database_path(mut self, path: impl AsRef<Path>) -> Self {
        self.database_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the remote store implementation (required).
    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    /// Set the local entity cache implementation (required).
    pub fn entity_cache(mut self, cache: Arc<dyn EntityCache>) -> Self {
        self.entity_cache = Some(cache);
        self
    }

    /// Set the network monitor implementation.
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Set a custom time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the event bus buffer size.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Build the configuration, failing fast when a required capability is
    /// missing.
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self
            .database_path
            .ok_or_else(|| Error::Config("Database path is required".to_string()))?;

        let remote_store = self.remote_store.ok_or_else(|| Error::CapabilityMissing {
            capability: "RemoteStore".to_string(),
            message: "No remote store implementation provided. \
                      Inject the adapter wrapping your API transport."
                .to_string(),
        })?;

        let entity_cache = self.entity_cache.ok_or_else(|| Error::CapabilityMissing {
            capability: "EntityCache".to_string(),
            message: "No entity cache implementation provided. \
                      Inject the adapter over your local read-model tables."
                .to_string(),
        })?;

        let config = CoreConfig {
            database_path,
            remote_store,
            entity_cache,
            network_monitor: self.network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;
        Ok(config)
    }
}
