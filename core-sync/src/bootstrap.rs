//! # Core Bootstrap
//!
//! Wires the sync machinery out of a validated [`CoreConfig`].
//!
//! ## Overview
//!
//! [`SyncCore`] is the construction path host applications use: it opens
//! the ledger database named in the config, builds the event bus, ledger
//! and engine from the injected collaborators, and prepares the adaptive
//! scheduler when a network monitor is available. Components never reach
//! for ambient state; everything flows from the one config object.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use core_sync::{SchedulerConfig, SyncConfig, SyncCore};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(config: CoreConfig) -> core_sync::Result<()> {
//! let core = SyncCore::initialize(
//!     config,
//!     SyncConfig::default(),
//!     SchedulerConfig::default(),
//! )
//! .await?;
//!
//! let token = CancellationToken::new();
//! let scheduler_task = core.spawn_scheduler(token.clone());
//! # Ok(())
//! # }
//! ```

use core_runtime::config::CoreConfig;
use core_runtime::EventBus;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{SyncConfig, SyncEngine};
use crate::error::{Result, SyncError};
use crate::ledger::ChangeLedger;
use crate::scheduler::{AdaptiveScheduler, SchedulerConfig};

/// Fully wired sync core built from a [`CoreConfig`]
pub struct SyncCore {
    event_bus: EventBus,
    engine: Arc<SyncEngine>,
    scheduler: Option<Arc<AdaptiveScheduler>>,
}

impl SyncCore {
    /// Open the ledger database and wire the engine and scheduler from the
    /// config's collaborators.
    pub async fn initialize(
        config: CoreConfig,
        sync_config: SyncConfig,
        scheduler_config: SchedulerConfig,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true);
        // SQLite serializes writers anyway; a single connection keeps the
        // ledger's read-merge-write sections free of write contention.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let event_bus = EventBus::new(config.event_buffer_size);
        let ledger = Arc::new(
            ChangeLedger::new(
                pool,
                Arc::clone(&config.clock),
                event_bus.clone(),
                sync_config.max_retries,
            )
            .await?,
        );

        let engine = Arc::new(SyncEngine::new(
            ledger,
            Arc::clone(&config.remote_store),
            Arc::clone(&config.entity_cache),
            config.network_monitor.clone(),
            Arc::clone(&config.clock),
            event_bus.clone(),
            sync_config,
        ));

        let scheduler = config.network_monitor.as_ref().map(|monitor| {
            Arc::new(AdaptiveScheduler::new(
                Arc::clone(&engine),
                Arc::clone(monitor),
                Arc::clone(&config.clock),
                scheduler_config,
            ))
        });

        info!(
            database = %config.database_path.display(),
            scheduled = scheduler.is_some(),
            "Sync core initialized"
        );

        Ok(Self {
            event_bus,
            engine,
            scheduler,
        })
    }

    /// The sync engine
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// The event bus carrying cycle and change lifecycle events
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Spawn the adaptive scheduler loop on a background task.
    ///
    /// Returns `None` when the config carried no network monitor; sync must
    /// then be driven through [`SyncEngine::sync`] directly.
    pub fn spawn_scheduler(
        &self,
        token: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<Result<()>>> {
        self.scheduler.as_ref().map(|scheduler| {
            let scheduler = Arc::clone(scheduler);
            tokio::spawn(async move { scheduler.run(token).await })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::network::{
        NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType,
    };
    use bridge_traits::remote::{Payload, RemoteStore, Snapshot};
    use bridge_traits::EntityCache;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::change::{ChangeOperation, ChangePriority};
    use crate::engine::{CycleOutcome, SyncTrigger};

    struct NullRemote;

    #[async_trait]
    impl RemoteStore for NullRemote {
        async fn fetch(&self, _t: &str, _id: &str) -> BridgeResult<Option<Snapshot>> {
            Ok(None)
        }

        async fn create(&self, t: &str, id: &str, p: &Payload) -> BridgeResult<Snapshot> {
            Ok(Snapshot::new(t, id, p.clone()))
        }

        async fn update(&self, t: &str, id: &str, p: &Payload) -> BridgeResult<Snapshot> {
            Ok(Snapshot::new(t, id, p.clone()))
        }

        async fn delete(&self, _t: &str, _id: &str) -> BridgeResult<()> {
            Ok(())
        }
    }

    struct NullCache;

    #[async_trait]
    impl EntityCache for NullCache {
        async fn apply_snapshot(&self, _snapshot: &Snapshot) -> BridgeResult<()> {
            Ok(())
        }

        async fn remove(&self, _t: &str, _id: &str) -> BridgeResult<()> {
            Ok(())
        }
    }

    struct QuietStream;

    #[async_trait]
    impl NetworkChangeStream for QuietStream {
        async fn next(&mut self) -> Option<NetworkInfo> {
            std::future::pending().await
        }
    }

    struct WifiMonitor;

    #[async_trait]
    impl NetworkMonitor for WifiMonitor {
        async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
            Ok(NetworkInfo {
                status: NetworkStatus::Connected,
                network_type: Some(NetworkType::WiFi),
                is_metered: false,
                is_expensive: false,
            })
        }

        async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
            Ok(Box::new(QuietStream))
        }
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("sync-core-test-{}.db", uuid::Uuid::new_v4()))
    }

    fn base_config(path: &PathBuf) -> CoreConfig {
        CoreConfig::builder()
            .database_path(path)
            .remote_store(Arc::new(NullRemote))
            .entity_cache(Arc::new(NullCache))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_wires_engine_from_config() {
        let path = temp_db_path();
        let core = SyncCore::initialize(
            base_config(&path),
            SyncConfig::default(),
            SchedulerConfig::default(),
        )
        .await
        .unwrap();

        core.engine()
            .record_change(
                "event",
                "e1",
                ChangeOperation::Create,
                Payload::new(),
                ChangePriority::Normal,
            )
            .await
            .unwrap();

        let outcome = core
            .engine()
            .sync(SyncTrigger::Manual, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(_)));
        assert_eq!(core.engine().ledger().pending_count().await.unwrap(), 0);

        // No monitor, no scheduler.
        assert!(core.spawn_scheduler(CancellationToken::new()).is_none());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_scheduler_spawns_when_monitor_present() {
        let path = temp_db_path();
        let config = CoreConfig::builder()
            .database_path(&path)
            .remote_store(Arc::new(NullRemote))
            .entity_cache(Arc::new(NullCache))
            .network_monitor(Arc::new(WifiMonitor))
            .build()
            .unwrap();

        let core = SyncCore::initialize(
            config,
            SyncConfig::default(),
            SchedulerConfig::default(),
        )
        .await
        .unwrap();

        let token = CancellationToken::new();
        let handle = core
            .spawn_scheduler(token.clone())
            .expect("monitor present");

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_ledger_survives_reinitialize() {
        let path = temp_db_path();

        let core = SyncCore::initialize(
            base_config(&path),
            SyncConfig::default(),
            SchedulerConfig::default(),
        )
        .await
        .unwrap();
        core.engine()
            .record_change(
                "event",
                "e1",
                ChangeOperation::Update,
                Payload::new(),
                ChangePriority::Normal,
            )
            .await
            .unwrap();
        drop(core);

        let reopened = SyncCore::initialize(
            base_config(&path),
            SyncConfig::default(),
            SchedulerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            reopened.engine().ledger().pending_count().await.unwrap(),
            1
        );

        std::fs::remove_file(&path).ok();
    }
}
