//! # Adaptive Scheduler
//!
//! Decides when sync cycles run based on network conditions.
//!
//! ## Overview
//!
//! The scheduler subscribes to the platform's network monitor and maps the
//! current conditions to a [`SyncCadence`]:
//!
//! | conditions            | cadence     | urgency |
//! |-----------------------|-------------|---------|
//! | Wi-Fi / Ethernet      | 30 minutes  | High    |
//! | Cellular (unmetered)  | 2 hours     | Normal  |
//! | Metered or expensive  | 6 hours     | Low     |
//! | Offline               | suppressed  | —       |
//!
//! On top of the periodic cadence, an eager cycle fires when connectivity
//! returns after an offline period. Captive-portal flapping (rapid
//! connect/disconnect sequences) is debounced so reconnects do not stampede
//! the backend.
//!
//! The scheduler drives the engine from a single task; a trigger that finds
//! a cycle already in flight waits for it to finish and runs once more, so
//! changes recorded mid-cycle are not stranded until the next tick.

use bridge_traits::network::{NetworkInfo, NetworkType};
use bridge_traits::{Clock, NetworkMonitor};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{CycleOutcome, SyncEngine, SyncStatus, SyncTrigger, SyncUrgency};
use crate::error::{Result, SyncError};

/// Tunables for the adaptive scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cycle period on Wi-Fi or Ethernet
    pub wifi_period: Duration,
    /// Cycle period on unmetered cellular
    pub cellular_period: Duration,
    /// Cycle period on metered or expensive connections
    pub metered_period: Duration,
    /// Minimum spacing between eager connectivity-triggered cycles
    pub debounce: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wifi_period: Duration::from_secs(30 * 60),
            cellular_period: Duration::from_secs(2 * 60 * 60),
            metered_period: Duration::from_secs(6 * 60 * 60),
            debounce: Duration::from_secs(5),
        }
    }
}

/// Sync cadence derived from network conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCadence {
    /// Offline: no cycles run until connectivity returns
    Suppressed,
    /// Connected: periodic cycles at the given urgency
    Active {
        urgency: SyncUrgency,
        period: Duration,
    },
}

/// Map network conditions to a sync cadence.
///
/// Pure, so hosts can unit-test their monitor wiring against it.
pub fn cadence_for(info: &NetworkInfo, config: &SchedulerConfig) -> SyncCadence {
    if !info.is_connected() {
        return SyncCadence::Suppressed;
    }

    if info.is_metered || info.is_expensive {
        return SyncCadence::Active {
            urgency: SyncUrgency::Low,
            period: config.metered_period,
        };
    }

    match info.network_type {
        Some(NetworkType::WiFi) | Some(NetworkType::Ethernet) => SyncCadence::Active {
            urgency: SyncUrgency::High,
            period: config.wifi_period,
        },
        // Unknown transports get the conservative cellular cadence.
        Some(NetworkType::Cellular) | Some(NetworkType::Other) | None => SyncCadence::Active {
            urgency: SyncUrgency::Normal,
            period: config.cellular_period,
        },
    }
}

/// Drives the sync engine on a network-aware schedule
pub struct AdaptiveScheduler {
    engine: Arc<SyncEngine>,
    monitor: Arc<dyn NetworkMonitor>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl AdaptiveScheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        monitor: Arc<dyn NetworkMonitor>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            monitor,
            clock,
            config,
        }
    }

    /// Run the scheduling loop until cancelled.
    ///
    /// Intended to be spawned as the single background worker that drives
    /// the engine. Returns when the token is cancelled or the network change
    /// stream closes.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut stream = self.monitor.subscribe_changes().await.map_err(|e| {
            SyncError::Scheduler(format!("network change subscription failed: {}", e))
        })?;

        let initial = self
            .monitor
            .get_network_info()
            .await
            .unwrap_or_else(|_| NetworkInfo::offline());
        let mut cadence = cadence_for(&initial, &self.config);
        let mut was_connected = initial.is_connected();
        let mut last_eager: Option<DateTime<Utc>> = None;

        info!(?cadence, "Adaptive scheduler started");

        // Drain whatever queued while the process was down.
        if let SyncCadence::Active { urgency, .. } = cadence {
            self.trigger(SyncTrigger::Scheduled(urgency), &token).await;
            last_eager = Some(self.clock.now());
        }

        loop {
            let period_timer = async {
                match cadence {
                    SyncCadence::Active { period, .. } => tokio::time::sleep(period).await,
                    SyncCadence::Suppressed => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Adaptive scheduler stopped");
                    return Ok(());
                }
                _ = period_timer => {
                    if let SyncCadence::Active { urgency, .. } = cadence {
                        self.trigger(SyncTrigger::Scheduled(urgency), &token).await;
                    }
                }
                update = stream.next() => {
                    let Some(info) = update else {
                        warn!("Network change stream closed; scheduler exiting");
                        return Ok(());
                    };

                    let new_cadence = cadence_for(&info, &self.config);
                    let now_connected = info.is_connected();

                    if new_cadence != cadence {
                        info!(from = ?cadence, to = ?new_cadence, "Sync cadence changed");
                    }

                    if now_connected && !was_connected && self.debounce_elapsed(last_eager) {
                        if let SyncCadence::Active { urgency, .. } = new_cadence {
                            self.trigger(SyncTrigger::Connectivity(urgency), &token).await;
                            last_eager = Some(self.clock.now());
                        }
                    }

                    was_connected = now_connected;
                    cadence = new_cadence;
                }
            }
        }
    }

    /// Run a cycle, retrying after the in-flight cycle when coalesced.
    async fn trigger(&self, trigger: SyncTrigger, token: &CancellationToken) {
        loop {
            match self.engine.sync(trigger, token).await {
                Ok(CycleOutcome::Completed(stats)) => {
                    debug!(?stats, trigger = trigger.as_str(), "Scheduled cycle finished");
                    return;
                }
                Ok(CycleOutcome::AlreadyRunning) => {
                    // The running cycle snapshotted the queue before our
                    // trigger; wait for it and run once more.
                    if !self.wait_until_not_syncing(token).await {
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, trigger = trigger.as_str(), "Scheduled cycle failed");
                    return;
                }
            }
        }
    }

    /// Wait for the engine to leave `Syncing`; false when cancelled or the
    /// engine was dropped.
    async fn wait_until_not_syncing(&self, token: &CancellationToken) -> bool {
        let mut status = self.engine.observe_status();

        while *status.borrow() == SyncStatus::Syncing {
            tokio::select! {
                _ = token.cancelled() => return false,
                changed = status.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }

        true
    }

    fn debounce_elapsed(&self, last_eager: Option<DateTime<Utc>>) -> bool {
        let Some(last) = last_eager else {
            return true;
        };

        let spacing = chrono::Duration::milliseconds(self.config.debounce.as_millis() as i64);
        self.clock.now() - last >= spacing
    }
}
