//! Integration tests for the offline sync workflow
//!
//! These tests verify the complete pipeline from recording offline
//! mutations through draining them against a remote store, including:
//! - Merge-on-write collapsing successive mutations per entity
//! - Priority-ordered queue draining
//! - Conflict resolution against server-side state
//! - Circuit breaker fail-fast when the backend is down
//! - Eager cycles when changes are recorded while connected

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::network::{NetworkChangeStream, NetworkInfo, NetworkStatus, NetworkType};
use bridge_traits::remote::{Payload, RemoteStore, Snapshot};
use bridge_traits::storage::EntityCache;
use bridge_traits::{Clock, NetworkMonitor, SystemClock};
use core_runtime::events::{CoreEvent, SyncEvent};
use core_runtime::EventBus;
use core_sync::{
    ChangeLedger, ChangeOperation, ChangePriority, ConflictStrategy, CycleOutcome, CycleStats,
    RetryPolicy, SyncConfig, SyncEngine, SyncTrigger,
};
use mockall::mock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Implementations
// ============================================================================

/// In-memory remote store recording the order of push operations
struct InMemoryRemote {
    entities: Mutex<HashMap<(String, String), Payload>>,
    op_log: Mutex<Vec<String>>,
}

impl InMemoryRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entities: Mutex::new(HashMap::new()),
            op_log: Mutex::new(Vec::new()),
        })
    }

    fn seed(&self, entity_type: &str, entity_id: &str, payload: Payload) {
        self.entities
            .lock()
            .unwrap()
            .insert((entity_type.to_string(), entity_id.to_string()), payload);
    }

    fn payload_of(&self, entity_type: &str, entity_id: &str) -> Option<Payload> {
        self.entities
            .lock()
            .unwrap()
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned()
    }

    fn op_log(&self) -> Vec<String> {
        self.op_log.lock().unwrap().clone()
    }

    fn log(&self, op: &str, entity_id: &str) {
        self.op_log
            .lock()
            .unwrap()
            .push(format!("{}:{}", op, entity_id));
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn fetch(&self, entity_type: &str, entity_id: &str) -> BridgeResult<Option<Snapshot>> {
        Ok(self
            .payload_of(entity_type, entity_id)
            .map(|payload| Snapshot::new(entity_type, entity_id, payload)))
    }

    async fn create(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Payload,
    ) -> BridgeResult<Snapshot> {
        self.log("create", entity_id);
        self.seed(entity_type, entity_id, payload.clone());
        Ok(Snapshot::new(entity_type, entity_id, payload.clone()))
    }

    async fn update(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Payload,
    ) -> BridgeResult<Snapshot> {
        self.log("update", entity_id);
        self.seed(entity_type, entity_id, payload.clone());
        Ok(Snapshot::new(entity_type, entity_id, payload.clone()))
    }

    async fn delete(&self, entity_type: &str, entity_id: &str) -> BridgeResult<()> {
        self.log("delete", entity_id);
        self.entities
            .lock()
            .unwrap()
            .remove(&(entity_type.to_string(), entity_id.to_string()));
        Ok(())
    }
}

mock! {
    Remote {}

    #[async_trait]
    impl RemoteStore for Remote {
        async fn fetch(&self, entity_type: &str, entity_id: &str) -> BridgeResult<Option<Snapshot>>;
        async fn create(
            &self,
            entity_type: &str,
            entity_id: &str,
            payload: &Payload,
        ) -> BridgeResult<Snapshot>;
        async fn update(
            &self,
            entity_type: &str,
            entity_id: &str,
            payload: &Payload,
        ) -> BridgeResult<Snapshot>;
        async fn delete(&self, entity_type: &str, entity_id: &str) -> BridgeResult<()>;
    }
}

struct NullCache;

#[async_trait]
impl EntityCache for NullCache {
    async fn apply_snapshot(&self, _snapshot: &Snapshot) -> BridgeResult<()> {
        Ok(())
    }

    async fn remove(&self, _entity_type: &str, _entity_id: &str) -> BridgeResult<()> {
        Ok(())
    }
}

/// Monitor that always reports a connected Wi-Fi network
struct AlwaysOnline;

struct EmptyStream;

#[async_trait]
impl NetworkChangeStream for EmptyStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        std::future::pending().await
    }
}

#[async_trait]
impl NetworkMonitor for AlwaysOnline {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(NetworkInfo {
            status: NetworkStatus::Connected,
            network_type: Some(NetworkType::WiFi),
            is_metered: false,
            is_expensive: false,
        })
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(EmptyStream))
    }
}

// ============================================================================
// Test Harness
// ============================================================================

struct Harness {
    engine: Arc<SyncEngine>,
    bus: EventBus,
}

async fn build_engine(
    remote: Arc<dyn RemoteStore>,
    monitor: Option<Arc<dyn NetworkMonitor>>,
    strategy: ConflictStrategy,
    breaker_threshold: u32,
    max_retries: u32,
) -> Harness {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = EventBus::default();
    let ledger = Arc::new(
        ChangeLedger::new(pool, Arc::clone(&clock), bus.clone(), max_retries)
            .await
            .unwrap(),
    );

    let config = SyncConfig {
        conflict_strategy: strategy,
        retry_policy: RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
        breaker_threshold,
        breaker_cooldown: Duration::from_secs(60),
        ..SyncConfig::default()
    };

    let engine = Arc::new(SyncEngine::new(
        ledger,
        remote,
        Arc::new(NullCache),
        monitor,
        clock,
        bus.clone(),
        config,
    ));

    Harness { engine, bus }
}

fn payload_with(key: &str, value: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert(key.to_string(), json!(value));
    payload
}

async fn run_cycle(engine: &SyncEngine) -> CycleStats {
    match engine
        .sync(SyncTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap()
    {
        CycleOutcome::Completed(stats) => stats,
        CycleOutcome::AlreadyRunning => panic!("Unexpected concurrent cycle"),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn offline_batch_drains_in_one_cycle() {
    let remote = InMemoryRemote::new();
    let harness = build_engine(
        remote.clone(),
        None,
        ConflictStrategy::UseLocal,
        100,
        3,
    )
    .await;
    let mut events = harness.bus.subscribe();
    let ledger = harness.engine.ledger();

    // A batch of edits made while offline.
    ledger
        .record(
            "event",
            "e1",
            ChangeOperation::Create,
            payload_with("name", "Standup"),
            ChangePriority::Normal,
        )
        .await
        .unwrap();
    ledger
        .record(
            "note",
            "n1",
            ChangeOperation::Create,
            payload_with("body", "Agenda"),
            ChangePriority::Normal,
        )
        .await
        .unwrap();

    let stats = run_cycle(&harness.engine).await;

    assert_eq!(stats.synced, 2);
    assert_eq!(ledger.pending_count().await.unwrap(), 0);
    assert!(remote.payload_of("event", "e1").is_some());
    assert!(remote.payload_of("note", "n1").is_some());

    // The cycle surfaced start and completion events, in order.
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Sync(sync_event) = event {
            kinds.push(match sync_event {
                SyncEvent::CycleStarted { pending, .. } => format!("started:{}", pending),
                SyncEvent::CycleCompleted { synced, .. } => format!("completed:{}", synced),
                SyncEvent::CycleFailed { .. } => "failed".to_string(),
            });
        }
    }
    assert_eq!(kinds, vec!["started:2", "completed:2"]);
}

#[tokio::test]
async fn successive_updates_collapse_to_one_push() {
    let remote = InMemoryRemote::new();
    remote.seed("event", "e1", payload_with("name", "Original"));
    let harness = build_engine(
        remote.clone(),
        None,
        ConflictStrategy::UseLocal,
        100,
        3,
    )
    .await;
    let ledger = harness.engine.ledger();

    ledger
        .record(
            "event",
            "e1",
            ChangeOperation::Update,
            payload_with("name", "A"),
            ChangePriority::Normal,
        )
        .await
        .unwrap();
    ledger
        .record(
            "event",
            "e1",
            ChangeOperation::Update,
            payload_with("name", "B"),
            ChangePriority::Normal,
        )
        .await
        .unwrap();

    assert_eq!(ledger.pending_count().await.unwrap(), 1);

    let stats = run_cycle(&harness.engine).await;

    assert_eq!(stats.synced, 1);
    assert_eq!(remote.op_log(), vec!["update:e1"]);
    assert_eq!(
        remote.payload_of("event", "e1").unwrap(),
        payload_with("name", "B")
    );
}

#[tokio::test]
async fn queue_drains_in_priority_order() {
    let remote = InMemoryRemote::new();
    let harness = build_engine(
        remote.clone(),
        None,
        ConflictStrategy::UseLocal,
        100,
        3,
    )
    .await;
    let ledger = harness.engine.ledger();

    for (id, priority) in [
        ("background", ChangePriority::Low),
        ("regular", ChangePriority::Normal),
        ("urgent", ChangePriority::Critical),
    ] {
        ledger
            .record(
                "event",
                id,
                ChangeOperation::Create,
                Payload::new(),
                priority,
            )
            .await
            .unwrap();
    }

    run_cycle(&harness.engine).await;

    assert_eq!(
        remote.op_log(),
        vec!["create:urgent", "create:regular", "create:background"]
    );
}

#[tokio::test]
async fn create_collision_resolves_as_update() {
    let remote = InMemoryRemote::new();
    remote.seed("event", "e1", payload_with("name", "server"));
    let harness = build_engine(
        remote.clone(),
        None,
        ConflictStrategy::UseLocal,
        100,
        3,
    )
    .await;

    harness
        .engine
        .ledger()
        .record(
            "event",
            "e1",
            ChangeOperation::Create,
            payload_with("name", "local"),
            ChangePriority::Normal,
        )
        .await
        .unwrap();

    run_cycle(&harness.engine).await;

    // The colliding create went through conflict resolution and was pushed
    // as an update, not a second create.
    assert_eq!(remote.op_log(), vec!["update:e1"]);
    assert_eq!(
        remote.payload_of("event", "e1").unwrap(),
        payload_with("name", "local")
    );
}

#[tokio::test]
async fn merge_strategy_interleaves_local_and_remote_fields() {
    let remote = InMemoryRemote::new();
    let mut server = Payload::new();
    server.insert("name".to_string(), json!("server"));
    server.insert("location".to_string(), json!("HQ"));
    remote.seed("event", "e1", server);

    let harness = build_engine(
        remote.clone(),
        None,
        ConflictStrategy::Merge,
        100,
        3,
    )
    .await;

    let mut local = Payload::new();
    local.insert("name".to_string(), json!("local"));
    local.insert("location".to_string(), serde_json::Value::Null);

    harness
        .engine
        .ledger()
        .record(
            "event",
            "e1",
            ChangeOperation::Update,
            local,
            ChangePriority::Normal,
        )
        .await
        .unwrap();

    run_cycle(&harness.engine).await;

    let merged = remote.payload_of("event", "e1").unwrap();
    assert_eq!(merged["name"], json!("local"));
    // Local null did not clobber the remote value.
    assert_eq!(merged["location"], json!("HQ"));
}

#[tokio::test]
async fn open_breaker_fails_fast_for_remaining_changes() {
    let mut mock = MockRemote::new();
    // Threshold is 3: exactly three fetches run before the breaker opens;
    // the remaining changes must not touch the remote at all.
    mock.expect_fetch()
        .times(3)
        .returning(|_, _| Err(BridgeError::Network("backend down".into())));

    let harness = build_engine(
        Arc::new(mock),
        None,
        ConflictStrategy::UseLocal,
        3,
        10,
    )
    .await;
    let ledger = harness.engine.ledger();

    for i in 0..5 {
        ledger
            .record(
                "event",
                &format!("e{}", i),
                ChangeOperation::Create,
                Payload::new(),
                ChangePriority::Normal,
            )
            .await
            .unwrap();
    }

    let stats = run_cycle(&harness.engine).await;

    assert_eq!(stats.failed, 3);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.synced, 0);
    // Everything stays queued; the skipped changes burned no retry budget.
    let pending = ledger.list_pending(None).await.unwrap();
    assert_eq!(pending.len(), 5);
    assert_eq!(
        pending.iter().filter(|c| c.retry_count == 0).count(),
        2
    );
}

#[tokio::test]
async fn exhausted_retry_budget_drops_the_change() {
    let mut mock = MockRemote::new();
    mock.expect_fetch()
        .returning(|_, _| Err(BridgeError::Network("backend down".into())));

    // Budget of 2: the change survives the first cycle and is dropped in
    // the second.
    let harness = build_engine(
        Arc::new(mock),
        None,
        ConflictStrategy::UseLocal,
        100,
        2,
    )
    .await;
    let ledger = harness.engine.ledger();

    ledger
        .record(
            "event",
            "e1",
            ChangeOperation::Create,
            Payload::new(),
            ChangePriority::Normal,
        )
        .await
        .unwrap();

    let first = run_cycle(&harness.engine).await;
    assert_eq!(first.failed, 1);
    assert_eq!(ledger.pending_count().await.unwrap(), 1);

    let second = run_cycle(&harness.engine).await;
    assert_eq!(second.dropped, 1);
    assert_eq!(ledger.pending_count().await.unwrap(), 0);
    assert!(ledger.failed_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn record_change_while_connected_syncs_eagerly() {
    let remote = InMemoryRemote::new();
    let harness = build_engine(
        remote.clone(),
        Some(Arc::new(AlwaysOnline)),
        ConflictStrategy::UseLocal,
        100,
        3,
    )
    .await;

    harness
        .engine
        .record_change(
            "event",
            "e1",
            ChangeOperation::Create,
            payload_with("name", "Standup"),
            ChangePriority::High,
        )
        .await
        .unwrap();

    // The eager background cycle should drain the queue without any
    // explicit trigger.
    let mut drained = false;
    for _ in 0..50 {
        if harness.engine.ledger().pending_count().await.unwrap() == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(drained, "recorded change was never synced");
    assert!(remote.payload_of("event", "e1").is_some());
}

#[tokio::test]
async fn delete_wins_over_later_edits_end_to_end() {
    let remote = InMemoryRemote::new();
    remote.seed("event", "e1", payload_with("name", "Original"));
    let harness = build_engine(
        remote.clone(),
        None,
        ConflictStrategy::UseLocal,
        100,
        3,
    )
    .await;
    let ledger = harness.engine.ledger();

    ledger
        .record(
            "event",
            "e1",
            ChangeOperation::Delete,
            Payload::new(),
            ChangePriority::Normal,
        )
        .await
        .unwrap();
    // A stray edit after the delete must not resurrect the entity.
    ledger
        .record(
            "event",
            "e1",
            ChangeOperation::Update,
            payload_with("name", "Zombie"),
            ChangePriority::Normal,
        )
        .await
        .unwrap();

    run_cycle(&harness.engine).await;

    assert_eq!(remote.op_log(), vec!["delete:e1"]);
    assert!(remote.payload_of("event", "e1").is_none());
}
