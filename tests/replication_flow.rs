//! End-to-end replication flows: a replica engine and a master engine wired
//! over one in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shipsync::{
    BusProducer, ConsumerLoop, ContentTypeDef, HostApp, MemoryBus, MemoryHost, Role, SyncConfig,
    SyncEngine, WriteOrigin,
};

// ============================================================================
// Helpers
// ============================================================================

const PAGE: &str = "api::page.page";

struct Site {
    engine: SyncEngine,
    host: Arc<MemoryHost>,
    bus: Arc<MemoryBus>,
}

fn content_types() -> Vec<ContentTypeDef> {
    vec![ContentTypeDef {
        uid: PAGE.into(),
        required_fields: vec![],
    }]
}

fn site(mode: Role, bus: &Arc<MemoryBus>, id_offset: u64) -> Site {
    let host = MemoryHost::with_id_offset(id_offset);
    let config = SyncConfig {
        mode,
        ship_id: (mode == Role::Replica).then(|| "ship-A".to_string()),
        content_types: vec![PAGE.into()],
        sync: shipsync::SyncTuning {
            debounce_ms: 1,
            retry_delay_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = SyncEngine::new(
        config,
        Arc::clone(&host) as Arc<dyn HostApp>,
        Arc::clone(bus) as Arc<dyn BusProducer>,
        content_types(),
        None,
    )
    .expect("engine");
    Site {
        engine,
        host,
        bus: Arc::clone(bus),
    }
}

/// Drain the ship-updates topic into the master's apply pipeline.
fn master_consumer(master: &Site) -> ConsumerLoop {
    ConsumerLoop::new(
        master.bus.subscribe("ship-updates"),
        master.engine.processor(),
        master.engine.dead_letters(),
        3,
        Duration::from_millis(1),
    )
}

/// Let the debounce window close before pushing.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ============================================================================
// Scenario: happy push
// ============================================================================

#[tokio::test]
async fn happy_push_reaches_master_within_one_cycle() {
    let bus = MemoryBus::new();
    let replica = site(Role::Replica, &bus, 1000);
    let master = site(Role::Master, &bus, 0);

    // User creates then edits a page on the replica.
    let record = replica
        .host
        .create(PAGE, "d1", &json!({"title": "v1"}), WriteOrigin::User)
        .await
        .expect("create");
    replica
        .engine
        .capture()
        .after_create(PAGE, &record, WriteOrigin::User);
    settle().await;

    replica.engine.check_connectivity().await;
    let outcome = replica.engine.push().await.expect("push");
    assert_eq!(outcome.sent, 1);
    assert_eq!(replica.engine.status().expect("status").queue_size, 0);

    let summary = master_consumer(&master).drain().await.expect("drain");
    assert_eq!(summary.applied, 1);

    let applied = master.host.find_by_document(PAGE, "d1").expect("record on master");
    assert_eq!(applied.payload["title"], "v1");
    // Master assigned its own local id; identity diverges by design.
    assert_ne!(applied.local_id, record.local_id);
    // The sighting registered the ship.
    let ships = master.engine.ships().expect("ships");
    assert_eq!(ships.len(), 1);
    assert_eq!(ships[0].ship_id, "ship-A");
}

// ============================================================================
// Scenario: offline accumulation, then reconnect
// ============================================================================

#[tokio::test]
async fn offline_updates_accumulate_and_drain_on_reconnect() {
    let bus = MemoryBus::new();
    let replica = site(Role::Replica, &bus, 1000);
    let master = site(Role::Master, &bus, 0);

    bus.set_offline(true);
    replica.engine.check_connectivity().await;

    // 50 distinct documents mutate while the link is down.
    for i in 0..50 {
        let record = replica
            .host
            .create(PAGE, &format!("d{i}"), &json!({"n": i}), WriteOrigin::User)
            .await
            .expect("create");
        replica
            .engine
            .capture()
            .after_create(PAGE, &record, WriteOrigin::User);
    }
    settle().await;

    // Push is skipped offline, but the queue holds everything.
    let skipped = replica.engine.push().await.expect("push");
    assert!(skipped.skipped);
    assert_eq!(replica.engine.status().expect("status").queue_size, 50);

    bus.set_offline(false);
    replica.engine.check_connectivity().await;
    let outcome = replica.engine.push().await.expect("push");
    assert_eq!(outcome.sent, 50);

    let summary = master_consumer(&master).drain().await.expect("drain");
    assert_eq!(summary.applied, 50);
    assert_eq!(summary.parked, 0);
    assert_eq!(master.host.record_count(), 50);
    // Nothing was dead-lettered along the way.
    assert_eq!(master.engine.dead_letters().stats().expect("stats").total(), 0);
}

// ============================================================================
// Scenario: duplicate delivery
// ============================================================================

#[tokio::test]
async fn duplicate_delivery_has_single_effect() {
    let bus = MemoryBus::new();
    let replica = site(Role::Replica, &bus, 1000);
    let master = site(Role::Master, &bus, 0);

    let record = replica
        .host
        .create(PAGE, "d1", &json!({"title": "once"}), WriteOrigin::User)
        .await
        .expect("create");
    replica
        .engine
        .capture()
        .after_create(PAGE, &record, WriteOrigin::User);
    settle().await;
    replica.engine.check_connectivity().await;
    replica.engine.push().await.expect("push");

    // The bus redelivers the same record a second time.
    let delivered = bus.topic_messages("ship-updates");
    assert_eq!(delivered.len(), 1);
    bus.publish("ship-updates", &delivered[0]).await.expect("redeliver");

    let summary = master_consumer(&master).drain().await.expect("drain");
    assert_eq!(summary.applied, 2, "both deliveries settle");
    // ...but only one apply hit the host.
    assert_eq!(master.host.write_log().len(), 1);
    assert_eq!(master.host.record_count(), 1);
}

// ============================================================================
// Scenario: debounce coalescing across a burst
// ============================================================================

#[tokio::test]
async fn rapid_edits_coalesce_to_one_message() {
    let bus = MemoryBus::new();
    let replica = site(Role::Replica, &bus, 1000);

    let mut record = replica
        .host
        .create(PAGE, "d1", &json!({"rev": 0}), WriteOrigin::User)
        .await
        .expect("create");
    replica
        .engine
        .capture()
        .after_create(PAGE, &record, WriteOrigin::User);
    for rev in 1..=4 {
        record = replica
            .host
            .update(PAGE, &record.local_id, &json!({"rev": rev}), WriteOrigin::User)
            .await
            .expect("update");
        replica
            .engine
            .capture()
            .after_update(PAGE, &record, WriteOrigin::User);
    }
    settle().await;
    replica.engine.check_connectivity().await;

    let outcome = replica.engine.push().await.expect("push");
    assert_eq!(outcome.sent, 1, "burst collapses to a single message");

    let wire = bus.topic_messages("ship-updates");
    assert_eq!(wire[0].payload.as_ref().expect("payload")["rev"], 4);
    assert_eq!(wire[0].supersedes.len(), 4);
}
