// tests/sync_protocol.rs - End-to-end protocol runs against a scripted host
//
// The engine talks to an in-process transport; each test plays the host
// side by reading the engine's outbound events and injecting replies
// through the inbound router.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use companion_sync::sync::watermark::WatermarkStore;
use companion_sync::{
    ChannelTransport, Database, DeviceInfo, EventStatus, EventType, InboundRouter, SyncConfig,
    SyncEngine, SyncEngineHandle, SyncEvent, SyncNotification, SYNC_CHANNEL,
};

const SESSION_ID: &str = "host-session-1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// ISO-8601 timestamp at `offset_secs` relative to now.
fn iso(offset_secs: i64) -> String {
    (Utc::now() + chrono::Duration::seconds(offset_secs))
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

struct Harness {
    handle: SyncEngineHandle,
    pool: SqlitePool,
    router: Arc<InboundRouter>,
    outbound: mpsc::Receiver<(String, SyncEvent)>,
    notifications: broadcast::Receiver<SyncNotification>,
}

async fn harness() -> Result<Harness> {
    harness_with(SyncConfig {
        device: DeviceInfo::detect("desktop"),
        ..SyncConfig::default()
    })
    .await
}

async fn harness_with(config: SyncConfig) -> Result<Harness> {
    init_tracing();
    let db = Database::in_memory().await?;
    let (transport, outbound) = ChannelTransport::new(64);
    let router = Arc::new(InboundRouter::new());
    let inbound = router.register(SYNC_CHANNEL, 64);
    let handle = SyncEngine::spawn(db.pool.clone(), Arc::new(transport), inbound, config);
    let notifications = handle.subscribe();

    Ok(Harness {
        handle,
        pool: db.pool,
        router,
        outbound,
        notifications,
    })
}

impl Harness {
    async fn recv_outbound(&mut self) -> SyncEvent {
        let (channel, event) = timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound event")
            .expect("engine transport closed");
        assert_eq!(channel, SYNC_CHANNEL);
        event
    }

    async fn expect_outbound(&mut self, event_type: &str) -> SyncEvent {
        let event = self.recv_outbound().await;
        assert_eq!(event.event_type, event_type, "payload: {}", event.payload);
        event
    }

    async fn inject(&self, event: SyncEvent) {
        self.router.dispatch(SYNC_CHANNEL, event).await.unwrap();
    }

    async fn next_notification(&mut self) -> SyncNotification {
        timeout(Duration::from_secs(5), self.notifications.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("observer channel closed")
    }

    async fn wait_terminal(&mut self) -> SyncNotification {
        loop {
            match self.next_notification().await {
                SyncNotification::Started { .. } | SyncNotification::Progress { .. } => continue,
                terminal => return terminal,
            }
        }
    }

    /// Host side of the opening handshake: accept the request, observe
    /// SYNC_START, return the request event for extra assertions.
    async fn accept_sync(&mut self) -> SyncEvent {
        let request = self.expect_outbound("SYNC_REQUEST").await;
        self.inject(SyncEvent::new(
            EventType::SyncRequest,
            EventStatus::Success,
            json!({
                "sync_session_id": SESSION_ID,
                "current_utc_timestamp": Utc::now().timestamp(),
                "clock_drift_seconds": 0,
                "last_sync_timestamp": request.payload["last_sync_timestamp"],
            }),
        ))
        .await;

        let start = self.expect_outbound("SYNC_START").await;
        assert_eq!(start.payload["sync_session_id"], json!(SESSION_ID));
        request
    }

    /// Host sends one row change and waits for the engine's confirmation.
    async fn send_host_record(&mut self, table: &str, operation: &str, record: Value) -> SyncEvent {
        let event_id = format!("host-data-{}", uuid::Uuid::new_v4());
        self.inject(SyncEvent::new(
            EventType::SyncData,
            EventStatus::New,
            json!({
                "sync_session_id": SESSION_ID,
                "event_id": event_id,
                "table": table,
                "operation": operation,
                "record": record,
            }),
        ))
        .await;

        let confirm = self.expect_outbound("SYNC_DATA_CONFIRM").await;
        assert_eq!(confirm.payload["event_id"], json!(event_id));
        confirm
    }

    async fn host_complete(&self) {
        self.inject(SyncEvent::new(
            EventType::SyncComplete,
            EventStatus::New,
            json!({ "sync_session_id": SESSION_ID }),
        ))
        .await;
    }

    /// Receive the engine's client-phase records, confirming each one,
    /// until its SYNC_COMPLETE arrives (which the host acknowledges).
    async fn drain_client_records(&mut self) -> Vec<Value> {
        let mut records = Vec::new();
        loop {
            let event = self.recv_outbound().await;
            match event.event_type.as_str() {
                "SYNC_DATA" => {
                    assert_eq!(event.payload["event_id"], json!(event.event_id.clone()));
                    self.inject(SyncEvent::new(
                        EventType::SyncDataConfirm,
                        EventStatus::Success,
                        json!({
                            "sync_session_id": SESSION_ID,
                            "event_id": event.payload["event_id"],
                            "status": "SUCCESS",
                        }),
                    ))
                    .await;
                    records.push(event.payload);
                }
                "SYNC_COMPLETE" => {
                    self.inject(SyncEvent::new(
                        EventType::SyncComplete,
                        EventStatus::Success,
                        json!({ "sync_session_id": SESSION_ID }),
                    ))
                    .await;
                    return records;
                }
                other => panic!("unexpected outbound event {other}"),
            }
        }
    }

    /// Acknowledge the engine's SYNC_FINALIZE.
    async fn finish(&mut self) {
        self.expect_outbound("SYNC_FINALIZE").await;
        self.inject(SyncEvent::new(
            EventType::SyncFinalize,
            EventStatus::Success,
            json!({ "sync_session_id": SESSION_ID }),
        ))
        .await;
    }

    async fn watermark(&self) -> i64 {
        WatermarkStore::new(self.pool.clone())
            .last_sync_timestamp()
            .await
            .unwrap()
    }

    async fn set_watermark(&self, value: i64) {
        WatermarkStore::new(self.pool.clone())
            .set_last_sync_timestamp(value)
            .await
            .unwrap();
    }

    async fn insert_profile(
        &self,
        id: &str,
        name: &str,
        created_off: i64,
        updated_off: i64,
        deleted_off: Option<i64>,
    ) {
        sqlx::query(
            "INSERT INTO character_profiles (id, name, created_at, updated_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(iso(created_off))
        .bind(iso(updated_off))
        .bind(deleted_off.map(iso))
        .execute(&self.pool)
        .await
        .unwrap();
    }

    async fn profile(&self, id: &str) -> Option<(String, String, Option<String>)> {
        sqlx::query_as(
            "SELECT name, updated_at, deleted_at FROM character_profiles WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .unwrap()
    }

    async fn profile_count(&self) -> i64 {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM character_profiles")
            .fetch_one(&self.pool)
            .await
            .unwrap();
        count.0
    }
}

fn profile_record(id: &str, name: &str, created_off: i64, updated_off: i64) -> Value {
    json!({
        "id": id,
        "name": name,
        "created_at": iso(created_off),
        "updated_at": iso(updated_off),
        "deleted_at": null,
    })
}

// Scenario: brand-new peer, host ships two seed rows.
#[tokio::test]
async fn new_peer_seeds_from_host() -> Result<()> {
    let mut h = harness().await?;
    h.handle.initiate_sync().await?;

    let request = h.accept_sync().await;
    assert_eq!(request.payload["last_sync_timestamp"], json!(0));
    assert!(request.payload["device_id"].as_str().is_some_and(|s| !s.is_empty()));
    assert!(request.payload["device_name"].as_str().is_some());

    let confirm = h
        .send_host_record(
            "character_profiles",
            "insert",
            profile_record("p-1", "Aria", -100, -100),
        )
        .await;
    assert_eq!(confirm.payload["status"], json!("SUCCESS"));
    h.send_host_record(
        "character_profiles",
        "insert",
        profile_record("p-2", "Brook", -100, -100),
    )
    .await;

    h.host_complete().await;
    assert!(h.drain_client_records().await.is_empty());
    h.finish().await;

    let SyncNotification::Completed { session } = h.wait_terminal().await else {
        panic!("expected completion");
    };
    assert_eq!(session.records_received, 2);
    assert_eq!(session.records_sent, 0);

    assert_eq!(h.profile_count().await, 2);
    assert!(h.profile("p-1").await.is_some());
    assert!(h.profile("p-2").await.is_some());
    assert_eq!(h.watermark().await, session.start_time_unix);
    Ok(())
}

// Scenario: both peers hold a row; each ends with both.
#[tokio::test]
async fn local_and_remote_rows_exchange() -> Result<()> {
    let mut h = harness().await?;
    h.insert_profile("a", "Local row", -50, -50, None).await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.send_host_record(
        "character_profiles",
        "insert",
        profile_record("b", "Host row", -60, -60),
    )
    .await;
    h.host_complete().await;

    let sent = h.drain_client_records().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["table"], json!("character_profiles"));
    assert_eq!(sent[0]["operation"], json!("insert"));
    assert_eq!(sent[0]["record"]["id"], json!("a"));

    h.finish().await;
    let SyncNotification::Completed { session } = h.wait_terminal().await else {
        panic!("expected completion");
    };
    assert!(session.records_sent >= 1);
    assert_eq!(h.profile_count().await, 2);
    Ok(())
}

// Scenario: remote edit is newer than the local copy and wins.
#[tokio::test]
async fn newer_remote_update_overwrites_local() -> Result<()> {
    let mut h = harness().await?;
    let watermark = Utc::now().timestamp() - 10;
    h.set_watermark(watermark).await;
    h.insert_profile("r", "Stale local", -3600, -20, None).await;

    h.handle.initiate_sync().await?;
    let request = h.accept_sync().await;
    assert_eq!(request.payload["last_sync_timestamp"], json!(watermark));

    let incoming = profile_record("r", "Fresh from host", -3600, -5);
    let expected_updated_at = incoming["updated_at"].clone();
    h.send_host_record("character_profiles", "update", incoming)
        .await;
    h.host_complete().await;

    // The local copy was older than the watermark, so nothing goes back
    assert!(h.drain_client_records().await.is_empty());
    h.finish().await;
    h.wait_terminal().await;

    let (name, updated_at, _) = h.profile("r").await.unwrap();
    assert_eq!(name, "Fresh from host");
    assert_eq!(json!(updated_at), expected_updated_at);
    Ok(())
}

// Scenario: local edit of a pre-existing row travels as an update.
#[tokio::test]
async fn local_update_sends_as_update() -> Result<()> {
    let mut h = harness().await?;
    let watermark = Utc::now().timestamp() - 10;
    h.set_watermark(watermark).await;
    h.insert_profile("r", "Edited locally", -3600, -5, None).await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.host_complete().await;

    let sent = h.drain_client_records().await;
    assert_eq!(sent.len(), 1);
    // created_at predates the watermark: update, not insert
    assert_eq!(sent[0]["operation"], json!("update"));
    assert_eq!(sent[0]["record"]["id"], json!("r"));

    h.finish().await;
    h.wait_terminal().await;

    let (name, _, _) = h.profile("r").await.unwrap();
    assert_eq!(name, "Edited locally");
    Ok(())
}

// Scenario: host soft delete lands as a tombstone, nothing is removed.
#[tokio::test]
async fn host_soft_delete_preserves_rows() -> Result<()> {
    let mut h = harness().await?;
    let watermark = Utc::now().timestamp() - 10;
    h.set_watermark(watermark).await;
    h.insert_profile("dying", "To be deleted", -3600, -3600, None)
        .await;
    h.insert_profile("sibling", "Still alive", -3600, -3600, None)
        .await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.send_host_record(
        "character_profiles",
        "delete",
        json!({
            "id": "dying",
            "name": "To be deleted",
            "created_at": iso(-3600),
            "updated_at": iso(-3),
            "deleted_at": iso(-3),
        }),
    )
    .await;
    h.host_complete().await;
    assert!(h.drain_client_records().await.is_empty());
    h.finish().await;
    h.wait_terminal().await;

    let (_, _, deleted_at) = h.profile("dying").await.unwrap();
    assert!(deleted_at.is_some());
    let (_, _, sibling_deleted) = h.profile("sibling").await.unwrap();
    assert!(sibling_deleted.is_none());
    assert_eq!(h.profile_count().await, 2);
    Ok(())
}

// Scenario: a locally soft-deleted row is transmitted as a delete.
#[tokio::test]
async fn local_soft_delete_propagates() -> Result<()> {
    let mut h = harness().await?;
    let watermark = Utc::now().timestamp() - 10;
    h.set_watermark(watermark).await;
    h.insert_profile("gone", "Deleted here", -3600, -3, Some(-3))
        .await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.host_complete().await;

    let sent = h.drain_client_records().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["operation"], json!("delete"));
    assert_eq!(sent[0]["record"]["id"], json!("gone"));
    assert!(sent[0]["record"]["deleted_at"].is_string());

    h.finish().await;
    h.wait_terminal().await;
    Ok(())
}

// Scenario: a malformed incoming record is confirmed with ERROR and the
// session dies with nothing persisted.
#[tokio::test]
async fn invalid_incoming_record_fails_session() -> Result<()> {
    let mut h = harness().await?;
    h.handle.initiate_sync().await?;
    h.accept_sync().await;

    let confirm = h
        .send_host_record(
            "not_a_synced_table",
            "insert",
            profile_record("x", "Nope", -10, -10),
        )
        .await;
    assert_eq!(confirm.payload["status"], json!("ERROR"));
    assert!(confirm.payload["error_message"].as_str().is_some());

    let SyncNotification::Error { message } = h.wait_terminal().await else {
        panic!("expected an error");
    };
    assert!(message.contains("unknown table"), "got: {message}");

    assert_eq!(h.profile_count().await, 0);
    assert_eq!(h.watermark().await, 0);
    Ok(())
}

// Scenario: with nothing to exchange the outbound sequence is exactly
// REQUEST, START, COMPLETE, FINALIZE.
#[tokio::test]
async fn empty_sync_has_exact_event_order() -> Result<()> {
    let mut h = harness().await?;
    h.handle.initiate_sync().await?;

    h.expect_outbound("SYNC_REQUEST").await;
    h.inject(SyncEvent::new(
        EventType::SyncRequest,
        EventStatus::Success,
        json!({ "sync_session_id": SESSION_ID }),
    ))
    .await;
    h.expect_outbound("SYNC_START").await;

    h.host_complete().await;
    h.expect_outbound("SYNC_COMPLETE").await;
    h.inject(SyncEvent::new(
        EventType::SyncComplete,
        EventStatus::Success,
        json!({ "sync_session_id": SESSION_ID }),
    ))
    .await;

    h.expect_outbound("SYNC_FINALIZE").await;
    h.inject(SyncEvent::new(
        EventType::SyncFinalize,
        EventStatus::Success,
        json!({ "sync_session_id": SESSION_ID }),
    ))
    .await;

    h.wait_terminal().await;
    // No stray outbound traffic after finalize
    assert!(
        timeout(Duration::from_millis(100), h.outbound.recv())
            .await
            .is_err()
    );
    Ok(())
}

// Law: a second run with no new changes moves nothing and re-advances the
// watermark to its own start time.
#[tokio::test]
async fn second_sync_with_no_changes_transfers_nothing() -> Result<()> {
    let mut h = harness().await?;
    h.insert_profile("a", "Mine", -100, -100, None).await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.send_host_record(
        "character_profiles",
        "insert",
        profile_record("b", "Theirs", -100, -100),
    )
    .await;
    h.host_complete().await;
    assert_eq!(h.drain_client_records().await.len(), 1);
    h.finish().await;
    h.wait_terminal().await;
    let first_watermark = h.watermark().await;
    assert!(first_watermark > 0);

    // Let the clock tick so the second watermark strictly increases
    tokio::time::sleep(Duration::from_millis(1100)).await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.host_complete().await;
    assert!(h.drain_client_records().await.is_empty());
    h.finish().await;

    let SyncNotification::Completed { session } = h.wait_terminal().await else {
        panic!("expected completion");
    };
    assert_eq!(session.records_sent, 0);
    assert_eq!(session.records_received, 0);
    assert_eq!(h.watermark().await, session.start_time_unix);
    assert!(h.watermark().await > first_watermark);
    Ok(())
}

// Law: duplicate delivery of the same record converges to the same state.
#[tokio::test]
async fn duplicate_data_delivery_is_idempotent() -> Result<()> {
    let mut h = harness().await?;
    h.handle.initiate_sync().await?;
    h.accept_sync().await;

    let record = profile_record("p-1", "Once", -100, -100);
    h.send_host_record("character_profiles", "insert", record.clone())
        .await;
    h.send_host_record("character_profiles", "insert", record)
        .await;

    h.host_complete().await;
    h.drain_client_records().await;
    h.finish().await;
    h.wait_terminal().await;

    assert_eq!(h.profile_count().await, 1);
    let (name, _, _) = h.profile("p-1").await.unwrap();
    assert_eq!(name, "Once");
    Ok(())
}

// Invariant: at most one outbound SYNC_DATA in flight.
#[tokio::test]
async fn one_data_event_in_flight_at_a_time() -> Result<()> {
    let mut h = harness().await?;
    h.insert_profile("a", "First", -100, -100, None).await;
    h.insert_profile("b", "Second", -100, -100, None).await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.host_complete().await;

    let first = h.expect_outbound("SYNC_DATA").await;
    // Nothing else may go out before the confirmation arrives
    assert!(
        timeout(Duration::from_millis(150), h.outbound.recv())
            .await
            .is_err(),
        "second SYNC_DATA sent before the first was confirmed"
    );

    h.inject(SyncEvent::new(
        EventType::SyncDataConfirm,
        EventStatus::Success,
        json!({
            "sync_session_id": SESSION_ID,
            "event_id": first.payload["event_id"],
            "status": "SUCCESS",
        }),
    ))
    .await;

    let second = h.expect_outbound("SYNC_DATA").await;
    assert_ne!(first.payload["event_id"], second.payload["event_id"]);
    h.inject(SyncEvent::new(
        EventType::SyncDataConfirm,
        EventStatus::Success,
        json!({
            "sync_session_id": SESSION_ID,
            "event_id": second.payload["event_id"],
            "status": "SUCCESS",
        }),
    ))
    .await;

    h.expect_outbound("SYNC_COMPLETE").await;
    Ok(())
}

// A confirmation that never arrives times the session out.
#[tokio::test]
async fn missing_confirmation_times_out() -> Result<()> {
    let mut h = harness_with(SyncConfig {
        device: DeviceInfo::detect("desktop"),
        confirmation_timeout: Duration::from_millis(200),
        ..SyncConfig::default()
    })
    .await?;
    h.insert_profile("a", "Unconfirmed", -100, -100, None).await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.host_complete().await;
    h.expect_outbound("SYNC_DATA").await;
    // Never confirm

    let SyncNotification::Error { message } = h.wait_terminal().await else {
        panic!("expected an error");
    };
    assert!(message.contains("Timed out"), "got: {message}");
    assert_eq!(h.watermark().await, 0);
    Ok(())
}

// A peer confirmation with ERROR status aborts the send loop.
#[tokio::test]
async fn confirm_error_fails_session() -> Result<()> {
    let mut h = harness().await?;
    h.insert_profile("a", "Refused", -100, -100, None).await;

    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.host_complete().await;

    let data = h.expect_outbound("SYNC_DATA").await;
    h.inject(SyncEvent::new(
        EventType::SyncDataConfirm,
        EventStatus::Error,
        json!({
            "sync_session_id": SESSION_ID,
            "event_id": data.payload["event_id"],
            "status": "ERROR",
            "error_message": "disk full",
        }),
    ))
    .await;

    let SyncNotification::Error { message } = h.wait_terminal().await else {
        panic!("expected an error");
    };
    assert!(message.contains("disk full"), "got: {message}");
    assert_eq!(h.watermark().await, 0);
    Ok(())
}

// SYNC_REJECT is terminal in any phase and never advances the watermark.
#[tokio::test]
async fn peer_reject_terminates_session() -> Result<()> {
    let mut h = harness().await?;
    h.handle.initiate_sync().await?;
    h.accept_sync().await;

    h.inject(SyncEvent::new(
        EventType::SyncReject,
        EventStatus::Error,
        json!({ "message": "device unpaired" }),
    ))
    .await;

    let SyncNotification::Rejected { payload } = h.wait_terminal().await else {
        panic!("expected a rejection");
    };
    assert_eq!(payload["message"], json!("device unpaired"));
    assert_eq!(h.watermark().await, 0);

    // The engine is idle again and can start a new session
    h.handle.initiate_sync().await?;
    h.expect_outbound("SYNC_REQUEST").await;
    Ok(())
}

// Cancellation clears the session without touching the watermark.
#[tokio::test]
async fn cancel_aborts_without_watermark() -> Result<()> {
    let mut h = harness().await?;
    h.handle.initiate_sync().await?;
    h.accept_sync().await;
    h.send_host_record(
        "character_profiles",
        "insert",
        profile_record("p-1", "Buffered only", -100, -100),
    )
    .await;

    h.handle.cancel().await?;

    let SyncNotification::Error { message } = h.wait_terminal().await else {
        panic!("expected an error");
    };
    assert_eq!(message, "cancelled");
    // Buffered rows were never applied
    assert_eq!(h.profile_count().await, 0);
    assert_eq!(h.watermark().await, 0);
    Ok(())
}

// A second initiate while a session is running is refused.
#[tokio::test]
async fn concurrent_initiate_is_refused() -> Result<()> {
    let mut h = harness().await?;
    h.handle.initiate_sync().await?;
    h.expect_outbound("SYNC_REQUEST").await;

    let err = h.handle.initiate_sync().await.unwrap_err();
    assert!(err.to_string().contains("already in progress"));
    Ok(())
}
