use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

use super::*;
use crate::models::ConflictStatus;
use crate::network::NetworkMonitor;
use crate::resolver::{ADDENDUM_SEPARATOR, DUPLICATE_FLAG_FIELD, DUPLICATE_OF_FIELD};
use crate::status::SyncStatusSnapshot;

#[derive(Default)]
struct ServerState {
    entities: HashMap<(EntityType, String), Entity>,
    next_id: u64,
    failures: VecDeque<RemoteError>,
    calls: Vec<String>,
    hang_on_call: Option<usize>,
    drop_network_on_call: Option<(usize, NetworkMonitor)>,
}

/// In-process server: versioned entities plus scripted failures.
#[derive(Clone, Default)]
struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    entered_hang: Arc<Notify>,
}

impl FakeServer {
    fn seed(&self, entity: &Entity) {
        self.state
            .lock()
            .unwrap()
            .entities
            .insert((entity.entity_type, entity.id.to_string()), entity.clone());
    }

    fn entity(&self, entity_type: EntityType, id: &str) -> Option<Entity> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(&(entity_type, id.to_string()))
            .cloned()
    }

    fn entities_of(&self, entity_type: EntityType) -> Vec<Entity> {
        let state = self.state.lock().unwrap();
        let mut entities: Vec<Entity> = state
            .entities
            .values()
            .filter(|entity| entity.entity_type == entity_type)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    fn fail_next(&self, error: RemoteError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    fn hang_on_call(&self, call: usize) {
        self.state.lock().unwrap().hang_on_call = Some(call);
    }

    fn drop_network_on_call(&self, call: usize, monitor: NetworkMonitor) {
        self.state.lock().unwrap().drop_network_on_call = Some((call, monitor));
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    async fn begin_call(&self, call: String) -> RemoteResult<()> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            let count = state.calls.len();

            let mut hang = state.hang_on_call == Some(count);
            if let Some((at, monitor)) = &state.drop_network_on_call {
                if *at == count {
                    monitor.set_link_up(false);
                    hang = true;
                }
            }
            if !hang {
                if let Some(error) = state.failures.pop_front() {
                    return Err(error);
                }
            }
            hang
        };

        if hang {
            self.entered_hang.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

impl RemoteApi for FakeServer {
    async fn create(
        &self,
        entity_type: EntityType,
        client_id: &EntityId,
        payload: &Map<String, Value>,
    ) -> RemoteResult<Entity> {
        self.begin_call(format!("create {entity_type}/{client_id}"))
            .await?;

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = EntityId::new(format!("srv-{}", state.next_id));
        let mut entity = Entity::new(entity_type, id, 1, Map::new());
        entity.apply_payload(payload);
        entity.version = 1;
        state
            .entities
            .insert((entity_type, entity.id.to_string()), entity.clone());
        Ok(entity)
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        payload: &Map<String, Value>,
        base_version: Option<i64>,
    ) -> RemoteResult<Entity> {
        self.begin_call(format!("update {entity_type}/{id}")).await?;

        let mut state = self.state.lock().unwrap();
        let Some(current) = state.entities.get_mut(&(entity_type, id.to_string())) else {
            return Err(RemoteError::Permanent {
                status: 404,
                message: format!("{entity_type} {id} not found"),
            });
        };
        if base_version != Some(current.version) {
            return Err(RemoteError::conflict(current.clone()));
        }
        let version = current.version + 1;
        current.apply_payload(payload);
        current.version = version;
        Ok(current.clone())
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        base_version: Option<i64>,
    ) -> RemoteResult<()> {
        self.begin_call(format!("delete {entity_type}/{id}")).await?;

        let mut state = self.state.lock().unwrap();
        let key = (entity_type, id.to_string());
        let Some(current) = state.entities.get(&key) else {
            return Ok(());
        };
        if base_version != Some(current.version) {
            return Err(RemoteError::conflict(current.clone()));
        }
        state.entities.remove(&key);
        Ok(())
    }
}

struct Harness {
    engine: Arc<SyncEngine<FakeServer>>,
    server: FakeServer,
    monitor: NetworkMonitor,
    store: LocalStore,
    queue: OperationQueue,
    recorder: ChangeRecorder,
}

impl Harness {
    async fn new() -> Self {
        Self::with(SyncConfig::default(), ConflictResolver::new()).await
    }

    async fn with(config: SyncConfig, resolver: ConflictResolver) -> Self {
        let store = LocalStore::open_in_memory().await.unwrap();
        let queue = OperationQueue::new(store.clone(), &config);
        let monitor = NetworkMonitor::new(true);
        let server = FakeServer::default();
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            queue.clone(),
            resolver,
            server.clone(),
            monitor.subscribe(),
            config,
        ));
        let recorder = engine.recorder();
        Self {
            engine,
            server,
            monitor,
            store,
            queue,
            recorder,
        }
    }

    /// Same entity on the server and in the device cache
    async fn seed_both(&self, entity: &Entity) {
        self.server.seed(entity);
        self.store.put_entity(entity).await.unwrap();
    }

    async fn sync(&self) -> SyncReport {
        match self.engine.sync_pending_operations().await.unwrap() {
            SyncOutcome::Completed(report) => report,
            other => panic!("expected a completed cycle, got {other:?}"),
        }
    }
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn entity(entity_type: EntityType, id: &str, version: i64, value: Value) -> Entity {
    Entity::new(entity_type, EntityId::from(id), version, fields(value))
}

#[tokio::test(flavor = "multi_thread")]
async fn created_entity_takes_server_id_and_references_follow() {
    let h = Harness::new().await;

    let visit = h
        .recorder
        .create(EntityType::Visit, fields(json!({"status": "scheduled"})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let task = h
        .recorder
        .create(
            EntityType::Task,
            fields(json!({"title": "Bring meds", "visitId": visit.id.as_str()})),
        )
        .await
        .unwrap();

    let report = h.sync().await;
    assert_eq!(report.synced, 2);
    assert_eq!(h.queue.size().await.unwrap(), 0);

    let server_visit = &h.server.entities_of(EntityType::Visit)[0];
    let server_task = &h.server.entities_of(EntityType::Task)[0];
    assert_eq!(
        server_task.field("visitId"),
        Some(&json!(server_visit.id.as_str()))
    );

    assert!(h
        .store
        .get_entity(EntityType::Visit, &visit.id)
        .await
        .unwrap()
        .is_none());
    let cached_visit = h
        .store
        .get_entity(EntityType::Visit, &server_visit.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached_visit.version, 1);

    let cached_task = h
        .store
        .get_entity(EntityType::Task, &server_task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        cached_task.field("visitId"),
        Some(&json!(server_visit.id.as_str()))
    );
    assert!(h
        .store
        .get_entity(EntityType::Task, &task.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn update_queued_behind_in_flight_create_is_remapped_before_sending() {
    let h = Harness::new().await;
    let temp = EntityId::from("tmp-1");

    let mut create =
        PendingOperation::create(EntityType::Visit, temp.clone(), fields(json!({"status": "scheduled"})));
    create.created_at = 1;
    h.queue.enqueue(create).await.unwrap();
    // Simulate the create already being in flight so the update is not folded into it.
    h.queue.dequeue_next_batch(1).await.unwrap();
    let mut update =
        PendingOperation::update(EntityType::Visit, temp.clone(), fields(json!({"status": "started"})), None);
    update.created_at = 2;
    h.queue.enqueue(update).await.unwrap();
    h.queue.revert_syncing().await.unwrap();

    let report = h.sync().await;
    assert_eq!(report.synced, 2);
    assert_eq!(
        h.server.calls(),
        vec!["create visit/tmp-1".to_string(), "update visit/srv-1".to_string()]
    );
    let server = h.server.entity(EntityType::Visit, "srv-1").unwrap();
    assert_eq!(server.version, 2);
    assert_eq!(server.field("status"), Some(&json!("started")));
}

#[tokio::test(flavor = "multi_thread")]
async fn replaying_offline_log_matches_direct_application() {
    let mutations = [
        json!({"status": "started", "notes": "arrived"}),
        json!({"notes": "arrived, patient asleep"}),
        json!({"mileage": 14}),
        json!({"status": "completed"}),
    ];
    let original = entity(EntityType::Visit, "v1", 1, json!({"status": "scheduled"}));

    // Online, one request per mutation.
    let direct = FakeServer::default();
    direct.seed(&original);
    let mut version = 1;
    for mutation in &mutations {
        let updated = direct
            .update(EntityType::Visit, &original.id, &fields(mutation.clone()), Some(version))
            .await
            .unwrap();
        version = updated.version;
    }

    // Offline, replayed from the queue.
    let h = Harness::new().await;
    h.seed_both(&original).await;
    for mutation in &mutations {
        h.queue
            .enqueue(PendingOperation::update(
                EntityType::Visit,
                original.id.clone(),
                fields(mutation.clone()),
                Some(1),
            ))
            .await
            .unwrap();
    }
    h.sync().await;

    let expected = direct.entity(EntityType::Visit, "v1").unwrap();
    let replayed = h.server.entity(EntityType::Visit, "v1").unwrap();
    assert_eq!(replayed.fields, expected.fields);
}

#[tokio::test(flavor = "multi_thread")]
async fn connectivity_loss_mid_batch_reverts_to_pending() {
    let h = Harness::new().await;
    for (index, id) in ["t1", "t2", "t3"].into_iter().enumerate() {
        h.seed_both(&entity(EntityType::Task, id, 1, json!({"done": false})))
            .await;
        let mut op = PendingOperation::update(
            EntityType::Task,
            EntityId::from(id),
            fields(json!({"done": true})),
            Some(1),
        );
        op.created_at = i64::try_from(index).unwrap();
        h.queue.enqueue(op).await.unwrap();
    }
    h.server.drop_network_on_call(2, h.monitor.clone());
    let mut events = h.engine.status().events();

    let report = h.sync().await;
    assert!(report.aborted);
    assert_eq!(report.synced, 1);

    let counts = h.queue.counts().await.unwrap();
    assert_eq!(counts.syncing, 0);
    assert_eq!(counts.pending, 2);
    let pending = h.queue.list().await.unwrap();
    assert!(pending.iter().all(|op| op.retry_count == 0));

    let snapshot = h.engine.status().snapshot();
    assert!(!snapshot.is_syncing);
    assert_eq!(snapshot.sync_status, SyncState::Error);
    assert_eq!(snapshot.pending_operations_count, 2);
    assert!(!snapshot.is_online);

    assert_eq!(events.recv().await.unwrap(), SyncEvent::SyncStarted);
    assert!(matches!(events.recv().await.unwrap(), SyncEvent::SyncFailed(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_cycle_is_skipped() {
    let h = Harness::new().await;
    h.recorder
        .create(EntityType::Note, fields(json!({"content": "x"})))
        .await
        .unwrap();
    h.monitor.set_link_up(false);

    let outcome = h.engine.sync_pending_operations().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Offline);
    assert!(h.server.calls().is_empty());
    assert_eq!(h.engine.status().snapshot().pending_operations_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reentrant_trigger_is_a_no_op() {
    let h = Harness::new().await;
    h.recorder
        .create(EntityType::Note, fields(json!({"content": "x"})))
        .await
        .unwrap();
    h.server.hang_on_call(1);

    let engine = Arc::clone(&h.engine);
    let first = tokio::spawn(async move { engine.sync_pending_operations().await });
    h.server.entered_hang.notified().await;

    assert!(h.engine.status().snapshot().is_syncing);
    let second = h.engine.sync_pending_operations().await.unwrap();
    assert_eq!(second, SyncOutcome::AlreadyRunning);

    h.monitor.set_link_up(false);
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, SyncOutcome::Completed(report) if report.aborted));
    assert_eq!(h.server.calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_counts_as_transient_failure() {
    let config = SyncConfig {
        request_timeout_ms: 50,
        ..SyncConfig::default()
    };
    let h = Harness::with(config, ConflictResolver::new()).await;
    h.recorder
        .create(EntityType::Incident, fields(json!({"severity": "low"})))
        .await
        .unwrap();
    h.server.hang_on_call(1);

    let report = h.sync().await;
    assert_eq!(report.retried, 1);
    let queued = h.queue.list().await.unwrap();
    assert_eq!(queued[0].status, OperationStatus::Pending);
    assert_eq!(queued[0].retry_count, 1);
    assert!(queued[0].last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_budget_exhaustion_is_terminal_until_retried() {
    let config = SyncConfig {
        max_retries: 1,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
        ..SyncConfig::default()
    };
    let h = Harness::with(config, ConflictResolver::new()).await;
    h.recorder
        .create(EntityType::Task, fields(json!({"title": "Call GP"})))
        .await
        .unwrap();
    h.server
        .fail_next(RemoteError::Transient("connection reset".to_string()));
    h.server
        .fail_next(RemoteError::Transient("connection reset".to_string()));
    let mut events = h.engine.status().events();

    let report = h.sync().await;
    assert_eq!(report.retried, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.server.calls().len(), 2);

    let failed = h.queue.list().await.unwrap();
    assert_eq!(failed[0].status, OperationStatus::Failed);
    assert_eq!(failed[0].retry_count, 2);
    assert_eq!(h.engine.status().snapshot().error_operations_count, 1);
    assert_eq!(h.engine.status().snapshot().sync_status, SyncState::Error);

    // Terminal failures are not retried automatically.
    h.sync().await;
    assert_eq!(h.server.calls().len(), 2);

    assert_eq!(events.recv().await.unwrap(), SyncEvent::SyncStarted);
    assert!(matches!(
        events.recv().await.unwrap(),
        SyncEvent::OperationFailed { .. }
    ));

    assert_eq!(h.engine.retry_failed_operations().await.unwrap(), 1);
    let report = h.sync().await;
    assert_eq!(report.synced, 1);
    assert_eq!(h.server.entities_of(EntityType::Task).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_failure_blocks_only_its_entity() {
    let h = Harness::new().await;
    h.seed_both(&entity(EntityType::Visit, "v1", 1, json!({"status": "scheduled"})))
        .await;
    h.seed_both(&entity(EntityType::Visit, "v2", 1, json!({"status": "scheduled"})))
        .await;

    let mut first = PendingOperation::update(
        EntityType::Visit,
        EntityId::from("v1"),
        fields(json!({"status": "bogus"})),
        Some(1),
    );
    first.created_at = 1;
    let mut second = PendingOperation::update(
        EntityType::Visit,
        EntityId::from("v2"),
        fields(json!({"status": "started"})),
        Some(1),
    );
    second.created_at = 2;
    h.queue.enqueue(first.clone()).await.unwrap();
    h.queue.enqueue(second).await.unwrap();
    h.server.fail_next(RemoteError::Permanent {
        status: 422,
        message: "invalid status".to_string(),
    });

    let report = h.sync().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.synced, 1);

    let failed = h.queue.get(&first.id).await.unwrap().unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.retry_count, 0);
    assert!(failed.last_error.unwrap().contains("invalid status"));

    // A later change to the failed entity waits behind it.
    h.recorder
        .update(EntityType::Visit, &EntityId::from("v1"), fields(json!({"notes": "x"})))
        .await
        .unwrap();
    let calls_before = h.server.calls().len();
    h.sync().await;
    assert_eq!(h.server.calls().len(), calls_before);
}

#[tokio::test(flavor = "multi_thread")]
async fn field_level_merge_appends_offline_note() {
    let h = Harness::new().await;
    let local = entity(
        EntityType::Note,
        "n1",
        1,
        json!({"content": "called patient", "updatedAt": 1_000}),
    );
    h.store.put_entity(&local).await.unwrap();
    h.server.seed(&entity(
        EntityType::Note,
        "n1",
        2,
        json!({"content": "called patient, left voicemail", "updatedAt": 2_000}),
    ));
    h.queue
        .enqueue(PendingOperation::update(
            EntityType::Note,
            local.id.clone(),
            fields(json!({"content": "called patient", "updatedAt": 1_000})),
            Some(1),
        ))
        .await
        .unwrap();

    let report = h.sync().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.synced, 1);

    let expected = format!("called patient, left voicemail{ADDENDUM_SEPARATOR}called patient");
    let server = h.server.entity(EntityType::Note, "n1").unwrap();
    assert_eq!(server.version, 3);
    assert_eq!(server.field("content"), Some(&json!(expected)));

    let cached = h
        .store
        .get_entity(EntityType::Note, &local.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.field("content"), Some(&json!(expected)));
    assert_eq!(cached.version, 3);

    let conflicts = h.store.list_conflicts(true).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].status, ConflictStatus::Resolved);
    assert_eq!(conflicts[0].resolution.as_deref(), Some("field-level-merge"));
    assert_eq!(conflicts[0].local_version, Some(1));
    assert_eq!(conflicts[0].server_version, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_duplicate_keeps_both_records() {
    let h = Harness::new().await;
    let local = entity(EntityType::CheckIn, "c1", 1, json!({"mood": "calm", "note": "same"}));
    h.store.put_entity(&local).await.unwrap();
    h.server.seed(&entity(
        EntityType::CheckIn,
        "c1",
        2,
        json!({"mood": "calm", "note": "same"}),
    ));
    h.queue
        .enqueue(PendingOperation::update(
            EntityType::CheckIn,
            local.id.clone(),
            fields(json!({"mood": "calm", "note": "same"})),
            Some(1),
        ))
        .await
        .unwrap();

    let report = h.sync().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.synced, 1);
    assert_eq!(h.queue.size().await.unwrap(), 0);

    let on_server = h.server.entities_of(EntityType::CheckIn);
    assert_eq!(on_server.len(), 2);
    let original = h.server.entity(EntityType::CheckIn, "c1").unwrap();
    assert_eq!(original.version, 2);
    let copy = on_server.iter().find(|entity| entity.id.as_str() != "c1").unwrap();
    assert_eq!(copy.field(DUPLICATE_FLAG_FIELD), Some(&json!(true)));
    assert_eq!(copy.field(DUPLICATE_OF_FIELD), Some(&json!("c1")));

    let cached = h.store.list_entities(EntityType::CheckIn).await.unwrap();
    assert_eq!(cached.len(), 2);
    assert!(cached.iter().all(|entity| !entity.id.is_temporary()));
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_conflict_blocks_entity_until_resolved() {
    let h = Harness::new().await;
    let local = entity(EntityType::CarePlan, "p1", 1, json!({"goal": "walk daily"}));
    h.store.put_entity(&local).await.unwrap();
    h.server.seed(&entity(EntityType::CarePlan, "p1", 2, json!({"goal": "rest"})));
    h.seed_both(&entity(EntityType::Task, "t1", 1, json!({"done": false})))
        .await;

    h.recorder
        .update(EntityType::CarePlan, &local.id, fields(json!({"goal": "walk twice daily"})))
        .await
        .unwrap();
    h.recorder
        .update(EntityType::Task, &EntityId::from("t1"), fields(json!({"done": true})))
        .await
        .unwrap();
    let mut events = h.engine.status().events();

    let report = h.sync().await;
    assert_eq!(report.deferred, 1);
    assert_eq!(report.synced, 1);

    let pending = h.engine.pending_conflicts().await.unwrap();
    assert_eq!(pending.len(), 1);
    let conflict = &pending[0];
    let provisional = h
        .store
        .get_entity(EntityType::CarePlan, &local.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(provisional.field("goal"), Some(&json!("rest")));
    assert_eq!(provisional.conflict_id, Some(conflict.id.to_string()));
    assert_eq!(h.engine.status().snapshot().conflict_count, 1);

    assert_eq!(events.recv().await.unwrap(), SyncEvent::SyncStarted);
    assert!(matches!(
        events.recv().await.unwrap(),
        SyncEvent::ConflictDetected {
            strategy: ResolutionStrategy::Manual,
            ..
        }
    ));

    // Nothing more goes out for the conflicted entity.
    let calls_before = h.server.calls().len();
    h.sync().await;
    assert_eq!(h.server.calls().len(), calls_before);

    let resolved = h
        .engine
        .resolve_conflict_manually(&conflict.id, ManualChoice::UseClient)
        .await
        .unwrap();
    assert_eq!(resolved.resolution.as_deref(), Some("manual:use-client"));
    assert_eq!(h.engine.status().snapshot().conflict_count, 0);

    let report = h.sync().await;
    assert_eq!(report.synced, 1);
    let server = h.server.entity(EntityType::CarePlan, "p1").unwrap();
    assert_eq!(server.field("goal"), Some(&json!("walk twice daily")));
    assert_eq!(server.version, 3);

    let again = h
        .engine
        .resolve_conflict_manually(&conflict.id, ManualChoice::UseServer)
        .await
        .unwrap_err();
    assert!(matches!(again, Error::InvalidInput(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_use_server_drops_local_change() {
    let h = Harness::new().await;
    let local = entity(EntityType::CarePlan, "p1", 1, json!({"goal": "walk daily"}));
    h.store.put_entity(&local).await.unwrap();
    h.server.seed(&entity(EntityType::CarePlan, "p1", 2, json!({"goal": "rest"})));
    h.recorder
        .update(EntityType::CarePlan, &local.id, fields(json!({"goal": "swim"})))
        .await
        .unwrap();
    h.sync().await;

    let conflict = h.engine.pending_conflicts().await.unwrap().remove(0);
    h.engine
        .resolve_conflict_manually(&conflict.id, ManualChoice::UseServer)
        .await
        .unwrap();

    assert_eq!(h.queue.size().await.unwrap(), 0);
    assert_eq!(h.queue.counts().await.unwrap().conflicted, 0);
    let cached = h
        .store
        .get_entity(EntityType::CarePlan, &local.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.field("goal"), Some(&json!("rest")));
    assert!(cached.conflict_id.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_merge_pushes_custom_fields() {
    let h = Harness::new().await;
    let local = entity(EntityType::CarePlan, "p1", 1, json!({"goal": "walk"}));
    h.store.put_entity(&local).await.unwrap();
    h.server.seed(&entity(EntityType::CarePlan, "p1", 2, json!({"goal": "rest"})));
    h.recorder
        .update(EntityType::CarePlan, &local.id, fields(json!({"goal": "swim"})))
        .await
        .unwrap();
    h.sync().await;

    let conflict = h.engine.pending_conflicts().await.unwrap().remove(0);
    h.engine
        .resolve_conflict_manually(
            &conflict.id,
            ManualChoice::Merge(fields(json!({"goal": "rest, then swim"}))),
        )
        .await
        .unwrap();
    h.sync().await;

    let server = h.server.entity(EntityType::CarePlan, "p1").unwrap();
    assert_eq!(server.field("goal"), Some(&json!("rest, then swim")));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_delete_restores_server_copy() {
    let h = Harness::new().await;
    h.store
        .put_entity(&entity(EntityType::Visit, "v1", 1, json!({"status": "scheduled"})))
        .await
        .unwrap();
    h.server
        .seed(&entity(EntityType::Visit, "v1", 2, json!({"status": "started"})));

    h.recorder
        .delete(EntityType::Visit, &EntityId::from("v1"))
        .await
        .unwrap();
    let report = h.sync().await;
    assert_eq!(report.conflicts, 1);

    let restored = h
        .store
        .get_entity(EntityType::Visit, &EntityId::from("v1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.version, 2);
    assert_eq!(restored.field("status"), Some(&json!("started")));
    assert!(h.queue.list().await.unwrap().is_empty());
    assert!(h.server.entity(EntityType::Visit, "v1").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn client_wins_reissues_rejected_delete() {
    let resolver =
        ConflictResolver::new().with_strategy(EntityType::Task, ResolutionStrategy::ClientWins);
    let h = Harness::with(SyncConfig::default(), resolver).await;
    h.store
        .put_entity(&entity(EntityType::Task, "t1", 1, json!({"done": false})))
        .await
        .unwrap();
    h.server
        .seed(&entity(EntityType::Task, "t1", 2, json!({"done": true})));

    h.recorder
        .delete(EntityType::Task, &EntityId::from("t1"))
        .await
        .unwrap();
    let report = h.sync().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.synced, 1);
    assert!(h.server.entity(EntityType::Task, "t1").is_none());
    assert!(h
        .store
        .get_entity(EntityType::Task, &EntityId::from("t1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn server_push_refreshes_cache_without_local_changes() {
    let h = Harness::new().await;
    h.seed_both(&entity(EntityType::Visit, "v1", 1, json!({"status": "scheduled"})))
        .await;

    let pushed = entity(EntityType::Visit, "v1", 2, json!({"status": "started"}));
    let outcome = h.engine.handle_server_push(pushed.clone()).await.unwrap();
    assert_eq!(outcome, PushOutcome::Applied);
    assert_eq!(
        h.store
            .get_entity(EntityType::Visit, &pushed.id)
            .await
            .unwrap(),
        Some(pushed.clone())
    );

    let stale = entity(EntityType::Visit, "v1", 1, json!({"status": "scheduled"}));
    assert_eq!(
        h.engine.handle_server_push(stale).await.unwrap(),
        PushOutcome::Ignored
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn server_push_takes_conflict_path_for_pending_change() {
    let h = Harness::new().await;
    h.seed_both(&entity(
        EntityType::Visit,
        "v1",
        1,
        json!({"status": "scheduled", "notes": "gate code 12"}),
    ))
    .await;
    h.monitor.set_link_up(false);
    h.recorder
        .update(EntityType::Visit, &EntityId::from("v1"), fields(json!({"notes": "dog in yard"})))
        .await
        .unwrap();

    let pushed = entity(
        EntityType::Visit,
        "v1",
        2,
        json!({"status": "scheduled", "notes": "gate code 34"}),
    );
    let outcome = h.engine.handle_server_push(pushed).await.unwrap();
    assert_eq!(outcome, PushOutcome::Conflicted);

    let queued = h.queue.list().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].base_version, Some(2));
    assert_eq!(
        queued[0].payload["notes"],
        json!(format!("gate code 34{ADDENDUM_SEPARATOR}dog in yard"))
    );
    assert!(h.server.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_syncs_on_reconnect() {
    let h = Harness::new().await;
    h.monitor.set_link_up(false);
    h.recorder
        .create(EntityType::Note, fields(json!({"content": "offline"})))
        .await
        .unwrap();

    let scheduler = spawn_sync_scheduler(Arc::clone(&h.engine), Duration::ZERO);
    let mut status = h.engine.status().watch();

    h.monitor.set_link_up(true);
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|snapshot: &SyncStatusSnapshot| snapshot.last_sync_time.is_some()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(h.server.entities_of(EntityType::Note).len(), 1);
    assert_eq!(h.engine.status().snapshot().pending_operations_count, 0);
    assert!(h.engine.status().snapshot().is_online);
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_runs_on_demand_trigger() {
    let h = Harness::new().await;
    h.monitor.set_link_up(false);
    let scheduler = spawn_sync_scheduler(Arc::clone(&h.engine), Duration::ZERO);
    h.monitor.set_link_up(true);

    let mut status = h.engine.status().watch();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|snapshot: &SyncStatusSnapshot| snapshot.last_sync_time.is_some()),
    )
    .await
    .unwrap()
    .unwrap();

    h.recorder
        .create(EntityType::Task, fields(json!({"title": "Refill"})))
        .await
        .unwrap();
    assert!(scheduler.trigger(SyncTrigger::Now).await);
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.server.entities_of(EntityType::Task).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    scheduler.shutdown().await;
}

/// Cache row that no longer parses as an entity
#[derive(serde::Serialize, serde::Deserialize)]
struct UnreadableRow {
    id: String,
    version: String,
}

impl crate::db::Record for UnreadableRow {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_cache_row_holds_back_only_its_entity() {
    let h = Harness::new().await;
    h.seed_both(&entity(EntityType::Visit, "v1", 1, json!({"status": "scheduled"})))
        .await;
    h.seed_both(&entity(EntityType::Visit, "v2", 1, json!({"status": "scheduled"})))
        .await;
    h.server
        .seed(&entity(EntityType::Visit, "v1", 2, json!({"status": "cancelled"})));
    h.store
        .put(
            Collection::Entities(EntityType::Visit),
            &UnreadableRow {
                id: "v1".to_string(),
                version: "two".to_string(),
            },
        )
        .await
        .unwrap();

    let stuck = PendingOperation::update(
        EntityType::Visit,
        EntityId::from("v1"),
        fields(json!({"status": "started"})),
        Some(1),
    );
    h.queue.enqueue(stuck.clone()).await.unwrap();
    h.queue
        .enqueue(PendingOperation::update(
            EntityType::Visit,
            EntityId::from("v2"),
            fields(json!({"status": "started"})),
            Some(1),
        ))
        .await
        .unwrap();

    let report = h.sync().await;
    assert_eq!(report.synced, 1);
    assert_eq!(
        h.server.entity(EntityType::Visit, "v2").unwrap().field("status"),
        Some(&json!("started"))
    );

    let left = h.queue.get(&stuck.id).await.unwrap().unwrap();
    assert_eq!(left.status, OperationStatus::Pending);
    assert_eq!(left.retry_count, 0);
    let v1_calls = h
        .server
        .calls()
        .iter()
        .filter(|call| call.starts_with("update") && call.ends_with("/v1"))
        .count();
    assert_eq!(v1_calls, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_retries_when_backoff_expires() {
    let config = SyncConfig {
        backoff_base_ms: 10,
        ..SyncConfig::default()
    };
    let h = Harness::with(config, ConflictResolver::new()).await;
    h.server
        .fail_next(RemoteError::Transient("HTTP 503".to_string()));
    h.recorder
        .create(EntityType::Note, fields(json!({"content": "retry me"})))
        .await
        .unwrap();

    // No periodic timer: only the backoff deadline can bring the retry.
    let scheduler = spawn_sync_scheduler(Arc::clone(&h.engine), Duration::ZERO);
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.queue.size().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(h.server.calls().len(), 2);
    assert_eq!(h.server.entities_of(EntityType::Note).len(), 1);
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_cycle_prunes_expired_conflicts() {
    let h = Harness::new().await;
    let server = entity(EntityType::Note, "n1", 2, json!({"content": "server"}));

    let mut expired = Conflict::new(None, None, &server, Some(1));
    expired.resolve("server-wins");
    expired.resolved_at = Some(1);
    let mut recent = Conflict::new(None, None, &server, Some(1));
    recent.resolve("server-wins");
    let open = Conflict::new(None, None, &server, Some(1));
    for conflict in [&expired, &recent, &open] {
        h.store.put_conflict(conflict).await.unwrap();
    }

    h.sync().await;

    let kept: HashSet<ConflictId> = h
        .store
        .list_conflicts(true)
        .await
        .unwrap()
        .iter()
        .map(|conflict| conflict.id)
        .collect();
    assert_eq!(kept, HashSet::from([recent.id, open.id]));
}

#[tokio::test(flavor = "multi_thread")]
async fn recover_reverts_operations_left_syncing() {
    let h = Harness::new().await;
    h.recorder
        .create(EntityType::Note, fields(json!({"content": "x"})))
        .await
        .unwrap();
    h.queue.dequeue_next_batch(10).await.unwrap();

    assert_eq!(h.engine.recover().await.unwrap(), 1);
    assert_eq!(h.queue.counts().await.unwrap().pending, 1);
}
