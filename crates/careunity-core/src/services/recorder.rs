//! Records user edits: updates the local cache and queues the change.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{Entity, EntityId, EntityType, PendingOperation, UPDATED_AT_FIELD};
use crate::queue::{EnqueueOutcome, OperationQueue};
use crate::services::LocalStore;
use crate::util::unix_millis_now;

const STATUS_FIELD: &str = "status";
const STATUS_UPDATED_AT_FIELD: &str = "statusUpdatedAt";

/// Entry point for local mutations, online or offline.
#[derive(Clone)]
pub struct ChangeRecorder {
    store: LocalStore,
    queue: OperationQueue,
}

impl ChangeRecorder {
    pub const fn new(store: LocalStore, queue: OperationQueue) -> Self {
        Self { store, queue }
    }

    /// Create an entity under a temporary id and queue its creation.
    pub async fn create(&self, entity_type: EntityType, fields: Map<String, Value>) -> Result<Entity> {
        let mut fields = fields;
        stamp(&mut fields);

        let entity = Entity::new(entity_type, EntityId::temporary(), 0, fields);
        self.store.put_entity(&entity).await?;
        self.queue
            .enqueue(PendingOperation::create(
                entity_type,
                entity.id.clone(),
                entity.fields.clone(),
            ))
            .await?;

        tracing::debug!("Recorded new {}", entity.key());
        Ok(entity)
    }

    /// Apply a field delta to a cached entity and queue it.
    pub async fn update(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        delta: Map<String, Value>,
    ) -> Result<Entity> {
        let mut entity = self
            .store
            .get_entity(entity_type, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {id}")))?;

        let mut delta = delta;
        for key in ["id", "type", "version", "_conflictId"] {
            delta.remove(key);
        }
        if delta.is_empty() {
            return Err(Error::InvalidInput("update carries no fields".to_string()));
        }
        stamp(&mut delta);

        entity.apply_payload(&delta);
        self.store.put_entity(&entity).await?;
        self.queue
            .enqueue(PendingOperation::update(
                entity_type,
                id.clone(),
                delta,
                Some(entity.version),
            ))
            .await?;

        tracing::debug!("Recorded update to {}", entity.key());
        Ok(entity)
    }

    /// Remove a cached entity and queue its deletion.
    pub async fn delete(&self, entity_type: EntityType, id: &EntityId) -> Result<EnqueueOutcome> {
        let cached = self.store.get_entity(entity_type, id).await?;
        self.store.delete_entity(entity_type, id).await?;

        let base_version = cached.map(|entity| entity.version);
        let outcome = self
            .queue
            .enqueue(PendingOperation::delete(entity_type, id.clone(), base_version))
            .await?;

        tracing::debug!("Recorded delete of {entity_type}/{id}");
        Ok(outcome)
    }
}

/// Set `updatedAt`, and `statusUpdatedAt` when the status changes
fn stamp(fields: &mut Map<String, Value>) {
    let now = Value::from(unix_millis_now());
    if fields.contains_key(STATUS_FIELD) && !fields.contains_key(STATUS_UPDATED_AT_FIELD) {
        fields.insert(STATUS_UPDATED_AT_FIELD.to_string(), now.clone());
    }
    fields.insert(UPDATED_AT_FIELD.to_string(), now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::models::OperationAction;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn recorder() -> (ChangeRecorder, LocalStore, OperationQueue) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let queue = OperationQueue::new(store.clone(), &SyncConfig::default());
        (ChangeRecorder::new(store.clone(), queue.clone()), store, queue)
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_caches_and_queues_under_temporary_id() {
        let (recorder, store, queue) = recorder().await;

        let visit = recorder
            .create(EntityType::Visit, fields(json!({"status": "scheduled"})))
            .await
            .unwrap();

        assert!(visit.id.is_temporary());
        assert!(visit.updated_at().is_some());
        assert!(visit.field("statusUpdatedAt").is_some());
        assert_eq!(
            store.get_entity(EntityType::Visit, &visit.id).await.unwrap(),
            Some(visit.clone())
        );

        let queued = queue.list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, OperationAction::Create);
        assert_eq!(queued[0].entity_id, visit.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_applies_delta_with_base_version() {
        let (recorder, store, queue) = recorder().await;
        let cached = Entity::new(
            EntityType::Task,
            EntityId::from("t1"),
            4,
            fields(json!({"title": "Order supplies", "done": false})),
        );
        store.put_entity(&cached).await.unwrap();

        let updated = recorder
            .update(EntityType::Task, &cached.id, fields(json!({"done": true, "version": 99})))
            .await
            .unwrap();

        assert_eq!(updated.version, 4);
        assert_eq!(updated.field("done"), Some(&json!(true)));
        let queued = queue.list().await.unwrap();
        assert_eq!(queued[0].base_version, Some(4));
        assert!(!queued[0].payload.contains_key("version"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_of_unknown_entity_is_not_found() {
        let (recorder, _, _) = recorder().await;
        let error = recorder
            .update(EntityType::Task, &EntityId::from("nope"), fields(json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_of_unsynced_entity_leaves_nothing_queued() {
        let (recorder, store, queue) = recorder().await;
        let note = recorder
            .create(EntityType::Note, fields(json!({"content": "draft"})))
            .await
            .unwrap();

        let outcome = recorder.delete(EntityType::Note, &note.id).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Cancelled { .. }));
        assert!(queue.list().await.unwrap().is_empty());
        assert!(store.list_entities(EntityType::Note).await.unwrap().is_empty());
    }
}
