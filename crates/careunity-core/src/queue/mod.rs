//! Operation queue
//!
//! Ordered log of mutations the server has not confirmed yet, persisted in
//! the `pendingOperations` collection. Operations on one entity leave the
//! queue strictly in creation order; operations on different entities are
//! independent.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::db::{Collection, WriteBatch};
use crate::error::{Error, Result};
use crate::models::{
    ConflictId, EntityId, EntityKey, EntityType, OperationAction, OperationId, OperationStatus,
    PendingOperation,
};
use crate::services::LocalStore;
use crate::util::{replace_json_string, unix_millis_now};

/// How an operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network or timeout; retried with backoff
    Transient,
    /// Validation or other rejection; never retried automatically
    Permanent,
}

/// What `enqueue` did with a new operation
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Appended as a new queue entry
    Queued(PendingOperation),
    /// Folded into an existing pending entry for the same entity
    Coalesced(PendingOperation),
    /// A delete met a never-synced create; both are gone
    Cancelled { operation_id: OperationId },
}

impl EnqueueOutcome {
    /// The operation left in the queue, if any
    pub const fn operation(&self) -> Option<&PendingOperation> {
        match self {
            Self::Queued(operation) | Self::Coalesced(operation) => Some(operation),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Per-status operation counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub syncing: usize,
    pub conflicted: usize,
    pub failed: usize,
}

/// Retry threshold and backoff curve
#[derive(Debug, Clone)]
struct RetryPolicy {
    max_retries: u32,
    config: SyncConfig,
}

/// Persistent queue of pending operations.
#[derive(Clone)]
pub struct OperationQueue {
    store: LocalStore,
    policy: Arc<RetryPolicy>,
    // Serializes read-modify-write sequences across clones.
    guard: Arc<Mutex<()>>,
}

impl OperationQueue {
    pub fn new(store: LocalStore, config: &SyncConfig) -> Self {
        Self {
            store,
            policy: Arc::new(RetryPolicy {
                max_retries: config.max_retries,
                config: config.clone(),
            }),
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Add an operation, coalescing with a pending one for the same entity.
    ///
    /// * `update` after a pending `create`/`update` merges field-by-field.
    /// * `delete` after a pending `update` replaces it.
    /// * `delete` after a pending `create` cancels both.
    pub async fn enqueue(&self, operation: PendingOperation) -> Result<EnqueueOutcome> {
        let _guard = self.guard.lock().await;

        let existing = self
            .entity_operations(operation.entity_type, &operation.entity_id)
            .await?
            .into_iter()
            .filter(|queued| queued.status == OperationStatus::Pending)
            .last();

        let Some(mut existing) = existing else {
            self.store
                .put(Collection::PendingOperations, &operation)
                .await?;
            tracing::debug!(
                "Queued {} for {}",
                operation.action,
                operation.entity_key()
            );
            return Ok(EnqueueOutcome::Queued(operation));
        };

        match (existing.action, operation.action) {
            (OperationAction::Create | OperationAction::Update, OperationAction::Update) => {
                merge_payload(&mut existing.payload, &operation.payload);
                self.store
                    .put(Collection::PendingOperations, &existing)
                    .await?;
                tracing::debug!("Coalesced update into queued {} for {}", existing.action, existing.entity_key());
                Ok(EnqueueOutcome::Coalesced(existing))
            }
            (OperationAction::Create, OperationAction::Delete) => {
                self.store
                    .delete(Collection::PendingOperations, &existing.id.as_str())
                    .await?;
                tracing::debug!(
                    "Delete cancelled never-synced create for {}",
                    existing.entity_key()
                );
                Ok(EnqueueOutcome::Cancelled {
                    operation_id: existing.id,
                })
            }
            (OperationAction::Update, OperationAction::Delete) => {
                existing.action = OperationAction::Delete;
                existing.payload = Map::new();
                self.store
                    .put(Collection::PendingOperations, &existing)
                    .await?;
                tracing::debug!("Delete replaced queued update for {}", existing.entity_key());
                Ok(EnqueueOutcome::Coalesced(existing))
            }
            _ => {
                self.store
                    .put(Collection::PendingOperations, &operation)
                    .await?;
                Ok(EnqueueOutcome::Queued(operation))
            }
        }
    }

    /// Take up to `max` due operations oldest-first and mark them `syncing`.
    pub async fn dequeue_next_batch(&self, max: usize) -> Result<Vec<PendingOperation>> {
        self.dequeue_batch_excluding(max, &HashSet::new()).await
    }

    /// Like [`Self::dequeue_next_batch`] but never picks the given entities.
    ///
    /// At most one operation per entity is handed out, and none while an
    /// earlier operation on that entity is in flight, conflicted or failed.
    pub async fn dequeue_batch_excluding(
        &self,
        max: usize,
        excluded: &HashSet<EntityKey>,
    ) -> Result<Vec<PendingOperation>> {
        let _guard = self.guard.lock().await;
        let now = unix_millis_now();

        let mut blocked: HashSet<EntityKey> = HashSet::new();
        let mut batch = Vec::new();

        for mut operation in self.sorted_operations().await? {
            if batch.len() >= max {
                break;
            }

            let key = operation.entity_key();
            if blocked.contains(&key) {
                continue;
            }
            blocked.insert(key.clone());

            if operation.status.blocks_entity()
                || excluded.contains(&key)
                || !operation.is_due(now)
            {
                continue;
            }

            operation.status = OperationStatus::Syncing;
            batch.push(operation);
        }

        let mut writes = WriteBatch::new();
        for operation in &batch {
            writes.put(Collection::PendingOperations, operation)?;
        }
        self.store.apply(writes).await?;

        Ok(batch)
    }

    /// Confirmed by the server: drop from the queue.
    pub async fn mark_synced(&self, operation_id: &OperationId) -> Result<()> {
        let _guard = self.guard.lock().await;
        self.store
            .delete(Collection::PendingOperations, &operation_id.as_str())
            .await?;
        Ok(())
    }

    /// Record a failure.
    ///
    /// Transient failures return the operation to `pending` behind an
    /// exponential backoff until `retryCount` exceeds the threshold, after
    /// which it is terminally `failed`. Permanent failures are terminal at once.
    pub async fn mark_failed(
        &self,
        operation_id: &OperationId,
        error: &str,
        kind: FailureKind,
    ) -> Result<PendingOperation> {
        let _guard = self.guard.lock().await;
        let mut operation = self.require(operation_id).await?;

        operation.last_error = Some(error.to_string());
        match kind {
            FailureKind::Transient => {
                operation.retry_count = operation.retry_count.saturating_add(1);
                if operation.retry_count > self.policy.max_retries {
                    operation.status = OperationStatus::Failed;
                    operation.next_attempt_at = None;
                    tracing::error!(
                        "Giving up on {} {} after {} attempts: {}",
                        operation.action,
                        operation.entity_key(),
                        operation.retry_count,
                        error
                    );
                } else {
                    let delay = self.policy.config.backoff_delay(operation.retry_count);
                    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                    operation.status = OperationStatus::Pending;
                    operation.next_attempt_at = Some(unix_millis_now().saturating_add(delay_ms));
                    tracing::warn!(
                        "Retrying {} {} in {:?} (attempt {}): {}",
                        operation.action,
                        operation.entity_key(),
                        delay,
                        operation.retry_count,
                        error
                    );
                }
            }
            FailureKind::Permanent => {
                operation.status = OperationStatus::Failed;
                operation.next_attempt_at = None;
                tracing::error!(
                    "{} {} rejected permanently: {}",
                    operation.action,
                    operation.entity_key(),
                    error
                );
            }
        }

        self.store
            .put(Collection::PendingOperations, &operation)
            .await?;
        Ok(operation)
    }

    /// Park an operation behind a conflict awaiting manual resolution.
    pub async fn mark_conflicted(
        &self,
        operation_id: &OperationId,
        conflict_id: ConflictId,
    ) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut operation = self.require(operation_id).await?;
        operation.status = OperationStatus::Conflicted;
        operation.conflict_id = Some(conflict_id);
        self.store
            .put(Collection::PendingOperations, &operation)
            .await
    }

    /// Rewrite an operation's payload after a resolution and make it due again.
    pub async fn requeue_with_payload(
        &self,
        operation_id: &OperationId,
        action: OperationAction,
        payload: Map<String, Value>,
        base_version: Option<i64>,
    ) -> Result<PendingOperation> {
        let _guard = self.guard.lock().await;
        let mut operation = self.require(operation_id).await?;
        operation.action = action;
        operation.payload = payload;
        operation.base_version = base_version;
        operation.status = OperationStatus::Pending;
        operation.conflict_id = None;
        operation.next_attempt_at = None;
        self.store
            .put(Collection::PendingOperations, &operation)
            .await?;
        Ok(operation)
    }

    /// Return one in-flight operation to `pending` without counting a retry.
    pub async fn release(&self, operation_id: &OperationId) -> Result<()> {
        let _guard = self.guard.lock().await;
        if let Some(mut operation) = self.find(operation_id).await? {
            if operation.status == OperationStatus::Syncing {
                operation.status = OperationStatus::Pending;
                self.store
                    .put(Collection::PendingOperations, &operation)
                    .await?;
            }
        }
        Ok(())
    }

    /// Return every `syncing` operation to `pending`.
    pub async fn revert_syncing(&self) -> Result<usize> {
        let _guard = self.guard.lock().await;
        let syncing = self.with_status(OperationStatus::Syncing).await?;

        let mut writes = WriteBatch::new();
        for mut operation in syncing {
            operation.status = OperationStatus::Pending;
            writes.put(Collection::PendingOperations, &operation)?;
        }
        let reverted = writes.len();
        self.store.apply(writes).await?;

        if reverted > 0 {
            tracing::info!("Reverted {reverted} in-flight operations to pending");
        }
        Ok(reverted)
    }

    /// Replace a temporary id with the server-assigned one across the queue.
    ///
    /// Rewrites the target of operations on that entity and every payload
    /// value equal to the temporary id (references from other entities).
    pub async fn remap_entity_id(
        &self,
        entity_type: EntityType,
        from: &EntityId,
        to: &EntityId,
    ) -> Result<usize> {
        let _guard = self.guard.lock().await;
        let mut writes = WriteBatch::new();
        let remapped = self
            .remap_writes(entity_type, from, to, &mut writes)
            .await?;
        self.store.apply(writes).await?;
        Ok(remapped)
    }

    /// Remove a finished operation together with `cache_writes` in one
    /// transaction.
    ///
    /// `overlay` sees the operations still queued behind this one for the
    /// same entity, read under the queue guard, and adds the writes that
    /// depend on them. When the server assigned a different id (`from` !=
    /// `to`) the id is remapped across the queue in the same transaction, so
    /// a crash cannot leave the queue and the cache disagreeing about the
    /// entity's id.
    pub async fn settle<F>(
        &self,
        operation_id: &OperationId,
        entity_type: EntityType,
        from: &EntityId,
        to: &EntityId,
        mut cache_writes: WriteBatch,
        overlay: F,
    ) -> Result<usize>
    where
        F: FnOnce(&[PendingOperation], &mut WriteBatch) -> Result<()>,
    {
        let _guard = self.guard.lock().await;
        let mut later = self.entity_operations(entity_type, from).await?;
        later.retain(|queued| queued.id != *operation_id);
        overlay(&later, &mut cache_writes)?;

        let remapped = if from == to {
            0
        } else {
            self.remap_writes(entity_type, from, to, &mut cache_writes)
                .await?
        };
        cache_writes.delete(Collection::PendingOperations, operation_id.as_str());
        self.store.apply(cache_writes).await?;
        Ok(remapped)
    }

    async fn remap_writes(
        &self,
        entity_type: EntityType,
        from: &EntityId,
        to: &EntityId,
        writes: &mut WriteBatch,
    ) -> Result<usize> {
        let mut remapped = 0;
        for mut operation in self.sorted_operations().await? {
            let mut changed = false;
            if operation.entity_type == entity_type && operation.entity_id == *from {
                operation.entity_id = to.clone();
                changed = true;
            }
            for value in operation.payload.values_mut() {
                changed |= replace_json_string(value, from.as_str(), to.as_str());
            }
            if changed {
                writes.put(Collection::PendingOperations, &operation)?;
                remapped += 1;
            }
        }

        if remapped > 0 {
            tracing::debug!("Remapped {from} -> {to} in {remapped} queued operations");
        }
        Ok(remapped)
    }

    /// Point queued changes to an entity at its newest confirmed version.
    pub async fn rebase_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        version: i64,
    ) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut writes = WriteBatch::new();
        for mut operation in self.entity_operations(entity_type, entity_id).await? {
            if matches!(
                operation.status,
                OperationStatus::Pending | OperationStatus::Failed
            ) {
                operation.base_version = Some(version);
                writes.put(Collection::PendingOperations, &operation)?;
            }
        }
        self.store.apply(writes).await
    }

    /// Put terminally failed operations back in line with a fresh retry budget.
    pub async fn retry_failed(&self) -> Result<usize> {
        let _guard = self.guard.lock().await;
        let failed = self.with_status(OperationStatus::Failed).await?;

        let mut writes = WriteBatch::new();
        for mut operation in failed {
            operation.status = OperationStatus::Pending;
            operation.retry_count = 0;
            operation.next_attempt_at = None;
            operation.last_error = None;
            writes.put(Collection::PendingOperations, &operation)?;
        }
        let retried = writes.len();
        self.store.apply(writes).await?;
        Ok(retried)
    }

    /// Drop an operation regardless of state.
    pub async fn discard(&self, operation_id: &OperationId) -> Result<bool> {
        let _guard = self.guard.lock().await;
        self.store
            .delete(Collection::PendingOperations, &operation_id.as_str())
            .await
    }

    /// Operation by id.
    pub async fn get(&self, operation_id: &OperationId) -> Result<Option<PendingOperation>> {
        self.find(operation_id).await
    }

    /// Every queued operation in creation order.
    pub async fn list(&self) -> Result<Vec<PendingOperation>> {
        self.sorted_operations().await
    }

    /// Queued operations targeting one entity, in creation order.
    pub async fn operations_for(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Vec<PendingOperation>> {
        self.entity_operations(entity_type, entity_id).await
    }

    /// Count of `pending` plus `syncing` operations.
    pub async fn size(&self) -> Result<usize> {
        let counts = self.counts().await?;
        Ok(counts.pending + counts.syncing)
    }

    /// Per-status counts.
    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for operation in self.sorted_operations().await? {
            match operation.status {
                OperationStatus::Pending => counts.pending += 1,
                OperationStatus::Syncing => counts.syncing += 1,
                OperationStatus::Conflicted => counts.conflicted += 1,
                OperationStatus::Failed => counts.failed += 1,
                OperationStatus::Synced => {}
            }
        }
        Ok(counts)
    }

    /// Earliest backoff deadline among operations a batch could take next:
    /// the first queued operation of each entity, when it is `pending`.
    pub async fn next_attempt_at(&self) -> Result<Option<i64>> {
        let mut heads: HashSet<EntityKey> = HashSet::new();
        Ok(self
            .sorted_operations()
            .await?
            .into_iter()
            .filter(|operation| heads.insert(operation.entity_key()))
            .filter(|operation| operation.status == OperationStatus::Pending)
            .filter_map(|operation| operation.next_attempt_at)
            .min())
    }

    async fn find(&self, operation_id: &OperationId) -> Result<Option<PendingOperation>> {
        self.store
            .get(Collection::PendingOperations, &operation_id.as_str())
            .await
    }

    async fn require(&self, operation_id: &OperationId) -> Result<PendingOperation> {
        self.find(operation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {operation_id}")))
    }

    async fn sorted_operations(&self) -> Result<Vec<PendingOperation>> {
        let mut operations: Vec<PendingOperation> =
            self.store.get_all(Collection::PendingOperations).await?;
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(operations)
    }

    async fn with_status(&self, status: OperationStatus) -> Result<Vec<PendingOperation>> {
        self.store
            .get_by_index(
                Collection::PendingOperations,
                "status",
                &Value::from(status.as_str()),
            )
            .await
    }

    async fn entity_operations(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Vec<PendingOperation>> {
        let mut operations: Vec<PendingOperation> = self
            .store
            .get_by_index(
                Collection::PendingOperations,
                "entityId",
                &Value::from(entity_id.as_str()),
            )
            .await?;
        operations.retain(|operation| operation.entity_type == entity_type);
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(operations)
    }
}

/// Field-level overwrite of `target` by `delta`
fn merge_payload(target: &mut Map<String, Value>, delta: &Map<String, Value>) {
    for (key, value) in delta {
        target.insert(key.clone(), value.clone());
    }
}
