//! Sync engine
//!
//! Drains the operation queue against the remote API while online. One
//! cycle runs at a time; a cycle stops cleanly when connectivity drops and
//! returns everything in flight to `pending`.
//!
//! Failures stay with their entity: a conflicted, failed or storage-broken
//! entity never holds up operations on other entities.

mod scheduler;
#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};

use crate::config::SyncConfig;
use crate::db::{Collection, WriteBatch};
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, Entity, EntityId, EntityKey, EntityType, OperationAction, OperationId,
    OperationStatus, PendingOperation,
};
use crate::network::NetworkState;
use crate::queue::{FailureKind, OperationQueue};
use crate::remote::{RemoteApi, RemoteError, RemoteResult};
use crate::resolver::{client_copy, ConflictResolver, ResolutionStrategy, ResolvedOutcome};
use crate::services::{ChangeRecorder, LocalStore};
use crate::status::{StatusSurface, SyncEvent, SyncReport, SyncState};
use crate::util::{replace_json_string, unix_millis_now};

pub use scheduler::{spawn_sync_scheduler, SchedulerHandle, SyncTrigger};

/// Conflicts one operation may hit in a single cycle before its entity is
/// left for the next cycle
const MAX_CONFLICT_ROUNDS: usize = 3;

/// Result of a sync trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle holds the engine; the trigger was ignored
    AlreadyRunning,
    /// Nothing attempted while offline
    Offline,
}

/// Decision submitted for a conflict awaiting manual resolution
#[derive(Debug, Clone, PartialEq)]
pub enum ManualChoice {
    /// Keep the device's copy and push it over the server's
    UseClient,
    /// Drop the device's change
    UseServer,
    /// Push caller-supplied fields
    Merge(Map<String, Value>),
}

impl ManualChoice {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UseClient => "use-client",
            Self::UseServer => "use-server",
            Self::Merge(_) => "merge",
        }
    }
}

/// What `handle_server_push` did with a pushed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Written to the cache
    Applied,
    /// Collided with a queued change and went through conflict resolution
    Conflicted,
    /// The entity waits on a conflict or failed change; cache left as is
    Deferred,
    /// Older than what the device already knows
    Ignored,
}

/// How one operation ended within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Synced,
    /// Conflict resolved in favor of the server copy (or a duplicate)
    Resolved,
    /// Conflict resolved into a new write that is queued again
    Rewritten,
    Deferred,
    Retried,
    Failed,
    Aborted,
}

/// Drives the queue to completion against a [`RemoteApi`].
pub struct SyncEngine<A> {
    store: LocalStore,
    queue: OperationQueue,
    resolver: ConflictResolver,
    remote: A,
    network: watch::Receiver<NetworkState>,
    config: SyncConfig,
    status: StatusSurface,
    cycle: Mutex<()>,
}

impl<A: RemoteApi> SyncEngine<A> {
    pub fn new(
        store: LocalStore,
        queue: OperationQueue,
        resolver: ConflictResolver,
        remote: A,
        network: watch::Receiver<NetworkState>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            queue,
            resolver,
            remote,
            network,
            config,
            status: StatusSurface::new(),
            cycle: Mutex::new(()),
        }
    }

    pub const fn status(&self) -> &StatusSurface {
        &self.status
    }

    pub const fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Recorder for local edits sharing this engine's store and queue.
    pub fn recorder(&self) -> ChangeRecorder {
        ChangeRecorder::new(self.store.clone(), self.queue.clone())
    }

    /// Fresh receiver of connectivity transitions.
    pub fn network(&self) -> watch::Receiver<NetworkState> {
        self.network.clone()
    }

    pub fn is_online(&self) -> bool {
        self.network.borrow().is_online()
    }

    /// Startup recovery: nothing may stay `syncing` from a previous run.
    pub async fn recover(&self) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        let reverted = self.queue.revert_syncing().await?;
        self.refresh_status().await?;
        Ok(reverted)
    }

    /// Recompute counts and connectivity on the status surface.
    pub async fn refresh_status(&self) -> Result<()> {
        let counts = self.queue.counts().await?;
        let conflicts = self.store.list_conflicts(false).await?.len();
        let online = self.is_online();
        self.status.update(|snapshot| {
            snapshot.pending_operations_count = counts.pending + counts.syncing;
            snapshot.error_operations_count = counts.failed;
            snapshot.conflict_count = conflicts;
            snapshot.is_online = online;
        });
        Ok(())
    }

    /// Conflicts waiting for a manual decision.
    pub async fn pending_conflicts(&self) -> Result<Vec<Conflict>> {
        self.store.list_conflicts(false).await
    }

    /// Drop resolved conflicts older than the configured retention.
    pub async fn prune_resolved_conflicts(&self) -> Result<usize> {
        let Some(retention) = self.config.conflict_retention_ms() else {
            return Ok(0);
        };
        self.store
            .prune_resolved_conflicts(unix_millis_now().saturating_sub(retention))
            .await
    }

    /// Give terminally failed operations another full retry budget.
    pub async fn retry_failed_operations(&self) -> Result<usize> {
        let retried = self.queue.retry_failed().await?;
        if retried > 0 {
            tracing::info!("Re-queued {retried} failed operations");
        }
        self.refresh_status().await?;
        Ok(retried)
    }

    /// Run one sync cycle unless one is already running or the device is offline.
    pub async fn sync_pending_operations(&self) -> Result<SyncOutcome> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            tracing::debug!("Sync already in progress; ignoring trigger");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        if !self.is_online() {
            self.refresh_status().await?;
            return Ok(SyncOutcome::Offline);
        }

        self.status.update(|snapshot| {
            snapshot.is_syncing = true;
            snapshot.sync_status = SyncState::Syncing;
        });
        self.status.emit(SyncEvent::SyncStarted);
        tracing::info!("Sync cycle started");

        let result = self.run_cycle().await;
        if matches!(&result, Ok(report) if !report.aborted) {
            if let Err(error) = self.prune_resolved_conflicts().await {
                tracing::warn!("Failed to prune resolved conflicts: {error}");
            }
        }
        if result.is_err() {
            if let Err(error) = self.queue.revert_syncing().await {
                tracing::error!("Failed to revert in-flight operations: {error}");
            }
        }
        if let Err(error) = self.refresh_status().await {
            tracing::warn!("Failed to refresh sync status: {error}");
        }

        match result {
            Ok(report) => {
                let finished_at = unix_millis_now();
                self.status.update(|snapshot| {
                    snapshot.is_syncing = false;
                    if report.aborted || report.failed > 0 {
                        snapshot.sync_status = SyncState::Error;
                    } else {
                        snapshot.sync_status = SyncState::Success;
                    }
                    if !report.aborted {
                        snapshot.last_sync_time = Some(finished_at);
                    }
                });

                if report.aborted {
                    self.status
                        .emit(SyncEvent::SyncFailed("connection lost during sync".to_string()));
                } else {
                    self.status.emit(SyncEvent::SyncCompleted(report));
                }
                tracing::info!(
                    "Sync cycle finished: {} synced, {} conflicts, {} deferred, {} retried, {} failed{}",
                    report.synced,
                    report.conflicts,
                    report.deferred,
                    report.retried,
                    report.failed,
                    if report.aborted { " (aborted)" } else { "" }
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(error) => {
                self.status.update(|snapshot| {
                    snapshot.is_syncing = false;
                    snapshot.sync_status = SyncState::Error;
                });
                self.status.emit(SyncEvent::SyncFailed(error.to_string()));
                tracing::error!("Sync cycle failed: {error}");
                Err(error)
            }
        }
    }

    async fn run_cycle(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut skipped: HashSet<EntityKey> = HashSet::new();
        let mut conflict_rounds: HashMap<OperationId, usize> = HashMap::new();

        'cycle: loop {
            if !self.is_online() {
                report.aborted = true;
                break;
            }

            let batch = self
                .queue
                .dequeue_batch_excluding(self.config.batch_size, &skipped)
                .await?;
            if batch.is_empty() {
                break;
            }
            tracing::debug!("Processing batch of {} operations", batch.len());

            for operation in batch {
                if !self.is_online() {
                    report.aborted = true;
                    break 'cycle;
                }

                let key = operation.entity_key();
                let operation_id = operation.id;
                // Earlier operations in this batch may have remapped ids or
                // rebased versions since it was dequeued.
                let operation = match self.queue.get(&operation_id).await {
                    Ok(Some(operation)) => operation,
                    Ok(None) => continue,
                    Err(error) => {
                        tracing::error!("Local store failure while syncing {key}: {error}");
                        skipped.insert(key);
                        continue;
                    }
                };
                match self.process(operation).await {
                    Ok(Step::Synced) => report.synced += 1,
                    Ok(Step::Resolved) => report.conflicts += 1,
                    Ok(Step::Rewritten) => {
                        report.conflicts += 1;
                        let rounds = conflict_rounds.entry(operation_id).or_default();
                        *rounds += 1;
                        if *rounds >= MAX_CONFLICT_ROUNDS {
                            tracing::warn!("{key} keeps conflicting; leaving it for the next cycle");
                            skipped.insert(key);
                        }
                    }
                    Ok(Step::Deferred) => report.deferred += 1,
                    Ok(Step::Retried) => report.retried += 1,
                    Ok(Step::Failed) => report.failed += 1,
                    Ok(Step::Aborted) => {
                        report.aborted = true;
                        break 'cycle;
                    }
                    Err(error) => {
                        tracing::error!("Local store failure while syncing {key}: {error}");
                        if let Err(release_error) = self.queue.release(&operation_id).await {
                            tracing::error!("Failed to release {operation_id}: {release_error}");
                        }
                        skipped.insert(key);
                    }
                }
            }
        }

        if report.aborted {
            let reverted = self.queue.revert_syncing().await?;
            tracing::warn!("Sync aborted: connection lost ({reverted} operations back to pending)");
        }
        Ok(report)
    }

    async fn process(&self, operation: PendingOperation) -> Result<Step> {
        let Some(response) = self.send(&operation).await else {
            return Ok(Step::Aborted);
        };

        match response {
            Ok(server) => {
                self.apply_success(&operation, server).await?;
                Ok(Step::Synced)
            }
            Err(RemoteError::Conflict { server }) => self.apply_conflict(&operation, *server).await,
            Err(RemoteError::Transient(message)) => {
                let updated = self
                    .queue
                    .mark_failed(&operation.id, &message, FailureKind::Transient)
                    .await?;
                if updated.status == OperationStatus::Failed {
                    self.notify_failed(&updated, &message);
                    Ok(Step::Failed)
                } else {
                    Ok(Step::Retried)
                }
            }
            Err(error @ RemoteError::Permanent { .. }) => {
                let message = error.to_string();
                let updated = self
                    .queue
                    .mark_failed(&operation.id, &message, FailureKind::Permanent)
                    .await?;
                self.notify_failed(&updated, &message);
                Ok(Step::Failed)
            }
        }
    }

    /// Issue the API call, bounded by the request timeout and abandoned when
    /// the device goes offline (`None`).
    async fn send(&self, operation: &PendingOperation) -> Option<RemoteResult<Option<Entity>>> {
        let call = async {
            match operation.action {
                OperationAction::Create => self
                    .remote
                    .create(operation.entity_type, &operation.entity_id, &operation.payload)
                    .await
                    .map(Some),
                OperationAction::Update => self
                    .remote
                    .update(
                        operation.entity_type,
                        &operation.entity_id,
                        &operation.payload,
                        operation.base_version,
                    )
                    .await
                    .map(Some),
                OperationAction::Delete => self
                    .remote
                    .delete(
                        operation.entity_type,
                        &operation.entity_id,
                        operation.base_version,
                    )
                    .await
                    .map(|()| None),
            }
        };

        let timeout = self.config.request_timeout();
        let mut network = self.network.clone();
        tokio::select! {
            result = tokio::time::timeout(timeout, call) => Some(result.unwrap_or_else(|_| {
                Err(RemoteError::Transient(format!("request timed out after {timeout:?}")))
            })),
            () = wait_offline(&mut network) => {
                tracing::debug!("Connection lost while sending {}", operation.entity_key());
                None
            }
        }
    }

    async fn apply_success(&self, operation: &PendingOperation, server: Option<Entity>) -> Result<()> {
        let entity_type = operation.entity_type;

        let Some(server) = server else {
            // Confirmed delete.
            let mut writes = WriteBatch::new();
            writes.delete(Collection::Entities(entity_type), operation.entity_id.as_str());
            self.queue
                .settle(
                    &operation.id,
                    entity_type,
                    &operation.entity_id,
                    &operation.entity_id,
                    writes,
                    |_, _| Ok(()),
                )
                .await?;
            tracing::debug!("Deleted {} on the server", operation.entity_key());
            return Ok(());
        };

        self.settle_on_server(operation, &server, WriteBatch::new()).await?;
        if operation.entity_id == server.id {
            tracing::debug!("Synced {} {} at version {}", operation.action, server.key(), server.version);
        } else {
            tracing::info!(
                "Server assigned {} to {} {}",
                server.id,
                entity_type,
                operation.entity_id
            );
        }
        Ok(())
    }

    /// Accept `server` as the truth for the operation's entity and drop the
    /// operation: the cache gets the server copy with any later queued
    /// changes layered on top, and a new server id replaces the device's id
    /// everywhere. `writes` commit in the same transaction.
    async fn settle_on_server(
        &self,
        operation: &PendingOperation,
        server: &Entity,
        mut writes: WriteBatch,
    ) -> Result<()> {
        let entity_type = operation.entity_type;

        if operation.entity_id != server.id {
            writes.delete(Collection::Entities(entity_type), operation.entity_id.as_str());
            self.rewrite_cached_references(&operation.entity_id, &server.id, &mut writes)
                .await?;
        }

        self.queue
            .settle(
                &operation.id,
                entity_type,
                &operation.entity_id,
                &server.id,
                writes,
                |later, writes| {
                    match overlay_pending(server.clone(), later) {
                        Some(cached) => {
                            writes.put(Collection::Entities(entity_type), &cached)?;
                        }
                        None => {
                            writes.delete(Collection::Entities(entity_type), server.id.as_str());
                        }
                    }
                    Ok(())
                },
            )
            .await?;
        self.queue
            .rebase_entity(entity_type, &server.id, server.version)
            .await
    }

    async fn apply_conflict(&self, operation: &PendingOperation, server: Entity) -> Result<Step> {
        let entity_type = operation.entity_type;
        let strategy = self.resolver.strategy_for(entity_type);
        let local = self.local_view(operation).await?;
        let conflict = Conflict::new(Some(operation.id), local.as_ref(), &server, operation.base_version);

        tracing::info!("Conflict on {}: {}; resolving with {strategy}", server.key(), conflict.reason);
        self.status.emit(SyncEvent::ConflictDetected {
            conflict_id: conflict.id,
            entity: server.key(),
            strategy,
        });

        let Some(local) = local else {
            return self
                .resolve_delete_conflict(operation, &server, conflict, strategy)
                .await;
        };

        let resolution = self.resolver.resolve_with(strategy, &local, &server);
        let label = resolution.strategy.as_str();
        let keeps_server = resolution.keeps_server(&server);
        match resolution.outcome {
            ResolvedOutcome::Deferred => self.defer(operation, &server, conflict).await,
            ResolvedOutcome::Merged(_) if keeps_server => {
                self.settle_on_server(operation, &server, WriteBatch::new()).await?;
                self.close_conflict(conflict, label).await?;
                Ok(Step::Resolved)
            }
            ResolvedOutcome::Merged(entity) => {
                self.rewrite(operation, &server, &entity).await?;
                self.close_conflict(conflict, label).await?;
                Ok(Step::Rewritten)
            }
            ResolvedOutcome::Duplicate { server: kept, duplicate } => {
                let recreate = PendingOperation::create(
                    entity_type,
                    duplicate.id.clone(),
                    duplicate.fields.clone(),
                );
                let mut writes = WriteBatch::new();
                writes.put(Collection::Entities(entity_type), &duplicate)?;
                writes.put(Collection::PendingOperations, &recreate)?;
                self.settle_on_server(operation, &kept, writes).await?;
                tracing::info!(
                    "Kept server copy of {} and re-created the device copy as {}",
                    kept.key(),
                    duplicate.id
                );
                self.close_conflict(conflict, label).await?;
                Ok(Step::Resolved)
            }
        }
    }

    /// A rejected delete: client-wins (and client-wins-if-newer when the
    /// delete happened after the server change) reissues it against the
    /// server version; manual waits; everything else keeps the server copy.
    async fn resolve_delete_conflict(
        &self,
        operation: &PendingOperation,
        server: &Entity,
        conflict: Conflict,
        strategy: ResolutionStrategy,
    ) -> Result<Step> {
        let reissue = match strategy {
            ResolutionStrategy::ClientWins => true,
            ResolutionStrategy::ClientWinsIfNewer => server
                .updated_at()
                .map_or(true, |server_at| operation.created_at > server_at),
            ResolutionStrategy::Manual => return self.defer(operation, server, conflict).await,
            _ => false,
        };

        if reissue {
            self.queue
                .requeue_with_payload(
                    &operation.id,
                    OperationAction::Delete,
                    Map::new(),
                    Some(server.version),
                )
                .await?;
            self.close_conflict(conflict, strategy.as_str()).await?;
            Ok(Step::Rewritten)
        } else {
            tracing::info!("Restoring {} after a rejected delete", server.key());
            self.settle_on_server(operation, server, WriteBatch::new()).await?;
            self.close_conflict(conflict, strategy.as_str()).await?;
            Ok(Step::Resolved)
        }
    }

    /// Cache the resolved copy and queue it as an update on the server version.
    async fn rewrite(&self, operation: &PendingOperation, server: &Entity, resolved: &Entity) -> Result<()> {
        let entity_type = operation.entity_type;
        let later = self.later_operations(operation).await?;

        let mut writes = WriteBatch::new();
        if operation.entity_id != server.id {
            writes.delete(Collection::Entities(entity_type), operation.entity_id.as_str());
            self.rewrite_cached_references(&operation.entity_id, &server.id, &mut writes)
                .await?;
        }
        let mut cached = resolved.clone();
        cached.conflict_id = None;
        match overlay_pending(cached, &later) {
            Some(cached) => {
                writes.put(Collection::Entities(entity_type), &cached)?;
            }
            None => {
                writes.delete(Collection::Entities(entity_type), server.id.as_str());
            }
        }
        self.store.apply(writes).await?;

        if operation.entity_id != server.id {
            self.queue
                .remap_entity_id(entity_type, &operation.entity_id, &server.id)
                .await?;
        }
        self.queue
            .requeue_with_payload(
                &operation.id,
                OperationAction::Update,
                resolved.fields.clone(),
                Some(server.version),
            )
            .await?;
        self.queue
            .rebase_entity(entity_type, &server.id, server.version)
            .await
    }

    /// Park the operation behind a pending conflict; the cache shows the
    /// server copy flagged as conflicted meanwhile.
    async fn defer(&self, operation: &PendingOperation, server: &Entity, conflict: Conflict) -> Result<Step> {
        let mut provisional = server.clone();
        provisional.conflict_id = Some(conflict.id.to_string());

        let mut writes = WriteBatch::new();
        if operation.entity_id != server.id {
            writes.delete(
                Collection::Entities(operation.entity_type),
                operation.entity_id.as_str(),
            );
        }
        writes.put(Collection::Entities(provisional.entity_type), &provisional)?;
        writes.put(Collection::Conflicts, &conflict)?;
        self.store.apply(writes).await?;
        self.queue.mark_conflicted(&operation.id, conflict.id).await?;

        tracing::info!("Conflict {} on {} awaits a manual decision", conflict.id, server.key());
        Ok(Step::Deferred)
    }

    async fn close_conflict(&self, mut conflict: Conflict, resolution: &str) -> Result<()> {
        conflict.resolve(resolution);
        self.store.put_conflict(&conflict).await?;
        self.status.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict.id,
            entity: EntityKey::new(conflict.entity_type, conflict.entity_id.clone()),
            resolution: resolution.to_string(),
        });
        Ok(())
    }

    /// Apply a human decision to a pending conflict.
    pub async fn resolve_conflict_manually(
        &self,
        conflict_id: &ConflictId,
        choice: ManualChoice,
    ) -> Result<Conflict> {
        let _cycle = self.cycle.lock().await;

        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if !conflict.is_pending() {
            return Err(Error::InvalidInput(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }

        let server = conflict.server_entity()?;
        let operation = match conflict.operation_id {
            Some(operation_id) => self.queue.get(&operation_id).await?,
            None => None,
        };
        let label = format!("manual:{}", choice.label());

        match choice {
            ManualChoice::UseServer => match &operation {
                Some(operation) => {
                    self.settle_on_server(operation, &server, WriteBatch::new())
                        .await?;
                }
                None => {
                    let mut kept = server.clone();
                    kept.conflict_id = None;
                    self.store.put_entity(&kept).await?;
                }
            },
            ManualChoice::UseClient => match conflict.local_entity() {
                Some(local) => {
                    self.push_resolved(operation.as_ref(), &server, &client_copy(&local, &server))
                        .await?;
                }
                None => {
                    self.reissue_delete(operation.as_ref(), &server).await?;
                }
            },
            ManualChoice::Merge(fields) => {
                let merged = Entity::new(server.entity_type, server.id.clone(), server.version, fields);
                self.push_resolved(operation.as_ref(), &server, &merged)
                    .await?;
            }
        }

        let mut conflict = conflict;
        conflict.resolve(label.clone());
        self.store.put_conflict(&conflict).await?;
        self.status.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict.id,
            entity: EntityKey::new(conflict.entity_type, conflict.entity_id.clone()),
            resolution: label,
        });
        tracing::info!("Conflict {} resolved ({})", conflict.id, conflict.resolution.as_deref().unwrap_or_default());

        self.refresh_status().await?;
        Ok(conflict)
    }

    async fn push_resolved(
        &self,
        operation: Option<&PendingOperation>,
        server: &Entity,
        resolved: &Entity,
    ) -> Result<()> {
        if let Some(operation) = operation {
            return self.rewrite(operation, server, resolved).await;
        }

        let mut cached = resolved.clone();
        cached.conflict_id = None;
        self.store.put_entity(&cached).await?;
        self.queue
            .enqueue(PendingOperation::update(
                server.entity_type,
                server.id.clone(),
                resolved.fields.clone(),
                Some(server.version),
            ))
            .await?;
        Ok(())
    }

    async fn reissue_delete(&self, operation: Option<&PendingOperation>, server: &Entity) -> Result<()> {
        self.store.delete_entity(server.entity_type, &server.id).await?;
        match operation {
            Some(operation) => {
                self.queue
                    .requeue_with_payload(
                        &operation.id,
                        OperationAction::Delete,
                        Map::new(),
                        Some(server.version),
                    )
                    .await?;
            }
            None => {
                self.queue
                    .enqueue(PendingOperation::delete(
                        server.entity_type,
                        server.id.clone(),
                        Some(server.version),
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    /// Server-initiated update (push channel): cache invalidation, or the
    /// conflict path when a queued change was based on an older version.
    pub async fn handle_server_push(&self, entity: Entity) -> Result<PushOutcome> {
        let _cycle = self.cycle.lock().await;
        let queued = self
            .queue
            .operations_for(entity.entity_type, &entity.id)
            .await?;

        if queued.iter().any(|operation| operation.status.blocks_entity()) {
            tracing::debug!("Push for {} deferred behind a blocked change", entity.key());
            return Ok(PushOutcome::Deferred);
        }

        let outcome = match queued.first() {
            None => {
                let cached = self.store.get_entity(entity.entity_type, &entity.id).await?;
                if cached.is_some_and(|cached| cached.version > entity.version) {
                    PushOutcome::Ignored
                } else {
                    let mut fresh = entity;
                    fresh.conflict_id = None;
                    self.store.put_entity(&fresh).await?;
                    PushOutcome::Applied
                }
            }
            Some(operation) => match operation.base_version {
                Some(base) if base < entity.version => {
                    self.apply_conflict(operation, entity).await?;
                    PushOutcome::Conflicted
                }
                _ => PushOutcome::Ignored,
            },
        };

        self.refresh_status().await?;
        Ok(outcome)
    }

    /// The device's view of the entity an operation targets
    async fn local_view(&self, operation: &PendingOperation) -> Result<Option<Entity>> {
        if operation.action == OperationAction::Delete {
            return Ok(None);
        }

        let cached = self
            .store
            .get_entity(operation.entity_type, &operation.entity_id)
            .await?;
        let base_version = operation.base_version.unwrap_or(0);
        let mut local = cached.unwrap_or_else(|| {
            Entity::new(
                operation.entity_type,
                operation.entity_id.clone(),
                base_version,
                Map::new(),
            )
        });
        local.apply_payload(&operation.payload);
        local.version = operation.base_version.unwrap_or(local.version);
        local.conflict_id = None;
        Ok(Some(local))
    }

    async fn later_operations(&self, operation: &PendingOperation) -> Result<Vec<PendingOperation>> {
        let mut later = self
            .queue
            .operations_for(operation.entity_type, &operation.entity_id)
            .await?;
        later.retain(|queued| queued.id != operation.id);
        Ok(later)
    }

    /// Rewrite cached entities that reference a temporary id.
    async fn rewrite_cached_references(
        &self,
        from: &EntityId,
        to: &EntityId,
        writes: &mut WriteBatch,
    ) -> Result<()> {
        for entity_type in EntityType::ALL {
            for mut entity in self.store.list_entities(entity_type).await? {
                if entity.id == *from {
                    continue;
                }
                let mut changed = false;
                for value in entity.fields.values_mut() {
                    changed |= replace_json_string(value, from.as_str(), to.as_str());
                }
                if changed {
                    writes.put(Collection::Entities(entity_type), &entity)?;
                }
            }
        }
        Ok(())
    }

    fn notify_failed(&self, operation: &PendingOperation, error: &str) {
        self.status.emit(SyncEvent::OperationFailed {
            operation_id: operation.id,
            entity: operation.entity_key(),
            error: error.to_string(),
        });
    }
}

/// Server copy with queued changes layered on top; `None` if one deletes it
fn overlay_pending(mut entity: Entity, later: &[PendingOperation]) -> Option<Entity> {
    let version = entity.version;
    for operation in later {
        match operation.action {
            OperationAction::Delete => return None,
            OperationAction::Create | OperationAction::Update => {
                entity.apply_payload(&operation.payload);
            }
        }
    }
    entity.version = version;
    Some(entity)
}

/// Resolves once the network reports offline; never if the monitor is gone.
async fn wait_offline(network: &mut watch::Receiver<NetworkState>) {
    if network
        .wait_for(|state| !state.is_online())
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}
