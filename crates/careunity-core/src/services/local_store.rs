//! Shared local store service used by the queue and the sync engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{Collection, Database, LibSqlRecordRepository, Record, RecordRepository, WriteBatch};
use crate::models::{Conflict, ConflictId, Entity, EntityId, EntityType};
use crate::{Error, Result};

/// Thread-safe handle to the device-local durable store.
///
/// Clones share one connection; each call takes the connection lock for its
/// duration, so calls never interleave mid-statement.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open the store at the given filesystem path, creating parent directories.
    ///
    /// An unreadable file is reported as [`Error::CorruptStore`] and left in
    /// place: it may hold the only copy of changes the server has not seen.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::error!("Local store at {} is unreadable: {error}", db_path.display());
                return Err(Error::CorruptStore(db_path, error.to_string()));
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    /// Fetch one record.
    pub async fn get<T: Record>(&self, collection: Collection, id: &str) -> Result<Option<T>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .get(collection, id)
            .await
    }

    /// Fetch all records of a collection.
    pub async fn get_all<T: Record>(&self, collection: Collection) -> Result<Vec<T>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .get_all(collection)
            .await
    }

    /// Fetch records by a top-level field value.
    pub async fn get_by_index<T: Record>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<T>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .get_by_index(collection, field, value)
            .await
    }

    /// Upsert a record.
    pub async fn put<T: Record>(&self, collection: Collection, record: &T) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .put(collection, record)
            .await
    }

    /// Insert a record, failing on an existing id.
    pub async fn add<T: Record>(&self, collection: Collection, record: &T) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .add(collection, record)
            .await
    }

    /// Remove a record.
    pub async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .delete(collection, id)
            .await
    }

    /// Count records of a collection.
    pub async fn count(&self, collection: Collection) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .count(collection)
            .await
    }

    /// Drop every record of a collection.
    pub async fn clear(&self, collection: Collection) -> Result<usize> {
        let db = self.db.lock().await;
        let removed = LibSqlRecordRepository::new(db.connection())
            .clear(collection)
            .await?;
        tracing::info!("Cleared {removed} records from {}", collection.name());
        Ok(removed)
    }

    /// Apply a batch of writes atomically.
    pub async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .apply(batch)
            .await
    }

    /// Cached entity by type and id.
    pub async fn get_entity(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<Entity>> {
        self.get(Collection::Entities(entity_type), id.as_str()).await
    }

    /// Cache an entity.
    pub async fn put_entity(&self, entity: &Entity) -> Result<()> {
        self.put(Collection::Entities(entity.entity_type), entity)
            .await
    }

    /// Drop an entity from the cache.
    pub async fn delete_entity(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        self.delete(Collection::Entities(entity_type), id.as_str())
            .await
    }

    /// All cached entities of a type.
    pub async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.get_all(Collection::Entities(entity_type)).await
    }

    /// Conflict by id.
    pub async fn get_conflict(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        self.get(Collection::Conflicts, &id.as_str()).await
    }

    /// Persist a conflict record.
    pub async fn put_conflict(&self, conflict: &Conflict) -> Result<()> {
        self.put(Collection::Conflicts, conflict).await
    }

    /// Conflicts oldest-first; unresolved only unless `include_resolved`.
    pub async fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<Conflict>> {
        if include_resolved {
            self.get_all(Collection::Conflicts).await
        } else {
            self.get_by_index(Collection::Conflicts, "status", &Value::from("pending"))
                .await
        }
    }

    /// Remove resolved conflicts resolved before `older_than` (unix ms).
    pub async fn prune_resolved_conflicts(&self, older_than: i64) -> Result<usize> {
        let resolved: Vec<Conflict> = self
            .get_by_index(Collection::Conflicts, "status", &Value::from("resolved"))
            .await?;

        let mut batch = WriteBatch::new();
        for conflict in resolved
            .iter()
            .filter(|conflict| conflict.resolved_at.is_some_and(|at| at < older_than))
        {
            batch.delete(Collection::Conflicts, conflict.id.as_str());
        }

        let pruned = batch.len();
        self.apply(batch).await?;
        if pruned > 0 {
            tracing::debug!("Pruned {pruned} resolved conflicts");
        }
        Ok(pruned)
    }
}
