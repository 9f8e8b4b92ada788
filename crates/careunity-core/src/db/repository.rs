//! Record repository implementation
//!
//! The device store is one `records` table partitioned into named
//! collections. Every call is a single statement, so each call is atomic on
//! its own; coordination across calls belongs to the queue and sync engine.

use std::fmt;

use libsql::params::Params;
use libsql::{Connection, Value as SqlValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Conflict, Entity, EntityType, PendingOperation};
use crate::util::unix_millis_now;

/// Named collection within the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Cached entities of one type (`entities:<type>`)
    Entities(EntityType),
    /// Ordered log of queued mutations
    PendingOperations,
    /// Unresolved conflicts and the resolved audit trail
    Conflicts,
}

impl Collection {
    /// Storage name of the collection
    pub fn name(self) -> String {
        match self {
            Self::Entities(entity_type) => format!("entities:{entity_type}"),
            Self::PendingOperations => "pendingOperations".to_string(),
            Self::Conflicts => "conflicts".to_string(),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A value that can live in a collection, keyed by its id
pub trait Record: Serialize + DeserializeOwned {
    /// Primary key within the collection
    fn record_id(&self) -> String;

    /// Ordering hint for `get_all`
    fn sort_key(&self) -> i64 {
        0
    }
}

impl Record for Entity {
    fn record_id(&self) -> String {
        self.id.to_string()
    }

    fn sort_key(&self) -> i64 {
        self.updated_at().unwrap_or(self.version)
    }
}

impl Record for PendingOperation {
    fn record_id(&self) -> String {
        self.id.as_str()
    }

    fn sort_key(&self) -> i64 {
        self.created_at
    }
}

impl Record for Conflict {
    fn record_id(&self) -> String {
        self.id.as_str()
    }

    fn sort_key(&self) -> i64 {
        self.created_at
    }
}

/// Trait for collection storage operations (async)
#[allow(async_fn_in_trait)]
pub trait RecordRepository {
    /// Fetch one record by id
    async fn get<T: Record>(&self, collection: Collection, id: &str) -> Result<Option<T>>;

    /// Fetch every record of a collection
    async fn get_all<T: Record>(&self, collection: Collection) -> Result<Vec<T>>;

    /// Fetch records whose top-level JSON `field` equals `value`
    async fn get_by_index<T: Record>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<T>>;

    /// Insert or overwrite a record by id
    async fn put<T: Record>(&self, collection: Collection, record: &T) -> Result<()>;

    /// Insert a record; fails if the id is already taken
    async fn add<T: Record>(&self, collection: Collection, record: &T) -> Result<()>;

    /// Remove a record, returning whether it existed
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool>;

    /// Number of records in a collection
    async fn count(&self, collection: Collection) -> Result<usize>;

    /// Remove every record of a collection
    async fn clear(&self, collection: Collection) -> Result<usize>;

    /// Apply several writes in one transaction
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}

#[derive(Debug, Clone)]
enum BatchWrite {
    Put {
        collection: Collection,
        id: String,
        body: String,
        sort_key: i64,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

/// Writes that must land together (e.g. a temporary-id remap)
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<BatchWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an upsert
    pub fn put<T: Record>(&mut self, collection: Collection, record: &T) -> Result<&mut Self> {
        self.writes.push(BatchWrite::Put {
            collection,
            id: record.record_id(),
            body: serde_json::to_string(record)?,
            sort_key: record.sort_key(),
        });
        Ok(self)
    }

    /// Queue a removal
    pub fn delete(&mut self, collection: Collection, id: impl Into<String>) -> &mut Self {
        self.writes.push(BatchWrite::Delete {
            collection,
            id: id.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// libSQL implementation of `RecordRepository`
pub struct LibSqlRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn collect_bodies<T: Record>(&self, sql: &str, params: Params) -> Result<Vec<T>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let body: String = row.get(0)?;
            records.push(serde_json::from_str(&body)?);
        }
        Ok(records)
    }
}

impl RecordRepository for LibSqlRecordRepository<'_> {
    async fn get<T: Record>(&self, collection: Collection, id: &str) -> Result<Option<T>> {
        let mut rows = self
            .conn
            .query(
                "SELECT body FROM records WHERE collection = ?1 AND id = ?2",
                libsql::params![collection.name(), id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let body: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn get_all<T: Record>(&self, collection: Collection) -> Result<Vec<T>> {
        self.collect_bodies(
            "SELECT body FROM records WHERE collection = ?1 ORDER BY sort_key ASC, id ASC",
            Params::Positional(vec![SqlValue::Text(collection.name())]),
        )
        .await
    }

    async fn get_by_index<T: Record>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<T>> {
        let path = index_path(field)?;
        let mut params = vec![SqlValue::Text(collection.name())];

        let predicate = match json_to_sql(value) {
            Some(sql_value) => {
                params.push(sql_value);
                "= ?2"
            }
            None => "IS NULL",
        };

        let sql = format!(
            "SELECT body FROM records
             WHERE collection = ?1 AND json_extract(body, '{path}') {predicate}
             ORDER BY sort_key ASC, id ASC"
        );
        self.collect_bodies(&sql, Params::Positional(params)).await
    }

    async fn put<T: Record>(&self, collection: Collection, record: &T) -> Result<()> {
        let body = serde_json::to_string(record)?;
        self.conn
            .execute(
                "INSERT INTO records (collection, id, body, sort_key, written_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(collection, id) DO UPDATE SET
                    body = excluded.body,
                    sort_key = excluded.sort_key,
                    written_at = excluded.written_at",
                libsql::params![
                    collection.name(),
                    record.record_id(),
                    body,
                    record.sort_key(),
                    unix_millis_now()
                ],
            )
            .await?;
        Ok(())
    }

    async fn add<T: Record>(&self, collection: Collection, record: &T) -> Result<()> {
        let body = serde_json::to_string(record)?;
        let id = record.record_id();
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO records (collection, id, body, sort_key, written_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                libsql::params![
                    collection.name(),
                    id.clone(),
                    body,
                    record.sort_key(),
                    unix_millis_now()
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(Error::AlreadyExists(format!("{collection}/{id}")));
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                libsql::params![collection.name(), id],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM records WHERE collection = ?1",
                libsql::params![collection.name()],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn clear(&self, collection: Collection) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM records WHERE collection = ?1",
                libsql::params![collection.name()],
            )
            .await?;
        Ok(usize::try_from(removed).unwrap_or_default())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        for write in batch.writes {
            let outcome = match write {
                BatchWrite::Put {
                    collection,
                    id,
                    body,
                    sort_key,
                } => {
                    self.conn
                        .execute(
                            "INSERT INTO records (collection, id, body, sort_key, written_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)
                             ON CONFLICT(collection, id) DO UPDATE SET
                                body = excluded.body,
                                sort_key = excluded.sort_key,
                                written_at = excluded.written_at",
                            libsql::params![collection.name(), id, body, sort_key, unix_millis_now()],
                        )
                        .await
                }
                BatchWrite::Delete { collection, id } => {
                    self.conn
                        .execute(
                            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                            libsql::params![collection.name(), id],
                        )
                        .await
                }
            };

            if let Err(e) = outcome {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        Ok(())
    }
}

/// Build a JSON path for an index lookup, rejecting anything but identifiers
fn index_path(field: &str) -> Result<String> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(format!("$.{field}"))
    } else {
        Err(Error::InvalidInput(format!("invalid index field '{field}'")))
    }
}

/// Map a JSON value onto what `json_extract` yields; `None` means SQL NULL
fn json_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => Some(number.as_i64().map_or_else(
            || SqlValue::Real(number.as_f64().unwrap_or_default()),
            SqlValue::Integer,
        )),
        Value::String(text) => Some(SqlValue::Text(text.clone())),
        Value::Array(_) | Value::Object(_) => Some(SqlValue::Text(value.to_string())),
    }
}
