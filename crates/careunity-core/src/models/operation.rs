//! Pending operation model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::conflict::ConflictId;
use super::entity::{EntityId, EntityKey, EntityType};
use crate::util::unix_millis_now;

/// A unique identifier for a queued operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    Create,
    Update,
    Delete,
}

impl OperationAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown operation action '{other}'"
            ))),
        }
    }
}

/// Lifecycle state of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting to be sent
    Pending,
    /// Handed to the sync engine for the current cycle
    Syncing,
    /// Hit a version conflict awaiting manual resolution
    Conflicted,
    /// Terminal failure; needs user attention
    Failed,
    /// Confirmed by the server
    Synced,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
            Self::Synced => "synced",
        }
    }

    /// Statuses that keep later operations on the same entity waiting
    pub const fn blocks_entity(self) -> bool {
        matches!(self, Self::Syncing | Self::Conflicted | Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A not-yet-confirmed mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Client-generated identifier
    pub id: OperationId,
    pub entity_type: EntityType,
    /// Target entity; temporary for creates until the server assigns an id
    pub entity_id: EntityId,
    pub action: OperationAction,
    /// Entity snapshot (create) or delta (update); empty for deletes
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Server version the change was made against
    #[serde(default)]
    pub base_version: Option<i64>,
    /// Client clock at enqueue time (unix ms)
    pub created_at: i64,
    pub status: OperationStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest retry time after a transient failure (unix ms)
    #[serde(default)]
    pub next_attempt_at: Option<i64>,
    /// Conflict blocking this operation, if any
    #[serde(default)]
    pub conflict_id: Option<ConflictId>,
}

impl PendingOperation {
    fn new(
        entity_type: EntityType,
        entity_id: EntityId,
        action: OperationAction,
        payload: Map<String, Value>,
        base_version: Option<i64>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            entity_type,
            entity_id,
            action,
            payload,
            base_version,
            created_at: unix_millis_now(),
            status: OperationStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            conflict_id: None,
        }
    }

    /// Queue the creation of an entity
    pub fn create(entity_type: EntityType, entity_id: EntityId, payload: Map<String, Value>) -> Self {
        Self::new(entity_type, entity_id, OperationAction::Create, payload, None)
    }

    /// Queue a change to an existing entity
    pub fn update(
        entity_type: EntityType,
        entity_id: EntityId,
        payload: Map<String, Value>,
        base_version: Option<i64>,
    ) -> Self {
        Self::new(
            entity_type,
            entity_id,
            OperationAction::Update,
            payload,
            base_version,
        )
    }

    /// Queue the removal of an entity
    pub fn delete(entity_type: EntityType, entity_id: EntityId, base_version: Option<i64>) -> Self {
        Self::new(
            entity_type,
            entity_id,
            OperationAction::Delete,
            Map::new(),
            base_version,
        )
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Whether the operation may be picked up at `now`
    pub fn is_due(&self, now: i64) -> bool {
        self.status == OperationStatus::Pending
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
