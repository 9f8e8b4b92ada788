//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::{Entity, EntityId, EntityType};
use super::operation::OperationId;
use crate::util::unix_millis_now;

/// A unique identifier for a conflict record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// Divergence between the device's and the server's copy of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Operation that hit the conflict
    pub operation_id: Option<OperationId>,
    /// Client version (`null` for a rejected delete)
    pub local_data: Value,
    /// Server version
    pub server_data: Value,
    pub local_version: Option<i64>,
    pub server_version: i64,
    /// Human-readable description
    pub reason: String,
    pub status: ConflictStatus,
    /// Strategy that fired, or `manual:<choice>`
    pub resolution: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

impl Conflict {
    /// Record a conflict between a local copy and the server's copy
    pub fn new(
        operation_id: Option<OperationId>,
        local: Option<&Entity>,
        server: &Entity,
        local_version: Option<i64>,
    ) -> Self {
        let reason = format!(
            "server copy of {} {} is at version {} but the local change was based on version {}",
            server.entity_type,
            server.id,
            server.version,
            local_version.map_or_else(|| "unknown".to_string(), |version| version.to_string())
        );

        Self {
            id: ConflictId::new(),
            entity_type: server.entity_type,
            entity_id: server.id.clone(),
            operation_id,
            local_data: local
                .and_then(|entity| serde_json::to_value(entity).ok())
                .unwrap_or(Value::Null),
            server_data: serde_json::to_value(server).unwrap_or(Value::Null),
            local_version,
            server_version: server.version,
            reason,
            status: ConflictStatus::Pending,
            resolution: None,
            created_at: unix_millis_now(),
            resolved_at: None,
        }
    }

    /// Mark resolved with the given strategy label
    pub fn resolve(&mut self, resolution: impl Into<String>) {
        self.status = ConflictStatus::Resolved;
        self.resolution = Some(resolution.into());
        self.resolved_at = Some(unix_millis_now());
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self.status, ConflictStatus::Pending)
    }

    /// Local copy as an entity, if one was recorded
    pub fn local_entity(&self) -> Option<Entity> {
        if self.local_data.is_null() {
            return None;
        }
        serde_json::from_value(self.local_data.clone()).ok()
    }

    /// Server copy as an entity
    pub fn server_entity(&self) -> crate::Result<Entity> {
        Ok(serde_json::from_value(self.server_data.clone())?)
    }
}
