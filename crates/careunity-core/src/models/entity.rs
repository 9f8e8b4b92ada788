//! Entity model
//!
//! Entities are the domain records (visits, care plans, notes, ...) cached on
//! the device and reconciled against the server. Apart from the identity and
//! version markers their fields are free-form JSON.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Prefix of client-minted identifiers awaiting a server-assigned id.
pub const TEMPORARY_ID_PREFIX: &str = "tmp-";

/// JSON key carrying the last-modified timestamp of an entity or list item.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Domain category of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Visit,
    CarePlan,
    Note,
    CheckIn,
    Incident,
    Task,
}

impl EntityType {
    /// Every known entity type.
    pub const ALL: [Self; 6] = [
        Self::Visit,
        Self::CarePlan,
        Self::Note,
        Self::CheckIn,
        Self::Incident,
        Self::Task,
    ];

    /// Canonical snake_case name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Visit => "visit",
            Self::CarePlan => "care_plan",
            Self::Note => "note",
            Self::CheckIn => "check_in",
            Self::Incident => "incident",
            Self::Task => "task",
        }
    }

    /// REST collection segment used by the remote API
    pub const fn api_path(self) -> &'static str {
        match self {
            Self::Visit => "visits",
            Self::CarePlan => "care-plans",
            Self::Note => "notes",
            Self::CheckIn => "check-ins",
            Self::Incident => "incidents",
            Self::Task => "tasks",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|entity_type| entity_type.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity type '{s}'")))
    }
}

/// Identifier of an entity, unique within its type.
///
/// Server ids are opaque; ids minted on the device before the first sync
/// carry the [`TEMPORARY_ID_PREFIX`] and are remapped once the server
/// assigns a permanent id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a temporary client-side id
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Whether this id was minted locally and never confirmed by the server
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Some endpoints hand out numeric ids.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Number(number) => Self(number.to_string()),
        })
    }
}

/// Entity identity within the whole store: `(type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityKey {
    pub const fn new(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            entity_type,
            entity_id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A domain record as cached on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identifier (temporary until first sync)
    pub id: EntityId,
    /// Domain category
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Server version marker used for conflict detection
    #[serde(default)]
    pub version: i64,
    /// Open manual conflict; the cached data is the provisional server copy
    #[serde(
        rename = "_conflictId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conflict_id: Option<String>,
    /// Type-specific fields, including `updatedAt`
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Create an entity from its fields
    pub fn new(entity_type: EntityType, id: EntityId, version: i64, fields: Map<String, Value>) -> Self {
        let mut entity = Self {
            id,
            entity_type,
            version,
            conflict_id: None,
            fields,
        };
        entity.strip_reserved_fields();
        entity
    }

    /// Build an entity from an API or payload JSON object.
    ///
    /// A missing `type` is filled in from `entity_type`; a missing id falls
    /// back to `fallback_id`.
    pub fn from_json(entity_type: EntityType, fallback_id: Option<&EntityId>, value: Value) -> Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(Error::InvalidInput(format!(
                "{entity_type} payload must be a JSON object"
            )));
        };

        object
            .entry("type")
            .or_insert_with(|| Value::String(entity_type.as_str().to_string()));
        if !object.contains_key("id") {
            let id = fallback_id.ok_or_else(|| {
                Error::InvalidInput(format!("{entity_type} payload is missing an id"))
            })?;
            object.insert("id".to_string(), Value::String(id.to_string()));
        }

        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// Last-modified time in unix milliseconds, if present and parseable
    pub fn updated_at(&self) -> Option<i64> {
        self.fields.get(UPDATED_AT_FIELD).and_then(parse_timestamp)
    }

    /// Read a field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Overlay a payload onto this entity field-by-field.
    ///
    /// Identity keys in the payload are ignored; `version` is taken when
    /// present.
    pub fn apply_payload(&mut self, payload: &Map<String, Value>) {
        for (key, value) in payload {
            match key.as_str() {
                "id" | "type" | "_conflictId" => {}
                "version" => {
                    if let Some(version) = value.as_i64() {
                        self.version = version;
                    }
                }
                _ => {
                    self.fields.insert(key.clone(), value.clone());
                }
            }
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id.clone())
    }

    fn strip_reserved_fields(&mut self) {
        for key in ["id", "type", "version", "_conflictId"] {
            self.fields.remove(key);
        }
    }
}

/// Parse a timestamp given either as unix milliseconds or RFC 3339 text.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|datetime| datetime.timestamp_millis())
        }),
        _ => None,
    }
}
