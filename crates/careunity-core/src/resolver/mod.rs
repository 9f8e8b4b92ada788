//! Conflict resolver
//!
//! Decides, per entity type, how a local copy and a newer server copy are
//! reconciled. Strategies are a closed enum; the per-type table falls back
//! to server-wins for anything unregistered.

mod merge;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{Entity, EntityId, EntityType};
use crate::util::unix_millis_now;

pub use merge::{merge_entities, ADDENDUM_SEPARATOR, NOTE_FIELDS};

/// Field set on the client copy kept by `create-duplicate`
pub const DUPLICATE_FLAG_FIELD: &str = "isDuplicate";
/// Field on the duplicate pointing at the server copy
pub const DUPLICATE_OF_FIELD: &str = "duplicateOf";

/// Named reconciliation algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    #[default]
    ServerWins,
    ClientWins,
    ClientWinsIfNewer,
    FieldLevelMerge,
    CreateDuplicate,
    Manual,
}

impl ResolutionStrategy {
    pub const ALL: [Self; 6] = [
        Self::ServerWins,
        Self::ClientWins,
        Self::ClientWinsIfNewer,
        Self::FieldLevelMerge,
        Self::CreateDuplicate,
        Self::Manual,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerWins => "server-wins",
            Self::ClientWins => "client-wins",
            Self::ClientWinsIfNewer => "client-wins-if-newer",
            Self::FieldLevelMerge => "field-level-merge",
            Self::CreateDuplicate => "create-duplicate",
            Self::Manual => "manual",
        }
    }

    /// Built-in strategy for an entity type
    pub const fn default_for(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Visit | EntityType::Note => Self::FieldLevelMerge,
            EntityType::CarePlan => Self::Manual,
            EntityType::CheckIn | EntityType::Incident => Self::CreateDuplicate,
            EntityType::Task => Self::ClientWinsIfNewer,
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown resolution strategy '{s}'")))
    }
}

/// What a strategy decided
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedOutcome {
    /// One reconciled copy, carrying the server version marker
    Merged(Entity),
    /// Server copy stays; the client copy lives on under a new id
    Duplicate { server: Entity, duplicate: Entity },
    /// Waiting for a human decision
    Deferred,
}

/// Outcome plus audit metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Strategy that fired
    pub strategy: ResolutionStrategy,
    pub outcome: ResolvedOutcome,
    pub local_version: i64,
    pub server_version: i64,
    pub resolved_at: i64,
}

impl Resolution {
    /// Whether the server copy was kept untouched
    pub fn keeps_server(&self, server: &Entity) -> bool {
        matches!(&self.outcome, ResolvedOutcome::Merged(entity) if entity == server)
    }
}

/// Per-type strategy table.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategies: HashMap<EntityType, ResolutionStrategy>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    /// Table with the built-in defaults for every entity type.
    pub fn new() -> Self {
        let strategies = EntityType::ALL
            .into_iter()
            .map(|entity_type| (entity_type, ResolutionStrategy::default_for(entity_type)))
            .collect();
        Self { strategies }
    }

    /// Empty table: every type resolves server-wins.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Defaults plus `strategies` overrides from config.
    ///
    /// Unknown strategy names fall back to server-wins; unknown entity types
    /// are ignored. Both are logged.
    pub fn from_config(config: &SyncConfig) -> Self {
        let mut resolver = Self::new();
        for (type_name, strategy_name) in &config.strategies {
            let Ok(entity_type) = type_name.parse::<EntityType>() else {
                tracing::warn!("Ignoring strategy for unknown entity type '{type_name}'");
                continue;
            };
            let strategy = strategy_name.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "Unknown strategy '{strategy_name}' for {entity_type}; using server-wins"
                );
                ResolutionStrategy::ServerWins
            });
            resolver.strategies.insert(entity_type, strategy);
        }
        resolver
    }

    #[must_use]
    pub fn with_strategy(mut self, entity_type: EntityType, strategy: ResolutionStrategy) -> Self {
        self.strategies.insert(entity_type, strategy);
        self
    }

    pub fn strategy_for(&self, entity_type: EntityType) -> ResolutionStrategy {
        self.strategies
            .get(&entity_type)
            .copied()
            .unwrap_or_default()
    }

    /// Resolve with the strategy registered for `entity_type`.
    pub fn resolve_conflict(
        &self,
        local: &Entity,
        server: &Entity,
        entity_type: EntityType,
    ) -> Resolution {
        self.resolve_with(self.strategy_for(entity_type), local, server)
    }

    /// Resolve with an explicit strategy.
    pub fn resolve_with(
        &self,
        strategy: ResolutionStrategy,
        local: &Entity,
        server: &Entity,
    ) -> Resolution {
        let (strategy, outcome) = match strategy {
            ResolutionStrategy::ServerWins => (strategy, server_wins(server)),
            ResolutionStrategy::ClientWins => (strategy, client_wins(local, server)),
            ResolutionStrategy::ClientWinsIfNewer => {
                if is_newer(local, server) {
                    (strategy, client_wins(local, server))
                } else {
                    (strategy, server_wins(server))
                }
            }
            ResolutionStrategy::FieldLevelMerge => match merge_entities(local, server) {
                Some(merged) => (strategy, ResolvedOutcome::Merged(merged)),
                None => {
                    tracing::warn!(
                        "Field-level merge of {} failed; falling back to server-wins",
                        server.key()
                    );
                    (ResolutionStrategy::ServerWins, server_wins(server))
                }
            },
            ResolutionStrategy::CreateDuplicate => (strategy, duplicate(local, server)),
            ResolutionStrategy::Manual => (strategy, ResolvedOutcome::Deferred),
        };

        tracing::debug!("Resolved conflict on {} with {strategy}", server.key());
        Resolution {
            strategy,
            outcome,
            local_version: local.version,
            server_version: server.version,
            resolved_at: unix_millis_now(),
        }
    }
}

/// Whether `local` was modified strictly after `server`
pub fn is_newer(local: &Entity, server: &Entity) -> bool {
    match (local.updated_at(), server.updated_at()) {
        (Some(local_at), Some(server_at)) => local_at > server_at,
        (Some(_), None) => true,
        _ => false,
    }
}

fn server_wins(server: &Entity) -> ResolvedOutcome {
    let mut kept = server.clone();
    kept.conflict_id = None;
    ResolvedOutcome::Merged(kept)
}

/// Local fields under the server's id and version marker
pub fn client_copy(local: &Entity, server: &Entity) -> Entity {
    Entity::new(
        server.entity_type,
        server.id.clone(),
        server.version,
        local.fields.clone(),
    )
}

fn client_wins(local: &Entity, server: &Entity) -> ResolvedOutcome {
    ResolvedOutcome::Merged(client_copy(local, server))
}

fn duplicate(local: &Entity, server: &Entity) -> ResolvedOutcome {
    let mut copy = Entity::new(
        server.entity_type,
        EntityId::temporary(),
        0,
        local.fields.clone(),
    );
    copy.fields
        .insert(DUPLICATE_FLAG_FIELD.to_string(), Value::Bool(true));
    copy.fields.insert(
        DUPLICATE_OF_FIELD.to_string(),
        Value::from(server.id.as_str()),
    );

    let mut kept = server.clone();
    kept.conflict_id = None;
    ResolvedOutcome::Duplicate {
        server: kept,
        duplicate: copy,
    }
}
