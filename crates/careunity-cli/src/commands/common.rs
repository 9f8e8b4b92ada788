use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use careunity_core::config::SyncConfig;
use careunity_core::network::{HttpProbe, NetworkMonitor, Probe};
use careunity_core::queue::OperationQueue;
use careunity_core::remote::HttpRemoteApi;
use careunity_core::resolver::ConflictResolver;
use careunity_core::services::LocalStore;
use careunity_core::sync::SyncEngine;
use careunity_core::{Conflict, Entity, EntityType, PendingOperation};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CliError;

const ENV_DB_PATH: &str = "CAREUNITY_DB_PATH";
const ENV_CONFIG_PATH: &str = "CAREUNITY_CONFIG";

#[derive(Debug, Serialize)]
pub struct OperationItem {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub status: String,
    pub retry_count: u32,
    pub base_version: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub created_at_iso: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub status: String,
    pub reason: String,
    pub local_version: Option<i64>,
    pub server_version: i64,
    pub resolution: Option<String>,
    pub created_at_iso: String,
}

/// Store, queue and engine wired against the configured API.
pub struct Session {
    pub engine: Arc<SyncEngine<HttpRemoteApi>>,
    pub monitor: NetworkMonitor,
    pub probe: HttpProbe,
}

impl Session {
    /// Probe the API once and feed the result to the monitor.
    pub async fn check_reachability(&self) -> bool {
        let reachable = self.probe.probe().await;
        self.monitor.record_probe(reachable);
        if let Err(error) = self.engine.refresh_status().await {
            tracing::warn!("Failed to refresh sync status: {error}");
        }
        reachable
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("careunity")
        .join("careunity.db")
}

pub fn resolve_config_path(cli_config_path: Option<PathBuf>) -> PathBuf {
    cli_config_path
        .or_else(|| env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("careunity")
        .join("config.json")
}

/// Config file (defaults when missing) with `CAREUNITY_*` overrides applied.
pub fn load_config(path: &Path) -> Result<SyncConfig, CliError> {
    let config = SyncConfig::load_from_path(path)?.with_env_overrides();
    config.validate()?;
    Ok(config)
}

pub async fn open_store(db_path: &Path) -> Result<LocalStore, CliError> {
    Ok(LocalStore::open_path(db_path).await?)
}

pub async fn open_queue(db_path: &Path, config: &SyncConfig) -> Result<OperationQueue, CliError> {
    let store = open_store(db_path).await?;
    Ok(OperationQueue::new(store, config))
}

/// Build the engine; leftovers from an interrupted run go back to `pending`.
pub async fn open_session(db_path: &Path, config: SyncConfig) -> Result<Session, CliError> {
    let Some(api_base_url) = config.api_base_url() else {
        return Err(CliError::SyncNotConfigured);
    };

    let store = open_store(db_path).await?;
    let queue = OperationQueue::new(store.clone(), &config);
    let resolver = ConflictResolver::from_config(&config);
    let remote = HttpRemoteApi::new(&api_base_url, config.request_timeout())?;
    let probe = HttpProbe::new(&api_base_url, config.request_timeout())?;

    // No OS link signal here; reachability alone decides.
    let monitor = NetworkMonitor::new(false);
    monitor.set_link_up(true);

    let engine = SyncEngine::new(store, queue, resolver, remote, monitor.subscribe(), config);
    let recovered = engine.recover().await?;
    if recovered > 0 {
        tracing::info!("Recovered {recovered} operations left in flight");
    }

    Ok(Session {
        engine: Arc::new(engine),
        monitor,
        probe,
    })
}

pub fn parse_entity_type(raw: &str) -> Result<EntityType, CliError> {
    Ok(raw.trim().parse::<EntityType>()?)
}

/// Parse an optional JSON object argument; absent or blank means no fields.
pub fn parse_fields(raw: Option<&str>) -> Result<Map<String, Value>, CliError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(Map::new());
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(CliError::InvalidFields(format!(
            "got {}",
            json_kind(&other)
        ))),
        Err(error) => Err(CliError::InvalidFields(error.to_string())),
    }
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::InvalidId("id cannot be empty".to_string()))
    } else {
        Ok(trimmed.to_string())
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn operation_to_item(operation: &PendingOperation) -> OperationItem {
    OperationItem {
        id: operation.id.to_string(),
        entity_type: operation.entity_type.to_string(),
        entity_id: operation.entity_id.to_string(),
        action: operation.action.to_string(),
        status: operation.status.to_string(),
        retry_count: operation.retry_count,
        base_version: operation.base_version,
        last_error: operation.last_error.clone(),
        created_at: operation.created_at,
        created_at_iso: format_timestamp(operation.created_at),
    }
}

pub fn format_operation_lines(operations: &[PendingOperation]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    operations
        .iter()
        .map(|operation| {
            let id = operation.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let target = format!("{}/{}", operation.entity_type, operation.entity_id);
            let age = format_relative_time(operation.created_at, now_ms);
            let mut line = format!(
                "{short_id:<13}  {:<6}  {:<10}  {target:<40}  {age}",
                operation.action.as_str(),
                operation.status.as_str()
            );
            if operation.retry_count > 0 {
                line.push_str(&format!("  retries={}", operation.retry_count));
            }
            if let Some(error) = &operation.last_error {
                line.push_str(&format!("  error={error}"));
            }
            line
        })
        .collect()
}

pub fn conflict_to_item(conflict: &Conflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id.to_string(),
        entity_type: conflict.entity_type.to_string(),
        entity_id: conflict.entity_id.to_string(),
        status: if conflict.is_pending() {
            "pending".to_string()
        } else {
            "resolved".to_string()
        },
        reason: conflict.reason.clone(),
        local_version: conflict.local_version,
        server_version: conflict.server_version,
        resolution: conflict.resolution.clone(),
        created_at_iso: format_timestamp(conflict.created_at),
    }
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let local = conflict
                .local_version
                .map_or_else(|| "-".to_string(), |version| version.to_string());
            let state = conflict.resolution.as_deref().unwrap_or("pending");
            format!(
                "{}  {}  {}/{}  local={local} server={}  {state}  {}",
                format_timestamp(conflict.created_at),
                conflict.id,
                conflict.entity_type,
                conflict.entity_id,
                conflict.server_version,
                conflict.reason
            )
        })
        .collect()
}

pub fn format_entity_lines(entities: &[Entity]) -> Vec<String> {
    entities
        .iter()
        .map(|entity| {
            let marker = if entity.conflict_id.is_some() {
                "  [conflict]"
            } else {
                ""
            };
            format!(
                "{:<40}  v{:<4}  {}{marker}",
                entity.id.as_str(),
                entity.version,
                fields_preview(&entity.fields, 60)
            )
        })
        .collect()
}

pub fn fields_preview(fields: &Map<String, Value>, max_chars: usize) -> String {
    let rendered = Value::Object(fields.clone()).to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = rendered.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}
