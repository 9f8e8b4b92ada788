//! Remote API seam
//!
//! The sync engine talks to the authoritative server only through
//! [`RemoteApi`]. [`HttpRemoteApi`] is the REST client used in production.

use std::future::Future;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::models::{Entity, EntityId, EntityType};
use crate::util::{compact_text, is_http_url};

/// How a remote write failed
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The server holds a newer version; carries its current copy
    #[error("version conflict: server holds version {}", server.version)]
    Conflict { server: Box<Entity> },
    /// Network, timeout or server-side trouble worth retrying
    #[error("transient failure: {0}")]
    Transient(String),
    /// Rejected request that will not succeed on retry
    #[error("rejected with HTTP {status}: {message}")]
    Permanent { status: u16, message: String },
}

impl RemoteError {
    pub fn conflict(server: Entity) -> Self {
        Self::Conflict {
            server: Box::new(server),
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// CRUD surface of the authoritative server.
///
/// Writes carry the version the change was based on; a mismatch comes back
/// as [`RemoteError::Conflict`].
pub trait RemoteApi: Send + Sync {
    /// Create an entity; `client_id` is the device's temporary id.
    fn create(
        &self,
        entity_type: EntityType,
        client_id: &EntityId,
        payload: &Map<String, Value>,
    ) -> impl Future<Output = RemoteResult<Entity>> + Send;

    fn update(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        payload: &Map<String, Value>,
        base_version: Option<i64>,
    ) -> impl Future<Output = RemoteResult<Entity>> + Send;

    fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        base_version: Option<i64>,
    ) -> impl Future<Output = RemoteResult<()>> + Send;
}

/// REST client for `{base}/api/{collection}[/{id}]`.
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(Error::Config(
                "API base URL must include http:// or https://".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("Failed to construct HTTP client: {error}")))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/api/{}", self.base_url, entity_type.api_path())
    }

    fn entity_url(&self, entity_type: EntityType, id: &EntityId) -> String {
        format!(
            "{}/{}",
            self.collection_url(entity_type),
            urlencoding::encode(id.as_str())
        )
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        base_version: Option<i64>,
        body: Option<&Value>,
    ) -> RemoteResult<(StatusCode, String)> {
        let mut request = self
            .client
            .request(method, &url)
            .header("Accept", "application/json");
        if let Some(version) = base_version {
            request = request.header(reqwest::header::IF_MATCH, format!("\"{version}\""));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| RemoteError::Transient(format!("request to {url} failed: {error}")))?;
        let status = response.status();
        let text = response.text().await.map_err(|error| {
            RemoteError::Transient(format!("failed to read response from {url}: {error}"))
        })?;
        Ok((status, text))
    }
}

impl RemoteApi for HttpRemoteApi {
    async fn create(
        &self,
        entity_type: EntityType,
        client_id: &EntityId,
        payload: &Map<String, Value>,
    ) -> RemoteResult<Entity> {
        let mut body = payload.clone();
        if client_id.is_temporary() {
            body.remove("id");
            body.insert("clientId".to_string(), Value::from(client_id.as_str()));
        }
        body.remove("version");

        let (status, text) = self
            .send(
                Method::POST,
                self.collection_url(entity_type),
                None,
                Some(&Value::Object(body)),
            )
            .await?;
        classify_response(status, &text, entity_type, None)?;
        parse_entity(&text, entity_type, None).ok_or_else(|| RemoteError::Permanent {
            status: status.as_u16(),
            message: "create response did not contain the created entity".to_string(),
        })
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        payload: &Map<String, Value>,
        base_version: Option<i64>,
    ) -> RemoteResult<Entity> {
        let mut body = payload.clone();
        body.insert("id".to_string(), Value::from(id.as_str()));
        match base_version {
            Some(version) => body.insert("version".to_string(), Value::from(version)),
            None => body.remove("version"),
        };

        let (status, text) = self
            .send(
                Method::PUT,
                self.entity_url(entity_type, id),
                base_version,
                Some(&Value::Object(body)),
            )
            .await?;
        classify_response(status, &text, entity_type, Some(id))?;

        // Servers answering 204 still applied the write.
        Ok(parse_entity(&text, entity_type, Some(id)).unwrap_or_else(|| {
            let version = base_version.unwrap_or(0).saturating_add(1);
            let mut entity = Entity::new(entity_type, id.clone(), version, Map::new());
            entity.apply_payload(payload);
            entity.version = version;
            entity
        }))
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        base_version: Option<i64>,
    ) -> RemoteResult<()> {
        let (status, text) = self
            .send(
                Method::DELETE,
                self.entity_url(entity_type, id),
                base_version,
                None,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            tracing::debug!("{entity_type}/{id} was already gone on the server");
            return Ok(());
        }
        classify_response(status, &text, entity_type, Some(id))
    }
}

/// Map a non-success response onto the error taxonomy.
fn classify_response(
    status: StatusCode,
    body: &str,
    entity_type: EntityType,
    id: Option<&EntityId>,
) -> RemoteResult<()> {
    if status.is_success() {
        return Ok(());
    }

    if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
        return match parse_conflict_body(body, entity_type, id) {
            Some(server) => Err(RemoteError::conflict(server)),
            None => Err(RemoteError::Permanent {
                status: status.as_u16(),
                message: format!(
                    "version conflict without a server copy: {}",
                    compact_text(body)
                ),
            }),
        };
    }

    if is_transient_status(status) {
        return Err(RemoteError::Transient(format!(
            "HTTP {}: {}",
            status.as_u16(),
            compact_text(body)
        )));
    }

    Err(RemoteError::Permanent {
        status: status.as_u16(),
        message: parse_error_message(body),
    })
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Server copy from a conflict body: `{ "current": {...} }` or the entity itself.
fn parse_conflict_body(body: &str, entity_type: EntityType, id: Option<&EntityId>) -> Option<Entity> {
    let value: Value = serde_json::from_str(body).ok()?;
    let current = match value {
        Value::Object(mut object) if object.contains_key("current") => object.remove("current")?,
        other => other,
    };
    Entity::from_json(entity_type, id, current).ok()
}

fn parse_entity(body: &str, entity_type: EntityType, id: Option<&EntityId>) -> Option<Entity> {
    if body.trim().is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(body).ok()?;
    let value = match value {
        Value::Object(mut object) if object.contains_key("data") => object.remove("data")?,
        other => other,
    };
    Entity::from_json(entity_type, id, value).ok()
}

fn parse_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["message", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str).map(ToString::to_string))
        })
        .unwrap_or_else(|| compact_text(body))
}
