use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] careunity_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Fields must be a JSON object: {0}")]
    InvalidFields(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("{0} requires an entity id")]
    MissingId(&'static str),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Set api_base_url in the config file or CAREUNITY_API_URL in the environment."
    )]
    SyncNotConfigured,
}
