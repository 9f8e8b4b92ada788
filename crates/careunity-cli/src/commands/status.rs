use std::path::Path;

use careunity_core::network::{HttpProbe, Probe};
use careunity_core::queue::QueueCounts;
use serde::Serialize;

use crate::commands::common::{format_timestamp, load_config, open_queue};
use crate::error::CliError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusItem {
    pub pending_operations_count: usize,
    pub syncing_operations_count: usize,
    pub error_operations_count: usize,
    pub conflict_count: usize,
    pub next_attempt_at: Option<String>,
    pub api_base_url: Option<String>,
    /// `None` when no API is configured
    pub is_online: Option<bool>,
}

pub async fn run_status(as_json: bool, db_path: &Path, config_path: &Path) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let queue = open_queue(db_path, &config).await?;
    let counts = queue.counts().await?;
    let next_attempt_at = queue.next_attempt_at().await?;

    let api_base_url = config.api_base_url();
    let is_online = match &api_base_url {
        Some(url) => Some(
            HttpProbe::new(url, config.request_timeout())?
                .probe()
                .await,
        ),
        None => None,
    };

    let status = status_item(&counts, next_attempt_at, api_base_url, is_online);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn status_item(
    counts: &QueueCounts,
    next_attempt_at: Option<i64>,
    api_base_url: Option<String>,
    is_online: Option<bool>,
) -> StatusItem {
    StatusItem {
        pending_operations_count: counts.pending,
        syncing_operations_count: counts.syncing,
        error_operations_count: counts.failed,
        conflict_count: counts.conflicted,
        next_attempt_at: next_attempt_at.map(format_timestamp),
        api_base_url,
        is_online,
    }
}

pub fn format_status_lines(status: &StatusItem) -> Vec<String> {
    let connectivity = match status.is_online {
        Some(true) => "online",
        Some(false) => "offline",
        None => "not configured",
    };

    let mut lines = vec![
        format!("pending:    {}", status.pending_operations_count),
        format!("failed:     {}", status.error_operations_count),
        format!("conflicts:  {}", status.conflict_count),
        format!("network:    {connectivity}"),
    ];
    if status.syncing_operations_count > 0 {
        lines.push(format!(
            "in flight:  {} (interrupted run; recovered on next sync)",
            status.syncing_operations_count
        ));
    }
    if let Some(at) = &status.next_attempt_at {
        lines.push(format!("next retry: {at}"));
    }
    lines
}
