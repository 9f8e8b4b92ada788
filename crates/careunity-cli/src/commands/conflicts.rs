use std::path::Path;

use careunity_core::sync::ManualChoice;
use careunity_core::ConflictId;
use chrono::Utc;

use crate::cli::{ConflictChoice, ConflictCommands};
use crate::commands::common::{
    conflict_to_item, format_conflict_lines, load_config, normalize_identifier, open_session,
    open_store, parse_fields, ConflictItem,
};
use crate::error::CliError;

const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

pub async fn run_conflicts(
    command: ConflictCommands,
    db_path: &Path,
    config_path: &Path,
) -> Result<(), CliError> {
    match command {
        ConflictCommands::List { all, json } => run_conflicts_list(all, json, db_path).await,
        ConflictCommands::Resolve { id, choice, fields } => {
            run_conflicts_resolve(&id, choice, fields.as_deref(), db_path, config_path).await
        }
        ConflictCommands::Prune { older_than_days } => {
            run_conflicts_prune(older_than_days, db_path, config_path)
                .await
                .map(|_| ())
        }
    }
}

pub async fn run_conflicts_list(
    include_resolved: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let conflicts = open_store(db_path)
        .await?
        .list_conflicts(include_resolved)
        .await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_resolve(
    id: &str,
    choice: ConflictChoice,
    fields: Option<&str>,
    db_path: &Path,
    config_path: &Path,
) -> Result<(), CliError> {
    let raw = normalize_identifier(id)?;
    let conflict_id = raw
        .parse::<ConflictId>()
        .map_err(|error| CliError::InvalidId(format!("{raw}: {error}")))?;
    let choice = manual_choice(choice, fields)?;

    let config = load_config(config_path)?;
    let session = open_session(db_path, config).await?;
    let conflict = session
        .engine
        .resolve_conflict_manually(&conflict_id, choice)
        .await?;

    println!(
        "Resolved {} on {}/{} ({})",
        conflict.id,
        conflict.entity_type,
        conflict.entity_id,
        conflict.resolution.as_deref().unwrap_or_default()
    );
    Ok(())
}

pub async fn run_conflicts_prune(
    older_than_days: Option<u64>,
    db_path: &Path,
    config_path: &Path,
) -> Result<usize, CliError> {
    let days = match older_than_days {
        Some(days) => days,
        None => match load_config(config_path)?.conflict_retention_days {
            0 => {
                println!("Conflict retention is unlimited; nothing pruned.");
                return Ok(0);
            }
            days => days,
        },
    };
    let cutoff = prune_cutoff(days, Utc::now().timestamp_millis());
    let pruned = open_store(db_path)
        .await?
        .prune_resolved_conflicts(cutoff)
        .await?;

    println!("Pruned {pruned} resolved conflicts older than {days} days.");
    Ok(pruned)
}

pub fn prune_cutoff(days: u64, now_ms: i64) -> i64 {
    let days = i64::try_from(days).unwrap_or(i64::MAX);
    now_ms.saturating_sub(days.saturating_mul(DAY_MS))
}

pub fn manual_choice(choice: ConflictChoice, fields: Option<&str>) -> Result<ManualChoice, CliError> {
    match choice {
        ConflictChoice::UseClient => Ok(ManualChoice::UseClient),
        ConflictChoice::UseServer => Ok(ManualChoice::UseServer),
        ConflictChoice::Merge => {
            let fields = parse_fields(fields)?;
            if fields.is_empty() {
                return Err(CliError::InvalidFields(
                    "merge needs --fields with the merged record".to_string(),
                ));
            }
            Ok(ManualChoice::Merge(fields))
        }
    }
}
