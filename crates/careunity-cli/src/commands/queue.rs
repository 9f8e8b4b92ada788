use std::path::Path;

use careunity_core::queue::{EnqueueOutcome, OperationQueue};
use careunity_core::services::ChangeRecorder;
use careunity_core::{EntityId, OperationId};

use crate::cli::{QueueAction, QueueCommands};
use crate::commands::common::{
    format_operation_lines, load_config, normalize_identifier, open_queue, open_store,
    operation_to_item, parse_entity_type, parse_fields, OperationItem,
};
use crate::error::CliError;

pub async fn run_queue(
    command: QueueCommands,
    db_path: &Path,
    config_path: &Path,
) -> Result<(), CliError> {
    match command {
        QueueCommands::Add {
            action,
            entity_type,
            id,
            fields,
        } => {
            run_queue_add(
                action,
                &entity_type,
                id.as_deref(),
                fields.as_deref(),
                db_path,
                config_path,
            )
            .await
        }
        QueueCommands::List { json } => run_queue_list(json, db_path, config_path).await,
        QueueCommands::Retry => run_queue_retry(db_path, config_path).await,
        QueueCommands::Discard { id } => run_queue_discard(&id, db_path, config_path).await,
    }
}

pub async fn run_queue_add(
    action: QueueAction,
    entity_type: &str,
    id: Option<&str>,
    fields: Option<&str>,
    db_path: &Path,
    config_path: &Path,
) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let entity_type = parse_entity_type(entity_type)?;
    let fields = parse_fields(fields)?;
    let store = open_store(db_path).await?;
    let queue = OperationQueue::new(store.clone(), &config);
    let recorder = ChangeRecorder::new(store, queue);

    match action {
        QueueAction::Create => {
            let entity = recorder.create(entity_type, fields).await?;
            println!("Queued create {}", entity.key());
        }
        QueueAction::Update => {
            let id = EntityId::new(normalize_identifier(id.ok_or(CliError::MissingId("update"))?)?);
            let entity = recorder.update(entity_type, &id, fields).await?;
            println!("Queued update {}", entity.key());
        }
        QueueAction::Delete => {
            let id = EntityId::new(normalize_identifier(id.ok_or(CliError::MissingId("delete"))?)?);
            if let EnqueueOutcome::Cancelled { .. } = recorder.delete(entity_type, &id).await? {
                println!("Dropped unsynced {entity_type}/{id}; nothing to send");
            } else {
                println!("Queued delete {entity_type}/{id}");
            }
        }
    }

    Ok(())
}

pub async fn run_queue_list(
    as_json: bool,
    db_path: &Path,
    config_path: &Path,
) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let operations = open_queue(db_path, &config).await?.list().await?;

    if as_json {
        let json_items = operations
            .iter()
            .map(operation_to_item)
            .collect::<Vec<OperationItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for line in format_operation_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_queue_retry(db_path: &Path, config_path: &Path) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let retried = open_queue(db_path, &config).await?.retry_failed().await?;
    println!("Re-queued {retried} failed operations");
    Ok(())
}

pub async fn run_queue_discard(
    id: &str,
    db_path: &Path,
    config_path: &Path,
) -> Result<(), CliError> {
    let raw = normalize_identifier(id)?;
    let operation_id = raw
        .parse::<OperationId>()
        .map_err(|error| CliError::InvalidId(format!("{raw}: {error}")))?;

    let config = load_config(config_path)?;
    if !open_queue(db_path, &config).await?.discard(&operation_id).await? {
        return Err(CliError::NotFound(format!("operation {operation_id}")));
    }
    println!("Discarded {operation_id}");
    Ok(())
}
