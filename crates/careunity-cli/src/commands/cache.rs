use std::path::Path;

use careunity_core::db::Collection;
use careunity_core::EntityId;

use crate::cli::CacheCommands;
use crate::commands::common::{
    format_entity_lines, normalize_identifier, open_store, parse_entity_type,
};
use crate::error::CliError;

pub async fn run_cache(command: CacheCommands, db_path: &Path) -> Result<(), CliError> {
    match command {
        CacheCommands::Show {
            entity_type,
            id,
            json,
        } => run_cache_show(&entity_type, id.as_deref(), json, db_path).await,
        CacheCommands::Clear { entity_type } => run_cache_clear(&entity_type, db_path).await,
    }
}

pub async fn run_cache_show(
    entity_type: &str,
    id: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity_type)?;
    let store = open_store(db_path).await?;

    let entities = match id {
        Some(id) => {
            let id = EntityId::new(normalize_identifier(id)?);
            let entity = store
                .get_entity(entity_type, &id)
                .await?
                .ok_or_else(|| CliError::NotFound(format!("{entity_type}/{id}")))?;
            vec![entity]
        }
        None => store.list_entities(entity_type).await?,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entities)?);
        return Ok(());
    }

    if entities.is_empty() {
        println!("No cached {entity_type} records.");
        return Ok(());
    }

    for line in format_entity_lines(&entities) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_cache_clear(entity_type: &str, db_path: &Path) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity_type)?;
    let removed = open_store(db_path)
        .await?
        .clear(Collection::Entities(entity_type))
        .await?;
    println!("Removed {removed} cached {entity_type} records");
    Ok(())
}
