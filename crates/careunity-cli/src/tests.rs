use careunity_core::config::SyncConfig;
use careunity_core::queue::QueueCounts;
use careunity_core::status::SyncReport;
use careunity_core::sync::ManualChoice;
use careunity_core::{Conflict, Entity, EntityId, EntityType, PendingOperation};
use clap::CommandFactory;
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

use crate::cli::{Cli, CompletionShell, ConflictChoice, QueueAction};
use crate::commands::cache::run_cache_clear;
use crate::commands::common::{
    fields_preview, format_conflict_lines, format_operation_lines, format_relative_time,
    format_timestamp, load_config, normalize_identifier, open_queue, open_session, open_store,
    parse_entity_type, parse_fields,
};
use crate::commands::completions::render_completions;
use crate::commands::conflicts::{manual_choice, prune_cutoff, run_conflicts_prune};
use crate::commands::queue::{run_queue_add, run_queue_discard};
use crate::commands::status::{format_status_lines, status_item};
use crate::commands::sync::format_report;
use crate::error::CliError;

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn parse_fields_accepts_objects_only() {
    assert_eq!(
        parse_fields(Some(r#"{"status":"started"}"#)).unwrap(),
        fields(json!({"status": "started"}))
    );
    assert!(parse_fields(None).unwrap().is_empty());
    assert!(parse_fields(Some("   ")).unwrap().is_empty());
    assert!(matches!(
        parse_fields(Some("[1, 2]")),
        Err(CliError::InvalidFields(message)) if message.contains("an array")
    ));
    assert!(matches!(
        parse_fields(Some("{not json")),
        Err(CliError::InvalidFields(_))
    ));
}

#[test]
fn parse_entity_type_accepts_cli_spelling() {
    assert_eq!(parse_entity_type("care-plan").unwrap(), EntityType::CarePlan);
    assert_eq!(parse_entity_type(" check_in ").unwrap(), EntityType::CheckIn);
    assert!(parse_entity_type("invoice").is_err());
}

#[test]
fn normalize_identifier_rejects_empty() {
    assert!(matches!(
        normalize_identifier(" \n "),
        Err(CliError::InvalidId(_))
    ));
    assert_eq!(normalize_identifier("  v1  ").unwrap(), "v1");
}

#[test]
fn format_timestamp_returns_utc_label() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn fields_preview_truncates_with_ellipsis() {
    let preview = fields_preview(&fields(json!({"content": "a long line of visit notes"})), 20);
    assert_eq!(preview.chars().count(), 20);
    assert!(preview.ends_with("..."));
    assert_eq!(fields_preview(&Map::new(), 20), "{}");
}

#[test]
fn format_operation_lines_include_target_and_error() {
    let mut operation = PendingOperation::update(
        EntityType::Visit,
        EntityId::from("v1"),
        fields(json!({"status": "started"})),
        Some(3),
    );
    operation.retry_count = 2;
    operation.last_error = Some("HTTP 503".to_string());

    let rendered = format_operation_lines(&[operation]);
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].contains("update"));
    assert!(rendered[0].contains("visit/v1"));
    assert!(rendered[0].contains("retries=2"));
    assert!(rendered[0].contains("error=HTTP 503"));
}

#[test]
fn format_conflict_lines_include_versions_and_state() {
    let server = Entity::new(EntityType::Note, EntityId::from("n1"), 4, Map::new());
    let pending = Conflict::new(None, None, &server, Some(2));
    let mut resolved = Conflict::new(None, None, &server, None);
    resolved.resolve("server-wins");

    let rendered = format_conflict_lines(&[pending, resolved]);
    assert!(rendered[0].contains("note/n1"));
    assert!(rendered[0].contains("local=2 server=4"));
    assert!(rendered[0].contains("pending"));
    assert!(rendered[1].contains("local=- server=4"));
    assert!(rendered[1].contains("server-wins"));
}

#[test]
fn status_lines_report_connectivity() {
    let counts = QueueCounts {
        pending: 3,
        syncing: 1,
        conflicted: 1,
        failed: 2,
    };
    let status = status_item(&counts, None, None, None);
    let rendered = format_status_lines(&status);
    assert!(rendered.contains(&"pending:    3".to_string()));
    assert!(rendered.contains(&"network:    not configured".to_string()));
    assert!(rendered.iter().any(|line| line.starts_with("in flight:  1")));

    let online = status_item(&QueueCounts::default(), Some(0), None, Some(true));
    let rendered = format_status_lines(&online);
    assert!(rendered.contains(&"network:    online".to_string()));
    assert!(rendered.contains(&"next retry: 1970-01-01 00:00:00 UTC".to_string()));
}

#[test]
fn format_report_flags_aborted_cycles() {
    let report = SyncReport {
        synced: 2,
        aborted: true,
        ..SyncReport::default()
    };
    let line = format_report(&report);
    assert!(line.starts_with("Synced 2"));
    assert!(line.contains("connection lost"));
}

#[test]
fn merge_choice_requires_fields() {
    assert!(matches!(
        manual_choice(ConflictChoice::Merge, None),
        Err(CliError::InvalidFields(_))
    ));
    assert_eq!(
        manual_choice(ConflictChoice::Merge, Some(r#"{"goal":"rest"}"#)).unwrap(),
        ManualChoice::Merge(fields(json!({"goal": "rest"})))
    );
    assert_eq!(
        manual_choice(ConflictChoice::UseServer, Some("ignored")).unwrap(),
        ManualChoice::UseServer
    );
}

#[test]
fn completions_name_the_binary() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("careunity"));
}

#[test]
fn load_config_reads_file_and_rejects_invalid_values() {
    let tmp = tempfile::tempdir().unwrap();
    let missing = tmp.path().join("missing.json");
    assert_eq!(load_config(&missing).unwrap().batch_size, SyncConfig::default().batch_size);

    let path = tmp.path().join("config.json");
    std::fs::write(&path, r#"{"batch_size": 5, "strategies": {"visit": "server-wins"}}"#).unwrap();
    let config = load_config(&path).unwrap();
    assert_eq!(config.batch_size, 5);
    assert_eq!(config.strategies.get("visit").map(String::as_str), Some("server-wins"));

    std::fs::write(&path, r#"{"batch_size": 0}"#).unwrap();
    assert!(load_config(&path).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn session_requires_api_url() {
    let tmp = tempfile::tempdir().unwrap();
    let result = open_session(&tmp.path().join("careunity.db"), SyncConfig::default()).await;
    assert!(matches!(result, Err(CliError::SyncNotConfigured)));
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_add_records_changes_offline() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("careunity.db");
    let config_path = tmp.path().join("config.json");

    run_queue_add(
        QueueAction::Create,
        "note",
        None,
        Some(r#"{"content":"called patient"}"#),
        &db_path,
        &config_path,
    )
    .await
    .unwrap();

    let queue = open_queue(&db_path, &SyncConfig::default()).await.unwrap();
    let queued = queue.list().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].entity_id.is_temporary());

    let missing_id = run_queue_add(
        QueueAction::Update,
        "note",
        None,
        Some(r#"{"content":"x"}"#),
        &db_path,
        &config_path,
    )
    .await;
    assert!(matches!(missing_id, Err(CliError::MissingId("update"))));

    run_queue_discard(&queued[0].id.to_string(), &db_path, &config_path)
        .await
        .unwrap();
    assert!(queue.list().await.unwrap().is_empty());

    let unknown = run_queue_discard(&queued[0].id.to_string(), &db_path, &config_path).await;
    assert!(matches!(unknown, Err(CliError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_clear_removes_cached_records() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("careunity.db");
    {
        let store = open_store(&db_path).await.unwrap();
        store
            .put_entity(&Entity::new(
                EntityType::Task,
                EntityId::from("t1"),
                1,
                fields(json!({"title": "Refill"})),
            ))
            .await
            .unwrap();
    }

    run_cache_clear("task", &db_path).await.unwrap();

    let store = open_store(&db_path).await.unwrap();
    assert!(store.list_entities(EntityType::Task).await.unwrap().is_empty());
}

#[test]
fn prune_cutoff_counts_whole_days_back() {
    let day = 24 * 60 * 60 * 1_000;
    assert_eq!(prune_cutoff(0, 5 * day), 5 * day);
    assert_eq!(prune_cutoff(2, 5 * day), 3 * day);
    assert_eq!(prune_cutoff(u64::MAX, 0), -i64::MAX);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicts_prune_removes_only_old_resolved_records() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("careunity.db");
    let config_path = tmp.path().join("config.json");
    let server = Entity::new(EntityType::Note, EntityId::from("n1"), 2, Map::new());

    let mut old = Conflict::new(None, None, &server, Some(1));
    old.resolve("server-wins");
    old.resolved_at = Some(1);
    let mut fresh = Conflict::new(None, None, &server, Some(1));
    fresh.resolve("server-wins");
    let open = Conflict::new(None, None, &server, Some(1));
    {
        let store = open_store(&db_path).await.unwrap();
        for conflict in [&old, &fresh, &open] {
            store.put_conflict(conflict).await.unwrap();
        }
    }

    let pruned = run_conflicts_prune(None, &db_path, &config_path).await.unwrap();
    assert_eq!(pruned, 1);

    std::fs::write(&config_path, r#"{"conflict_retention_days": 0}"#).unwrap();
    assert_eq!(run_conflicts_prune(None, &db_path, &config_path).await.unwrap(), 0);

    let remaining = open_store(&db_path).await.unwrap().list_conflicts(true).await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|conflict| conflict.id != old.id));
}
