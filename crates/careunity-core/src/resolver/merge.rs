//! Field-level merge of a local and a server copy

use serde_json::{Map, Value};

use crate::models::{parse_timestamp, Entity, UPDATED_AT_FIELD};

/// Label placed between server text and the appended offline text
pub const ADDENDUM_SEPARATOR: &str = "\n\n--- Offline addendum ---\n";

/// Free-text fields that are concatenated instead of overwritten
pub const NOTE_FIELDS: [&str; 5] = ["notes", "note", "content", "comments", "description"];

const STATUS_FIELD: &str = "status";
const STATUS_UPDATED_AT_FIELD: &str = "statusUpdatedAt";

/// Merge `local` into `server`.
///
/// Returns `None` when the two copies do not describe the same kind of
/// entity.
pub fn merge_entities(local: &Entity, server: &Entity) -> Option<Entity> {
    if local.entity_type != server.entity_type {
        return None;
    }

    let mut merged = server.clone();
    merged.conflict_id = None;

    for (key, local_value) in &local.fields {
        match key.as_str() {
            UPDATED_AT_FIELD | STATUS_UPDATED_AT_FIELD => {}
            STATUS_FIELD => merge_status(&mut merged.fields, &local.fields),
            _ => {
                let Some(server_value) = server.fields.get(key) else {
                    merged.fields.insert(key.clone(), local_value.clone());
                    continue;
                };
                if let Some(value) = merge_value(key, local_value, server_value) {
                    merged.fields.insert(key.clone(), value);
                }
            }
        }
    }

    if let Some(updated_at) = later_timestamp(local, server) {
        merged
            .fields
            .insert(UPDATED_AT_FIELD.to_string(), updated_at);
    }

    Some(merged)
}

/// Merged value for a field present on both sides; `None` keeps the server value
fn merge_value(key: &str, local: &Value, server: &Value) -> Option<Value> {
    if local == server {
        return None;
    }

    match (local, server) {
        (Value::String(local_text), Value::String(server_text)) if is_note_field(key) => {
            merge_text(local_text, server_text).map(Value::String)
        }
        (Value::Array(local_items), Value::Array(server_items)) => {
            merge_items(local_items, server_items).map(Value::Array)
        }
        _ => None,
    }
}

fn is_note_field(key: &str) -> bool {
    NOTE_FIELDS
        .iter()
        .any(|field| field.eq_ignore_ascii_case(key))
}

/// Server text followed by the labeled client text
fn merge_text(local: &str, server: &str) -> Option<String> {
    if local.trim().is_empty() {
        return None;
    }
    if server.trim().is_empty() {
        return Some(local.to_string());
    }
    if server.contains(&format!("{ADDENDUM_SEPARATOR}{local}")) {
        return None;
    }
    Some(format!("{server}{ADDENDUM_SEPARATOR}{local}"))
}

/// The side whose `statusUpdatedAt` is later decides `status`.
fn merge_status(merged: &mut Map<String, Value>, local: &Map<String, Value>) {
    let Some(local_status) = local.get(STATUS_FIELD) else {
        return;
    };
    if !merged.contains_key(STATUS_FIELD) {
        merged.insert(STATUS_FIELD.to_string(), local_status.clone());
        if let Some(at) = local.get(STATUS_UPDATED_AT_FIELD) {
            merged.insert(STATUS_UPDATED_AT_FIELD.to_string(), at.clone());
        }
        return;
    }

    let local_at = local.get(STATUS_UPDATED_AT_FIELD).and_then(parse_timestamp);
    let server_at = merged.get(STATUS_UPDATED_AT_FIELD).and_then(parse_timestamp);
    let local_is_newer = match (local_at, server_at) {
        (Some(local_at), Some(server_at)) => local_at > server_at,
        (Some(_), None) => true,
        _ => false,
    };

    if local_is_newer {
        merged.insert(STATUS_FIELD.to_string(), local_status.clone());
        if let Some(at) = local.get(STATUS_UPDATED_AT_FIELD) {
            merged.insert(STATUS_UPDATED_AT_FIELD.to_string(), at.clone());
        }
    }
}

/// Item-by-item merge of arrays of objects keyed by `id`.
///
/// Server order is kept; items only the client has are appended. Arrays
/// holding anything else are left to the server.
fn merge_items(local: &[Value], server: &[Value]) -> Option<Vec<Value>> {
    if !local.iter().chain(server).all(|item| item_id(item).is_some()) {
        return None;
    }

    let mut merged: Vec<Value> = server
        .iter()
        .map(|server_item| {
            let local_item = local
                .iter()
                .find(|item| item_id(item) == item_id(server_item));
            match local_item {
                Some(local_item) if item_is_newer(local_item, server_item) => local_item.clone(),
                _ => server_item.clone(),
            }
        })
        .collect();

    for local_item in local {
        let id = item_id(local_item);
        if !server.iter().any(|item| item_id(item) == id) {
            merged.push(local_item.clone());
        }
    }

    Some(merged)
}

fn item_id(item: &Value) -> Option<String> {
    match item.as_object()?.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn item_is_newer(local: &Value, server: &Value) -> bool {
    let local_at = local.get(UPDATED_AT_FIELD).and_then(parse_timestamp);
    let server_at = server.get(UPDATED_AT_FIELD).and_then(parse_timestamp);
    match (local_at, server_at) {
        (Some(local_at), Some(server_at)) => local_at > server_at,
        (Some(_), None) => true,
        _ => false,
    }
}

fn later_timestamp(local: &Entity, server: &Entity) -> Option<Value> {
    match (local.updated_at(), server.updated_at()) {
        (Some(local_at), Some(server_at)) if local_at > server_at => {
            local.field(UPDATED_AT_FIELD).cloned()
        }
        (Some(_), None) => local.field(UPDATED_AT_FIELD).cloned(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityId, EntityType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entity(entity_type: EntityType, version: i64, fields: Value) -> Entity {
        Entity::new(
            entity_type,
            EntityId::from("e1"),
            version,
            fields.as_object().cloned().unwrap(),
        )
    }

    #[test]
    fn note_text_gets_labeled_addendum() {
        let local = entity(
            EntityType::Note,
            1,
            json!({"content": "called patient", "updatedAt": 1_000}),
        );
        let server = entity(
            EntityType::Note,
            2,
            json!({"content": "called patient, left voicemail", "updatedAt": 2_000}),
        );

        let merged = merge_entities(&local, &server).unwrap();
        assert_eq!(
            merged.field("content"),
            Some(&json!(
                "called patient, left voicemail\n\n--- Offline addendum ---\ncalled patient"
            ))
        );
        assert_eq!(merged.version, 2);
        assert_eq!(merged.updated_at(), Some(2_000));
    }

    #[test]
    fn addendum_is_not_appended_twice() {
        let local = entity(EntityType::Note, 1, json!({"notes": "fed cat"}));
        let server = entity(
            EntityType::Note,
            3,
            json!({"notes": "walked dog\n\n--- Offline addendum ---\nfed cat"}),
        );
        let merged = merge_entities(&local, &server).unwrap();
        assert_eq!(merged.field("notes"), server.field("notes"));
    }

    #[test]
    fn status_follows_latest_status_change() {
        let local = entity(
            EntityType::Visit,
            1,
            json!({"status": "completed", "statusUpdatedAt": 5_000}),
        );
        let server = entity(
            EntityType::Visit,
            2,
            json!({"status": "started", "statusUpdatedAt": 4_000}),
        );
        let merged = merge_entities(&local, &server).unwrap();
        assert_eq!(merged.field("status"), Some(&json!("completed")));
        assert_eq!(merged.field("statusUpdatedAt"), Some(&json!(5_000)));

        let stale = entity(
            EntityType::Visit,
            1,
            json!({"status": "scheduled", "statusUpdatedAt": 1_000}),
        );
        let merged = merge_entities(&stale, &server).unwrap();
        assert_eq!(merged.field("status"), Some(&json!("started")));
    }

    #[test]
    fn keyed_items_merge_independently() {
        let local = entity(
            EntityType::CarePlan,
            1,
            json!({"tasks": [
                {"id": "a", "done": true, "updatedAt": 300},
                {"id": "b", "done": false, "updatedAt": 100},
                {"id": "c", "done": false, "updatedAt": 100}
            ]}),
        );
        let server = entity(
            EntityType::CarePlan,
            2,
            json!({"tasks": [
                {"id": "a", "done": false, "updatedAt": 200},
                {"id": "b", "done": true, "updatedAt": 200},
                {"id": "d", "done": false, "updatedAt": 200}
            ]}),
        );

        let merged = merge_entities(&local, &server).unwrap();
        assert_eq!(
            merged.field("tasks"),
            Some(&json!([
                {"id": "a", "done": true, "updatedAt": 300},
                {"id": "b", "done": true, "updatedAt": 200},
                {"id": "d", "done": false, "updatedAt": 200},
                {"id": "c", "done": false, "updatedAt": 100}
            ]))
        );
    }

    #[test]
    fn plain_arrays_and_scalars_keep_server_value() {
        let local = entity(EntityType::Task, 1, json!({"tags": ["a"], "priority": 1}));
        let server = entity(EntityType::Task, 2, json!({"tags": ["b"], "priority": 3}));
        let merged = merge_entities(&local, &server).unwrap();
        assert_eq!(merged.field("tags"), Some(&json!(["b"])));
        assert_eq!(merged.field("priority"), Some(&json!(3)));
    }

    #[test]
    fn swapped_roles_keep_every_field() {
        let a = entity(
            EntityType::Visit,
            1,
            json!({"notes": "left early", "mileage": 12, "updatedAt": 10}),
        );
        let b = entity(
            EntityType::Visit,
            2,
            json!({"notes": "family present", "medsGiven": true, "updatedAt": 20}),
        );

        let forward = merge_entities(&a, &b).unwrap();
        let backward = merge_entities(&b, &a).unwrap();
        for merged in [&forward, &backward] {
            for key in a.fields.keys().chain(b.fields.keys()) {
                assert!(merged.fields.contains_key(key), "missing {key}");
            }
            let notes = merged.field("notes").and_then(Value::as_str).unwrap();
            assert!(notes.contains("left early") && notes.contains("family present"));
            assert_eq!(merged.updated_at(), Some(20));
        }
    }

    #[test]
    fn mismatched_types_do_not_merge() {
        let local = entity(EntityType::Task, 1, json!({}));
        let server = entity(EntityType::Note, 1, json!({}));
        assert!(merge_entities(&local, &server).is_none());
    }
}
