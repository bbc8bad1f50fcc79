//! JSON-schema documents and default payloads served to the configuration UI.

use crate::collections::StrategyKind;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;

pub fn collection_schema() -> JsonValue {
    let class_names: Vec<&str> = StrategyKind::ALL
        .iter()
        .map(|kind| kind.class_name())
        .collect();
    json!({
        "type": "object",
        "properties": {
            "identifier": {
                "type": "string",
                "title": "Identifier",
                "pattern": "^[A-Za-z_][A-Za-z0-9_]*$",
            },
            "display_name": { "type": "string", "title": "Name", "default": "" },
            "schedule": { "type": "string", "title": "Schedule" },
            "enabled": { "type": "boolean", "title": "Enabled", "default": true },
            "class_name": {
                "type": "string",
                "title": "Class name",
                "enum": class_names,
            },
            "settings": { "type": "object", "title": "Settings", "default": {} },
        },
        "required": ["identifier", "schedule", "class_name"],
    })
}

pub fn schedule_schema(post_commands: &BTreeMap<String, Vec<String>>) -> JsonValue {
    let mut post_command_ids: Vec<String> = vec![String::new()];
    post_command_ids.extend(post_commands.keys().cloned());
    json!({
        "type": "object",
        "properties": {
            "identifier": {
                "type": "string",
                "title": "Identifier",
                "pattern": "^[A-Za-z_][A-Za-z0-9_]*$",
            },
            "display_name": { "type": "string", "title": "Name", "default": "" },
            "hostname": { "type": "string", "title": "Hostname" },
            "schedule": { "type": "string", "title": "Schedule" },
            "enabled": { "type": "boolean", "title": "Enabled", "default": true },
            "filter": { "type": "string", "title": "Filter", "default": "true" },
            "order": {
                "type": "string",
                "title": "Order",
                "enum": ["SHUFFLE", "CHRONOLOGICAL_DESCENDING", "CHRONOLOGICAL_ASCENDING"],
                "default": "SHUFFLE",
            },
            "post_command_id": {
                "type": "string",
                "title": "Post command",
                "enum": post_command_ids,
                "default": "",
            },
            "affiche_options": {
                "type": "object",
                "title": "Affiche options",
                "default": {},
            },
        },
        "required": ["identifier", "hostname", "schedule"],
    })
}

pub fn default_collection() -> JsonValue {
    json!({
        "identifier": "local",
        "display_name": "local",
        "schedule": "0 */1 * * *",
        "enabled": true,
        "class_name": StrategyKind::FileSystem.class_name(),
        "settings": StrategyKind::FileSystem.settings_default(),
    })
}

pub fn default_schedule() -> JsonValue {
    json!({
        "identifier": "local",
        "display_name": "local",
        "hostname": "localhost",
        "schedule": "*/15 * * * *",
        "enabled": true,
        "filter": "true",
        "order": "SHUFFLE",
        "post_command_id": "",
        "affiche_options": {},
    })
}
