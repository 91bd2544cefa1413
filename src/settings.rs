use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel::PgConnection;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::models::NewDeviceSettingsRow;
use crate::schema::device_settings;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings must be a JSON object")]
    NotAnObject,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

/// Known settings paths. Anything outside this allow-list is dropped on both
/// read and write so unexpected fields never round-trip through storage.
const ALLOWED: &[(&str, &[&str])] = &[
    ("encryption", &["passphrase"]),
    (
        "messages",
        &[
            "send_interval_min",
            "send_interval_max",
            "limit_period",
            "limit_value",
            "sim_selection_mode",
            "log_lifetime_days",
        ],
    ),
    ("ping", &["interval_seconds"]),
    ("logs", &["lifetime_days"]),
    ("webhooks", &["internet_required", "retry_count", "signing_key"]),
];

pub fn get(conn: &mut PgConnection, user_id: &str) -> Result<Value, SettingsError> {
    let stored: Option<Value> = device_settings::table
        .find(user_id)
        .select(device_settings::settings)
        .first(conn)
        .optional()?;

    Ok(filter_settings(&stored.unwrap_or_else(|| json!({}))))
}

/// Deep-merges the (filtered) patch into the stored document.
pub fn patch(
    conn: &mut PgConnection,
    user_id: &str,
    input: &Value,
) -> Result<Value, SettingsError> {
    if !input.is_object() {
        return Err(SettingsError::NotAnObject);
    }

    let current = get(conn, user_id)?;
    let mut merged = current;
    merge(&mut merged, &filter_settings(input));

    save(conn, user_id, &merged)?;
    Ok(merged)
}

/// Replaces the stored document with the (filtered) input.
pub fn put(
    conn: &mut PgConnection,
    user_id: &str,
    input: &Value,
) -> Result<Value, SettingsError> {
    if !input.is_object() {
        return Err(SettingsError::NotAnObject);
    }

    let filtered = filter_settings(input);
    save(conn, user_id, &filtered)?;
    Ok(filtered)
}

fn save(conn: &mut PgConnection, user_id: &str, value: &Value) -> Result<(), SettingsError> {
    diesel::insert_into(device_settings::table)
        .values(&NewDeviceSettingsRow {
            user_id: user_id.to_string(),
            settings: value.clone(),
        })
        .on_conflict(device_settings::user_id)
        .do_update()
        .set(device_settings::settings.eq(excluded(device_settings::settings)))
        .execute(conn)?;
    Ok(())
}

fn filter_settings(value: &Value) -> Value {
    let Some(sections) = value.as_object() else {
        return json!({});
    };

    let mut out = Map::new();
    for (section, keys) in ALLOWED {
        let Some(Value::Object(section_values)) = sections.get(*section) else {
            continue;
        };

        let mut filtered = Map::new();
        for key in *keys {
            if let Some(entry) = section_values.get(*key) {
                filtered.insert((*key).to_string(), entry.clone());
            }
        }
        if !filtered.is_empty() {
            out.insert((*section).to_string(), Value::Object(filtered));
        }
    }

    Value::Object(out)
}

fn merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value);
                    }
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
