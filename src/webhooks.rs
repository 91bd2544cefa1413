use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::ids::new_id;
use crate::models::{NewWebhook, Webhook};
use crate::schema::webhooks;

/// Webhook events a caller may subscribe to.
pub const WEBHOOK_EVENTS: &[&str] = &[
    "sms:received",
    "sms:sent",
    "sms:delivered",
    "sms:failed",
    "system:ping",
];

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook not found")]
    NotFound,
    #[error("invalid {field} = {value:?}: {cause}")]
    Validation {
        field: &'static str,
        value: String,
        cause: String,
    },
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookIn {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    pub url: String,
    pub event: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOut {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub url: String,
    pub event: String,
}

impl From<Webhook> for WebhookOut {
    fn from(webhook: Webhook) -> Self {
        Self {
            id: webhook.ext_id,
            device_id: webhook.device_id,
            url: webhook.url,
            event: webhook.event,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebhookFilter {
    pub ext_id: Option<String>,
    pub device_id: Option<String>,
}

pub fn select(
    conn: &mut PgConnection,
    user_id: &str,
    filter: &WebhookFilter,
) -> Result<Vec<Webhook>, WebhookError> {
    let mut query = webhooks::table
        .filter(webhooks::user_id.eq(user_id))
        .into_boxed();

    if let Some(ext_id) = filter.ext_id.clone() {
        query = query.filter(webhooks::ext_id.eq(ext_id));
    }
    if let Some(device_id) = filter.device_id.clone() {
        // Device-scoped reads also see the user's unscoped webhooks.
        query = query.filter(
            webhooks::device_id
                .eq(device_id)
                .or(webhooks::device_id.is_null()),
        );
    }

    query
        .order(webhooks::id.asc())
        .load(conn)
        .map_err(WebhookError::from)
}

/// Upserts by `(user_id, ext_id)`. Bad URLs and unknown events are rejected
/// with field-level validation errors.
pub fn replace(
    conn: &mut PgConnection,
    user_id: &str,
    input: WebhookIn,
) -> Result<Webhook, WebhookError> {
    let parsed = Url::parse(&input.url).map_err(|err| WebhookError::Validation {
        field: "url",
        value: input.url.clone(),
        cause: err.to_string(),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(WebhookError::Validation {
            field: "url",
            value: input.url.clone(),
            cause: "scheme must be http or https".to_string(),
        });
    }

    if !WEBHOOK_EVENTS.contains(&input.event.as_str()) {
        return Err(WebhookError::Validation {
            field: "event",
            value: input.event.clone(),
            cause: "unknown event".to_string(),
        });
    }

    let ext_id = match input.id {
        Some(id) if !id.is_empty() => id,
        _ => new_id(),
    };

    let row = NewWebhook {
        ext_id,
        user_id: user_id.to_string(),
        device_id: input.device_id,
        url: input.url,
        event: input.event,
    };

    diesel::insert_into(webhooks::table)
        .values(&row)
        .on_conflict((webhooks::user_id, webhooks::ext_id))
        .do_update()
        .set((
            webhooks::device_id.eq(excluded(webhooks::device_id)),
            webhooks::url.eq(excluded(webhooks::url)),
            webhooks::event.eq(excluded(webhooks::event)),
        ))
        .get_result(conn)
        .map_err(WebhookError::from)
}

pub fn delete(
    conn: &mut PgConnection,
    user_id: &str,
    filter: &WebhookFilter,
) -> Result<usize, WebhookError> {
    let mut query = webhooks::table
        .filter(webhooks::user_id.eq(user_id))
        .select(webhooks::id)
        .into_boxed();

    if let Some(ext_id) = filter.ext_id.clone() {
        query = query.filter(webhooks::ext_id.eq(ext_id));
    }
    if let Some(device_id) = filter.device_id.clone() {
        query = query.filter(webhooks::device_id.eq(device_id));
    }

    let ids: Vec<i64> = query.load(conn)?;
    if ids.is_empty() {
        return Ok(0);
    }

    diesel::delete(webhooks::table.filter(webhooks::id.eq_any(&ids)))
        .execute(conn)
        .map_err(WebhookError::from)
}
