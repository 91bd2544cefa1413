use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header::LOCATION, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::{
    auth::{
        self, authorization_header, AuthenticatedUser, SCOPE_DEVICES_MANAGE, SCOPE_MESSAGES_READ,
        SCOPE_MESSAGES_SEND, SCOPE_SETTINGS_MANAGE, SCOPE_TOKENS_MANAGE, SCOPE_TOKENS_REFRESH,
        SCOPE_WEBHOOKS_MANAGE,
    },
    devices::DeviceFilter,
    error::{AppError, AppResult},
    events::Event,
    messages::{
        EnqueueOptions, MessageIn, MessageStateOut, Order, ProcessingState, SelectFilter,
        SelectOptions,
    },
    settings,
    state::AppState,
    webhooks::{self, WebhookFilter, WebhookIn, WebhookOut},
};

use super::mobile::{notify_webhooks_updated, DeviceResponse};

const X_TOTAL_COUNT: &str = "x-total-count";

#[derive(Deserialize)]
pub struct EnqueueQuery {
    #[serde(default, rename = "skipPhoneValidation")]
    pub skip_phone_validation: bool,
    #[serde(default, rename = "deviceActiveWithin")]
    pub device_active_within: Option<u64>,
}

pub async fn enqueue_message(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<EnqueueQuery>,
    Json(payload): Json<MessageIn>,
) -> AppResult<(StatusCode, HeaderMap, Json<MessageStateOut>)> {
    user.require_scope(SCOPE_MESSAGES_SEND)?;

    let device = {
        let mut conn = state.db()?;
        state
            .devices
            .get_any(
                &mut conn,
                &user.user_id,
                payload.device_id.as_deref(),
                query
                    .device_active_within
                    .filter(|hours| *hours > 0)
                    .map(|hours| Duration::from_secs(hours.saturating_mul(3600))),
            )
            .map_err(|err| match err {
                crate::devices::DeviceError::NotFound => {
                    AppError::bad_request("no suitable device")
                }
                other => other.into(),
            })?
    };

    let message_state = state
        .messages
        .enqueue(
            device,
            payload,
            EnqueueOptions {
                skip_phone_validation: query.skip_phone_validation,
            },
        )
        .await?;

    let mut headers = HeaderMap::new();
    if let Ok(location) =
        HeaderValue::from_str(&format!("/3rdparty/v1/messages/{}", message_state.id))
    {
        headers.insert(LOCATION, location);
    }

    Ok((StatusCode::ACCEPTED, headers, Json(message_state)))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: Option<ProcessingState>,
    #[serde(default, rename = "deviceId")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub order: Option<String>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> AppResult<(HeaderMap, Json<Vec<MessageStateOut>>)> {
    user.require_scope(SCOPE_MESSAGES_READ)?;

    let order = match query.order.as_deref() {
        None | Some("") => Order::default(),
        Some(raw) => {
            Order::parse(raw).ok_or_else(|| AppError::bad_request("order must be lifo or fifo"))?
        }
    };

    let filter = SelectFilter {
        device_id: query.device_id,
        state: query.state,
        start_date: query.from.map(|from| from.naive_utc()),
        end_date: query.to.map(|to| to.naive_utc()),
        ..SelectFilter::default()
    };
    let options = SelectOptions {
        order,
        limit: query.limit,
        offset: query.offset,
        ..SelectOptions::default()
    };

    let (states, total) = state
        .messages
        .select_states(&user.user_id, filter, options)
        .await?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&total.to_string()) {
        headers.insert(X_TOTAL_COUNT, value);
    }

    Ok((headers, Json(states)))
}

pub async fn get_message(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(ext_id): Path<String>,
) -> AppResult<Json<MessageStateOut>> {
    user.require_scope(SCOPE_MESSAGES_READ)?;

    let message_state = state.messages.get_state(&user.user_id, &ext_id).await?;
    Ok(Json(message_state))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportInboxRequest {
    pub device_id: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

pub async fn export_inbox(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ExportInboxRequest>,
) -> AppResult<StatusCode> {
    user.require_scope(SCOPE_MESSAGES_READ)?;
    if payload.until <= payload.since {
        return Err(AppError::bad_request("until must be after since"));
    }

    let device = {
        let mut conn = state.db()?;
        state.devices.get(
            &mut conn,
            &user.user_id,
            &DeviceFilter::default().with_id(payload.device_id),
        )?
    };

    state
        .messages
        .export_inbox(&device, payload.since, payload.until)
        .await?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub struct WebhookQuery {
    #[serde(default, rename = "deviceId")]
    pub device_id: Option<String>,
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<WebhookQuery>,
) -> AppResult<Json<Vec<WebhookOut>>> {
    user.require_scope(SCOPE_WEBHOOKS_MANAGE)?;

    let mut conn = state.db()?;
    let filter = WebhookFilter {
        device_id: query.device_id,
        ..WebhookFilter::default()
    };
    let found = webhooks::select(&mut conn, &user.user_id, &filter)?;

    Ok(Json(found.into_iter().map(WebhookOut::from).collect()))
}

pub async fn register_webhook(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<WebhookIn>,
) -> AppResult<(StatusCode, Json<WebhookOut>)> {
    user.require_scope(SCOPE_WEBHOOKS_MANAGE)?;

    let mut conn = state.db()?;
    let webhook = webhooks::replace(&mut conn, &user.user_id, payload)?;

    notify_webhooks_updated(&state, user.user_id.clone());

    Ok((StatusCode::CREATED, Json(webhook.into())))
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(ext_id): Path<String>,
) -> AppResult<StatusCode> {
    user.require_scope(SCOPE_WEBHOOKS_MANAGE)?;

    let mut conn = state.db()?;
    let filter = WebhookFilter {
        ext_id: Some(ext_id),
        ..WebhookFilter::default()
    };
    webhooks::delete(&mut conn, &user.user_id, &filter)?;

    notify_webhooks_updated(&state, user.user_id.clone());

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_devices(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<DeviceResponse>>> {
    user.require_scope(SCOPE_DEVICES_MANAGE)?;

    let mut conn = state.db()?;
    let found = state
        .devices
        .select(&mut conn, &user.user_id, &DeviceFilter::default())?;

    Ok(Json(found.into_iter().map(DeviceResponse::from).collect()))
}

pub async fn delete_device(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(device_id): Path<String>,
) -> AppResult<StatusCode> {
    user.require_scope(SCOPE_DEVICES_MANAGE)?;

    let mut conn = state.db()?;
    let removed = state.devices.remove(
        &mut conn,
        &user.user_id,
        &DeviceFilter::default().with_id(device_id),
    )?;
    if removed == 0 {
        return Err(AppError::not_found());
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_settings(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    user.require_scope(SCOPE_SETTINGS_MANAGE)?;

    let mut conn = state.db()?;
    Ok(Json(settings::get(&mut conn, &user.user_id)?))
}

pub async fn patch_settings(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    user.require_scope(SCOPE_SETTINGS_MANAGE)?;

    let mut conn = state.db()?;
    let merged = settings::patch(&mut conn, &user.user_id, &payload)?;

    notify_settings_updated(&state, user.user_id.clone());

    Ok(Json(merged))
}

pub async fn put_settings(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    user.require_scope(SCOPE_SETTINGS_MANAGE)?;

    let mut conn = state.db()?;
    let replaced = settings::put(&mut conn, &user.user_id, &payload)?;

    notify_settings_updated(&state, user.user_id.clone());

    Ok(Json(replaced))
}

#[derive(Deserialize, Default)]
pub struct TokenRequest {
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub id: String,
    pub token_type: &'static str,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: chrono::NaiveDateTime,
}

pub async fn issue_token(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Option<Json<TokenRequest>>,
) -> AppResult<(StatusCode, Json<TokenResponse>)> {
    user.require_scope(SCOPE_TOKENS_MANAGE)?;

    let Json(payload) = payload.unwrap_or_default();
    let scopes = match payload.scopes {
        Some(scopes) if !scopes.is_empty() => scopes,
        _ => auth::default_scopes(),
    };

    let mut conn = state.db()?;
    let pair = state.tokens.generate_token_pair(
        &mut conn,
        &user.user_id,
        &scopes,
        SCOPE_TOKENS_REFRESH,
        payload.ttl.map(Duration::from_secs),
    )?;

    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            id: pair.access.jti,
            token_type: "Bearer",
            access_token: pair.access.token,
            refresh_token: pair.refresh.token,
            expires_at: pair.access.expires_at,
        }),
    ))
}

pub async fn refresh_token(
    State(state): State<AppState>,
    parts: axum::http::request::Parts,
) -> AppResult<(StatusCode, Json<TokenResponse>)> {
    let header = authorization_header(&parts).ok_or_else(AppError::unauthorized)?;
    let refresh = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(AppError::unauthorized)?
        .trim();

    let mut conn = state.db()?;
    let pair = state
        .tokens
        .refresh_token_pair(&mut conn, refresh)
        .map_err(|err| {
            if matches!(err, crate::auth::jwt::TokenError::Replay) {
                // A replayed refresh token means the credential leaked or the
                // client lost the rotation race; both deserve a trace.
                error!("refresh token replay detected");
            }
            AppError::from(err)
        })?;

    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            id: pair.access.jti,
            token_type: "Bearer",
            access_token: pair.access.token,
            refresh_token: pair.refresh.token,
            expires_at: pair.access.expires_at,
        }),
    ))
}

pub async fn revoke_token(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(jti): Path<String>,
) -> AppResult<StatusCode> {
    user.require_scope(SCOPE_TOKENS_MANAGE)?;

    let mut conn = state.db()?;
    state.tokens.revoke_token(&mut conn, &user.user_id, &jti)?;

    Ok(StatusCode::NO_CONTENT)
}

fn notify_settings_updated(state: &AppState, user_id: String) {
    let events = state.events.clone();
    tokio::spawn(async move {
        if let Err(err) = events
            .notify(&user_id, None, Event::settings_updated())
            .await
        {
            error!(user_id = %user_id, error = %err, "failed to notify settings change");
        }
    });
}
