use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event as WireEvent, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tracing::{error, warn};

use crate::{
    auth::{AuthenticatedDevice, AuthenticatedUser, RegistrationAuth},
    error::{AppError, AppResult},
    events::Event,
    ids::new_user_credentials,
    messages::{MessageError, MessageStateIn, Order, PendingMessage},
    models::Device,
    state::AppState,
    users,
    webhooks::{self, WebhookFilter, WebhookIn, WebhookOut},
};

#[derive(Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "pushToken")]
    pub push_token: Option<String>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub id: String,
    pub token: String,
    pub login: String,
    pub password: String,
}

pub async fn register_device(
    State(state): State<AppState>,
    auth: RegistrationAuth,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<RegisterResponse>)> {
    let mut conn = state.db()?;

    let (user_id, password) = match auth {
        RegistrationAuth::User(user_id) => (user_id, String::new()),
        RegistrationAuth::Server | RegistrationAuth::Anonymous => {
            let (login, password) = new_user_credentials();
            users::create(&mut conn, &login, &password)?;
            (login, password)
        }
    };

    let device = state
        .devices
        .insert(&mut conn, &user_id, payload.name, payload.push_token)?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: device.id,
            token: device.auth_token,
            login: user_id,
            password,
        }),
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub last_seen: chrono::NaiveDateTime,
    pub created_at: chrono::NaiveDateTime,
}

impl From<Device> for DeviceResponse {
    fn from(device: Device) -> Self {
        Self {
            id: device.id,
            name: device.name,
            last_seen: device.last_seen,
            created_at: device.created_at,
        }
    }
}

pub async fn get_device(
    AuthenticatedDevice(device): AuthenticatedDevice,
) -> Json<DeviceResponse> {
    Json(device.into())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeviceRequest {
    pub id: String,
    #[serde(default)]
    pub push_token: Option<String>,
}

pub async fn update_device(
    State(state): State<AppState>,
    AuthenticatedDevice(device): AuthenticatedDevice,
    Json(payload): Json<UpdateDeviceRequest>,
) -> AppResult<StatusCode> {
    if payload.id != device.id {
        return Err(AppError::forbidden());
    }

    let mut conn = state.db()?;
    state
        .devices
        .update_push_token(&mut conn, &device.id, payload.push_token)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCodeResponse {
    pub code: String,
    pub valid_until: DateTime<Utc>,
}

pub async fn get_user_code(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserCodeResponse>> {
    // One-time codes mint full device credentials; only a password login may
    // request one.
    if user.scopes.is_some() {
        return Err(AppError::forbidden());
    }

    let code = state.otp.generate(&user.user_id)?;
    Ok(Json(UserCodeResponse {
        code: code.code,
        valid_until: code.valid_until,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<StatusCode> {
    if user.scopes.is_some() {
        return Err(AppError::forbidden());
    }

    let mut conn = state.db()?;
    users::change_password(
        &mut conn,
        &user.user_id,
        &payload.current_password,
        &payload.new_password,
    )?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PendingQuery {
    #[serde(default)]
    pub order: Option<String>,
}

pub async fn get_messages(
    State(state): State<AppState>,
    AuthenticatedDevice(device): AuthenticatedDevice,
    Query(query): Query<PendingQuery>,
) -> AppResult<Json<Vec<PendingMessage>>> {
    let order = match query.order.as_deref() {
        None | Some("") => Order::default(),
        Some(raw) => {
            Order::parse(raw).ok_or_else(|| AppError::bad_request("order must be lifo or fifo"))?
        }
    };

    let pending = state.messages.select_pending(&device.id, order).await?;
    Ok(Json(pending))
}

pub async fn update_messages(
    State(state): State<AppState>,
    AuthenticatedDevice(device): AuthenticatedDevice,
    Json(payload): Json<Vec<MessageStateIn>>,
) -> AppResult<StatusCode> {
    for update in payload {
        let ext_id = update.id.clone();
        match state.messages.update_state(&device, update).await {
            Ok(()) => {}
            // An unknown id in a bulk report must not block the rest.
            Err(MessageError::NotFound) => {
                warn!(device_id = %device.id, ext_id = %ext_id, "state report for unknown message");
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_webhooks(
    State(state): State<AppState>,
    AuthenticatedDevice(device): AuthenticatedDevice,
) -> AppResult<Json<Vec<WebhookOut>>> {
    let mut conn = state.db()?;
    let filter = WebhookFilter {
        device_id: Some(device.id.clone()),
        ..WebhookFilter::default()
    };
    let found = webhooks::select(&mut conn, &device.user_id, &filter)?;

    Ok(Json(found.into_iter().map(WebhookOut::from).collect()))
}

pub async fn create_webhook(
    State(state): State<AppState>,
    AuthenticatedDevice(device): AuthenticatedDevice,
    Json(mut payload): Json<WebhookIn>,
) -> AppResult<(StatusCode, Json<WebhookOut>)> {
    payload.device_id = Some(device.id.clone());

    let mut conn = state.db()?;
    let webhook = webhooks::replace(&mut conn, &device.user_id, payload)?;

    notify_webhooks_updated(&state, device.user_id.clone());

    Ok((StatusCode::CREATED, Json(webhook.into())))
}

pub async fn get_settings(
    State(state): State<AppState>,
    AuthenticatedDevice(device): AuthenticatedDevice,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let settings = crate::settings::get(&mut conn, &device.user_id)?;
    Ok(Json(settings))
}

pub async fn events_stream(
    State(state): State<AppState>,
    AuthenticatedDevice(device): AuthenticatedDevice,
) -> Sse<impl Stream<Item = Result<WireEvent, Infallible>>> {
    let (rx, guard) = state.sse.subscribe(&device.id).into_parts();

    let stream = ReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        Ok(WireEvent::default()
            .event(event.event_type.clone())
            .json_data(&event)
            .unwrap_or_default())
    });

    let keep_alive_period = state.config.sse_keep_alive;
    let mut sse = Sse::new(stream);
    if !keep_alive_period.is_zero() {
        sse = sse.keep_alive(KeepAlive::new().interval(keep_alive_period));
    }
    sse
}

pub(crate) fn notify_webhooks_updated(state: &AppState, user_id: String) {
    let events = state.events.clone();
    tokio::spawn(async move {
        if let Err(err) = events.notify(&user_id, None, Event::webhooks_updated()).await {
            error!(user_id = %user_id, error = %err, "failed to notify webhook change");
        }
    });
}
