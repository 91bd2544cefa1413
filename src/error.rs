use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn disabled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => AppError::not_found(),
            _ => AppError::internal(value),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<crate::messages::MessageError> for AppError {
    fn from(value: crate::messages::MessageError) -> Self {
        use crate::messages::MessageError;
        match value {
            MessageError::NotFound => AppError::not_found(),
            MessageError::AlreadyExists => {
                AppError::conflict("message with this id already exists")
            }
            MessageError::NoContent => AppError::bad_request("no text or data content"),
            MessageError::Validation(cause) => AppError::bad_request(cause),
            MessageError::MoreThanOne => AppError::internal("multiple messages matched"),
            other => AppError::internal(other),
        }
    }
}

impl From<crate::devices::DeviceError> for AppError {
    fn from(value: crate::devices::DeviceError) -> Self {
        use crate::devices::DeviceError;
        match value {
            DeviceError::NotFound => AppError::not_found(),
            DeviceError::MoreThanOne => AppError::internal("multiple devices matched"),
            DeviceError::Database(err) => AppError::from(err),
        }
    }
}

impl From<crate::webhooks::WebhookError> for AppError {
    fn from(value: crate::webhooks::WebhookError) -> Self {
        use crate::webhooks::WebhookError;
        match value {
            WebhookError::NotFound => AppError::not_found(),
            validation @ WebhookError::Validation { .. } => {
                AppError::bad_request(validation.to_string())
            }
            WebhookError::Database(err) => AppError::from(err),
        }
    }
}

impl From<crate::auth::jwt::TokenError> for AppError {
    fn from(value: crate::auth::jwt::TokenError) -> Self {
        use crate::auth::jwt::TokenError;
        match value {
            TokenError::InvalidParams(cause) => AppError::bad_request(cause),
            TokenError::InvalidToken
            | TokenError::Revoked
            | TokenError::Replay
            | TokenError::InvalidUse => AppError::unauthorized(),
            TokenError::Database(err) => AppError::from(err),
        }
    }
}

impl From<crate::users::UserError> for AppError {
    fn from(value: crate::users::UserError) -> Self {
        use crate::users::UserError;
        match value {
            UserError::Exists => AppError::conflict("user already exists"),
            UserError::NotFound | UserError::InvalidCredentials => AppError::unauthorized(),
            other => AppError::internal(other),
        }
    }
}

impl From<crate::otp::OtpError> for AppError {
    fn from(value: crate::otp::OtpError) -> Self {
        use crate::otp::OtpError;
        match value {
            OtpError::NotFound => AppError::unauthorized(),
            other => AppError::internal(other),
        }
    }
}

impl From<crate::settings::SettingsError> for AppError {
    fn from(value: crate::settings::SettingsError) -> Self {
        use crate::settings::SettingsError;
        match value {
            SettingsError::NotAnObject => AppError::bad_request("settings must be a JSON object"),
            SettingsError::Database(err) => AppError::from(err),
        }
    }
}
