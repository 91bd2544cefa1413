pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::header::AUTHORIZATION, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::{error::AppError, models::Device, state::AppState, users};

pub const SCOPE_MESSAGES_SEND: &str = "messages:send";
pub const SCOPE_MESSAGES_READ: &str = "messages:read";
pub const SCOPE_WEBHOOKS_MANAGE: &str = "webhooks:manage";
pub const SCOPE_DEVICES_MANAGE: &str = "devices:manage";
pub const SCOPE_SETTINGS_MANAGE: &str = "settings:manage";
pub const SCOPE_TOKENS_MANAGE: &str = "tokens:manage";
pub const SCOPE_TOKENS_REFRESH: &str = "tokens:refresh";

pub fn default_scopes() -> Vec<String> {
    [
        SCOPE_MESSAGES_SEND,
        SCOPE_MESSAGES_READ,
        SCOPE_WEBHOOKS_MANAGE,
        SCOPE_DEVICES_MANAGE,
        SCOPE_SETTINGS_MANAGE,
        SCOPE_TOKENS_MANAGE,
    ]
    .iter()
    .map(|scope| scope.to_string())
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Basic,
    Bearer,
    Code,
}

fn split_authorization(value: &str) -> Option<(Scheme, &str)> {
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    match scheme {
        s if s.eq_ignore_ascii_case("basic") => Some((Scheme::Basic, rest)),
        s if s.eq_ignore_ascii_case("bearer") => Some((Scheme::Bearer, rest)),
        s if s.eq_ignore_ascii_case("code") => Some((Scheme::Code, rest)),
        _ => None,
    }
}

pub fn authorization_header(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn decode_basic(payload: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(payload).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// A user authenticated with Basic credentials or a bearer JWT. JWT callers
/// carry their granted scopes; Basic callers are unrestricted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub scopes: Option<Vec<String>>,
}

impl AuthenticatedUser {
    pub fn require_scope(&self, scope: &str) -> Result<(), AppError> {
        match &self.scopes {
            None => Ok(()),
            Some(scopes) if scopes.iter().any(|granted| granted == scope) => Ok(()),
            Some(_) => Err(AppError::forbidden()),
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = authorization_header(parts).ok_or_else(AppError::unauthorized)?;
        let (scheme, payload) =
            split_authorization(&header).ok_or_else(AppError::unauthorized)?;

        match scheme {
            Scheme::Basic => {
                let (username, password_value) =
                    decode_basic(payload).ok_or_else(AppError::unauthorized)?;
                let mut conn = state.db()?;
                let user = users::login(&mut conn, &username, &password_value)
                    .map_err(|_| AppError::unauthorized())?;
                Ok(AuthenticatedUser {
                    user_id: user.id,
                    scopes: None,
                })
            }
            Scheme::Bearer => {
                let mut conn = state.db()?;
                let claims = state
                    .tokens
                    .parse_token(&mut conn, payload)
                    .map_err(|_| AppError::unauthorized())?;
                Ok(AuthenticatedUser {
                    user_id: claims.sub,
                    scopes: Some(claims.scopes),
                })
            }
            Scheme::Code => Err(AppError::unauthorized()),
        }
    }
}

/// A device authenticated with its bearer auth token. Every successful
/// authentication records an online observation for the device.
#[derive(Debug, Clone)]
pub struct AuthenticatedDevice(pub Device);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedDevice {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;
        let token = bearer.token();
        if token.is_empty() {
            return Err(AppError::unauthorized());
        }

        let mut conn = state.db()?;
        let device = state
            .devices
            .get_by_token(&mut conn, token)
            .map_err(|_| AppError::unauthorized())?;

        state.online.set_online(&device.id);

        Ok(AuthenticatedDevice(device))
    }
}

/// Identity established for device registration: an existing user (Basic or
/// one-time code), a trusted server (private token), or nobody in public
/// mode.
pub enum RegistrationAuth {
    User(String),
    Server,
    Anonymous,
}

#[async_trait]
impl FromRequestParts<AppState> for RegistrationAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(header) = authorization_header(parts) else {
            return if state.config.is_public() {
                Ok(RegistrationAuth::Anonymous)
            } else {
                Err(AppError::unauthorized())
            };
        };
        let (scheme, payload) =
            split_authorization(&header).ok_or_else(AppError::unauthorized)?;

        match scheme {
            Scheme::Basic => {
                let (username, password_value) =
                    decode_basic(payload).ok_or_else(AppError::unauthorized)?;
                let mut conn = state.db()?;
                let user = users::login(&mut conn, &username, &password_value)
                    .map_err(|_| AppError::unauthorized())?;
                Ok(RegistrationAuth::User(user.id))
            }
            Scheme::Code => {
                let user_id = state
                    .otp
                    .validate(payload)
                    .map_err(|_| AppError::unauthorized())?;
                Ok(RegistrationAuth::User(user_id))
            }
            Scheme::Bearer => {
                let expected = state.config.gateway_private_token.as_deref().unwrap_or("");
                if !expected.is_empty() && constant_time_eq(payload.as_bytes(), expected.as_bytes())
                {
                    Ok(RegistrationAuth::Server)
                } else if state.config.is_public() {
                    Ok(RegistrationAuth::Anonymous)
                } else {
                    Err(AppError::unauthorized())
                }
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_schemes_case_insensitively() {
        assert!(matches!(
            split_authorization("basic dXNlcjpwYXNz"),
            Some((Scheme::Basic, "dXNlcjpwYXNz"))
        ));
        assert!(matches!(
            split_authorization("Bearer token"),
            Some((Scheme::Bearer, "token"))
        ));
        assert!(matches!(
            split_authorization("Code 123456"),
            Some((Scheme::Code, "123456"))
        ));
        assert!(split_authorization("Digest nope").is_none());
        assert!(split_authorization("nospace").is_none());
    }

    #[test]
    fn decodes_basic_credentials() {
        assert_eq!(
            decode_basic("dXNlcjpwYXNz"),
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(decode_basic("~~~"), None);
    }

    #[test]
    fn constant_time_eq_compares_exactly() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre7"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
    }
}
