use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;
use crate::ids::new_id;
use crate::models::{NewTokenRecord, TokenRecord};
use crate::schema::tokens;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),
    #[error("invalid token")]
    InvalidToken,
    #[error("token revoked")]
    Revoked,
    #[error("refresh token replay detected")]
    Replay,
    #[error("token not valid for this use")]
    InvalidUse,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub scopes: Vec<String>,
}

/// Refresh tokens carry the refresh scope in `scopes` and remember the
/// access token's scopes so rotation can reissue an identical pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    #[serde(flatten)]
    pub claims: Claims,
    pub original_scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub jti: String,
    pub token: String,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: TokenInfo,
    pub refresh: TokenInfo,
}

#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    secret_issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            secret_issuer: config.jwt_issuer.clone(),
            access_ttl: config.jwt_access_ttl,
            refresh_ttl: config.jwt_refresh_ttl,
        }
    }

    /// Issues a signed access/refresh pair and records both jtis.
    pub fn generate_token_pair(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        scopes: &[String],
        refresh_scope: &str,
        access_ttl: Option<Duration>,
    ) -> Result<TokenPair, TokenError> {
        let pair = self.sign_pair(user_id, scopes, refresh_scope, access_ttl)?;

        diesel::insert_into(tokens::table)
            .values(&[
                new_token_record(user_id, &pair.access),
                new_token_record(user_id, &pair.refresh),
            ])
            .execute(conn)?;

        Ok(pair)
    }

    /// Verifies signature, issuer and expiry, then the persisted revocation
    /// state.
    pub fn parse_token(
        &self,
        conn: &mut PgConnection,
        token: &str,
    ) -> Result<Claims, TokenError> {
        let claims = self.decode_access(token)?;

        let revoked: i64 = tokens::table
            .filter(tokens::id.eq(&claims.jti))
            .filter(tokens::revoked_at.is_not_null())
            .count()
            .get_result(conn)?;
        if revoked > 0 {
            return Err(TokenError::Revoked);
        }

        Ok(claims)
    }

    /// Marks a jti revoked; absent or already-revoked records are a no-op.
    pub fn revoke_token(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        jti: &str,
    ) -> Result<(), TokenError> {
        diesel::update(
            tokens::table
                .filter(tokens::id.eq(jti))
                .filter(tokens::user_id.eq(user_id))
                .filter(tokens::revoked_at.is_null()),
        )
        .set(tokens::revoked_at.eq(Utc::now().naive_utc()))
        .execute(conn)?;

        Ok(())
    }

    /// Rotates a refresh token: the current record is locked `FOR UPDATE`,
    /// checked for expiry and prior revocation, revoked, and the successor
    /// pair is inserted in the same transaction. A second rotation of the
    /// same token therefore fails with `Replay` without issuing anything.
    pub fn refresh_token_pair(
        &self,
        conn: &mut PgConnection,
        refresh_token: &str,
    ) -> Result<TokenPair, TokenError> {
        let claims = self.decode_refresh(refresh_token)?;
        if claims.original_scopes.is_empty() {
            return Err(TokenError::InvalidUse);
        }
        let refresh_scope = claims
            .claims
            .scopes
            .first()
            .ok_or(TokenError::InvalidUse)?
            .clone();

        let pair = self.sign_pair(
            &claims.claims.sub,
            &claims.original_scopes,
            &refresh_scope,
            None,
        )?;

        conn.transaction::<_, TokenError, _>(|conn| {
            let current: Option<TokenRecord> = tokens::table
                .find(&claims.claims.jti)
                .for_update()
                .first(conn)
                .optional()?;
            let current = current.ok_or(TokenError::InvalidToken)?;

            let now = Utc::now().naive_utc();
            if current.revoked_at.is_some() {
                return Err(TokenError::Replay);
            }
            if current.expires_at < now {
                return Err(TokenError::InvalidToken);
            }

            diesel::update(tokens::table.find(&current.id))
                .set(tokens::revoked_at.eq(now))
                .execute(conn)?;

            diesel::insert_into(tokens::table)
                .values(&[
                    new_token_record(&claims.claims.sub, &pair.refresh),
                    new_token_record(&claims.claims.sub, &pair.access),
                ])
                .execute(conn)?;

            Ok(())
        })?;

        Ok(pair)
    }

    pub fn decode_access(&self, token: &str) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation())
            .map_err(|_| TokenError::InvalidToken)?;
        Ok(data.claims)
    }

    pub fn decode_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        let data = decode::<RefreshClaims>(token, &self.decoding, &self.validation())
            .map_err(|_| TokenError::InvalidToken)?;
        Ok(data.claims)
    }

    fn sign_pair(
        &self,
        user_id: &str,
        scopes: &[String],
        refresh_scope: &str,
        access_ttl: Option<Duration>,
    ) -> Result<TokenPair, TokenError> {
        if user_id.is_empty() {
            return Err(TokenError::InvalidParams("user id is required"));
        }
        if scopes.is_empty() {
            return Err(TokenError::InvalidParams("scopes are required"));
        }

        let access_ttl = access_ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| ttl.min(self.access_ttl))
            .unwrap_or(self.access_ttl);

        let now = Utc::now();
        let access_claims = self.new_claims(user_id, scopes.to_vec(), now, access_ttl);
        let refresh_claims = RefreshClaims {
            claims: self.new_claims(
                user_id,
                vec![refresh_scope.to_string()],
                now,
                self.refresh_ttl,
            ),
            original_scopes: scopes.to_vec(),
        };

        let access = TokenInfo {
            jti: access_claims.jti.clone(),
            expires_at: expires_at_naive(&access_claims),
            token: self.sign(&access_claims)?,
        };
        let refresh = TokenInfo {
            jti: refresh_claims.claims.jti.clone(),
            expires_at: expires_at_naive(&refresh_claims.claims),
            token: self.sign(&refresh_claims)?,
        };

        Ok(TokenPair { access, refresh })
    }

    fn new_claims(
        &self,
        user_id: &str,
        scopes: Vec<String>,
        now: chrono::DateTime<Utc>,
        ttl: Duration,
    ) -> Claims {
        Claims {
            iss: self.secret_issuer.clone(),
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())).timestamp(),
            jti: new_id(),
            scopes,
        }
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|_| TokenError::InvalidToken)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.secret_issuer.clone()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation
    }
}

fn new_token_record(user_id: &str, info: &TokenInfo) -> NewTokenRecord {
    NewTokenRecord {
        id: info.jti.clone(),
        user_id: user_id.to_string(),
        expires_at: info.expires_at,
    }
}

fn expires_at_naive(claims: &Claims) -> NaiveDateTime {
    chrono::DateTime::from_timestamp(claims.exp, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_else(|| Utc::now().naive_utc())
}
