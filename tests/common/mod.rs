use std::env;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use diesel::connection::SimpleConnection;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use smsbridge::config::{AppConfig, GatewayMode, PushMode};
use smsbridge::db::{self, PgPool};
use smsbridge::routes;
use smsbridge::state::AppState;
use tokio::sync::Mutex;
use tower::util::ServiceExt;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub struct TestApp {
    pub state: AppState,
    router: Router,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredDevice {
    pub id: String,
    pub token: String,
    pub login: String,
    pub password: String,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: 4,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            gateway_mode: GatewayMode::Public,
            gateway_private_token: None,
            jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_access_ttl: Duration::from_secs(3600),
            jwt_refresh_ttl: Duration::from_secs(86400),
            otp_ttl: Duration::from_secs(300),
            otp_retries: 3,
            push_mode: PushMode::None,
            push_url: None,
            push_debounce: Duration::from_secs(5),
            push_timeout: Duration::from_secs(1),
            push_max_retries: 3,
            push_blacklist_ttl: Duration::from_secs(3600),
            sse_keep_alive: Duration::from_secs(0),
            sse_buffer_size: 16,
            messages_cache_ttl: Duration::from_secs(300),
            messages_hashing_interval: Duration::from_secs(3600),
            cache_url: "memory://".to_string(),
            pubsub_buffer_size: 16,
            phone_default_region: "US".to_string(),
            online_persist_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(10),
            tasks_messages_hashing_interval: Duration::from_secs(3600),
            tasks_messages_cleanup_interval: Duration::from_secs(3600),
            tasks_messages_cleanup_max_age: Duration::from_secs(30 * 24 * 3600),
            tasks_devices_cleanup_interval: Duration::from_secs(3600),
            tasks_devices_cleanup_max_age: Duration::from_secs(365 * 24 * 3600),
        };

        let pool = db::init_pool(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let state = AppState::new(pool, config)?;
        let router = routes::create_router(state.clone());

        Ok(Self { state, router })
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    /// Registers a device through the public-mode API, returning the device
    /// credentials together with the freshly created user login/password.
    pub async fn register_device(&self) -> Result<RegisteredDevice> {
        let response = self
            .request(
                Method::POST,
                "/mobile/v1/device",
                Some(serde_json::json!({"name": "test device"})),
                None,
            )
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "device registration failed with status {}",
            response.status()
        );

        let body = body_to_vec(response.into_body()).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn basic_auth(login: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{login}:{password}")))
    }

    pub fn bearer_auth(token: &str) -> String {
        format!("Bearer {token}")
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
        authorization: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(authorization) = authorization {
            builder = builder.header("authorization", authorization);
        }

        let request = match payload {
            Some(payload) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&payload)?))?,
            None => builder.body(Body::empty())?,
        };

        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_to_json(body: Body) -> Result<Value> {
    let raw = body_to_vec(body).await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE device_settings, webhooks, tokens, message_states, message_recipients, messages, devices, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
