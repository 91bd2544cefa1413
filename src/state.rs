use std::sync::Arc;
use std::time::Duration;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::TokenService,
    cache::CacheFactory,
    config::{AppConfig, PushMode},
    db::PgPool,
    devices::DeviceRegistry,
    error::{AppError, AppResult},
    events::EventRouter,
    messages::{cache::StateCache, hashing::HashingQueue, MessageService},
    online::OnlineTracker,
    otp::OtpService,
    push::PushService,
    push_client::{NoopClient, PushClient, UpstreamClient},
    pubsub::PubSub,
    sse::SseHub,
};

pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub tokens: TokenService,
    pub devices: DeviceRegistry,
    pub messages: MessageService,
    pub events: EventRouter,
    pub push: PushService,
    pub sse: SseHub,
    pub online: OnlineTracker,
    pub otp: Arc<OtpService>,
    pub hashing: Arc<HashingQueue>,
    pub pubsub: PubSub,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig) -> anyhow::Result<Self> {
        let caches = CacheFactory::from_url(&config.cache_url)?;

        let tokens = TokenService::from_config(&config);
        let devices = DeviceRegistry::new(caches.namespace("devices:", Duration::from_secs(600)));
        let otp = Arc::new(OtpService::new(
            caches.namespace("otp:", config.otp_ttl),
            config.otp_ttl,
            config.otp_retries,
        ));

        let push_client: Arc<dyn PushClient> = match config.push_mode {
            PushMode::Upstream => Arc::new(UpstreamClient::new(
                config.push_url.as_deref().unwrap_or_default(),
                config.push_timeout,
            )?),
            PushMode::None => Arc::new(NoopClient),
        };
        let push = PushService::new(
            push_client,
            caches.namespace("push:events:", Duration::ZERO),
            caches.namespace("push:blacklist:", config.push_blacklist_ttl),
            config.push_debounce,
            config.push_timeout,
            config.push_max_retries,
            config.push_blacklist_ttl,
        );

        let sse = SseHub::new(config.sse_buffer_size);
        let pubsub = PubSub::new(config.pubsub_buffer_size);
        let events = EventRouter::new(
            pubsub.clone(),
            pool.clone(),
            devices.clone(),
            push.clone(),
            sse.clone(),
        );

        let hashing = HashingQueue::new(pool.clone(), config.messages_hashing_interval);
        let messages = MessageService::new(
            pool.clone(),
            StateCache::new(
                caches.namespace("messages:", config.messages_cache_ttl),
                config.messages_cache_ttl,
            ),
            events.clone(),
            hashing.clone(),
            config.phone_default_region.clone(),
        );

        let online = OnlineTracker::new(
            caches.namespace("online:", Duration::ZERO),
            pool.clone(),
            devices.clone(),
            config.online_persist_interval,
        );

        Ok(Self {
            pool,
            config: Arc::new(config),
            tokens,
            devices,
            messages,
            events,
            push,
            sse,
            online,
            otp,
            hashing,
            pubsub,
        })
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
