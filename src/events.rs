use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::db::{self, PgPool};
use crate::devices::{DeviceFilter, DeviceRegistry};
use crate::push::PushService;
use crate::push_client::PushEvent;
use crate::pubsub::{PubSub, PubSubError};
use crate::sse::{SseEvent, SseHub};

const EVENTS_TOPIC: &str = "events";
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub const EVENT_MESSAGE_ENQUEUED: &str = "MessageEnqueued";
pub const EVENT_MESSAGES_EXPORT_REQUESTED: &str = "MessagesExportRequested";
pub const EVENT_WEBHOOKS_UPDATED: &str = "WebhooksUpdated";
pub const EVENT_SETTINGS_UPDATED: &str = "SettingsUpdated";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event type is empty")]
    EmptyEventType,
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to publish event: {0}")]
    Publish(#[from] PubSubError),
    #[error("publish timed out")]
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub data: HashMap<String, String>,
}

impl Event {
    pub fn new(event_type: &str, data: HashMap<String, String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
        }
    }

    pub fn message_enqueued() -> Self {
        Self::new(EVENT_MESSAGE_ENQUEUED, HashMap::new())
    }

    pub fn messages_export_requested(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        let mut data = HashMap::new();
        data.insert(
            "since".to_string(),
            since.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        data.insert(
            "until".to_string(),
            until.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        Self::new(EVENT_MESSAGES_EXPORT_REQUESTED, data)
    }

    pub fn webhooks_updated() -> Self {
        Self::new(EVENT_WEBHOOKS_UPDATED, HashMap::new())
    }

    pub fn settings_updated() -> Self {
        Self::new(EVENT_SETTINGS_UPDATED, HashMap::new())
    }
}

/// The unit published on the internal event topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct EventEnvelope {
    user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    event: Event,
}

/// Accepts domain events and fans them out to devices, choosing push for
/// devices with a push token and the SSE channel otherwise. `notify` is
/// decoupled from delivery through the bus so transient transport failures
/// never stall producers.
#[derive(Clone)]
pub struct EventRouter {
    pubsub: PubSub,
    pool: PgPool,
    devices: DeviceRegistry,
    push: PushService,
    sse: SseHub,
}

impl EventRouter {
    pub fn new(
        pubsub: PubSub,
        pool: PgPool,
        devices: DeviceRegistry,
        push: PushService,
        sse: SseHub,
    ) -> Self {
        Self {
            pubsub,
            pool,
            devices,
            push,
            sse,
        }
    }

    pub async fn notify(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        event: Event,
    ) -> Result<(), EventError> {
        if event.event_type.is_empty() {
            return Err(EventError::EmptyEventType);
        }

        let envelope = EventEnvelope {
            user_id: user_id.to_string(),
            device_id: device_id.map(str::to_string),
            event,
        };
        let payload = serde_json::to_vec(&envelope)?;

        tokio::time::timeout(PUBLISH_TIMEOUT, self.pubsub.publish(EVENTS_TOPIC, payload))
            .await
            .map_err(|_| EventError::Timeout)??;

        Ok(())
    }

    /// Single consumer loop; runs until the bus closes.
    pub async fn run(&self) {
        let mut subscription = match self.pubsub.subscribe(EVENTS_TOPIC) {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(error = %err, "failed to subscribe to event topic");
                return;
            }
        };

        while let Some(message) = subscription.recv().await {
            let envelope: EventEnvelope = match serde_json::from_slice(&message.data) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(error = %err, "failed to deserialize event envelope");
                    continue;
                }
            };
            self.process(envelope).await;
        }

        info!("event router stopped");
    }

    async fn process(&self, envelope: EventEnvelope) {
        let registry = self.devices.clone();
        let user_id = envelope.user_id.clone();
        let mut filter = DeviceFilter::default();
        if let Some(device_id) = &envelope.device_id {
            filter.id = Some(device_id.clone());
        }

        let devices = db::with_conn(&self.pool, move |conn| {
            registry
                .select(conn, &user_id, &filter)
                .map_err(anyhow::Error::from)
        })
        .await;

        let devices = match devices {
            Ok(devices) => devices,
            Err(err) => {
                error!(user_id = %envelope.user_id, error = %err, "failed to select devices");
                return;
            }
        };

        if devices.is_empty() {
            info!(user_id = %envelope.user_id, "no devices to notify");
            return;
        }

        // One failing device must not affect the rest.
        for device in devices {
            match device.push_token.as_deref() {
                Some(token) if !token.is_empty() => {
                    if let Err(err) = self.push.enqueue(
                        token,
                        PushEvent {
                            event_type: envelope.event.event_type.clone(),
                            data: envelope.event.data.clone(),
                        },
                    ) {
                        error!(
                            device_id = %device.id,
                            error = %err,
                            "failed to enqueue push notification"
                        );
                    }
                }
                _ => {
                    if let Err(err) = self.sse.send(
                        &device.id,
                        SseEvent {
                            event_type: envelope.event.event_type.clone(),
                            data: envelope.event.data.clone(),
                        },
                    ) {
                        error!(
                            device_id = %device.id,
                            error = %err,
                            "failed to send event over sse"
                        );
                    }
                }
            }
        }
    }
}
