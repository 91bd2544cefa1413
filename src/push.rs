use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheError, GetOptions, KvCache, SetOptions};
use crate::push_client::{PushClient, PushEvent, PushMessage};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to serialize push envelope: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Cached unit of outbound push work. The cache key collapses the envelope
/// per `(token, event type)`, so a burst of identical notifications within
/// one debounce window costs a single transmission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct EventEnvelope {
    token: String,
    event: PushEvent,
    retries: u32,
}

impl EventEnvelope {
    fn key(&self) -> String {
        format!("{}:{}", self.token, self.event.event_type)
    }
}

struct Inner {
    client: Arc<dyn PushClient>,
    events: Arc<dyn KvCache>,
    blacklist: Arc<dyn KvCache>,

    debounce: Duration,
    timeout: Duration,
    max_retries: u32,
    blacklist_ttl: Duration,
}

/// Debounced push dispatcher: `enqueue` stages envelopes in the events cache
/// and a periodic tick drains and transmits them, retrying failures up to a
/// bound before blacklisting the target token for a cooldown.
#[derive(Clone)]
pub struct PushService {
    inner: Arc<Inner>,
}

impl PushService {
    pub fn new(
        client: Arc<dyn PushClient>,
        events: Arc<dyn KvCache>,
        blacklist: Arc<dyn KvCache>,
        debounce: Duration,
        timeout: Duration,
        max_retries: u32,
        blacklist_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                events,
                blacklist,
                debounce: debounce.max(Duration::from_secs(5)),
                timeout: timeout.max(Duration::from_secs(1)),
                max_retries: max_retries.max(1),
                blacklist_ttl,
            }),
        }
    }

    /// Stages an event for the token. Blacklisted tokens are dropped; a newer
    /// event for the same `(token, type)` overwrites a staged one.
    pub fn enqueue(&self, token: &str, event: PushEvent) -> Result<(), PushError> {
        if self
            .inner
            .blacklist
            .get(token, GetOptions::default())
            .is_ok()
        {
            debug!(token = %token, "skipping blacklisted push token");
            return Ok(());
        }

        let envelope = EventEnvelope {
            token: token.to_string(),
            event,
            retries: 0,
        };
        let payload = serde_json::to_vec(&envelope)?;
        self.inner
            .events
            .set(&envelope.key(), payload, SetOptions::default())?;

        Ok(())
    }

    /// Drives the batch tick until the process shuts down.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.inner.debounce);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.send_all().await;
        }
    }

    pub async fn send_all(&self) {
        let raw_events = match self.inner.events.drain() {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = %err, "failed to drain push events cache");
                return;
            }
        };
        if raw_events.is_empty() {
            return;
        }

        let envelopes: Vec<EventEnvelope> = raw_events
            .into_values()
            .filter_map(|value| match serde_json::from_slice(&value) {
                Ok(envelope) => Some(envelope),
                Err(err) => {
                    error!(error = %err, "failed to deserialize push envelope");
                    None
                }
            })
            .collect();
        if envelopes.is_empty() {
            return;
        }

        let messages: Vec<PushMessage> = envelopes
            .iter()
            .map(|envelope| PushMessage {
                token: envelope.token.clone(),
                event: envelope.event.clone(),
            })
            .collect();

        info!(total = messages.len(), "sending push batch");

        let outcome =
            tokio::time::timeout(self.inner.timeout, self.inner.client.send(&messages)).await;

        match outcome {
            Ok(Ok(slots)) => {
                let failed: Vec<EventEnvelope> = envelopes
                    .into_iter()
                    .zip(slots)
                    .filter_map(|(envelope, slot)| {
                        slot.map(|reason| {
                            error!(token = %envelope.token, reason = %reason, "push send failed");
                            envelope
                        })
                    })
                    .collect();
                if !failed.is_empty() {
                    self.retry(failed);
                }
            }
            Ok(Err(err)) => {
                error!(error = %err, "push batch failed");
                self.retry(envelopes);
            }
            Err(_) => {
                error!("push batch timed out");
                self.retry(envelopes);
            }
        }
    }

    fn retry(&self, envelopes: Vec<EventEnvelope>) {
        for mut envelope in envelopes {
            envelope.retries += 1;

            if envelope.retries >= self.inner.max_retries {
                if let Err(err) = self.inner.blacklist.set(
                    &envelope.token,
                    Vec::new(),
                    SetOptions::ttl(self.inner.blacklist_ttl),
                ) {
                    warn!(token = %envelope.token, error = %err, "failed to blacklist token");
                    continue;
                }
                warn!(
                    token = %envelope.token,
                    ttl = ?self.inner.blacklist_ttl,
                    "retries exceeded, token blacklisted"
                );
                continue;
            }

            let payload = match serde_json::to_vec(&envelope) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(error = %err, "failed to serialize push envelope");
                    continue;
                }
            };
            // A newer envelope staged for the same key wins over the retry.
            if let Err(CacheError::Exists) =
                self.inner
                    .events
                    .set_or_fail(&envelope.key(), payload, SetOptions::default())
            {
                debug!(key = %envelope.key(), "newer envelope supersedes retry");
            }
        }
    }
}
