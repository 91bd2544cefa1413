use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SseError {
    #[error("device has no open event stream")]
    NoConnection,
    #[error("event stream buffer is full")]
    BufferFull,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SseEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: HashMap<String, String>,
}

type ChannelMap = Arc<DashMap<String, (Uuid, mpsc::Sender<SseEvent>)>>;

/// Per-device persistent event channels. At most one stream per device: a
/// reconnect replaces the previous channel and its reader ends. Writers never
/// block; a full buffer drops the event at the sender.
#[derive(Clone)]
pub struct SseHub {
    channels: ChannelMap,
    buffer_size: usize,
}

impl SseHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Opens the device's stream, replacing any previous one.
    pub fn subscribe(&self, device_id: &str) -> SseStream {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer_size);
        if self
            .channels
            .insert(device_id.to_string(), (id, tx))
            .is_some()
        {
            debug!(device_id = %device_id, "replacing existing event stream");
        }

        SseStream {
            rx,
            guard: StreamGuard {
                id,
                device_id: device_id.to_string(),
                channels: self.channels.clone(),
            },
        }
    }

    /// Offers an event to the device's stream without blocking the caller.
    pub fn send(&self, device_id: &str, event: SseEvent) -> Result<(), SseError> {
        let entry = self
            .channels
            .get(device_id)
            .ok_or(SseError::NoConnection)?;

        entry.1.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SseError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => SseError::NoConnection,
        })
    }

    /// Closes every stream; readers end after draining.
    pub fn close(&self) {
        self.channels.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.channels.len()
    }
}

/// Unregisters the channel when the reader goes away, unless a newer stream
/// already took its place.
pub struct StreamGuard {
    id: Uuid,
    device_id: String,
    channels: ChannelMap,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.channels
            .remove_if(&self.device_id, |_, (id, _)| *id == self.id);
    }
}

/// Reader half of a device's stream.
pub struct SseStream {
    rx: mpsc::Receiver<SseEvent>,
    guard: StreamGuard,
}

impl SseStream {
    pub async fn recv(&mut self) -> Option<SseEvent> {
        self.rx.recv().await
    }

    pub fn into_parts(self) -> (mpsc::Receiver<SseEvent>, StreamGuard) {
        (self.rx, self.guard)
    }
}
