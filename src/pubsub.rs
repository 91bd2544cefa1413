use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PubSubError {
    #[error("pubsub is closed")]
    Closed,
    #[error("invalid topic name")]
    InvalidTopic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

type SubscriberMap = HashMap<String, HashMap<Uuid, mpsc::Sender<TopicMessage>>>;

struct Inner {
    buffer_size: usize,
    topics: RwLock<SubscriberMap>,
    closed: AtomicBool,
}

/// In-process topic bus. Every subscriber owns a buffered queue; `publish`
/// fans the payload out and waits for each subscriber slot, so callers bound
/// it with a timeout when delivery must not stall them.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl PubSub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer_size: buffer_size.max(1),
                topics: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        if topic.is_empty() {
            return Err(PubSubError::InvalidTopic);
        }

        let senders: Vec<mpsc::Sender<TopicMessage>> = {
            let topics = self.inner.topics.read();
            match topics.get(topic) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => return Ok(()),
            }
        };

        let message = TopicMessage {
            topic: topic.to_string(),
            data,
        };
        for sender in senders {
            // A dropped receiver is not a publish failure.
            let _ = sender.send(message.clone()).await;
        }

        Ok(())
    }

    pub fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        if topic.is_empty() {
            return Err(PubSubError::InvalidTopic);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);

        Ok(Subscription {
            id,
            topic: topic.to_string(),
            rx,
            inner: self.inner.clone(),
        })
    }

    /// Drops all subscriber senders; readers drain what is buffered, then end.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.topics.write().clear();
    }
}

pub struct Subscription {
    id: Uuid,
    topic: String,
    rx: mpsc::Receiver<TopicMessage>,
    inner: Arc<Inner>,
}

impl Subscription {
    /// Receives the next message; `None` once the bus is closed and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<TopicMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut topics = self.inner.topics.write();
        if let Some(subscribers) = topics.get_mut(&self.topic) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                topics.remove(&self.topic);
            }
        }
    }
}
