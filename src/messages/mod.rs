use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod hashing;
pub mod repository;
pub mod service;

pub use service::{EnqueueOptions, MessageService};

pub const MAX_PENDING_BATCH: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 100;
pub const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message not found")]
    NotFound,
    #[error("message with this id already exists")]
    AlreadyExists,
    #[error("multiple messages found")]
    MoreThanOne,
    #[error("no text or data content")]
    NoContent,
    #[error("{0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingState {
    Pending,
    Processed,
    Sent,
    Delivered,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "Pending",
            ProcessingState::Processed => "Processed",
            ProcessingState::Sent => "Sent",
            ProcessingState::Delivered => "Delivered",
            ProcessingState::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(ProcessingState::Pending),
            "Processed" => Some(ProcessingState::Processed),
            "Sent" => Some(ProcessingState::Sent),
            "Delivered" => Some(ProcessingState::Delivered),
            "Failed" => Some(ProcessingState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Data,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "Text",
            MessageType::Data => "Data",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataContent {
    pub data: String,
    pub port: u16,
}

/// Ordering of the pending queue within one priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Lifo,
    Fifo,
}

impl Order {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "lifo" => Some(Order::Lifo),
            "fifo" => Some(Order::Fifo),
            _ => None,
        }
    }
}

/// Enqueue request as accepted from API callers.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageIn {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub text_message: Option<TextContent>,
    #[serde(default)]
    pub data_message: Option<DataContent>,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub priority: Option<i16>,
    #[serde(default)]
    pub sim_number: Option<i16>,
    #[serde(default)]
    pub with_delivery_report: Option<bool>,
    #[serde(default)]
    pub is_encrypted: Option<bool>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub valid_until: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientState {
    pub phone_number: String,
    pub state: ProcessingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State report posted by a device for one message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStateIn {
    pub id: String,
    pub state: ProcessingState,
    #[serde(default)]
    pub recipients: Vec<RecipientState>,
    #[serde(default)]
    pub states: HashMap<String, NaiveDateTime>,
}

/// Caller-visible message state; also the cached representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageStateOut {
    pub id: String,
    pub device_id: String,
    pub state: ProcessingState,
    pub is_hashed: bool,
    pub is_encrypted: bool,
    pub recipients: Vec<RecipientState>,
    #[serde(default)]
    pub states: HashMap<String, NaiveDateTime>,
}

/// Pending work as handed to a device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_message: Option<TextContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_message: Option<DataContent>,
    pub phone_numbers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sim_number: Option<i16>,
    pub with_delivery_report: bool,
    pub is_encrypted: bool,
    pub priority: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct SelectFilter {
    pub ext_id: Option<String>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub state: Option<ProcessingState>,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
}

impl SelectFilter {
    pub fn with_ext_id(mut self, ext_id: impl Into<String>) -> Self {
        self.ext_id = Some(ext_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub with_recipients: bool,
    pub with_states: bool,
    pub order: Order,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
