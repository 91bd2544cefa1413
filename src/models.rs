use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub password_hash: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize, Deserialize)]
#[diesel(table_name = devices)]
#[diesel(belongs_to(User))]
pub struct Device {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub auth_token: String,
    pub push_token: Option<String>,
    pub last_seen: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = devices)]
pub struct NewDevice {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub auth_token: String,
    pub push_token: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = messages)]
#[diesel(belongs_to(Device))]
pub struct Message {
    pub id: i64,
    pub device_id: String,
    pub ext_id: String,
    pub message_type: String,
    pub content: String,
    pub state: String,
    pub priority: i16,
    pub sim_number: Option<i16>,
    pub valid_until: Option<NaiveDateTime>,
    pub with_delivery_report: bool,
    pub is_hashed: bool,
    pub is_encrypted: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub device_id: String,
    pub ext_id: String,
    pub message_type: String,
    pub content: String,
    pub state: String,
    pub priority: i16,
    pub sim_number: Option<i16>,
    pub valid_until: Option<NaiveDateTime>,
    pub with_delivery_report: bool,
    pub is_encrypted: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = message_recipients)]
#[diesel(belongs_to(Message))]
pub struct MessageRecipient {
    pub id: i64,
    pub message_id: i64,
    pub phone_number: String,
    pub state: String,
    pub error: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = message_recipients)]
pub struct NewMessageRecipient {
    pub message_id: i64,
    pub phone_number: String,
    pub state: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = message_states)]
#[diesel(belongs_to(Message))]
pub struct MessageStateRow {
    pub id: i64,
    pub message_id: i64,
    pub state: String,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = message_states)]
pub struct NewMessageStateRow {
    pub message_id: i64,
    pub state: String,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = tokens)]
#[diesel(belongs_to(User))]
pub struct TokenRecord {
    pub id: String,
    pub user_id: String,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tokens)]
pub struct NewTokenRecord {
    pub id: String,
    pub user_id: String,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = webhooks)]
#[diesel(belongs_to(User))]
pub struct Webhook {
    pub id: i64,
    pub ext_id: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub url: String,
    pub event: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhooks)]
pub struct NewWebhook {
    pub ext_id: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub url: String,
    pub event: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = device_settings)]
#[diesel(primary_key(user_id))]
pub struct DeviceSettingsRow {
    pub user_id: String,
    pub settings: serde_json::Value,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = device_settings)]
pub struct NewDeviceSettingsRow {
    pub user_id: String,
    pub settings: serde_json::Value,
}
