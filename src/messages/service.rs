use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::db::PgPool;
use crate::events::{Event, EventRouter};
use crate::ids::new_id;
use crate::models::{Device, NewMessage};

use super::cache::StateCache;
use super::hashing::HashingQueue;
use super::repository::{self, MessageRecord, StateUpdate};
use super::{
    DataContent, MessageError, MessageIn, MessageStateIn, MessageStateOut, MessageType, Order,
    PendingMessage, ProcessingState, RecipientState, SelectFilter, SelectOptions, TextContent,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};

const HASHED_PHONE_LENGTH: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    pub skip_phone_validation: bool,
}

/// The message-lifecycle engine: enqueue, per-device pull, per-recipient
/// state reconciliation, cached state reads, and the hashing hand-off.
#[derive(Clone)]
pub struct MessageService {
    pool: PgPool,
    cache: StateCache,
    events: EventRouter,
    hashing: Arc<HashingQueue>,
    phone_region: String,
}

impl MessageService {
    pub fn new(
        pool: PgPool,
        cache: StateCache,
        events: EventRouter,
        hashing: Arc<HashingQueue>,
        phone_region: String,
    ) -> Self {
        Self {
            pool,
            cache,
            events,
            hashing,
            phone_region,
        }
    }

    /// Validates and persists a message, caches its initial state, and
    /// notifies the owning device. Returns the state snapshot the caller can
    /// poll for.
    pub async fn enqueue(
        &self,
        device: Device,
        input: MessageIn,
        opts: EnqueueOptions,
    ) -> Result<MessageStateOut, MessageError> {
        let (message, phone_numbers) = self.prepare(&device, input, &opts)?;

        let pool = self.pool.clone();
        let record = run_blocking(move || {
            let mut conn = pool.get().map_err(internal)?;
            repository::insert(&mut conn, &message, &phone_numbers)
        })
        .await?;

        let state = record_to_state(&record);
        if let Err(err) = self.cache.set(&device.user_id, &state.id, Some(&state)) {
            warn!(ext_id = %state.id, error = %err, "failed to cache message state");
        }

        let events = self.events.clone();
        let user_id = device.user_id.clone();
        let device_id = device.id.clone();
        tokio::spawn(async move {
            if let Err(err) = events
                .notify(&user_id, Some(&device_id), Event::message_enqueued())
                .await
            {
                error!(
                    user_id = %user_id,
                    device_id = %device_id,
                    error = %err,
                    "failed to notify device about enqueued message"
                );
            }
        });

        Ok(state)
    }

    /// Up to 100 pending messages for a device, highest priority first and
    /// LIFO within a priority unless FIFO is requested.
    pub async fn select_pending(
        &self,
        device_id: &str,
        order: Order,
    ) -> Result<Vec<PendingMessage>, MessageError> {
        let pool = self.pool.clone();
        let device_id = device_id.to_string();
        let records = run_blocking(move || {
            let mut conn = pool.get().map_err(internal)?;
            repository::select_pending(&mut conn, &device_id, order)
        })
        .await?;

        records.iter().map(record_to_pending).collect()
    }

    /// Applies a device state report: loads the message by `(ext_id, device)`,
    /// coerces `Pending` to `Processed`, normalises recipient numbers (hashed
    /// messages match on the hashed form), and persists the reconciliation.
    pub async fn update_state(
        &self,
        device: &Device,
        input: MessageStateIn,
    ) -> Result<(), MessageError> {
        let pool = self.pool.clone();
        let filter = SelectFilter::default()
            .with_ext_id(input.id.clone())
            .with_device_id(device.id.clone());

        let record = run_blocking(move || {
            let mut conn = pool.get().map_err(internal)?;

            let record = repository::get(&mut conn, &filter, &SelectOptions::default())?;

            let state = coerce_pending(input.state);
            let update = StateUpdate {
                message_id: record.message.id,
                state,
                states: input
                    .states
                    .iter()
                    .map(|(name, at)| (name.clone(), *at))
                    .collect(),
                recipients: normalize_recipients(&input.recipients, record.message.is_hashed),
            };
            repository::update_state(&mut conn, &update)?;

            repository::get(
                &mut conn,
                &SelectFilter::default()
                    .with_ext_id(record.message.ext_id.clone())
                    .with_device_id(record.message.device_id.clone()),
                &SelectOptions {
                    with_recipients: true,
                    with_states: true,
                    ..SelectOptions::default()
                },
            )
        })
        .await?;

        let state = record_to_state(&record);
        if let Err(err) = self.cache.set(&device.user_id, &state.id, Some(&state)) {
            warn!(ext_id = %state.id, error = %err, "failed to cache message state");
        }
        self.hashing.enqueue(record.message.id);

        Ok(())
    }

    /// Filtered state listing for a user, with the total row count for
    /// pagination headers. The page size is capped at 100.
    pub async fn select_states(
        &self,
        user_id: &str,
        mut filter: SelectFilter,
        mut options: SelectOptions,
    ) -> Result<(Vec<MessageStateOut>, i64), MessageError> {
        filter.user_id = Some(user_id.to_string());
        options.with_recipients = true;
        options.with_states = true;
        options.limit = Some(
            options
                .limit
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        );

        let pool = self.pool.clone();
        let (records, total) = run_blocking(move || {
            let mut conn = pool.get().map_err(internal)?;
            repository::select(&mut conn, &filter, &options)
        })
        .await?;

        Ok((records.iter().map(record_to_state).collect(), total))
    }

    /// Single-state read through the cache. A cached empty payload means the
    /// id is known to be absent and storage is not consulted.
    pub async fn get_state(
        &self,
        user_id: &str,
        ext_id: &str,
    ) -> Result<MessageStateOut, MessageError> {
        match self.cache.get(user_id, ext_id) {
            Ok(Some(state)) => return Ok(state),
            Ok(None) => return Err(MessageError::NotFound),
            Err(_) => {}
        }

        let pool = self.pool.clone();
        let filter = SelectFilter::default()
            .with_ext_id(ext_id.to_string())
            .with_user_id(user_id.to_string());
        let result = run_blocking(move || {
            let mut conn = pool.get().map_err(internal)?;
            repository::get(
                &mut conn,
                &filter,
                &SelectOptions {
                    with_recipients: true,
                    with_states: true,
                    ..SelectOptions::default()
                },
            )
        })
        .await;

        match result {
            Ok(record) => {
                let state = record_to_state(&record);
                if let Err(err) = self.cache.set(user_id, ext_id, Some(&state)) {
                    warn!(ext_id = %ext_id, error = %err, "failed to cache message state");
                }
                Ok(state)
            }
            Err(MessageError::NotFound) => {
                if let Err(err) = self.cache.set(user_id, ext_id, None) {
                    warn!(ext_id = %ext_id, error = %err, "failed to cache negative state");
                }
                Err(MessageError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Asks the device to replay its inbox for the window as webhook events.
    pub async fn export_inbox(
        &self,
        device: &Device,
        since: chrono::DateTime<Utc>,
        until: chrono::DateTime<Utc>,
    ) -> Result<(), MessageError> {
        self.events
            .notify(
                &device.user_id,
                Some(&device.id),
                Event::messages_export_requested(since, until),
            )
            .await
            .map_err(|err| MessageError::Internal(err.to_string()))
    }

    fn prepare(
        &self,
        device: &Device,
        mut input: MessageIn,
        opts: &EnqueueOptions,
    ) -> Result<(NewMessage, Vec<String>), MessageError> {
        let is_encrypted = input.is_encrypted.unwrap_or(false);

        if input.phone_numbers.is_empty() {
            return Err(MessageError::Validation("no recipients".to_string()));
        }
        for (index, phone) in input.phone_numbers.iter_mut().enumerate() {
            if !is_encrypted && !opts.skip_phone_validation {
                *phone = clean_phone_number(phone, &self.phone_region).map_err(|err| {
                    MessageError::Validation(format!("phone in row {}: {err}", index + 1))
                })?;
            }
        }

        let valid_until = match input.ttl {
            Some(ttl) if ttl > 0 => Some(
                Utc::now().naive_utc()
                    + chrono::Duration::from_std(Duration::from_secs(ttl)).unwrap_or_else(|_| chrono::Duration::zero()),
            ),
            _ => input.valid_until.map(|until| until.naive_utc()),
        };

        let (message_type, content) = match (&input.text_message, &input.data_message) {
            (Some(text), _) => (
                MessageType::Text,
                serde_json::to_string(text).map_err(internal)?,
            ),
            (None, Some(data)) => (
                MessageType::Data,
                serde_json::to_string(data).map_err(internal)?,
            ),
            (None, None) => return Err(MessageError::NoContent),
        };

        let ext_id = match input.id {
            Some(id) if !id.is_empty() => id,
            _ => new_id(),
        };

        let message = NewMessage {
            device_id: device.id.clone(),
            ext_id,
            message_type: message_type.as_str().to_string(),
            content,
            state: ProcessingState::Pending.as_str().to_string(),
            priority: input.priority.unwrap_or(0).clamp(-128, 127),
            sim_number: input.sim_number,
            valid_until,
            with_delivery_report: input.with_delivery_report.unwrap_or(true),
            is_encrypted,
        };

        Ok((message, input.phone_numbers))
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, MessageError>
where
    F: FnOnce() -> Result<T, MessageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| MessageError::Internal(err.to_string()))?
}

fn internal(err: impl std::fmt::Display) -> MessageError {
    MessageError::Internal(err.to_string())
}

fn coerce_pending(state: ProcessingState) -> ProcessingState {
    if state == ProcessingState::Pending {
        ProcessingState::Processed
    } else {
        state
    }
}

/// Normalises recipient reports: older clients omit the leading `+`, and
/// reports for already-hashed messages must match the stored hashed form.
fn normalize_recipients(recipients: &[RecipientState], hashed: bool) -> Vec<RecipientState> {
    recipients
        .iter()
        .map(|recipient| {
            let mut phone_number = recipient.phone_number.clone();
            if !phone_number.is_empty() && !phone_number.starts_with('+') {
                phone_number = format!("+{phone_number}");
            }
            if hashed {
                phone_number = hash_phone(&phone_number);
            }

            RecipientState {
                phone_number,
                state: coerce_pending(recipient.state),
                error: recipient.error.clone(),
            }
        })
        .collect()
}

pub fn hash_phone(phone: &str) -> String {
    hex::encode(Sha256::digest(phone.as_bytes()))[..HASHED_PHONE_LENGTH].to_string()
}

fn clean_phone_number(input: &str, region: &str) -> Result<String, String> {
    let region = region.parse::<phonenumber::country::Id>().ok();

    let number = phonenumber::parse(region, input)
        .map_err(|err| format!("failed to parse phone number: {err}"))?;
    if !phonenumber::is_valid(&number) {
        return Err("invalid phone number".to_string());
    }

    // Messages go out over the cellular network; toll-free, premium and the
    // like are not deliverable targets.
    let kind = number.number_type(&phonenumber::metadata::DATABASE);
    if !matches!(
        kind,
        phonenumber::Type::Mobile | phonenumber::Type::FixedLineOrMobile
    ) {
        return Err("not a mobile phone number".to_string());
    }

    Ok(number
        .format()
        .mode(phonenumber::Mode::E164)
        .to_string())
}

fn record_to_state(record: &MessageRecord) -> MessageStateOut {
    let states: HashMap<String, NaiveDateTime> = record
        .states
        .iter()
        .map(|row| (row.state.clone(), row.updated_at))
        .collect();

    MessageStateOut {
        id: record.message.ext_id.clone(),
        device_id: record.message.device_id.clone(),
        state: ProcessingState::parse(&record.message.state).unwrap_or(ProcessingState::Pending),
        is_hashed: record.message.is_hashed,
        is_encrypted: record.message.is_encrypted,
        recipients: record
            .recipients
            .iter()
            .map(|recipient| RecipientState {
                phone_number: recipient.phone_number.clone(),
                state: ProcessingState::parse(&recipient.state)
                    .unwrap_or(ProcessingState::Pending),
                error: recipient.error.clone(),
            })
            .collect(),
        states,
    }
}

fn record_to_pending(record: &MessageRecord) -> Result<PendingMessage, MessageError> {
    let mut text_message = None;
    let mut data_message = None;
    match record.message.message_type.as_str() {
        "Text" => {
            text_message = Some(
                serde_json::from_str::<TextContent>(&record.message.content).map_err(internal)?,
            );
        }
        "Data" => {
            data_message = Some(
                serde_json::from_str::<DataContent>(&record.message.content).map_err(internal)?,
            );
        }
        other => {
            return Err(MessageError::Internal(format!(
                "unknown message type {other}"
            )))
        }
    }

    Ok(PendingMessage {
        id: record.message.ext_id.clone(),
        text_message,
        data_message,
        phone_numbers: record
            .recipients
            .iter()
            .map(|recipient| recipient.phone_number.clone())
            .collect(),
        sim_number: record.message.sim_number,
        with_delivery_report: record.message.with_delivery_report,
        is_encrypted: record.message.is_encrypted,
        priority: record.message.priority,
        valid_until: record.message.valid_until,
        created_at: record.message.created_at,
    })
}
