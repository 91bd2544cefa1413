use chrono::{NaiveDateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::sql_types::{Array, BigInt};
use diesel::PgConnection;

use crate::models::{
    Message, MessageRecipient, MessageStateRow, NewMessage, NewMessageRecipient,
    NewMessageStateRow,
};
use crate::schema::{devices, message_recipients, message_states, messages};

use super::{
    MessageError, Order, ProcessingState, RecipientState, SelectFilter, SelectOptions,
    MAX_PENDING_BATCH,
};

/// A message row together with its preloaded children.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message: Message,
    pub recipients: Vec<MessageRecipient>,
    pub states: Vec<MessageStateRow>,
}

/// Reconciliation payload applied by `update_state`. Recipient phone numbers
/// are expected to be normalised (and hashed, for hashed messages) by the
/// caller.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub message_id: i64,
    pub state: ProcessingState,
    pub states: Vec<(String, NaiveDateTime)>,
    pub recipients: Vec<RecipientState>,
}

macro_rules! apply_filter {
    ($query:expr, $filter:expr) => {{
        let mut query = $query;
        if let Some(ext_id) = $filter.ext_id.clone() {
            query = query.filter(messages::ext_id.eq(ext_id));
        }
        if let Some(device_id) = $filter.device_id.clone() {
            query = query.filter(messages::device_id.eq(device_id));
        }
        if let Some(state) = $filter.state {
            query = query.filter(messages::state.eq(state.as_str()));
        }
        if let Some(start) = $filter.start_date {
            query = query.filter(messages::created_at.ge(start));
        }
        if let Some(end) = $filter.end_date {
            query = query.filter(messages::created_at.lt(end));
        }
        if let Some(user_id) = $filter.user_id.clone() {
            let owned = devices::table
                .filter(devices::user_id.eq(user_id))
                .select(devices::id);
            query = query.filter(messages::device_id.eq_any(owned));
        }
        query
    }};
}

pub fn select(
    conn: &mut PgConnection,
    filter: &SelectFilter,
    options: &SelectOptions,
) -> Result<(Vec<MessageRecord>, i64), MessageError> {
    let total: i64 = apply_filter!(
        messages::table.select(count_star()).into_boxed(),
        filter
    )
    .get_result(conn)?;

    let mut query = apply_filter!(messages::table.into_boxed(), filter);
    query = match options.order {
        Order::Fifo => query.order((messages::priority.desc(), messages::id.asc())),
        Order::Lifo => query.order((messages::priority.desc(), messages::id.desc())),
    };
    if let Some(limit) = options.limit {
        query = query.limit(limit);
    }
    if let Some(offset) = options.offset {
        query = query.offset(offset);
    }

    let rows: Vec<Message> = query.load(conn)?;

    let recipients = if options.with_recipients {
        MessageRecipient::belonging_to(&rows)
            .load::<MessageRecipient>(conn)?
            .grouped_by(&rows)
    } else {
        vec![Vec::new(); rows.len()]
    };
    let states = if options.with_states {
        MessageStateRow::belonging_to(&rows)
            .load::<MessageStateRow>(conn)?
            .grouped_by(&rows)
    } else {
        vec![Vec::new(); rows.len()]
    };

    let records = rows
        .into_iter()
        .zip(recipients)
        .zip(states)
        .map(|((message, recipients), states)| MessageRecord {
            message,
            recipients,
            states,
        })
        .collect();

    Ok((records, total))
}

pub fn select_pending(
    conn: &mut PgConnection,
    device_id: &str,
    order: Order,
) -> Result<Vec<MessageRecord>, MessageError> {
    let filter = SelectFilter {
        device_id: Some(device_id.to_string()),
        state: Some(ProcessingState::Pending),
        ..SelectFilter::default()
    };
    let options = SelectOptions {
        with_recipients: true,
        order,
        limit: Some(MAX_PENDING_BATCH),
        ..SelectOptions::default()
    };

    let (records, _) = select(conn, &filter, &options)?;
    Ok(records)
}

pub fn get(
    conn: &mut PgConnection,
    filter: &SelectFilter,
    options: &SelectOptions,
) -> Result<MessageRecord, MessageError> {
    let (mut records, _) = select(conn, filter, options)?;
    match records.len() {
        0 => Err(MessageError::NotFound),
        1 => Ok(records.remove(0)),
        _ => Err(MessageError::MoreThanOne),
    }
}

/// Persists a message with its recipients. A `(ext_id, device_id)` collision
/// maps to `AlreadyExists` so callers can answer 409.
pub fn insert(
    conn: &mut PgConnection,
    message: &NewMessage,
    phone_numbers: &[String],
) -> Result<MessageRecord, MessageError> {
    conn.transaction::<_, MessageError, _>(|conn| {
        let inserted: Message = diesel::insert_into(messages::table)
            .values(message)
            .get_result(conn)
            .map_err(|err| match err {
                diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    MessageError::AlreadyExists
                }
                other => MessageError::Database(other),
            })?;

        let recipients: Vec<NewMessageRecipient> = phone_numbers
            .iter()
            .map(|phone_number| NewMessageRecipient {
                message_id: inserted.id,
                phone_number: phone_number.clone(),
                state: ProcessingState::Pending.as_str().to_string(),
                error: None,
            })
            .collect();
        let recipients: Vec<MessageRecipient> = diesel::insert_into(message_recipients::table)
            .values(&recipients)
            .get_results(conn)?;

        Ok(MessageRecord {
            message: inserted,
            recipients,
            states: Vec::new(),
        })
    })
}

/// Applies a device state report in one transaction. History rows use
/// `ON CONFLICT DO NOTHING`, so only the first entry into each state is
/// recorded; recipient rows are upserted by `(message_id, phone_number)`.
pub fn update_state(conn: &mut PgConnection, update: &StateUpdate) -> Result<(), MessageError> {
    conn.transaction::<_, MessageError, _>(|conn| {
        diesel::update(messages::table.find(update.message_id))
            .set((
                messages::state.eq(update.state.as_str()),
                messages::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        let history: Vec<NewMessageStateRow> = update
            .states
            .iter()
            .map(|(state, at)| NewMessageStateRow {
                message_id: update.message_id,
                state: state.clone(),
                updated_at: *at,
            })
            .collect();
        if !history.is_empty() {
            diesel::insert_into(message_states::table)
                .values(&history)
                .on_conflict((message_states::message_id, message_states::state))
                .do_nothing()
                .execute(conn)?;
        }

        for recipient in &update.recipients {
            diesel::insert_into(message_recipients::table)
                .values(&NewMessageRecipient {
                    message_id: update.message_id,
                    phone_number: recipient.phone_number.clone(),
                    state: recipient.state.as_str().to_string(),
                    error: recipient.error.clone(),
                })
                .on_conflict((
                    message_recipients::message_id,
                    message_recipients::phone_number,
                ))
                .do_update()
                .set((
                    message_recipients::state.eq(excluded(message_recipients::state)),
                    message_recipients::error.eq(excluded(message_recipients::error)),
                ))
                .execute(conn)?;
        }

        Ok(())
    })
}

/// One-way anonymisation of settled messages: the content becomes the SHA-256
/// of its plain text (or data) and recipient numbers are truncated digests.
/// Encrypted rows are exempt and `is_hashed` never flips back.
pub fn hash_processed(conn: &mut PgConnection, ids: &[i64]) -> Result<usize, MessageError> {
    conn.transaction::<_, MessageError, _>(|conn| {
        // Recipients first: eligibility is read from the messages table before
        // the flag flips.
        let mut recipients_sql =
            "UPDATE message_recipients r \
             SET phone_number = left(encode(sha256(convert_to(r.phone_number, 'UTF8')), 'hex'), 16) \
             FROM messages m \
             WHERE m.id = r.message_id AND m.is_hashed = false \
               AND m.is_encrypted = false AND m.state <> 'Pending'"
                .to_string();
        let mut messages_sql =
            "UPDATE messages \
             SET is_hashed = true, \
                 content = encode(sha256(convert_to(coalesce(content::json->>'text', content::json->>'data', ''), 'UTF8')), 'hex') \
             WHERE is_hashed = false AND is_encrypted = false AND state <> 'Pending'"
                .to_string();

        let affected = if ids.is_empty() {
            diesel::sql_query(recipients_sql).execute(conn)?;
            diesel::sql_query(messages_sql).execute(conn)?
        } else {
            recipients_sql.push_str(" AND m.id = ANY($1)");
            messages_sql.push_str(" AND id = ANY($1)");
            diesel::sql_query(recipients_sql)
                .bind::<Array<BigInt>, _>(ids.to_vec())
                .execute(conn)?;
            diesel::sql_query(messages_sql)
                .bind::<Array<BigInt>, _>(ids.to_vec())
                .execute(conn)?
        };

        Ok(affected)
    })
}

/// Deletes settled messages older than the cutoff; pending work is retained.
pub fn cleanup(conn: &mut PgConnection, until: NaiveDateTime) -> Result<usize, MessageError> {
    diesel::delete(
        messages::table
            .filter(messages::state.ne(ProcessingState::Pending.as_str()))
            .filter(messages::created_at.lt(until)),
    )
    .execute(conn)
    .map_err(MessageError::from)
}
