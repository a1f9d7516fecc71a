//! The append protocol.
//!
//! An append runs in a single transaction: lock the stream row, check the
//! caller's expected version against the head, batch-insert the messages, and
//! advance the head. Conflicts surface in two ways and are classified by
//! structured constraint names:
//!
//! - `stream_id_key` (two creators raced) and
//!   `message_stream_id_internal_stream_version_unique` (two appends raced) are
//!   concurrency conflicts, retried with bounded backoff when the caller
//!   passed [`ExpectedVersion::Any`];
//! - `message_message_id_key` means a message id already exists somewhere in
//!   the store and is never retried.
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::PgDatabaseError;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use streamstore::{stream, AppendResult, ExpectedVersion, NewMessage, Position};

use crate::Error;

use super::PgStreamStore;

const MAX_APPEND_ATTEMPTS: u32 = 200;
const RETRY_BACKOFF_FACTOR: f64 = 1.05;
const MAX_RETRY_DELAY_MS: f64 = 50.0;

const UNIQUE_VIOLATION: &str = "23505";
const STREAM_ID_KEY: &str = "stream_id_key";
const STREAM_VERSION_KEY: &str = "message_stream_id_internal_stream_version_unique";
const MESSAGE_ID_KEY: &str = "message_message_id_key";

/// Outcome of an append inside its transaction, including the retention hints
/// read from the stream row for the (not yet implemented) scavenger.
pub(super) struct AppendOutcome {
    pub stream_version: i64,
    pub position: Position,
    pub max_age: Option<i64>,
    pub max_count: Option<i64>,
}

impl PgStreamStore {
    pub(crate) async fn append(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        messages: Vec<NewMessage>,
    ) -> Result<AppendResult, Error> {
        validate_stream_id(stream_id)?;
        validate_messages(&messages)?;
        let _guard = self.enter_write()?;
        self.append_with_retry(stream_id, expected_version, &messages)
            .await
    }

    /// Append path shared with the operational writes (metadata entries and
    /// deletion tombstones), which skip the public parameter validation. The
    /// caller holds the write latch.
    pub(super) async fn append_with_retry(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        messages: &[NewMessage],
    ) -> Result<AppendResult, Error> {
        with_concurrency_retry(stream_id, expected_version, || {
            self.try_append(stream_id, expected_version, messages)
        })
        .await
    }

    async fn try_append(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        messages: &[NewMessage],
    ) -> Result<AppendResult, Error> {
        let mut tx = self.reader.pool().begin().await?;
        let outcome = append_in_tx(&mut tx, stream_id, expected_version, messages).await?;
        tx.commit().await?;
        if outcome.max_age.is_some() || outcome.max_count.is_some() {
            tracing::trace!(
                stream_id,
                max_age = ?outcome.max_age,
                max_count = ?outcome.max_count,
                "retention hints observed, scavenging not implemented"
            );
        }
        Ok(AppendResult {
            stream_version: outcome.stream_version,
            position: outcome.position,
        })
    }
}

/// Retries `op` on concurrency conflicts when the caller holds no version
/// expectation. Anything else propagates immediately.
pub(super) async fn with_concurrency_retry<T, F, Fut>(
    stream_id: &str,
    expected_version: ExpectedVersion,
    op: F,
) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(Error::Concurrency)
                if expected_version == ExpectedVersion::Any
                    && attempt + 1 < MAX_APPEND_ATTEMPTS =>
            {
                attempt += 1;
                tracing::debug!(stream_id, attempt, "append raced, retrying");
                tokio::time::sleep(retry_delay(attempt)).await;
            }
            result => return result,
        }
    }
}

/// Appends `messages` to `stream_id` inside `tx`, creating the stream row if
/// needed. An empty batch checks the expected version and reports the current
/// head without writing.
pub(super) async fn append_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: &str,
    expected_version: ExpectedVersion,
    messages: &[NewMessage],
) -> Result<AppendOutcome, Error> {
    let now = Utc::now();
    let stream = lock_stream(tx, stream_id).await?;

    if messages.is_empty() {
        return match (stream, expected_version) {
            (Some(_), ExpectedVersion::Empty) => Err(Error::Concurrency),
            (Some(s), ExpectedVersion::Exact(v)) if s.version != v => Err(Error::Concurrency),
            (Some(s), _) => Ok(AppendOutcome {
                stream_version: s.version,
                position: Position::new(s.position),
                max_age: s.max_age,
                max_count: s.max_count,
            }),
            (None, ExpectedVersion::Exact(_)) => Err(Error::Concurrency),
            (None, _) => Ok(AppendOutcome {
                stream_version: -1,
                position: Position::START,
                max_age: None,
                max_count: None,
            }),
        };
    }

    let (stream_id_internal, base_version, max_age, max_count) = match (stream, expected_version) {
        (Some(_), ExpectedVersion::Empty) => return Err(Error::Concurrency),
        (Some(s), ExpectedVersion::Exact(v)) if s.version != v => return Err(Error::Concurrency),
        (Some(s), _) => (s.id_internal, s.version, s.max_age, s.max_count),
        (None, ExpectedVersion::Exact(_)) => return Err(Error::Concurrency),
        (None, _) => {
            // A deleted id may only be re-created without an expectation.
            if expected_version == ExpectedVersion::Empty && was_deleted(tx, stream_id).await? {
                return Err(Error::Concurrency);
            }
            (insert_stream(tx, stream_id).await?, -1, None, None)
        }
    };

    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "INSERT INTO message (message_id, stream_id_internal, stream_version, type, data, metadata, created_at) ",
    );
    builder.push_values(messages.iter().enumerate(), |mut b, (offset, message)| {
        b.push_bind(message.id);
        b.push_bind(stream_id_internal);
        b.push_bind(base_version + 1 + offset as i64);
        b.push_bind(message.message_type.clone());
        b.push_bind(message.data.clone());
        b.push_bind(message.metadata.clone());
        b.push_bind(now);
    });
    builder.push(" RETURNING position");
    let rows = builder
        .build()
        .fetch_all(&mut **tx)
        .await
        .map_err(classify_unique_violation)?;

    let position: i64 = rows.last().map(|row| row.get(0)).unwrap_or_default();
    let stream_version = base_version + messages.len() as i64;

    sqlx::query("UPDATE stream SET version = $1, position = $2 WHERE id_internal = $3")
        .bind(stream_version)
        .bind(position)
        .bind(stream_id_internal)
        .execute(&mut **tx)
        .await?;

    Ok(AppendOutcome {
        stream_version,
        position: Position::new(position),
        max_age,
        max_count,
    })
}

pub(super) struct LockedStream {
    pub id_internal: i64,
    pub version: i64,
    pub position: i64,
    pub max_age: Option<i64>,
    pub max_count: Option<i64>,
}

/// Locks the stream row for the rest of the transaction, serializing appends
/// per stream.
pub(super) async fn lock_stream(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: &str,
) -> Result<Option<LockedStream>, Error> {
    Ok(sqlx::query(
        "SELECT id_internal, version, position, max_age, max_count FROM stream WHERE id = $1 FOR UPDATE",
    )
    .bind(stream_id)
    .fetch_optional(&mut **tx)
    .await?
    .map(|row| LockedStream {
        id_internal: row.get("id_internal"),
        version: row.get("version"),
        position: row.get("position"),
        max_age: row.get("max_age"),
        max_count: row.get("max_count"),
    }))
}

/// Whether `stream_id` has a tombstone on the deletion stream.
async fn was_deleted(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: &str,
) -> Result<bool, Error> {
    Ok(sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM message m \
         JOIN stream s ON s.id_internal = m.stream_id_internal \
         WHERE s.id = $1 AND m.type = $2 AND m.data->>'streamId' = $3)",
    )
    .bind(stream::DELETED_STREAM_ID)
    .bind(stream::STREAM_DELETED_TYPE)
    .bind(stream_id)
    .fetch_one(&mut **tx)
    .await?)
}

/// Creates the stream row. A concurrent creator hits `stream_id_key` here,
/// which classifies as a concurrency conflict.
async fn insert_stream(tx: &mut Transaction<'_, Postgres>, stream_id: &str) -> Result<i64, Error> {
    sqlx::query_scalar("INSERT INTO stream (id, stream_type) VALUES ($1, $2) RETURNING id_internal")
        .bind(stream_id)
        .bind(stream::stream_type(stream_id))
        .fetch_one(&mut **tx)
        .await
        .map_err(classify_unique_violation)
}

fn classify_unique_violation(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            match db.constraint() {
                Some(MESSAGE_ID_KEY) => {
                    let detail = db
                        .try_downcast_ref::<PgDatabaseError>()
                        .and_then(|pg| pg.detail())
                        .unwrap_or("");
                    return Error::DuplicateMessage(duplicate_message_id(detail));
                }
                Some(STREAM_ID_KEY) | Some(STREAM_VERSION_KEY) => return Error::Concurrency,
                _ => {}
            }
        }
    }
    Error::Database(err)
}

/// Postgres reports the conflicting key as
/// `Key (message_id)=(<uuid>) already exists.`; the offending id sits between
/// `=(` and `)`.
fn duplicate_message_id(detail: &str) -> Uuid {
    detail
        .split_once("=(")
        .and_then(|(_, rest)| rest.split_once(')'))
        .and_then(|(id, _)| Uuid::parse_str(id).ok())
        .unwrap_or_else(Uuid::nil)
}

fn retry_delay(attempt: u32) -> Duration {
    let ms = RETRY_BACKOFF_FACTOR
        .powi(attempt as i32)
        .min(MAX_RETRY_DELAY_MS);
    Duration::from_micros((ms * 1_000.0) as u64)
}

pub(super) fn validate_stream_id(stream_id: &str) -> Result<(), Error> {
    if stream_id.is_empty() {
        return Err(Error::InvalidParameter("stream_id is required".into()));
    }
    if stream::is_operational(stream_id) {
        return Err(Error::InvalidParameter(
            "stream_id must not be an operational stream".into(),
        ));
    }
    Ok(())
}

fn validate_messages(messages: &[NewMessage]) -> Result<(), Error> {
    for message in messages {
        if message.id.is_nil() {
            return Err(Error::InvalidParameter("message id must be a UUID".into()));
        }
        if message.message_type.is_empty() {
            return Err(Error::InvalidParameter("message type is required".into()));
        }
        if message.data.is_null() {
            return Err(Error::InvalidParameter("message data is required".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_delays_grow_and_cap_at_fifty_milliseconds() {
        let mut previous = Duration::ZERO;
        for attempt in 1..MAX_APPEND_ATTEMPTS {
            let delay = retry_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(50));
            previous = delay;
        }
        assert_eq!(retry_delay(MAX_APPEND_ATTEMPTS), Duration::from_millis(50));
    }

    #[test]
    fn it_extracts_the_duplicate_id_from_the_constraint_detail() {
        let id = duplicate_message_id(
            "Key (message_id)=(6a00cf6e-43e6-4ed2-9724-8a8c9bbd07e4) already exists.",
        );
        assert_eq!(
            id,
            Uuid::parse_str("6a00cf6e-43e6-4ed2-9724-8a8c9bbd07e4").unwrap()
        );
        assert_eq!(duplicate_message_id("no key here"), Uuid::nil());
        assert_eq!(duplicate_message_id("Key (message_id)=(garbage)"), Uuid::nil());
    }

    #[test]
    fn stream_ids_must_be_present_and_not_operational() {
        assert!(validate_stream_id("account-42").is_ok());
        assert!(matches!(
            validate_stream_id(""),
            Err(Error::InvalidParameter(message)) if message == "stream_id is required"
        ));
        assert!(matches!(
            validate_stream_id("$lol"),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            validate_stream_id("$$account-42"),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn messages_must_carry_an_id_a_type_and_data() {
        let valid = NewMessage::new("Credited", json!({"amount": 5}));
        assert!(validate_messages(&[valid.clone()]).is_ok());

        let nil_id = valid.clone().with_id(Uuid::nil());
        assert!(matches!(
            validate_messages(&[nil_id]),
            Err(Error::InvalidParameter(message)) if message == "message id must be a UUID"
        ));

        let mut no_type = valid.clone();
        no_type.message_type = String::new();
        assert!(matches!(
            validate_messages(&[no_type]),
            Err(Error::InvalidParameter(message)) if message == "message type is required"
        ));

        let mut null_data = valid;
        null_data.data = serde_json::Value::Null;
        assert!(matches!(
            validate_messages(&[null_data]),
            Err(Error::InvalidParameter(message)) if message == "message data is required"
        ));
    }
}
