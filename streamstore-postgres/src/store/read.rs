//! Range reads over streams and the all-stream.
//!
//! `PgReader` is the read-only half of the store. Subscriptions and the
//! polling notifier hold their own clone of it instead of the store itself,
//! so nothing they own points back at the subscription registry.
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use streamstore::{AllPage, Message, Position, ReadDirection, StreamPage};
use tokio_util::sync::CancellationToken;

use crate::gap::{self, GapPolicy};
use crate::Error;

const STREAM_MESSAGES_FORWARD: &str = "SELECT s.id AS stream_id, m.message_id, m.type, m.data, \
     m.metadata, m.stream_version, m.position, m.created_at \
     FROM message m JOIN stream s ON s.id_internal = m.stream_id_internal \
     WHERE s.id = $1 AND m.stream_version >= $2 ORDER BY m.stream_version ASC LIMIT $3";

const STREAM_MESSAGES_BACKWARD: &str = "SELECT s.id AS stream_id, m.message_id, m.type, m.data, \
     m.metadata, m.stream_version, m.position, m.created_at \
     FROM message m JOIN stream s ON s.id_internal = m.stream_id_internal \
     WHERE s.id = $1 AND m.stream_version <= $2 ORDER BY m.stream_version DESC LIMIT $3";

const ALL_MESSAGES_FORWARD: &str = "SELECT s.id AS stream_id, m.message_id, m.type, m.data, \
     m.metadata, m.stream_version, m.position, m.created_at \
     FROM message m JOIN stream s ON s.id_internal = m.stream_id_internal \
     WHERE m.position >= $1 ORDER BY m.position ASC LIMIT $2";

const ALL_MESSAGES_BACKWARD: &str = "SELECT s.id AS stream_id, m.message_id, m.type, m.data, \
     m.metadata, m.stream_version, m.position, m.created_at \
     FROM message m JOIN stream s ON s.id_internal = m.stream_id_internal \
     WHERE m.position <= $1 ORDER BY m.position DESC LIMIT $2";

/// Read-only access to the store.
#[derive(Clone)]
pub(crate) struct PgReader {
    pool: PgPool,
    gap: GapPolicy,
}

/// Head of a stream row at read time.
pub(crate) struct StreamInfo {
    pub version: i64,
    pub position: i64,
}

impl PgReader {
    pub(crate) fn new(pool: PgPool, gap: GapPolicy) -> Self {
        Self { pool, gap }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Reads up to `count` messages from one stream.
    ///
    /// One probe row beyond `count` is fetched to decide `is_end` without a
    /// second query. The stream info is read *after* the messages: a
    /// concurrent append can only move the returned head past the returned
    /// last message, never behind it.
    pub(crate) async fn read_stream(
        &self,
        stream_id: &str,
        from_version: i64,
        count: u64,
        direction: ReadDirection,
    ) -> Result<StreamPage, Error> {
        let sql = match direction {
            ReadDirection::Forward => STREAM_MESSAGES_FORWARD,
            ReadDirection::Backward => STREAM_MESSAGES_BACKWARD,
        };
        let rows = sqlx::query(sql)
            .bind(stream_id)
            .bind(from_version)
            .bind(probe_limit(count))
            .fetch_all(&self.pool)
            .await?;
        let Some(info) = self.stream_info(stream_id).await? else {
            return Ok(StreamPage {
                stream_id: stream_id.to_owned(),
                stream_version: 0,
                stream_position: Position::START,
                next_version: 0,
                is_end: true,
                messages: Vec::new(),
            });
        };

        let mut messages: Vec<Message> = rows.iter().map(message_from_row).collect();
        let is_end = messages.len() as u64 <= count;
        if !is_end {
            messages.truncate(count as usize);
        }
        let next_version = next_stream_version(
            direction,
            is_end,
            info.version,
            messages.last().map(|m| m.stream_version),
        );
        Ok(StreamPage {
            stream_id: stream_id.to_owned(),
            stream_version: info.version,
            stream_position: Position::new(info.position),
            next_version,
            is_end,
            messages,
        })
    }

    /// Reads up to `count` messages from the all-stream. Forward reads are
    /// gap-checked; backward reads cannot race an in-flight append into
    /// reordering, so they go straight through.
    pub(crate) async fn read_all(
        &self,
        from_position: Position,
        count: u64,
        direction: ReadDirection,
        cancel: &CancellationToken,
    ) -> Result<AllPage, Error> {
        match direction {
            ReadDirection::Backward => self.read_all_raw(from_position, count, direction).await,
            ReadDirection::Forward => {
                gap::read_gapless(
                    || self.read_all_raw(from_position, count, ReadDirection::Forward),
                    count,
                    &self.gap,
                    cancel,
                )
                .await
            }
        }
    }

    async fn read_all_raw(
        &self,
        from_position: Position,
        count: u64,
        direction: ReadDirection,
    ) -> Result<AllPage, Error> {
        let sql = match direction {
            ReadDirection::Forward => ALL_MESSAGES_FORWARD,
            ReadDirection::Backward => ALL_MESSAGES_BACKWARD,
        };
        let rows = sqlx::query(sql)
            .bind(from_position.get())
            .bind(probe_limit(count))
            .fetch_all(&self.pool)
            .await?;

        let mut messages: Vec<Message> = rows.iter().map(message_from_row).collect();
        let is_end = messages.len() as u64 <= count;
        if !is_end {
            messages.truncate(count as usize);
        }
        let next_position = match direction {
            ReadDirection::Forward => messages
                .last()
                .map(|m| m.position.next())
                .unwrap_or(from_position),
            ReadDirection::Backward => messages
                .last()
                .map(|m| m.position.prev())
                .unwrap_or(Position::START),
        };
        Ok(AllPage {
            messages,
            next_position,
            is_end,
        })
    }

    /// Global position of the most recent message, `0` for an empty store.
    pub(crate) async fn read_head_position(&self) -> Result<Position, Error> {
        let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) FROM message")
            .fetch_one(&self.pool)
            .await?;
        Ok(Position::new(head))
    }

    pub(crate) async fn stream_info(&self, stream_id: &str) -> Result<Option<StreamInfo>, Error> {
        Ok(
            sqlx::query("SELECT version, position FROM stream WHERE id = $1")
                .bind(stream_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| StreamInfo {
                    version: row.get("version"),
                    position: row.get("position"),
                }),
        )
    }
}

fn probe_limit(count: u64) -> i64 {
    count.saturating_add(1).min(i64::MAX as u64) as i64
}

fn message_from_row(row: &PgRow) -> Message {
    Message {
        stream_id: row.get("stream_id"),
        id: row.get("message_id"),
        message_type: row.get("type"),
        data: row.get("data"),
        metadata: row.get("metadata"),
        stream_version: row.get("stream_version"),
        position: Position::new(row.get("position")),
        created_at: row.get("created_at"),
    }
}

/// The version to continue a stream read from.
fn next_stream_version(
    direction: ReadDirection,
    is_end: bool,
    head_version: i64,
    last_version: Option<i64>,
) -> i64 {
    match direction {
        ReadDirection::Forward => {
            if is_end {
                head_version + 1
            } else {
                last_version.map(|v| v + 1).unwrap_or(head_version + 1)
            }
        }
        ReadDirection::Backward => {
            let version = if is_end { 0 } else { last_version.unwrap_or(0) };
            (version - 1).max(0)
        }
    }
}
