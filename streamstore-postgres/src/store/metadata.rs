//! Stream metadata and deletion.
//!
//! Metadata entries are ordinary appends to the companion `$$<id>` stream;
//! the latest entry wins on read. Deleting a stream removes its rows and its
//! companion stream in one transaction and records a `$streamDeleted`
//! tombstone on the operational `$deleted` stream.
use serde_json::json;
use uuid::Uuid;

use streamstore::{
    stream, ExpectedVersion, NewMessage, ReadDirection, StreamMetadata, StreamMetadataResult,
    STREAM_VERSION_END,
};

use crate::Error;

use super::append::{
    append_in_tx, lock_stream, validate_stream_id, with_concurrency_retry, LockedStream,
};
use super::PgStreamStore;

impl PgStreamStore {
    pub(crate) async fn get_metadata(
        &self,
        stream_id: &str,
    ) -> Result<StreamMetadataResult, Error> {
        if stream_id.is_empty() {
            return Err(Error::InvalidParameter("stream_id is required".into()));
        }
        if stream_id.starts_with("$$") {
            return Err(Error::InvalidParameter(
                "stream_id must not be a metadata stream".into(),
            ));
        }
        let page = self
            .reader
            .read_stream(
                &stream::metadata_stream_id(stream_id),
                STREAM_VERSION_END,
                1,
                ReadDirection::Backward,
            )
            .await?;
        let Some(entry) = page.messages.into_iter().next() else {
            return Ok(StreamMetadataResult::none());
        };
        let metadata: StreamMetadata = serde_json::from_value(entry.data).unwrap_or_default();
        Ok(StreamMetadataResult {
            metadata: metadata.metadata,
            metadata_stream_version: entry.stream_version,
            max_age: metadata.max_age,
            max_count: metadata.max_count,
        })
    }

    pub(crate) async fn set_metadata(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        metadata: StreamMetadata,
    ) -> Result<i64, Error> {
        validate_stream_id(stream_id)?;
        let _guard = self.enter_write()?;

        let data = serde_json::to_value(&metadata)
            .map_err(|err| Error::InvalidParameter(format!("metadata must be JSON: {err}")))?;
        let entry = NewMessage::new(stream::STREAM_METADATA_TYPE, data);
        let result = self
            .append_with_retry(
                &stream::metadata_stream_id(stream_id),
                expected_version,
                &[entry],
            )
            .await?;

        // Mirror the hints onto the live stream row so the append path can
        // observe them without reading the metadata stream.
        sqlx::query("UPDATE stream SET max_age = $1, max_count = $2 WHERE id = $3")
            .bind(metadata.max_age)
            .bind(metadata.max_count)
            .bind(stream_id)
            .execute(self.reader.pool())
            .await?;

        Ok(result.stream_version)
    }

    pub(crate) async fn delete_stream_with_tombstone(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
    ) -> Result<(), Error> {
        validate_stream_id(stream_id)?;
        let _guard = self.enter_write()?;
        with_concurrency_retry(stream_id, expected_version, || {
            self.try_delete_stream(stream_id, expected_version)
        })
        .await
    }

    async fn try_delete_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
    ) -> Result<(), Error> {
        let mut tx = self.reader.pool().begin().await?;
        let Some(stream_row) = lock_stream(&mut tx, stream_id).await? else {
            // Nothing to delete. An exact expectation is still a conflict.
            return match expected_version {
                ExpectedVersion::Exact(_) => Err(Error::Concurrency),
                _ => Ok(()),
            };
        };
        match expected_version {
            // The row exists, so the stream has messages.
            ExpectedVersion::Empty => return Err(Error::Concurrency),
            ExpectedVersion::Exact(v) if v != stream_row.version => {
                return Err(Error::Concurrency)
            }
            _ => {}
        }

        delete_stream_rows(&mut tx, &stream_row).await?;
        if let Some(metadata_row) =
            lock_stream(&mut tx, &stream::metadata_stream_id(stream_id)).await?
        {
            delete_stream_rows(&mut tx, &metadata_row).await?;
        }

        let tombstone = NewMessage::new(
            stream::STREAM_DELETED_TYPE,
            json!({ "streamId": stream_id }),
        );
        append_in_tx(
            &mut tx,
            stream::DELETED_STREAM_ID,
            ExpectedVersion::Any,
            &[tombstone],
        )
        .await?;
        tx.commit().await?;
        tracing::debug!(stream_id, "stream deleted");
        Ok(())
    }

    /// Deletes one message. The message's version and position are never
    /// reused; the stream head is left untouched.
    pub(crate) async fn delete_single_message(
        &self,
        stream_id: &str,
        message_id: Uuid,
    ) -> Result<(), Error> {
        let _guard = self.enter_write()?;
        sqlx::query(
            "DELETE FROM message WHERE message_id = $1 \
             AND stream_id_internal = (SELECT id_internal FROM stream WHERE id = $2)",
        )
        .bind(message_id)
        .bind(stream_id)
        .execute(self.reader.pool())
        .await?;
        Ok(())
    }
}

async fn delete_stream_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    stream_row: &LockedStream,
) -> Result<(), Error> {
    sqlx::query("DELETE FROM message WHERE stream_id_internal = $1")
        .bind(stream_row.id_internal)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM stream WHERE id_internal = $1")
        .bind(stream_row.id_internal)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
