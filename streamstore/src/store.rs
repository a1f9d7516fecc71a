//! The store and consumer traits.
//!
//! [`StreamStore`] is implemented by storage backends. It covers appends,
//! range reads over a single stream and over the globally-ordered all-stream,
//! and stream metadata and deletion. Live tailing is backend-specific and is
//! exposed by the backend's own subscription API, driven by a
//! [`MessageConsumer`].
use async_trait::async_trait;
use uuid::Uuid;

use crate::message::{Message, NewMessage};
use crate::metadata::{StreamMetadata, StreamMetadataResult};
use crate::position::Position;
use crate::read::{AllPage, AppendResult, ReadDirection, StreamPage};
use crate::version::ExpectedVersion;

/// A boxed error for consumer callbacks.
pub type BoxDynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A store of named, append-only message streams.
#[async_trait]
pub trait StreamStore {
    type Error: Send + Sync;

    /// Appends `messages` to `stream_id`, creating the stream if it does not
    /// exist.
    ///
    /// The append is atomic: either every message is persisted with dense,
    /// consecutive stream versions and strictly increasing global positions,
    /// or none is. `expected_version` states the caller's view of the stream
    /// head; a mismatch fails with the backend's concurrency error. An empty
    /// batch performs the expected-version check and returns the current head
    /// without writing.
    async fn append_to_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        messages: Vec<NewMessage>,
    ) -> Result<AppendResult, Self::Error>;

    /// Reads up to `count` messages from `stream_id`, starting at
    /// `from_version` inclusive. Pass [`STREAM_VERSION_END`] to start from the
    /// stream head.
    ///
    /// [`STREAM_VERSION_END`]: crate::STREAM_VERSION_END
    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: i64,
        count: u64,
        direction: ReadDirection,
    ) -> Result<StreamPage, Self::Error>;

    /// Reads up to `count` messages from the all-stream, starting at
    /// `from_position` inclusive.
    async fn read_all(
        &self,
        from_position: Position,
        count: u64,
        direction: ReadDirection,
    ) -> Result<AllPage, Self::Error>;

    /// The global position of the most recent message, [`Position::START`]
    /// when the store is empty.
    async fn read_head_position(&self) -> Result<Position, Self::Error>;

    /// The latest metadata entry for `stream_id`.
    async fn get_stream_metadata(
        &self,
        stream_id: &str,
    ) -> Result<StreamMetadataResult, Self::Error>;

    /// Writes a metadata entry for `stream_id`. `expected_version` applies to
    /// the metadata stream. Returns the metadata stream's version after the
    /// write.
    async fn set_stream_metadata(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        metadata: StreamMetadata,
    ) -> Result<i64, Self::Error>;

    /// Deletes `stream_id` and all its messages, recording a tombstone on the
    /// operational deletion stream. The id may be re-created afterwards only
    /// with [`ExpectedVersion::Any`].
    async fn delete_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
    ) -> Result<(), Self::Error>;

    /// Deletes a single message. The deleted message's version and position
    /// are never reused.
    async fn delete_message(&self, stream_id: &str, message_id: Uuid)
        -> Result<(), Self::Error>;
}

/// A consumer of a live subscription.
///
/// `process` is invoked strictly in order and never concurrently with itself.
/// Delivery is at-least-once: after a crash or redelivery the consumer may see
/// a message twice and must be idempotent. The remaining hooks default to
/// no-ops.
#[async_trait]
pub trait MessageConsumer: Send + Sync + 'static {
    /// Handles one message. Returning an error drops the subscription after
    /// the [`dropped`](MessageConsumer::dropped) hook runs.
    async fn process(&self, message: Message) -> Result<(), BoxDynError>;

    /// Invoked exactly once, after the subscription has resolved its starting
    /// point and before the first delivery.
    async fn established(&self) {}

    /// Invoked whenever the subscription transitions from catching up to the
    /// live tail.
    async fn caught_up(&self) {}

    /// Invoked exactly once if the subscription drops because `process`
    /// failed. The subscription tears itself down afterwards.
    async fn dropped(&self, _error: BoxDynError) {}
}
