//! # Streamstore Core Library
//!
//! Backend-agnostic vocabulary for a stream-oriented message store: named,
//! append-only streams of immutable messages, each message carrying a dense
//! per-stream version and a sparse global position.
//!
//! Storage backends implement the [`StreamStore`] trait; live consumers
//! implement [`MessageConsumer`].
mod message;
mod metadata;
mod position;
mod read;
mod store;
pub mod stream;
mod version;

pub use crate::message::{Message, NewMessage};
pub use crate::metadata::{StreamMetadata, StreamMetadataResult};
pub use crate::position::{ParsePositionError, Position};
pub use crate::read::{AllPage, AppendResult, ReadDirection, StreamPage};
pub use crate::store::{BoxDynError, MessageConsumer, StreamStore};
pub use crate::version::{ExpectedVersion, STREAM_VERSION_END};
