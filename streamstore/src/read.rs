//! Result pages returned by reads and appends.
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::position::Position;

/// Direction of a range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadDirection {
    #[default]
    Forward,
    Backward,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResult {
    /// Version of the last message in the stream after the append. `-1` when
    /// an empty batch was appended to a stream that does not exist.
    pub stream_version: i64,
    /// Global position of the last message in the stream.
    pub position: Position,
}

/// A page of messages from a single stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPage {
    pub stream_id: String,
    /// Version of the stream head at read time, `0` for a missing stream.
    pub stream_version: i64,
    /// Global position of the stream head at read time.
    pub stream_position: Position,
    /// The version to pass as `from` to continue reading in the same
    /// direction.
    pub next_version: i64,
    /// Whether the read reached the end of the stream in its direction.
    pub is_end: bool,
    pub messages: Vec<Message>,
}

/// A page of messages from the all-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllPage {
    pub messages: Vec<Message>,
    /// The position to pass as `from` to continue reading in the same
    /// direction.
    pub next_position: Position,
    pub is_end: bool,
}
