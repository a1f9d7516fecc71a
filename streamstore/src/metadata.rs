//! Stream metadata: user payload plus retention hints.
//!
//! Metadata lives as ordinary messages of type `$streamMetadata` in the
//! companion `$$<streamId>` stream; the latest entry is authoritative. The
//! retention hints are persisted end-to-end but not enforced by the store.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata written for a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Maximum age of messages in the stream, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    /// Maximum number of messages retained in the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,
}

/// Metadata read back for a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadataResult {
    pub metadata: Option<Value>,
    /// Version of the latest entry in the metadata stream, `-1` when no
    /// metadata has ever been written.
    pub metadata_stream_version: i64,
    pub max_age: Option<i64>,
    pub max_count: Option<i64>,
}

impl StreamMetadataResult {
    /// The result for a stream without any metadata.
    pub fn none() -> Self {
        Self {
            metadata: None,
            metadata_stream_version: -1,
            max_age: None,
            max_count: None,
        }
    }
}
