//! Stream naming rules.
//!
//! Stream ids are opaque non-empty strings with one reserved prefix: ids
//! starting with `$` belong to the store itself and cannot be written through
//! the public append. Each user stream has a companion metadata stream whose
//! id is the user stream's id prefixed with `$$`.

/// Operational stream receiving a tombstone for every deleted stream.
pub const DELETED_STREAM_ID: &str = "$deleted";

/// Message type of a metadata entry in a `$$<id>` stream.
pub const STREAM_METADATA_TYPE: &str = "$streamMetadata";

/// Message type of a deletion tombstone on [`DELETED_STREAM_ID`].
pub const STREAM_DELETED_TYPE: &str = "$streamDeleted";

/// Whether the id names an operational stream reserved for the store.
pub fn is_operational(stream_id: &str) -> bool {
    stream_id.starts_with('$')
}

/// The id of the companion metadata stream for `stream_id`.
pub fn metadata_stream_id(stream_id: &str) -> String {
    format!("$${stream_id}")
}

/// The stream's type: the category before the first `-`, or the whole id for
/// uncategorized streams.
pub fn stream_type(stream_id: &str) -> &str {
    stream_id
        .split_once('-')
        .map(|(category, _)| category)
        .unwrap_or(stream_id)
}
