//! Messages are the immutable records persisted in streams.
//!
//! [`NewMessage`] is the caller-supplied form handed to an append;
//! [`Message`] is the persisted form read back from the store, carrying the
//! per-stream version and global position assigned at commit time.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::position::Position;

/// A message to be appended to a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    /// Globally unique id. The store rejects a second append of the same id
    /// anywhere in the store.
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NewMessage {
    /// Creates a message with a fresh random id and no metadata.
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            data,
            metadata: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A message persisted in the store.
///
/// `stream_version` values within one stream are dense (`0..N-1`); `position`
/// values are strictly increasing store-wide but may contain gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub stream_id: String,
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub stream_version: i64,
    pub position: Position,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_messages_get_distinct_ids() {
        let a = NewMessage::new("OrderPlaced", json!({"order": 1}));
        let b = NewMessage::new("OrderPlaced", json!({"order": 1}));
        assert_ne!(a.id, b.id);
        assert!(a.metadata.is_none());
    }

    #[test]
    fn persisted_messages_serialize_with_wire_field_names() {
        let message = Message {
            stream_id: "account-1".into(),
            id: Uuid::nil(),
            message_type: "Opened".into(),
            data: json!({}),
            metadata: None,
            stream_version: 0,
            position: Position::new(12),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["streamId"], "account-1");
        assert_eq!(value["type"], "Opened");
        assert_eq!(value["position"], "12");
        assert_eq!(value["streamVersion"], 0);
    }
}
