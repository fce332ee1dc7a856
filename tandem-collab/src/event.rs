//! Application event envelope carried by `messageEvent` frames.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::{Message, ProtocolError};

/// One application-level notification from the relay.
///
/// Encoded as a CBOR map with camelCase keys. Unknown keys are ignored
/// so the relay can add fields without breaking older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub event_id: String,
    pub event_type: String,
    pub doc_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, ciborium::Value>>,
    /// Optional document diff attached to the event.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub update: Option<Vec<u8>>,
}

impl EventMessage {
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        doc_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            doc_id: doc_id.into(),
            timestamp,
            user: None,
            metadata: None,
            update: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: ciborium::Value) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_update(mut self, update: Vec<u8>) -> Self {
        self.update = Some(update);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::MalformedEvent(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::MalformedEvent(e.to_string()))
    }

    /// Wrap into a `messageEvent` frame.
    pub fn to_message(&self) -> Result<Message, ProtocolError> {
        Ok(Message::Event(self.encode()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciborium::Value;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_decodes_camel_case_map() {
        let map = Value::Map(vec![
            (text("eventId"), text("ev-1")),
            (text("eventType"), text("comment.created")),
            (text("docId"), text("doc-9")),
            (text("timestamp"), Value::Integer(1_700_000_000_000u64.into())),
            (text("user"), text("u-3")),
            (
                text("metadata"),
                Value::Map(vec![(text("thread"), text("t-1"))]),
            ),
            (text("update"), Value::Bytes(vec![1, 2, 3])),
            (text("futureField"), Value::Bool(true)),
        ]);
        let mut bytes = Vec::new();
        ciborium::into_writer(&map, &mut bytes).unwrap();

        let event = EventMessage::decode(&bytes).unwrap();
        assert_eq!(event.event_id, "ev-1");
        assert_eq!(event.event_type, "comment.created");
        assert_eq!(event.doc_id, "doc-9");
        assert_eq!(event.timestamp, 1_700_000_000_000);
        assert_eq!(event.user.as_deref(), Some("u-3"));
        assert_eq!(event.update, Some(vec![1, 2, 3]));
        assert_eq!(event.metadata.unwrap()["thread"], text("t-1"));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = EventMessage::new("ev-2", "doc.renamed", "doc-1", 5);
        let bytes = event.encode().unwrap();
        let value: Value = ciborium::from_reader(bytes.as_slice()).unwrap();
        let Value::Map(entries) = value else {
            panic!("expected a map");
        };
        assert_eq!(entries.len(), 4);
        assert_eq!(EventMessage::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_update_is_a_byte_string() {
        let event = EventMessage::new("ev-3", "snapshot", "doc-1", 1).with_update(vec![9; 4]);
        let bytes = event.encode().unwrap();
        let value: Value = ciborium::from_reader(bytes.as_slice()).unwrap();
        let Value::Map(entries) = value else {
            panic!("expected a map");
        };
        let update = entries
            .iter()
            .find(|(k, _)| *k == text("update"))
            .map(|(_, v)| v.clone());
        assert_eq!(update, Some(Value::Bytes(vec![9; 4])));
    }

    #[test]
    fn test_malformed_event_is_an_error() {
        assert!(matches!(
            EventMessage::decode(&[0xFF, 0x00]),
            Err(ProtocolError::MalformedEvent(_))
        ));
        // Valid CBOR, missing required keys.
        let mut bytes = Vec::new();
        ciborium::into_writer(&Value::Map(vec![]), &mut bytes).unwrap();
        assert!(EventMessage::decode(&bytes).is_err());
    }
}
