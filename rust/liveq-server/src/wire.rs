use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One framed event on the server-to-client push stream.
///
/// The identity handshake is always the first event on a fresh stream;
/// keep-alive frames carry no application semantics and exist only to keep
/// intermediaries from dropping an idle stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Identity handshake carrying the raw connection id. Sent exactly once.
    ConnectionId(String),
    /// Content-free heartbeat frame.
    KeepAlive,
    /// Application message published to a channel.
    Message(ChannelMessage),
}

/// Payload of a `message` event: a channel name plus opaque JSON data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub data: serde_json::Value,
}

/// Body of the out-of-band subscribe/unsubscribe calls. These never travel
/// on the push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub channel: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

/// Wire shape of a subscribe response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SubscribeAck {
    Ok,
    Forbidden,
    ConnectionNotFound,
}

impl StreamEvent {
    pub fn message(channel: impl Into<String>, data: serde_json::Value) -> Self {
        StreamEvent::Message(ChannelMessage {
            channel: channel.into(),
            data,
        })
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<Result<(), crate::registry::SubscribeError>> for SubscribeAck {
    fn from(result: Result<(), crate::registry::SubscribeError>) -> Self {
        match result {
            Ok(()) => SubscribeAck::Ok,
            Err(crate::registry::SubscribeError::Forbidden) => SubscribeAck::Forbidden,
            Err(crate::registry::SubscribeError::ConnectionNotFound) => {
                SubscribeAck::ConnectionNotFound
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_id_event_shape() {
        let event = StreamEvent::ConnectionId("abc-123".to_string());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "connection-id");
        assert_eq!(value["data"], "abc-123");
    }

    #[test]
    fn test_keep_alive_event_is_content_free() {
        let event = StreamEvent::KeepAlive;
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "keep-alive");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_message_event_round_trip() {
        let event = StreamEvent::message("orders:42", json!({"total": 7}));
        let bytes = event.encode().unwrap();
        let decoded = StreamEvent::decode(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_subscribe_request_wire_names() {
        let request = SubscribeRequest {
            channel: "orders:42".to_string(),
            connection_id: "c1".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["channel"], "orders:42");
        assert_eq!(value["connectionId"], "c1");
    }

    #[test]
    fn test_subscribe_ack_sentinels() {
        let value = serde_json::to_value(SubscribeAck::ConnectionNotFound).unwrap();
        assert_eq!(value["status"], "connection-not-found");
        let value = serde_json::to_value(SubscribeAck::Forbidden).unwrap();
        assert_eq!(value["status"], "forbidden");
    }
}
