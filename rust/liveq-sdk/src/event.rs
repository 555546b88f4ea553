use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One framed event received on the push stream. Mirrors the broker's wire
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Identity handshake carrying the raw connection id. Always the first
    /// event on a fresh stream.
    ConnectionId(String),
    /// Content-free heartbeat frame.
    KeepAlive,
    /// Application message published to a channel.
    Message(ChannelMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub data: Value,
}

impl StreamEvent {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// One atomic change to a query's result set, as published by the broker's
/// diff publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum LiveQueryChange {
    /// Complete snapshot replacing the current state.
    All { items: Vec<Value> },
    /// A row entered the query's visible window.
    Add { item: Value },
    /// A visible row changed; a no-op when `old_id` is not present.
    Replace {
        #[serde(rename = "oldId")]
        old_id: Value,
        item: Value,
    },
    /// A row left the query's visible window.
    Remove { id: Value },
}

/// Decode a published payload into a batch of changes. Publishers send
/// either a single change or an array of them.
pub fn decode_changes(data: Value) -> Result<Vec<LiveQueryChange>, serde_json::Error> {
    match data {
        Value::Array(_) => serde_json::from_value(data),
        other => serde_json::from_value(other).map(|change| vec![change]),
    }
}
