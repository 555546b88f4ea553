use crate::event::StreamEvent;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Three-way result of a subscribe call against the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// The authorization hook rejected the channel. Hard failure, no retry.
    Forbidden,
    /// The broker does not recognize the connection id. The client must
    /// reconnect and retry.
    ConnectionNotFound,
}

/// A push stream of framed events. The stream ending means the transport
/// was lost.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// The client's view of the broker endpoints.
///
/// Hosts implement this against whatever HTTP stack serves the broker;
/// `open_stream` maps to the push-stream endpoint and the remaining methods
/// to the short-lived request/response endpoints.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Open a fresh push stream. The first event on it is the identity
    /// handshake carrying the new connection id.
    async fn open_stream(&self) -> Result<EventStream>;

    async fn subscribe(&self, channel: &str, connection_id: &str) -> Result<SubscribeOutcome>;

    async fn unsubscribe(&self, channel: &str, connection_id: &str) -> Result<()>;

    /// Report active query ids to the broker's storage; returns the subset
    /// the broker no longer knows about.
    async fn keep_alive_queries(&self, ids: &[String]) -> Result<Vec<String>>;
}
