use async_trait::async_trait;

/// Request context handed to the authorization hook alongside the channel
/// name. `metadata` is whatever the host's transport adapter extracted from
/// the request (auth claims, session attributes).
#[derive(Debug, Clone, Default)]
pub struct SubscribeContext {
    pub connection_id: String,
    pub metadata: serde_json::Value,
}

impl SubscribeContext {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Host-supplied authorization hook consulted on every subscribe call.
#[async_trait]
pub trait SubscribeGuard: Send + Sync {
    async fn can_subscribe(&self, channel: &str, ctx: &SubscribeContext) -> bool;
}

/// Default policy: every connection may subscribe to every channel.
pub struct AllowAll;

#[async_trait]
impl SubscribeGuard for AllowAll {
    async fn can_subscribe(&self, _channel: &str, _ctx: &SubscribeContext) -> bool {
        true
    }
}
