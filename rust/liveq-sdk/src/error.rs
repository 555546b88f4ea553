use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveQError {
    #[error("subscription to channel '{0}' was rejected")]
    SubscriptionForbidden(String),

    #[error("max reconnection attempts reached ({0})")]
    MaxReconnectAttempts(u32),

    #[error("failed to hydrate item for query '{query}': {source}")]
    Hydration {
        query: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("client is closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
