use crate::auth::{AllowAll, SubscribeContext, SubscribeGuard};
use crate::config::RegistryConfig;
use crate::wire::StreamEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failure modes of a subscribe call the client must distinguish.
///
/// `ConnectionNotFound` is the sentinel a client uses to detect that this
/// process instance never saw its connection id (broker restart, or a
/// load-balanced request landing elsewhere) and that it must reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("subscription rejected")]
    Forbidden,
    #[error("connection not found")]
    ConnectionNotFound,
}

struct ConnectionEntry {
    channels: HashSet<String>,
    sender: mpsc::Sender<StreamEvent>,
    keep_alive: CancellationToken,
}

/// Handle returned to the transport adapter for one open connection.
///
/// The adapter forwards `events` to its push stream; dropping the receiver
/// signals transport loss and the registry cleans the connection up.
pub struct ConnectionHandle {
    pub id: String,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Owns every live connection and its channel subscriptions. All mutation
/// goes through this API; the connection table is the only shared state.
#[derive(Clone)]
pub struct ChannelRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
    guard: Arc<dyn SubscribeGuard>,
    config: RegistryConfig,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            guard: Arc::new(AllowAll),
            config: RegistryConfig::default(),
        }
    }

    pub fn with_guard(mut self, guard: Arc<dyn SubscribeGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Open a new connection: allocate an id, queue the identity handshake
    /// as the first event, and start the keep-alive loop.
    pub async fn open_connection(&self) -> ConnectionHandle {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.event_queue_size);

        // The queue is freshly created, so this cannot fail or block.
        let _ = tx.send(StreamEvent::ConnectionId(id.clone())).await;

        let cancel = CancellationToken::new();
        let entry = ConnectionEntry {
            channels: HashSet::new(),
            sender: tx.clone(),
            keep_alive: cancel.clone(),
        };
        self.connections.write().await.insert(id.clone(), entry);
        info!("connection {} opened", id);

        self.spawn_keep_alive(id.clone(), tx, cancel);

        ConnectionHandle { id, events: rx }
    }

    fn spawn_keep_alive(
        &self,
        id: String,
        sender: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        let interval = self.config.keep_alive_interval;
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so the first
            // keep-alive goes out one full interval after the handshake.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("keep-alive loop for connection {} stopped", id);
                        break;
                    }
                    _ = ticker.tick() => {
                        if sender.send(StreamEvent::KeepAlive).await.is_err() {
                            // Receiver dropped: the transport is gone.
                            warn!("connection {} transport dropped, removing", id);
                            registry.close_connection(&id).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Mark `channel` as subscribed on the given connection.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        channel: &str,
        ctx: &SubscribeContext,
    ) -> Result<(), SubscribeError> {
        if !self.connections.read().await.contains_key(connection_id) {
            debug!(
                "subscribe to {} for unknown connection {}",
                channel, connection_id
            );
            return Err(SubscribeError::ConnectionNotFound);
        }

        if !self.guard.can_subscribe(channel, ctx).await {
            info!(
                "subscribe to {} rejected for connection {}",
                channel, connection_id
            );
            return Err(SubscribeError::Forbidden);
        }

        let mut connections = self.connections.write().await;
        // The connection may have closed while the guard ran.
        let entry = connections
            .get_mut(connection_id)
            .ok_or(SubscribeError::ConnectionNotFound)?;
        entry.channels.insert(channel.to_string());
        debug!("connection {} subscribed to {}", connection_id, channel);
        Ok(())
    }

    /// Remove the channel marking. Always a successful no-op when the
    /// connection or the subscription does not exist.
    pub async fn unsubscribe(&self, connection_id: &str, channel: &str) {
        if let Some(entry) = self.connections.write().await.get_mut(connection_id) {
            if entry.channels.remove(channel) {
                debug!("connection {} unsubscribed from {}", connection_id, channel);
            }
        }
    }

    /// Fan a message out to every connection subscribed to `channel`, once
    /// per connection. Fire-and-forget: a full or closed queue drops the
    /// frame for that connection only.
    pub async fn publish(&self, channel: &str, data: serde_json::Value) {
        let event = StreamEvent::message(channel, data);
        let targets: Vec<(String, mpsc::Sender<StreamEvent>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(_, entry)| entry.channels.contains(channel))
                .map(|(id, entry)| (id.clone(), entry.sender.clone()))
                .collect()
        };

        for (id, sender) in targets {
            if let Err(e) = sender.try_send(event.clone()) {
                debug!("dropping frame for connection {}: {}", id, e);
            }
        }
    }

    /// Close a connection and cancel its keep-alive loop. Idempotent.
    pub async fn close_connection(&self, connection_id: &str) {
        if let Some(entry) = self.connections.write().await.remove(connection_id) {
            entry.keep_alive.cancel();
            info!("connection {} closed", connection_id);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Channels currently subscribed on a connection, or `None` if the
    /// connection is unknown.
    pub async fn subscribed_channels(&self, connection_id: &str) -> Option<HashSet<String>> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|entry| entry.channels.clone())
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(handle: &mut ConnectionHandle) -> StreamEvent {
        timeout(Duration::from_secs(1), handle.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_handshake_is_first_event() {
        let registry = ChannelRegistry::new();
        let mut handle = registry.open_connection().await;
        let event = next_event(&mut handle).await;
        assert_eq!(event, StreamEvent::ConnectionId(handle.id.clone()));
    }

    #[tokio::test]
    async fn test_fan_out_reaches_only_subscribers() {
        let registry = ChannelRegistry::new();
        let mut a = registry.open_connection().await;
        let mut b = registry.open_connection().await;
        let mut c = registry.open_connection().await;
        for handle in [&mut a, &mut b, &mut c] {
            next_event(handle).await; // drain handshake
        }

        let ctx = SubscribeContext::new(&a.id);
        registry.subscribe(&a.id, "orders", &ctx).await.unwrap();
        let ctx = SubscribeContext::new(&b.id);
        registry.subscribe(&b.id, "orders", &ctx).await.unwrap();

        registry.publish("orders", json!({"seq": 1})).await;

        for handle in [&mut a, &mut b] {
            let event = next_event(handle).await;
            assert_eq!(event, StreamEvent::message("orders", json!({"seq": 1})));
        }
        // c never subscribed and must receive nothing.
        assert!(
            timeout(Duration::from_millis(50), c.events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_single_delivery_per_connection() {
        let registry = ChannelRegistry::new();
        let mut a = registry.open_connection().await;
        next_event(&mut a).await;

        let ctx = SubscribeContext::new(&a.id);
        registry.subscribe(&a.id, "orders", &ctx).await.unwrap();
        // Duplicate subscribe must not double deliveries.
        registry.subscribe(&a.id, "orders", &ctx).await.unwrap();

        registry.publish("orders", json!({"seq": 2})).await;
        next_event(&mut a).await;
        assert!(
            timeout(Duration::from_millis(50), a.events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let registry = ChannelRegistry::new();
        let mut a = registry.open_connection().await;
        next_event(&mut a).await;

        let ctx = SubscribeContext::new(&a.id);
        registry.subscribe(&a.id, "orders", &ctx).await.unwrap();
        registry.unsubscribe(&a.id, "orders").await;
        registry.unsubscribe(&a.id, "orders").await;
        registry.unsubscribe(&a.id, "never-subscribed").await;
        registry.unsubscribe("no-such-connection", "orders").await;

        assert!(registry
            .subscribed_channels(&a.id)
            .await
            .unwrap()
            .is_empty());

        registry.publish("orders", json!({"seq": 3})).await;
        assert!(
            timeout(Duration::from_millis(50), a.events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_subscribe_unknown_connection() {
        let registry = ChannelRegistry::new();
        let ctx = SubscribeContext::new("stale-id");
        let result = registry.subscribe("stale-id", "orders", &ctx).await;
        assert_eq!(result, Err(SubscribeError::ConnectionNotFound));
    }

    struct DenyPrivate;

    #[async_trait]
    impl SubscribeGuard for DenyPrivate {
        async fn can_subscribe(&self, channel: &str, _ctx: &SubscribeContext) -> bool {
            !channel.starts_with("private:")
        }
    }

    #[tokio::test]
    async fn test_forbidden_channel() {
        let registry = ChannelRegistry::new().with_guard(Arc::new(DenyPrivate));
        let mut a = registry.open_connection().await;
        next_event(&mut a).await;

        let ctx = SubscribeContext::new(&a.id);
        let result = registry.subscribe(&a.id, "private:admin", &ctx).await;
        assert_eq!(result, Err(SubscribeError::Forbidden));
        assert!(registry.subscribe(&a.id, "public", &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_keep_alive_frames_flow_until_close() {
        let registry = ChannelRegistry::new().with_config(
            RegistryConfig::default().with_keep_alive_interval(Duration::from_millis(20)),
        );
        let mut a = registry.open_connection().await;
        next_event(&mut a).await;

        let event = next_event(&mut a).await;
        assert_eq!(event, StreamEvent::KeepAlive);

        registry.close_connection(&a.id).await;
        registry.close_connection(&a.id).await; // idempotent

        // Drain anything already queued; the stream must then end because
        // the cancelled keep-alive loop and removed entry drop the senders.
        let ended = timeout(Duration::from_secs(1), async {
            while let Some(event) = a.events.recv().await {
                assert_eq!(event, StreamEvent::KeepAlive);
            }
        })
        .await;
        assert!(ended.is_ok(), "keep-alive loop leaked after close");
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_after_close_is_silent() {
        let registry = ChannelRegistry::new();
        let mut a = registry.open_connection().await;
        next_event(&mut a).await;
        let ctx = SubscribeContext::new(&a.id);
        registry.subscribe(&a.id, "orders", &ctx).await.unwrap();

        registry.close_connection(&a.id).await;
        registry.publish("orders", json!({"seq": 4})).await;
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_removes_connection() {
        let registry = ChannelRegistry::new().with_config(
            RegistryConfig::default().with_keep_alive_interval(Duration::from_millis(10)),
        );
        let handle = registry.open_connection().await;
        let id = handle.id.clone();
        drop(handle);

        // The keep-alive loop notices the dropped receiver and cleans up.
        timeout(Duration::from_secs(1), async {
            loop {
                if registry.subscribed_channels(&id).await.is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was not removed after transport drop");
    }
}
