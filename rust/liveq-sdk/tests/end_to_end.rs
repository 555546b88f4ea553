//! Exercises the SDK against the real broker, wired back-to-back in
//! process: the transport adapter bridges the registry's per-connection
//! event queue onto the SDK's push stream through the actual wire encoding.

use anyhow::Result;
use async_trait::async_trait;
use liveq_sdk::{
    BrokerTransport, ClientConfig, ClientState, ConnectionManager, EventStream, LiveQError,
    LiveQueryClient, LiveQueryListener, LiveQueryUpdate, QueryDefinition, QueryPhase,
    SnapshotFetcher, StreamEvent, SubscribeOutcome,
};
use liveq_server::{
    ChannelRegistry, InMemoryQueryStorage, QueryStorage, StoredQuery, SubscribeContext,
    SubscribeError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

/// Bridges the SDK onto an in-process registry. Each `open_stream` opens a
/// fresh broker connection and re-encodes its events through the wire
/// format, exactly as an HTTP adapter would.
struct InProcessTransport {
    registry: ChannelRegistry,
    storage: Arc<InMemoryQueryStorage>,
    last_connection_id: Mutex<Option<String>>,
    subscribe_counts: Mutex<HashMap<String, u32>>,
    open_count: AtomicU32,
}

impl InProcessTransport {
    fn new(registry: ChannelRegistry) -> Self {
        Self::with_storage(registry, InMemoryQueryStorage::new())
    }

    fn with_storage(registry: ChannelRegistry, storage: InMemoryQueryStorage) -> Self {
        Self {
            registry,
            storage: Arc::new(storage),
            last_connection_id: Mutex::new(None),
            subscribe_counts: Mutex::new(HashMap::new()),
            open_count: AtomicU32::new(0),
        }
    }

    fn current_connection_id(&self) -> String {
        self.last_connection_id.lock().unwrap().clone().unwrap()
    }

    fn subscribe_count(&self, channel: &str) -> u32 {
        self.subscribe_counts
            .lock()
            .unwrap()
            .get(channel)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerTransport for InProcessTransport {
    async fn open_stream(&self) -> Result<EventStream> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let handle = self.registry.open_connection().await;
        *self.last_connection_id.lock().unwrap() = Some(handle.id.clone());
        let stream =
            tokio_stream::wrappers::ReceiverStream::new(handle.events).filter_map(|event| {
                let bytes = event.encode().ok()?;
                StreamEvent::decode(&bytes).ok()
            });
        Ok(Box::pin(stream))
    }

    async fn subscribe(&self, channel: &str, connection_id: &str) -> Result<SubscribeOutcome> {
        let ctx = SubscribeContext::new(connection_id);
        let outcome = match self.registry.subscribe(connection_id, channel, &ctx).await {
            Ok(()) => SubscribeOutcome::Subscribed,
            Err(SubscribeError::Forbidden) => SubscribeOutcome::Forbidden,
            Err(SubscribeError::ConnectionNotFound) => SubscribeOutcome::ConnectionNotFound,
        };
        if outcome == SubscribeOutcome::Subscribed {
            *self
                .subscribe_counts
                .lock()
                .unwrap()
                .entry(channel.to_string())
                .or_insert(0) += 1;
            self.storage
                .save(StoredQuery {
                    id: channel.to_string(),
                    entity_key: "tasks".to_string(),
                    definition: Value::Null,
                })
                .await?;
        }
        Ok(outcome)
    }

    async fn unsubscribe(&self, channel: &str, connection_id: &str) -> Result<()> {
        self.registry.unsubscribe(connection_id, channel).await;
        self.storage.remove(channel).await
    }

    async fn keep_alive_queries(&self, ids: &[String]) -> Result<Vec<String>> {
        self.storage.keep_alive_and_return_unknown_ids(ids).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Task {
    id: u32,
    title: String,
}

struct Collector {
    states: Mutex<Vec<Vec<Task>>>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(Vec::new()),
        })
    }

    fn last(&self) -> Vec<Task> {
        self.states.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

impl LiveQueryListener<Task> for Collector {
    fn next(&self, update: &LiveQueryUpdate<Task>) {
        self.states.lock().unwrap().push(update.items.clone());
    }

    fn error(&self, _err: &LiveQError) {}
}

struct FixedFetcher {
    items: Vec<Value>,
    calls: AtomicU32,
}

impl FixedFetcher {
    fn new(items: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            items,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SnapshotFetcher for FixedFetcher {
    async fn fetch(&self) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.clone())
    }
}

fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .with_reconnect_intervals(vec![Duration::from_millis(10)])
        .with_max_reconnect_attempts(20)
}

macro_rules! wait_until {
    ($cond:expr) => {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !$cond {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    };
}

#[tokio::test]
async fn publish_reaches_subscribed_handler() {
    let registry = ChannelRegistry::new();
    let transport = Arc::new(InProcessTransport::new(registry.clone()));
    let manager = ConnectionManager::new(transport, fast_config());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager
        .subscribe("orders", move |data| sink.lock().unwrap().push(data))
        .await
        .unwrap();
    wait_until!(manager.state() == ClientState::Connected);

    registry.publish("orders", json!({"seq": 1})).await;
    registry.publish("other-channel", json!({"seq": 2})).await;

    wait_until!(!seen.lock().unwrap().is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![json!({"seq": 1})]);
}

#[tokio::test]
async fn broker_side_close_triggers_reconnect_and_resubscribe() {
    let registry = ChannelRegistry::new();
    let transport = Arc::new(InProcessTransport::new(registry.clone()));
    let manager = ConnectionManager::new(transport.clone(), fast_config());

    manager.subscribe("orders", |_| {}).await.unwrap();
    let dropped = manager.subscribe("dropped", |_| {}).await.unwrap();
    dropped.unsubscribe().await;
    wait_until!(manager.state() == ClientState::Connected);

    // Kill the connection broker-side: the per-connection queue closes, the
    // push stream ends, and the client reconnects with a fresh identity.
    let stale_id = transport.current_connection_id();
    registry.close_connection(&stale_id).await;

    wait_until!(transport.open_count.load(Ordering::SeqCst) == 2);
    wait_until!(manager.state() == ClientState::Connected);

    let fresh_id = transport.current_connection_id();
    assert_ne!(fresh_id, stale_id);
    let channels = registry.subscribed_channels(&fresh_id).await.unwrap();
    assert!(channels.contains("orders"));
    // The channel whose last handler went away before the drop stays gone.
    assert!(!channels.contains("dropped"));
    assert_eq!(transport.subscribe_count("orders"), 2);
    assert_eq!(transport.subscribe_count("dropped"), 1);
}

#[tokio::test]
async fn live_query_folds_published_diff_batches() {
    let registry = ChannelRegistry::new();
    let transport = Arc::new(InProcessTransport::new(registry.clone()));
    let client = LiveQueryClient::new(transport, fast_config());

    let listener = Collector::new();
    let fetcher = FixedFetcher::new(vec![
        json!({"id": 1, "title": "b"}),
        json!({"id": 2, "title": "d"}),
    ]);
    let handle = client
        .subscribe_query::<Task>(
            QueryDefinition::new("tasks").order_by("title"),
            listener.clone(),
            fetcher,
        )
        .await
        .unwrap();
    wait_until!(handle.phase().await == QueryPhase::Live);

    registry
        .publish(
            handle.channel(),
            json!([
                {"type": "add", "data": {"item": {"id": 3, "title": "c"}}},
                {"type": "replace", "data": {"oldId": 1, "item": {"id": 1, "title": "a"}}},
                {"type": "remove", "data": {"id": 2}}
            ]),
        )
        .await;

    let expected = vec![
        Task {
            id: 1,
            title: "a".to_string(),
        },
        Task {
            id: 3,
            title: "c".to_string(),
        },
    ];
    wait_until!(handle.current().await == expected);
    assert_eq!(listener.last(), expected);
}

#[tokio::test]
async fn expired_query_registration_forces_snapshot_refetch() {
    let registry = ChannelRegistry::new();
    // Storage expires registrations faster than the keep-alive cadence, so
    // the first keep-alive call reports the query as unknown.
    let storage = InMemoryQueryStorage::new().with_expiry(Duration::from_millis(5));
    let transport = Arc::new(InProcessTransport::with_storage(registry, storage));
    let client = LiveQueryClient::new(
        transport.clone(),
        fast_config().with_keep_alive_query_interval(Duration::from_millis(30)),
    );

    let listener = Collector::new();
    let fetcher = FixedFetcher::new(vec![json!({"id": 1, "title": "a"})]);
    let probe = fetcher.clone();
    let _handle = client
        .subscribe_query::<Task>(QueryDefinition::new("tasks"), listener, fetcher)
        .await
        .unwrap();

    // Initial snapshot plus at least one refetch forced by expiry.
    wait_until!(probe.calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn unsubscribe_releases_broker_channel() {
    let registry = ChannelRegistry::new();
    let transport = Arc::new(InProcessTransport::new(registry.clone()));
    let client = LiveQueryClient::new(transport.clone(), fast_config());

    let listener = Collector::new();
    let fetcher = FixedFetcher::new(Vec::new());
    let handle = client
        .subscribe_query::<Task>(QueryDefinition::new("tasks"), listener, fetcher)
        .await
        .unwrap();
    wait_until!(handle.phase().await == QueryPhase::Live);

    let channel = handle.channel().to_string();
    let connection_id = transport.current_connection_id();
    assert_eq!(transport.subscribe_count(&channel), 1);
    handle.unsubscribe().await;

    // The broker-side release is fire-and-forget; wait for it to land.
    wait_until!({
        let channels = registry.subscribed_channels(&connection_id).await;
        channels.map_or(true, |set| !set.contains(&channel))
    });
}
