use crate::config::ClientConfig;
use crate::connection::{ConnectionHooks, ConnectionManager, SubscriptionHandle};
use crate::error::LiveQError;
use crate::event::{decode_changes, LiveQueryChange};
use crate::live_query::{LiveQueryListener, QueryDefinition, QueryPhase, QuerySubscription};
use crate::transport::BrokerTransport;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Fetches a full result-set snapshot for one query, out of band of the
/// push stream. Called on first subscribe and whenever diffs may have been
/// missed (reconnect, expired broker-side registration).
#[async_trait]
pub trait SnapshotFetcher: Send + Sync + 'static {
    async fn fetch(&self) -> anyhow::Result<Vec<Value>>;
}

/// Events serialized through each query's worker task. Funnelling snapshot
/// responses through the same queue as pushed diffs keeps folding strictly
/// in arrival order.
enum QueryEvent {
    Changes(Vec<LiveQueryChange>),
    Snapshot(Vec<Value>),
    Fail(LiveQError),
    Close,
}

struct ActiveQuery {
    refresh: Arc<dyn Fn() + Send + Sync>,
    events: mpsc::UnboundedSender<QueryEvent>,
}

type QueryMap = Arc<RwLock<HashMap<String, ActiveQuery>>>;

/// Entry point for live queries: wires the connection manager, the diff
/// reducer, and the periodic broker-side keep-alive together.
pub struct LiveQueryClient {
    connection: ConnectionManager,
    queries: QueryMap,
    scope: String,
    shutdown: watch::Sender<bool>,
}

impl LiveQueryClient {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: ClientConfig) -> Self {
        Self::with_scope(transport, config, "live-query")
    }

    /// `scope` prefixes every generated channel name, letting one broker
    /// carry several independent clients.
    pub fn with_scope(
        transport: Arc<dyn BrokerTransport>,
        config: ClientConfig,
        scope: impl Into<String>,
    ) -> Self {
        let queries: QueryMap = Arc::new(RwLock::new(HashMap::new()));

        // Diffs published while the stream was down are gone, so every
        // reconnect refetches each query's snapshot.
        let hook_queries = queries.clone();
        let on_reconnect: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let queries = hook_queries.clone();
            tokio::spawn(async move {
                for query in queries.read().await.values() {
                    (query.refresh)();
                }
            });
        });

        // A channel rejected during resubscribe can never receive diffs
        // again: surface the rejection to the query's listeners and drop
        // the registration so the keep-alive loop stops reporting it.
        let dropped_queries = queries.clone();
        let on_channel_dropped: Arc<dyn Fn(&str) + Send + Sync> =
            Arc::new(move |channel: &str| {
                let queries = dropped_queries.clone();
                let channel = channel.to_string();
                tokio::spawn(async move {
                    if let Some(query) = queries.write().await.remove(&channel) {
                        let forbidden = LiveQError::SubscriptionForbidden(channel);
                        let _ = query.events.send(QueryEvent::Fail(forbidden));
                        let _ = query.events.send(QueryEvent::Close);
                    }
                });
            });

        let keep_alive_interval = config.keep_alive_query_interval;
        let connection = ConnectionManager::with_hooks(
            transport,
            config,
            ConnectionHooks {
                on_reconnect,
                on_channel_dropped,
            },
        );
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(keep_alive_loop(
            connection.clone(),
            queries.clone(),
            keep_alive_interval,
            shutdown_rx,
        ));

        Self {
            connection,
            queries,
            scope: scope.into(),
            shutdown,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Open a live query: subscribe its private channel, fetch the initial
    /// snapshot, and fold every pushed diff batch into a typed result set.
    ///
    /// Returns `SubscriptionForbidden` when the broker rejects the channel.
    pub async fn subscribe_query<T>(
        &self,
        definition: QueryDefinition,
        listener: Arc<dyn LiveQueryListener<T>>,
        fetcher: Arc<dyn SnapshotFetcher>,
    ) -> Result<LiveQueryHandle<T>, LiveQError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        let channel = format!("{}:{}", self.scope, Uuid::new_v4());

        let mut subscription = QuerySubscription::new(channel.clone(), definition);
        subscription.add_listener(listener);
        let subscription = Arc::new(Mutex::new(subscription));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(query_worker(subscription.clone(), event_rx));

        let handler_tx = event_tx.clone();
        let connection_sub = self
            .connection
            .subscribe(&channel, move |data| {
                let event = match decode_changes(data) {
                    Ok(changes) => QueryEvent::Changes(changes),
                    Err(e) => QueryEvent::Fail(LiveQError::Serialization(e)),
                };
                let _ = handler_tx.send(event);
            })
            .await?;

        let refresh_tx = event_tx.clone();
        let refresh: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let fetcher = fetcher.clone();
            let tx = refresh_tx.clone();
            tokio::spawn(async move {
                let event = match fetcher.fetch().await {
                    Ok(items) => QueryEvent::Snapshot(items),
                    Err(e) => QueryEvent::Fail(LiveQError::Transport(e)),
                };
                let _ = tx.send(event);
            });
        });
        refresh();

        self.queries.write().await.insert(
            channel.clone(),
            ActiveQuery {
                refresh,
                events: event_tx.clone(),
            },
        );

        Ok(LiveQueryHandle {
            channel,
            subscription,
            connection_sub: Mutex::new(Some(connection_sub)),
            event_tx,
            queries: self.queries.clone(),
        })
    }

    /// Tear down the connection and stop the keep-alive loop. Terminal.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.connection.close().await;
    }
}

/// Handle to one open live query.
pub struct LiveQueryHandle<T> {
    channel: String,
    subscription: Arc<Mutex<QuerySubscription<T>>>,
    connection_sub: Mutex<Option<SubscriptionHandle>>,
    event_tx: mpsc::UnboundedSender<QueryEvent>,
    queries: QueryMap,
}

impl<T> LiveQueryHandle<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// The private channel this query's diffs arrive on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn phase(&self) -> QueryPhase {
        self.subscription.lock().await.phase()
    }

    /// Copy of the current materialized result set.
    pub async fn current(&self) -> Vec<T> {
        self.subscription.lock().await.items().to_vec()
    }

    /// Attach another observer. A late joiner immediately receives the
    /// current state as a snapshot before any subsequent diff.
    pub async fn add_listener(&self, listener: Arc<dyn LiveQueryListener<T>>) -> u64 {
        let mut subscription = self.subscription.lock().await;
        subscription.send_initial_state(listener.as_ref());
        subscription.add_listener(listener)
    }

    /// Detach one observer. Removing the last observer tears the whole
    /// query down, exactly as [`unsubscribe`](Self::unsubscribe) does.
    pub async fn remove_listener(&self, listener_id: u64) {
        let last = self.subscription.lock().await.remove_listener(listener_id);
        if last {
            self.teardown().await;
        }
    }

    /// Release the broker subscription and complete the query's listeners.
    pub async fn unsubscribe(self) {
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.queries.write().await.remove(&self.channel);
        if let Some(sub) = self.connection_sub.lock().await.take() {
            sub.unsubscribe().await;
        }
        let _ = self.event_tx.send(QueryEvent::Close);
    }
}

async fn query_worker<T>(
    subscription: Arc<Mutex<QuerySubscription<T>>>,
    mut event_rx: mpsc::UnboundedReceiver<QueryEvent>,
) where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    while let Some(event) = event_rx.recv().await {
        let mut subscription = subscription.lock().await;
        match event {
            QueryEvent::Changes(changes) => subscription.handle(&changes),
            QueryEvent::Snapshot(items) => {
                subscription.handle(&[LiveQueryChange::All { items }])
            }
            QueryEvent::Fail(err) => {
                warn!("query {} failed: {}", subscription.id(), err);
                subscription.fail(&err);
            }
            QueryEvent::Close => {
                subscription.close();
                break;
            }
        }
    }
}

/// Periodically confirms this client's queries are still registered on the
/// broker. Queries the broker no longer knows (expired while the client was
/// away) get a fresh snapshot after the broker re-learns them.
async fn keep_alive_loop(
    connection: ConnectionManager,
    queries: QueryMap,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                // A send error means the client itself was dropped.
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let ids: Vec<String> = queries.read().await.keys().cloned().collect();
        if ids.is_empty() {
            continue;
        }
        match connection.keep_alive_queries(&ids).await {
            Ok(unknown) => {
                let queries = queries.read().await;
                for id in unknown {
                    debug!("broker lost query {}, refetching snapshot", id);
                    if let Some(query) = queries.get(&id) {
                        (query.refresh)();
                    }
                }
            }
            Err(e) => {
                warn!("query keep-alive call failed: {}", e);
            }
        }
    }
}
