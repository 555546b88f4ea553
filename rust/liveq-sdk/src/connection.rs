use crate::config::ClientConfig;
use crate::error::LiveQError;
use crate::event::{ChannelMessage, StreamEvent};
use crate::transport::{BrokerTransport, SubscribeOutcome};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Callback invoked for every message delivered on a subscribed channel.
pub type MessageHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Hook fired after a reconnect completes and every channel has been
/// resubscribed. Used upstream to refresh query snapshots, since diffs
/// published while disconnected were missed.
pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Hook fired with the channel name when a subscription is dropped because
/// the broker rejected it during resubscribe. The original subscribe caller
/// is long gone by then, so this is the only way the rejection can reach
/// whoever owns the channel's handlers.
pub type ChannelDroppedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks the connection loop fires back into the owning layer.
#[derive(Clone)]
pub struct ConnectionHooks {
    pub on_reconnect: ReconnectHook,
    pub on_channel_dropped: ChannelDroppedHook,
}

impl Default for ConnectionHooks {
    fn default() -> Self {
        Self {
            on_reconnect: Arc::new(|| {}),
            on_channel_dropped: Arc::new(|_| {}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Opening the first stream; no connection id confirmed yet.
    Connecting,
    Connected,
    /// Transport dropped; a new stream is being opened.
    Reconnecting,
    /// Torn down. Terminal.
    Closed,
}

enum Command {
    Subscribe {
        channel: String,
        handler_id: u64,
        handler: MessageHandler,
        ack: oneshot::Sender<Result<(), LiveQError>>,
    },
    Unsubscribe {
        channel: String,
        handler_id: u64,
    },
    Close,
}

/// Gives the rest of the client a stable subscribe API that survives
/// transport reconnection. Negotiates the connection identity, demuxes
/// incoming messages to local handlers, and replays subscriptions after a
/// dropped connection.
#[derive(Clone)]
pub struct ConnectionManager {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ClientState>,
    transport: Arc<dyn BrokerTransport>,
    next_handler_id: Arc<AtomicU64>,
}

/// Handle for one registered channel handler. `unsubscribe` drops the
/// handler; the last handler on a channel also releases the broker-side
/// subscription (fire-and-forget).
pub struct SubscriptionHandle {
    channel: String,
    handler_id: u64,
    command_tx: mpsc::Sender<Command>,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn unsubscribe(self) {
        let _ = self
            .command_tx
            .send(Command::Unsubscribe {
                channel: self.channel,
                handler_id: self.handler_id,
            })
            .await;
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: ClientConfig) -> Self {
        Self::with_hooks(transport, config, ConnectionHooks::default())
    }

    pub fn with_hooks(
        transport: Arc<dyn BrokerTransport>,
        config: ClientConfig,
        hooks: ConnectionHooks,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (state_tx, state_rx) = watch::channel(ClientState::Connecting);

        let ctx = LoopCtx {
            transport: transport.clone(),
            config,
            state_tx,
            hooks,
            handlers: HashMap::new(),
            pending_acks: HashMap::new(),
        };
        tokio::spawn(run(ctx, command_rx));

        Self {
            command_tx,
            state_rx,
            transport,
            next_handler_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    /// Stream of state transitions, starting from the current state.
    pub fn state_stream(&self) -> WatchStream<ClientState> {
        WatchStream::new(self.state_rx.clone())
    }

    /// Register a handler for a channel. The first handler on a channel
    /// triggers the broker subscribe call; while the connection identity is
    /// still being negotiated the call is deferred until it arrives.
    ///
    /// Returns `SubscriptionForbidden` when the broker's authorization hook
    /// rejects the channel. Transport loss and unknown-connection responses
    /// are recovered internally and never surface here.
    pub async fn subscribe<F>(
        &self,
        channel: &str,
        handler: F,
    ) -> Result<SubscriptionHandle, LiveQError>
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Subscribe {
                channel: channel.to_string(),
                handler_id,
                handler: Arc::new(handler),
                ack: ack_tx,
            })
            .await
            .map_err(|_| LiveQError::Closed)?;
        ack_rx.await.map_err(|_| LiveQError::Closed)??;

        Ok(SubscriptionHandle {
            channel: channel.to_string(),
            handler_id,
            command_tx: self.command_tx.clone(),
        })
    }

    /// Pass-through to the broker's keep-alive-query endpoint.
    pub async fn keep_alive_queries(&self, ids: &[String]) -> Result<Vec<String>, LiveQError> {
        self.transport
            .keep_alive_queries(ids)
            .await
            .map_err(LiveQError::Transport)
    }

    /// Tear the connection down. Terminal.
    pub async fn close(&self) {
        let _ = self.command_tx.send(Command::Close).await;
    }
}

struct LoopCtx {
    transport: Arc<dyn BrokerTransport>,
    config: ClientConfig,
    state_tx: watch::Sender<ClientState>,
    hooks: ConnectionHooks,
    handlers: HashMap<String, Vec<(u64, MessageHandler)>>,
    pending_acks: HashMap<String, Vec<oneshot::Sender<Result<(), LiveQError>>>>,
}

enum LoopStep {
    Continue,
    Reconnect,
    Shutdown,
}

async fn run(mut ctx: LoopCtx, mut command_rx: mpsc::Receiver<Command>) {
    let mut reconnect_attempt: u32 = 0;
    let mut ever_connected = false;
    let mut gave_up = false;

    'outer: loop {
        let phase = if ever_connected {
            ClientState::Reconnecting
        } else {
            ClientState::Connecting
        };
        let _ = ctx.state_tx.send(phase);

        let mut stream = match ctx.transport.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to open push stream: {}", e);
                if !backoff(&ctx, &mut reconnect_attempt).await {
                    gave_up = true;
                    break;
                }
                continue;
            }
        };

        // Identity handshake. Subscribe commands arriving before the id is
        // confirmed are deferred and flushed by the resubscribe pass below.
        let connection_id = loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(StreamEvent::ConnectionId(id)) => break id,
                    Some(other) => {
                        debug!("ignoring pre-handshake event: {:?}", other);
                    }
                    None => {
                        warn!("push stream ended before identity handshake");
                        if !backoff(&ctx, &mut reconnect_attempt).await {
                            gave_up = true;
                            break 'outer;
                        }
                        continue 'outer;
                    }
                },
                cmd = command_rx.recv() => {
                    if let LoopStep::Shutdown = handle_command_disconnected(&mut ctx, cmd) {
                        break 'outer;
                    }
                }
            }
        };
        debug!("connection identity confirmed: {}", connection_id);

        if !resubscribe_all(&mut ctx, &connection_id).await {
            if !backoff(&ctx, &mut reconnect_attempt).await {
                gave_up = true;
                break;
            }
            continue;
        }

        reconnect_attempt = 0;
        let _ = ctx.state_tx.send(ClientState::Connected);
        if ever_connected {
            info!("reconnected as {}", connection_id);
            (ctx.hooks.on_reconnect)();
        }
        ever_connected = true;

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(StreamEvent::Message(message)) => dispatch(&ctx, message),
                    Some(StreamEvent::KeepAlive) => {}
                    Some(StreamEvent::ConnectionId(id)) => {
                        debug!("unexpected identity event mid-stream: {}", id);
                    }
                    None => {
                        warn!("push stream lost, reconnecting");
                        if !backoff(&ctx, &mut reconnect_attempt).await {
                            gave_up = true;
                            break 'outer;
                        }
                        continue 'outer;
                    }
                },
                cmd = command_rx.recv() => {
                    match handle_command_connected(&mut ctx, cmd, &connection_id).await {
                        LoopStep::Continue => {}
                        LoopStep::Reconnect => continue 'outer,
                        LoopStep::Shutdown => break 'outer,
                    }
                }
            }
        }
    }

    let _ = ctx.state_tx.send(ClientState::Closed);
    let max_attempts = ctx.config.max_reconnect_attempts;
    if gave_up {
        fail_all_pending(&mut ctx, || LiveQError::MaxReconnectAttempts(max_attempts));
    } else {
        fail_all_pending(&mut ctx, || LiveQError::Closed);
    }
    debug!("connection loop terminated");
}

fn handle_command_disconnected(ctx: &mut LoopCtx, cmd: Option<Command>) -> LoopStep {
    match cmd {
        Some(Command::Subscribe {
            channel,
            handler_id,
            handler,
            ack,
        }) => {
            ctx.handlers
                .entry(channel.clone())
                .or_default()
                .push((handler_id, handler));
            ctx.pending_acks.entry(channel).or_default().push(ack);
            LoopStep::Continue
        }
        Some(Command::Unsubscribe {
            channel,
            handler_id,
        }) => {
            // No broker call while disconnected: the new connection simply
            // never subscribes this channel.
            remove_handler(ctx, &channel, handler_id);
            LoopStep::Continue
        }
        Some(Command::Close) | None => LoopStep::Shutdown,
    }
}

async fn handle_command_connected(
    ctx: &mut LoopCtx,
    cmd: Option<Command>,
    connection_id: &str,
) -> LoopStep {
    match cmd {
        Some(Command::Subscribe {
            channel,
            handler_id,
            handler,
            ack,
        }) => {
            let already_subscribed = ctx
                .handlers
                .get(&channel)
                .map_or(false, |handlers| !handlers.is_empty());
            ctx.handlers
                .entry(channel.clone())
                .or_default()
                .push((handler_id, handler));

            if already_subscribed {
                let _ = ack.send(Ok(()));
                return LoopStep::Continue;
            }

            match ctx.transport.subscribe(&channel, connection_id).await {
                Ok(SubscribeOutcome::Subscribed) => {
                    let _ = ack.send(Ok(()));
                    LoopStep::Continue
                }
                Ok(SubscribeOutcome::Forbidden) => {
                    remove_handler(ctx, &channel, handler_id);
                    let _ = ack.send(Err(LiveQError::SubscriptionForbidden(channel)));
                    LoopStep::Continue
                }
                Ok(SubscribeOutcome::ConnectionNotFound) => {
                    // The broker forgot us (restart, or a load-balanced call
                    // landed elsewhere). Reconnect; the resubscribe pass
                    // retries this call and resolves the ack.
                    debug!("broker does not recognize connection {}", connection_id);
                    ctx.pending_acks.entry(channel).or_default().push(ack);
                    LoopStep::Reconnect
                }
                Err(e) => {
                    warn!("subscribe call for {} failed: {}", channel, e);
                    ctx.pending_acks.entry(channel).or_default().push(ack);
                    LoopStep::Reconnect
                }
            }
        }
        Some(Command::Unsubscribe {
            channel,
            handler_id,
        }) => {
            if remove_handler(ctx, &channel, handler_id) {
                // Last local handler gone: release the broker subscription,
                // fire-and-forget. Local teardown never waits on it.
                let transport = ctx.transport.clone();
                let id = connection_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = transport.unsubscribe(&channel, &id).await {
                        debug!("unsubscribe call for {} failed: {}", channel, e);
                    }
                });
            }
            LoopStep::Continue
        }
        Some(Command::Close) | None => LoopStep::Shutdown,
    }
}

/// Remove one handler; returns true when the channel has no handlers left.
fn remove_handler(ctx: &mut LoopCtx, channel: &str, handler_id: u64) -> bool {
    if let Some(handlers) = ctx.handlers.get_mut(channel) {
        handlers.retain(|(id, _)| *id != handler_id);
        if handlers.is_empty() {
            ctx.handlers.remove(channel);
            return true;
        }
    }
    false
}

/// Subscribe every channel that still has at least one local handler on the
/// (new) connection, resolving any deferred acks. Returns false when the
/// connection must be restarted.
async fn resubscribe_all(ctx: &mut LoopCtx, connection_id: &str) -> bool {
    let channels: Vec<String> = ctx.handlers.keys().cloned().collect();
    for channel in channels {
        match ctx.transport.subscribe(&channel, connection_id).await {
            Ok(SubscribeOutcome::Subscribed) => {
                ack_channel(ctx, &channel, || Ok(()));
            }
            Ok(SubscribeOutcome::Forbidden) => {
                warn!("subscription to {} rejected, dropping channel", channel);
                ctx.handlers.remove(&channel);
                let name = channel.clone();
                ack_channel(ctx, &channel, || {
                    Err(LiveQError::SubscriptionForbidden(name.clone()))
                });
                (ctx.hooks.on_channel_dropped)(&channel);
            }
            Ok(SubscribeOutcome::ConnectionNotFound) => {
                debug!("connection identity rejected during resubscribe");
                return false;
            }
            Err(e) => {
                warn!("subscribe call for {} failed: {}", channel, e);
                return false;
            }
        }
    }
    true
}

fn ack_channel(ctx: &mut LoopCtx, channel: &str, make: impl Fn() -> Result<(), LiveQError>) {
    if let Some(acks) = ctx.pending_acks.remove(channel) {
        for ack in acks {
            let _ = ack.send(make());
        }
    }
}

fn fail_all_pending(ctx: &mut LoopCtx, make: impl Fn() -> LiveQError) {
    for (_, acks) in ctx.pending_acks.drain() {
        for ack in acks {
            let _ = ack.send(Err(make()));
        }
    }
}

fn dispatch(ctx: &LoopCtx, message: ChannelMessage) {
    match ctx.handlers.get(&message.channel) {
        Some(handlers) => {
            for (_, handler) in handlers {
                handler(message.data.clone());
            }
        }
        None => {
            // The broker may still be delivering to a channel this client
            // unsubscribed from moments ago.
            debug!("ignoring message for unknown channel {}", message.channel);
        }
    }
}

async fn backoff(ctx: &LoopCtx, attempt: &mut u32) -> bool {
    if !ctx.config.auto_reconnect || *attempt >= ctx.config.max_reconnect_attempts {
        warn!("giving up after {} reconnection attempts", attempt);
        return false;
    }
    let delay = ctx.config.reconnect_delay(*attempt);
    *attempt += 1;
    info!("reconnecting in {:?} (attempt {})", delay, attempt);
    sleep(delay).await;
    true
}
