//! # liveq-server
//!
//! Broker side of the LiveQ live-query engine.
//!
//! This crate provides the pieces a host application wires into its own
//! transport layer:
//!
//! - A channel registry that owns every live push-stream connection and
//!   fans published messages out to subscribed connections
//! - The heartbeat wire protocol (identity handshake, keep-alive frames,
//!   application messages)
//! - An authorization hook consulted on every subscribe call
//! - A query-storage contract for horizontally-scaled deployments
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use liveq_server::{ChannelRegistry, SubscribeContext};
//!
//! let registry = ChannelRegistry::new();
//!
//! // From the push-stream endpoint handler:
//! let mut handle = registry.open_connection().await;
//! // forward handle.events to the response stream...
//!
//! // From the subscribe endpoint handler:
//! let ctx = SubscribeContext::new(&handle.id);
//! registry.subscribe(&handle.id, "orders:open", &ctx).await?;
//!
//! // From the publisher:
//! registry.publish("orders:open", serde_json::json!({"op": "add"})).await;
//! ```
//!
//! Subscribe and unsubscribe are ordinary request/response calls; only the
//! identity handshake, keep-alive frames, and published messages travel on
//! the push stream.

pub mod auth;
pub mod config;
pub mod registry;
pub mod storage;
pub mod telemetry;
pub mod wire;

pub use auth::{AllowAll, SubscribeContext, SubscribeGuard};
pub use config::RegistryConfig;
pub use registry::{ChannelRegistry, ConnectionHandle, SubscribeError};
pub use storage::{InMemoryQueryStorage, QueryStorage, StoredQuery};
pub use telemetry::{init as init_telemetry, TelemetryConfig};
pub use wire::{ChannelMessage, StreamEvent, SubscribeAck, SubscribeRequest};
