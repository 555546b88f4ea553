//! Client SDK for LiveQ live queries.
//!
//! Sits on the other side of the broker's push stream: it keeps a single
//! connection alive across transport failures, multiplexes channel
//! subscriptions over it, and folds published diff batches into typed,
//! ordered result sets.
//!
//! # Quick Start
//!
//! ```ignore
//! use liveq_sdk::{ClientConfig, LiveQueryClient, QueryDefinition};
//! use std::sync::Arc;
//!
//! let client = LiveQueryClient::new(transport, ClientConfig::default());
//! let handle = client
//!     .subscribe_query::<Task>(
//!         QueryDefinition::new("tasks").order_by("title"),
//!         listener,
//!         fetcher,
//!     )
//!     .await?;
//! println!("live on channel {}", handle.channel());
//! ```
//!
//! The transport itself is pluggable: implement [`BrokerTransport`] over
//! whatever carries the push stream and the subscribe calls.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod live_query;
pub mod transport;

pub use client::{LiveQueryClient, LiveQueryHandle, SnapshotFetcher};
pub use config::ClientConfig;
pub use connection::{
    ChannelDroppedHook, ClientState, ConnectionHooks, ConnectionManager, ReconnectHook,
    SubscriptionHandle,
};
pub use error::LiveQError;
pub use event::{decode_changes, ChannelMessage, LiveQueryChange, StreamEvent};
pub use live_query::{
    AppliedChange, LiveQueryListener, LiveQueryUpdate, QueryDefinition, QueryPhase,
    QuerySubscription, SortSegment,
};
pub use transport::{BrokerTransport, EventStream, SubscribeOutcome};
