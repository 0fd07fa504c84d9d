//! # Meridian
//!
//! The metadata and write-path coordinator of a distributed time-series
//! database node.
//!
//! Meridian maintains the authoritative cluster topology (data nodes,
//! databases, retention policies, shard groups, shards, users, series
//! schemas) and routes every incoming point write into the correct shard on
//! the correct replicas. All topology changes flow through an external
//! totally-ordered message broker so that every node converges on identical
//! state by applying log messages in log order.
//!
//! ## Architecture
//!
//! - **Broker port**: publish/subscribe to the replicated log; topology
//!   commands go on the broadcast topic, point writes on per-shard topics
//! - **Apply engine**: a single consumer task that deterministically mutates
//!   in-memory state and the durable metastore in log order
//! - **Metastore**: a transactional embedded key/value store mirroring
//!   topology for crash recovery
//! - **Write pipeline**: resolves series, picks the shard, and upgrades
//!   string-keyed writes to a compact binary form once schema is known

pub mod api;
pub mod auth;
pub mod broker;
pub mod codec;
pub mod meta;
pub mod metastore;
pub mod query;
pub mod server;
pub mod shard;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::broker::{BrokerClient, LocalBroker, Message, MessageType, BROADCAST_TOPIC_ID};
    pub use crate::meta::{DataNode, FieldValue, Point, RetentionPolicy, User};
    pub use crate::query::{Results, Statement};
    pub use crate::server::{Server, ServerConfig};
    pub use crate::{Error, Result};
}
