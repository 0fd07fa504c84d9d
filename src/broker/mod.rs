//! Broker client port for the replicated log
//!
//! Topology-changing commands are published to the broadcast topic and point
//! writes to per-shard topics (topic id = shard id). The broker assigns every
//! published message a totally-ordered log index; replicas consume messages
//! in strict log order per topic and apply them deterministically.
//!
//! The port is pluggable so tests can drive the apply engine with a
//! deterministic in-memory broker.

mod local;

pub use local::LocalBroker;

use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Topic id reserved for the globally-ordered broadcast log.
pub const BROADCAST_TOPIC_ID: u64 = 0;

/// Message type codes on the wire. One byte per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Data node messages
    CreateDataNode = 0x00,
    DeleteDataNode = 0x01,

    // Database messages
    CreateDatabase = 0x10,
    DeleteDatabase = 0x11,

    // Retention policy messages
    CreateRetentionPolicy = 0x20,
    UpdateRetentionPolicy = 0x21,
    DeleteRetentionPolicy = 0x22,
    SetDefaultRetentionPolicy = 0x23,

    // User messages
    CreateUser = 0x30,
    UpdateUser = 0x31,
    DeleteUser = 0x32,

    // Shard messages
    CreateShardGroupIfNotExists = 0x40,

    // Series messages
    CreateSeriesIfNotExists = 0x50,

    // Write series data messages (per-shard topics)
    WriteRawSeries = 0x80,
    WriteSeries = 0x81,
}

/// A message committed to the broker log.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message type code.
    pub message_type: MessageType,
    /// Topic the message was published on.
    pub topic_id: u64,
    /// Log index assigned by the broker. Zero until published.
    pub index: u64,
    /// Payload. JSON commands for topology messages, binary for raw writes.
    pub data: Vec<u8>,
}

impl Message {
    /// Create an unpublished message for a topic.
    pub fn new(message_type: MessageType, topic_id: u64, data: Vec<u8>) -> Self {
        Self {
            message_type,
            topic_id,
            index: 0,
            data,
        }
    }
}

/// Client port onto the external ordered log.
///
/// A single consumer channel per replica delivers messages in strict log
/// order per topic; the broadcast topic is globally ordered.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish a message and return its assigned log index.
    async fn publish(&self, m: Message) -> Result<u64>;

    /// Create a new replica with the given id on the broker.
    async fn create_replica(&self, replica_id: u64) -> Result<()>;

    /// Delete an existing replica from the broker.
    async fn delete_replica(&self, replica_id: u64) -> Result<()>;

    /// Begin delivery of a topic on the replica's consumer channel.
    /// Re-subscription is idempotent.
    async fn subscribe(&self, replica_id: u64, topic_id: u64) -> Result<()>;

    /// Stop delivery of a topic to the replica.
    async fn unsubscribe(&self, replica_id: u64, topic_id: u64) -> Result<()>;
}

/// Consumer end of a replica's delivery channel.
pub type Delivery = mpsc::UnboundedReceiver<Message>;
