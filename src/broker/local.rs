//! Deterministic in-memory broker
//!
//! A single-process stand-in for the external replicated log. Messages get
//! strictly increasing indexes starting at 1 and are fanned out, in publish
//! order, to every replica subscribed to the message's topic.

use super::{BrokerClient, Delivery, Message};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct Inner {
    /// Last assigned log index.
    index: u64,
    /// Delivery senders by replica id.
    replicas: HashMap<u64, mpsc::UnboundedSender<Message>>,
    /// Receivers parked until a consumer claims them.
    deliveries: HashMap<u64, Delivery>,
    /// Topic subscriptions by replica id.
    subscriptions: HashMap<u64, HashSet<u64>>,
}

/// In-memory ordered log used by tests and single-node deployments.
#[derive(Default)]
pub struct LocalBroker {
    inner: Mutex<Inner>,
}

impl LocalBroker {
    /// Create an empty broker with no replicas.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the consumer channel for a replica.
    ///
    /// Returns `None` if the replica does not exist or its channel was
    /// already claimed.
    pub fn take_delivery(&self, replica_id: u64) -> Option<Delivery> {
        self.inner.lock().deliveries.remove(&replica_id)
    }

    /// Highest index assigned so far.
    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }
}

#[async_trait]
impl BrokerClient for LocalBroker {
    async fn publish(&self, mut m: Message) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.index += 1;
        m.index = inner.index;
        debug!(
            index = m.index,
            topic = m.topic_id,
            "publishing {:?}",
            m.message_type
        );

        // Fan out to replicas subscribed to this topic at publish time.
        let subscribed: Vec<u64> = inner
            .subscriptions
            .iter()
            .filter(|(_, topics)| topics.contains(&m.topic_id))
            .map(|(id, _)| *id)
            .collect();
        for replica_id in subscribed {
            if let Some(tx) = inner.replicas.get(&replica_id) {
                // A dropped consumer is equivalent to a closed replica.
                let _ = tx.send(m.clone());
            }
        }

        Ok(m.index)
    }

    async fn create_replica(&self, replica_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.replicas.contains_key(&replica_id) {
            return Err(Error::Broker(format!("replica {replica_id} exists")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.replicas.insert(replica_id, tx);
        inner.deliveries.insert(replica_id, rx);
        inner.subscriptions.insert(replica_id, HashSet::new());
        Ok(())
    }

    async fn delete_replica(&self, replica_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.replicas.remove(&replica_id);
        inner.deliveries.remove(&replica_id);
        inner.subscriptions.remove(&replica_id);
        Ok(())
    }

    async fn subscribe(&self, replica_id: u64, topic_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.subscriptions.get_mut(&replica_id) {
            Some(topics) => {
                topics.insert(topic_id);
                Ok(())
            }
            None => Err(Error::Broker(format!("replica {replica_id} not found"))),
        }
    }

    async fn unsubscribe(&self, replica_id: u64, topic_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(topics) = inner.subscriptions.get_mut(&replica_id) {
            topics.remove(&topic_id);
        }
        Ok(())
    }
}
