//! Server: cluster metadata and the write path
//!
//! The server owns the in-memory topology, the durable metastore, and the
//! broker client. Every topology change is published to the broadcast topic
//! and applied by a single consumer task in log order, so all nodes converge
//! on identical state. Point writes are published to per-shard topics and
//! applied by each replica of the shard.
//!
//! One process-wide readers-writer lock protects the topology graph and the
//! per-index error map. Apply handlers run under the write lock and never
//! publish to the broker; public read accessors take the shared lock.

use crate::auth;
use crate::broker::{BrokerClient, Delivery, Message, MessageType, BROADCAST_TOPIC_ID};
use crate::codec;
use crate::meta::{
    truncate_timestamp, DataNode, Database, FieldType, FieldValue, Point, RetentionPolicy, Series,
    ShardGroup, User,
};
use crate::metastore::Metastore;
use crate::shard::PointStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// bcrypt cost used when hashing user passwords.
    pub bcrypt_cost: u32,
    /// Upper bound on how long `sync` waits for an index to apply.
    pub sync_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: auth::DEFAULT_BCRYPT_COST,
            sync_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// - `MERIDIAN_BCRYPT_COST`: bcrypt cost factor
    /// - `MERIDIAN_SYNC_TIMEOUT_MS`: sync timeout in milliseconds
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(cost) = std::env::var("MERIDIAN_BCRYPT_COST") {
            if let Ok(cost) = cost.parse() {
                config.bcrypt_cost = cost;
            }
        }
        if let Ok(ms) = std::env::var("MERIDIAN_SYNC_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.sync_timeout = Duration::from_millis(ms);
            }
        }
        config
    }
}

/// Mutable server state guarded by the topology lock.
struct State {
    /// This node's data node id. Zero until initialized or joined.
    id: u64,
    /// Data directory. `None` while the server is closed.
    path: Option<PathBuf>,
    meta: Option<Metastore>,
    client: Option<Arc<dyn BrokerClient>>,
    /// Errors recorded by apply handlers, keyed by log index.
    errors: HashMap<u64, Error>,
    data_nodes: BTreeMap<u64, DataNode>,
    databases: HashMap<String, Database>,
    /// Local point stores for shards this node replicates, by shard id.
    stores: HashMap<u64, PointStore>,
    users: HashMap<String, User>,
    apply_task: Option<tokio::task::JoinHandle<()>>,
}

impl State {
    fn new() -> Self {
        Self {
            id: 0,
            path: None,
            meta: None,
            client: None,
            errors: HashMap::new(),
            data_nodes: BTreeMap::new(),
            databases: HashMap::new(),
            stores: HashMap::new(),
            users: HashMap::new(),
            apply_task: None,
        }
    }

    fn opened(&self) -> bool {
        self.path.is_some()
    }

    fn meta(&self) -> Result<&Metastore> {
        self.meta.as_ref().ok_or(Error::ServerClosed)
    }
}

struct Shared {
    config: ServerConfig,
    state: RwLock<State>,
    /// Highest applied log index; `sync` waits on change notifications.
    index_tx: watch::Sender<u64>,
}

/// A metadata and write-path coordinator node.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

fn shard_store_path(base: &Path, shard_id: u64) -> PathBuf {
    base.join("shards").join(shard_id.to_string())
}

impl Server {
    /// Create a closed server with the given config.
    pub fn new(config: ServerConfig) -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(State::new()),
                index_tx,
            }),
        }
    }

    /// Initialize the server from a data directory.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::PathRequired);
        }

        let mut state = self.shared.state.write();
        if state.opened() {
            return Err(Error::ServerOpen);
        }

        std::fs::create_dir_all(path)?;
        std::fs::create_dir_all(path.join("shards"))?;

        let meta = Metastore::open(path.join("meta"))?;
        Self::load_state(&mut state, &meta, path)?;
        state.meta = Some(meta);
        state.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Shut the server down. In-flight applies are dropped.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        if !state.opened() {
            return Err(Error::ServerClosed);
        }
        state.path = None;
        if let Some(task) = state.apply_task.take() {
            task.abort();
        }
        state.client = None;
        state.meta = None;
        state.stores.clear();
        state.data_nodes.clear();
        state.databases.clear();
        state.users.clear();
        state.errors.clear();
        Ok(())
    }

    /// Rebuild in-memory state from the metastore and reopen local shard
    /// stores for shards this node replicates.
    fn load_state(state: &mut State, meta: &Metastore, path: &Path) -> Result<()> {
        let (id, nodes, databases, users) = meta.view(|tx| {
            Ok((tx.id()?, tx.data_nodes()?, tx.databases()?, tx.users()?))
        })?;

        state.id = id;
        state.data_nodes = nodes.into_iter().map(|n| (n.id, n)).collect();
        state.users = users.into_iter().map(|u| (u.name.clone(), u)).collect();

        state.databases.clear();
        state.stores.clear();
        let mut local_shards = Vec::new();
        for db in databases {
            info!(database = %db.name, "loading metadata index");
            for rp in db.policies.values() {
                for g in &rp.shard_groups {
                    for sh in &g.shards {
                        if sh.has_data_node(id) {
                            local_shards.push(sh.id);
                        }
                    }
                }
            }
            state.databases.insert(db.name.clone(), db);
        }
        for shard_id in local_shards {
            let store = PointStore::open(shard_store_path(path, shard_id))?;
            state.stores.insert(shard_id, store);
        }
        Ok(())
    }

    /// True when the server is open.
    pub fn is_open(&self) -> bool {
        self.shared.state.read().opened()
    }

    /// This node's data node id. Zero when closed or not yet in a cluster.
    pub fn id(&self) -> u64 {
        self.shared.state.read().id
    }

    /// The data directory, empty when closed.
    pub fn path(&self) -> Option<PathBuf> {
        self.shared.state.read().path.clone()
    }

    /// Highest applied log index.
    pub fn index(&self) -> u64 {
        *self.shared.index_tx.borrow()
    }

    /// Attach a broker client and start the apply task on its delivery
    /// channel. Replacing the client stops the previous apply task.
    pub fn set_client(&self, client: Arc<dyn BrokerClient>, delivery: Delivery) -> Result<()> {
        let mut state = self.shared.state.write();
        if !state.opened() {
            return Err(Error::ServerClosed);
        }
        if let Some(task) = state.apply_task.take() {
            task.abort();
        }
        state.client = Some(client.clone());
        state.apply_task = Some(tokio::spawn(apply_loop(
            self.shared.clone(),
            client,
            delivery,
        )));
        Ok(())
    }

    fn client(&self) -> Result<Arc<dyn BrokerClient>> {
        self.shared
            .state
            .read()
            .client
            .clone()
            .ok_or(Error::ServerClosed)
    }

    /// Encode a command, publish it on the broadcast topic, and wait until it
    /// has been applied locally. Returns the assigned log index.
    async fn broadcast<C: Serialize>(&self, message_type: MessageType, c: &C) -> Result<u64> {
        let data = serde_json::to_vec(c)?;
        let client = self.client()?;
        let index = client
            .publish(Message::new(message_type, BROADCAST_TOPIC_ID, data))
            .await?;
        self.sync(index).await?;
        Ok(index)
    }

    /// Wait until the given index (or a higher one) has been applied, then
    /// return any error the apply handler recorded for it.
    pub async fn sync(&self, index: u64) -> Result<()> {
        let mut rx = self.shared.index_tx.subscribe();
        let deadline = tokio::time::Instant::now() + self.shared.config.sync_timeout;
        loop {
            if *rx.borrow_and_update() >= index {
                let mut state = self.shared.state.write();
                return match state.errors.remove(&index) {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
            if !self.is_open() {
                return Err(Error::ServerClosed);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(Error::ServerClosed),
                Err(_) => return Err(Error::Timeout),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Cluster lifecycle
    // ---------------------------------------------------------------------

    /// Create the first data node and take id 1.
    pub async fn initialize(&self, url: &Url) -> Result<()> {
        self.create_data_node(url).await?;

        // The very first node must come back with id 1; the broker's replica
        // addressing relies on it.
        let n = self.data_node_by_url(url).ok_or(Error::DataNodeNotFound)?;
        assert_eq!(n.id, 1, "invalid initial server id: {}", n.id);

        let mut state = self.shared.state.write();
        state.meta()?.update(|tx| tx.set_id(n.id))?;
        state.id = n.id;
        Ok(())
    }

    /// Register with an existing cluster through a peer, download its
    /// metastore snapshot, and adopt the assigned node id.
    pub async fn join(&self, url: &Url, join_url: &Url) -> Result<()> {
        let http = reqwest::Client::new();

        // Ask the peer to create our data node.
        let mut target = join_url.clone();
        target.set_path("/data_nodes");
        let resp = http
            .post(target)
            .json(&DataNodeJson {
                id: 0,
                url: url.to_string(),
            })
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::CREATED {
            return Err(Error::UnableToJoin);
        }
        let n: DataNodeJson = resp.json().await?;
        if n.id == 0 {
            return Err(Error::UnableToJoin);
        }

        // Download the peer's metastore snapshot.
        let mut target = join_url.clone();
        target.set_path("/metastore");
        let resp = http.post(target).send().await?;
        if !resp.status().is_success() {
            return Err(Error::UnableToJoin);
        }
        let image = resp.bytes().await?;

        // Replace the local metastore with the snapshot, persist the assigned
        // id, and rebuild in-memory state from it.
        let mut state = self.shared.state.write();
        let path = state.path.clone().ok_or(Error::ServerClosed)?;
        state.meta = None;
        let meta = Metastore::restore(path.join("meta"), &image)?;
        meta.update(|tx| tx.set_id(n.id))?;
        Self::load_state(&mut state, &meta, &path)?;
        state.meta = Some(meta);
        state.id = n.id;
        info!(id = n.id, "joined cluster");
        Ok(())
    }

    /// Stream a consistent metastore snapshot to a writer. Returns the image
    /// size in bytes.
    pub fn copy_metastore(&self, w: &mut dyn Write) -> Result<u64> {
        let state = self.shared.state.read();
        state.meta()?.copy(w)
    }

    /// Serialize a consistent metastore snapshot.
    pub fn metastore_snapshot(&self) -> Result<Vec<u8>> {
        let state = self.shared.state.read();
        state.meta()?.snapshot()
    }

    // ---------------------------------------------------------------------
    // Data nodes
    // ---------------------------------------------------------------------

    /// Returns a data node by id.
    pub fn data_node(&self, id: u64) -> Option<DataNode> {
        self.shared.state.read().data_nodes.get(&id).cloned()
    }

    /// Returns a data node by url.
    pub fn data_node_by_url(&self, url: &Url) -> Option<DataNode> {
        self.shared
            .state
            .read()
            .data_nodes
            .values()
            .find(|n| &n.url == url)
            .cloned()
    }

    /// Returns all data nodes ordered by id.
    pub fn data_nodes(&self) -> Vec<DataNode> {
        self.shared.state.read().data_nodes.values().cloned().collect()
    }

    /// Create a new data node with a given url.
    pub async fn create_data_node(&self, url: &Url) -> Result<()> {
        let c = CreateDataNodeCommand {
            url: url.to_string(),
        };
        self.broadcast(MessageType::CreateDataNode, &c).await?;
        Ok(())
    }

    /// Delete an existing data node.
    pub async fn delete_data_node(&self, id: u64) -> Result<()> {
        let c = DeleteDataNodeCommand { id };
        self.broadcast(MessageType::DeleteDataNode, &c).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Databases
    // ---------------------------------------------------------------------

    /// Returns true if a database exists.
    pub fn database_exists(&self, name: &str) -> bool {
        self.shared.state.read().databases.contains_key(name)
    }

    /// Returns a sorted list of all database names.
    pub fn databases(&self) -> Vec<String> {
        let state = self.shared.state.read();
        let mut names: Vec<String> = state.databases.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a new database.
    pub async fn create_database(&self, name: &str) -> Result<()> {
        let c = CreateDatabaseCommand {
            name: name.to_string(),
        };
        self.broadcast(MessageType::CreateDatabase, &c).await?;
        Ok(())
    }

    /// Delete an existing database and everything it owns.
    pub async fn delete_database(&self, name: &str) -> Result<()> {
        let c = DeleteDatabaseCommand {
            name: name.to_string(),
        };
        self.broadcast(MessageType::DeleteDatabase, &c).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Retention policies
    // ---------------------------------------------------------------------

    /// Returns a retention policy by name.
    pub fn retention_policy(&self, database: &str, name: &str) -> Result<Option<RetentionPolicy>> {
        let state = self.shared.state.read();
        let db = state
            .databases
            .get(database)
            .ok_or(Error::DatabaseNotFound)?;
        Ok(db.policies.get(name).cloned())
    }

    /// Returns all retention policies of a database, sorted by name.
    pub fn retention_policies(&self, database: &str) -> Result<Vec<RetentionPolicy>> {
        let state = self.shared.state.read();
        let db = state
            .databases
            .get(database)
            .ok_or(Error::DatabaseNotFound)?;
        let mut policies: Vec<RetentionPolicy> = db.policies.values().cloned().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(policies)
    }

    /// Returns the default retention policy of a database, if one is set.
    pub fn default_retention_policy(&self, database: &str) -> Result<Option<RetentionPolicy>> {
        let state = self.shared.state.read();
        let db = state
            .databases
            .get(database)
            .ok_or(Error::DatabaseNotFound)?;
        Ok(db
            .default_retention_policy
            .as_ref()
            .and_then(|name| db.policies.get(name))
            .cloned())
    }

    /// Create a retention policy on a database.
    pub async fn create_retention_policy(
        &self,
        database: &str,
        rp: &RetentionPolicy,
    ) -> Result<()> {
        let c = CreateRetentionPolicyCommand {
            database: database.to_string(),
            name: rp.name.clone(),
            duration: rp.duration,
            replica_n: rp.replica_n,
            split_n: rp.split_n,
        };
        self.broadcast(MessageType::CreateRetentionPolicy, &c).await?;
        Ok(())
    }

    /// Rename an existing retention policy.
    pub async fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        new_name: &str,
    ) -> Result<()> {
        let c = UpdateRetentionPolicyCommand {
            database: database.to_string(),
            name: name.to_string(),
            new_name: new_name.to_string(),
        };
        self.broadcast(MessageType::UpdateRetentionPolicy, &c).await?;
        Ok(())
    }

    /// Remove a retention policy from a database.
    pub async fn delete_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        let c = DeleteRetentionPolicyCommand {
            database: database.to_string(),
            name: name.to_string(),
        };
        self.broadcast(MessageType::DeleteRetentionPolicy, &c).await?;
        Ok(())
    }

    /// Set the policy new writes and reads default to on a database.
    pub async fn set_default_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        let c = SetDefaultRetentionPolicyCommand {
            database: database.to_string(),
            name: name.to_string(),
        };
        self.broadcast(MessageType::SetDefaultRetentionPolicy, &c)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------------

    /// Returns a user by name.
    pub fn user(&self, name: &str) -> Option<User> {
        self.shared.state.read().users.get(name).cloned()
    }

    /// Returns all users sorted by name.
    pub fn users(&self) -> Vec<User> {
        let state = self.shared.state.read();
        let mut users: Vec<User> = state.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    /// Returns whether at least one admin-level user exists.
    pub fn admin_user_exists(&self) -> bool {
        self.shared.state.read().users.values().any(|u| u.admin)
    }

    /// Returns the user when the credentials are valid.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let state = self.shared.state.read();
        let user = state.users.get(username).ok_or(Error::UserNotFound)?;
        user.authenticate(password)?;
        Ok(user.clone())
    }

    /// Create a user on the server.
    pub async fn create_user(&self, username: &str, password: &str, admin: bool) -> Result<()> {
        let c = CreateUserCommand {
            username: username.to_string(),
            password: password.to_string(),
            admin,
        };
        self.broadcast(MessageType::CreateUser, &c).await?;
        Ok(())
    }

    /// Update an existing user's password.
    pub async fn update_user(&self, username: &str, password: &str) -> Result<()> {
        let c = UpdateUserCommand {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.broadcast(MessageType::UpdateUser, &c).await?;
        Ok(())
    }

    /// Remove a user from the server.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        let c = DeleteUserCommand {
            username: username.to_string(),
        };
        self.broadcast(MessageType::DeleteUser, &c).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Shard groups and series
    // ---------------------------------------------------------------------

    /// Returns all shard groups of a database across its policies.
    pub fn shard_groups(&self, database: &str) -> Result<Vec<ShardGroup>> {
        let state = self.shared.state.read();
        let db = state
            .databases
            .get(database)
            .ok_or(Error::DatabaseNotFound)?;
        let mut groups = Vec::new();
        for rp in db.policies.values() {
            groups.extend(rp.shard_groups.iter().cloned());
        }
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    /// Returns the shard group covering a timestamp, if one exists.
    pub fn shard_group_by_timestamp(
        &self,
        database: &str,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ShardGroup>> {
        let state = self.shared.state.read();
        let db = state
            .databases
            .get(database)
            .ok_or(Error::DatabaseNotFound)?;
        Ok(db.shard_group_by_timestamp(policy, timestamp)?.cloned())
    }

    /// Create the shard group covering the interval a timestamp falls into.
    /// Idempotent: an existing covering group is left untouched.
    pub async fn create_shard_group_if_not_exists(
        &self,
        database: &str,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let c = CreateShardGroupIfNotExistsCommand {
            database: database.to_string(),
            policy: policy.to_string(),
            timestamp,
        };
        self.broadcast(MessageType::CreateShardGroupIfNotExists, &c)
            .await?;
        Ok(())
    }

    /// Returns the shard group for a timestamp, creating it when missing.
    async fn ensure_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ShardGroup> {
        if let Some(g) = self.shard_group_by_timestamp(database, policy, timestamp)? {
            return Ok(g);
        }
        self.create_shard_group_if_not_exists(database, policy, timestamp)
            .await?;
        self.shard_group_by_timestamp(database, policy, timestamp)?
            .ok_or(Error::ShardNotFound)
    }

    /// Returns the series id for a measurement and tag set, allocating one
    /// through the log when the series is new.
    pub async fn create_series_if_not_exists(
        &self,
        database: &str,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<u32> {
        // Fast path under the shared lock. The lock must be released before
        // broadcasting or the apply task could never acquire the write lock.
        {
            let state = self.shared.state.read();
            let db = state
                .databases
                .get(database)
                .ok_or(Error::DatabaseNotFound)?;
            if let (_, Some(series)) = db.measurement_and_series(name, tags) {
                return Ok(series.id);
            }
        }

        let c = CreateSeriesIfNotExistsCommand {
            database: database.to_string(),
            name: name.to_string(),
            tags: tags.clone(),
        };
        self.broadcast(MessageType::CreateSeriesIfNotExists, &c)
            .await?;

        let state = self.shared.state.read();
        let db = state
            .databases
            .get(database)
            .ok_or(Error::DatabaseNotFound)?;
        match db.measurement_and_series(name, tags) {
            (_, Some(series)) => Ok(series.id),
            _ => Err(Error::SeriesNotFound),
        }
    }

    /// Returns a measurement and its schema by database and name.
    pub fn measurement(&self, database: &str, name: &str) -> Option<crate::meta::Measurement> {
        self.shared
            .state
            .read()
            .databases
            .get(database)
            .and_then(|db| db.measurements.get(name))
            .cloned()
    }

    /// Returns the sorted measurement names of a database.
    pub fn measurement_names(&self, database: &str) -> Option<Vec<String>> {
        self.shared
            .state
            .read()
            .databases
            .get(database)
            .map(|db| db.names.clone())
    }

    // ---------------------------------------------------------------------
    // Write pipeline
    // ---------------------------------------------------------------------

    /// Write a single point, routing it to the correct shard topic.
    ///
    /// Returns the log index the write was published at, or zero for a point
    /// with no values. Point writes are not synced through the broadcast
    /// apply path; they are consumed on the shard's own subscription.
    pub async fn write_series(
        &self,
        database: &str,
        retention_policy: Option<&str>,
        point: Point,
    ) -> Result<u64> {
        // Resolve the series id, creating the series when it is new.
        let series_id = self
            .create_series_if_not_exists(database, &point.name, &point.tags)
            .await?;

        // Default the retention policy from the database.
        let policy = match retention_policy {
            Some(p) => p.to_string(),
            None => self
                .default_retention_policy(database)?
                .ok_or(Error::DefaultRetentionPolicyNotFound)?
                .name,
        };

        // The measurement exists once the series does.
        if !self.measurement_exists(database, &point.name) {
            return Err(Error::MeasurementNotFound);
        }

        // Acquire the covering shard group; this may broadcast.
        let group = self
            .ensure_shard_group(database, &policy, point.timestamp)
            .await?;
        let shard = group.shard_by_series_id(series_id);

        // Writes with no values are ignored.
        if point.values.is_empty() {
            return Ok(0);
        }

        let timestamp = point.timestamp.timestamp_nanos_opt().unwrap_or(0);

        // Map string keys to field ids. When every key is known the write
        // goes out in the compact raw form; otherwise the apply handler
        // creates the missing fields and rewrites to raw on each replica.
        let raw_values = {
            let state = self.shared.state.read();
            state
                .databases
                .get(database)
                .and_then(|db| db.measurements.get(&point.name))
                .and_then(|m| m.map_values(&point.values))
        };

        let client = self.client()?;
        match raw_values {
            Some(raw) => {
                let data = marshal_point(series_id, timestamp, &raw);
                debug!(series = series_id, shard = shard.id, "raw series write");
                client
                    .publish(Message::new(MessageType::WriteRawSeries, shard.id, data))
                    .await
            }
            None => {
                let c = WriteSeriesCommand {
                    database: database.to_string(),
                    measurement: point.name.clone(),
                    series_id,
                    timestamp,
                    values: point.values,
                };
                debug!(series = series_id, shard = shard.id, "non-raw series write");
                client
                    .publish(Message::new(
                        MessageType::WriteSeries,
                        shard.id,
                        serde_json::to_vec(&c)?,
                    ))
                    .await
            }
        }
    }

    fn measurement_exists(&self, database: &str, name: &str) -> bool {
        self.shared
            .state
            .read()
            .databases
            .get(database)
            .map(|db| db.measurements.contains_key(name))
            .unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------------

    /// Read a single point from a series.
    ///
    /// Returns `None` when no shard group covers the timestamp or the shard
    /// holds no point at it.
    pub fn read_series(
        &self,
        database: &str,
        retention_policy: Option<&str>,
        name: &str,
        tags: &HashMap<String, String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<HashMap<String, FieldValue>>> {
        let state = self.shared.state.read();
        let db = state
            .databases
            .get(database)
            .ok_or(Error::DatabaseNotFound)?;

        let (measurement, series) = db.measurement_and_series(name, tags);
        let measurement = measurement.ok_or(Error::MeasurementNotFound)?;
        let series = series.ok_or(Error::SeriesNotFound)?;

        let policy = match retention_policy {
            Some(p) => p,
            None => db
                .default_retention_policy
                .as_deref()
                .ok_or(Error::RetentionPolicyNotFound)?,
        };

        let group = match db.shard_group_by_timestamp(policy, timestamp)? {
            Some(g) => g,
            None => return Ok(None),
        };
        let shard = group.shard_by_series_id(series.id);
        let store = state.stores.get(&shard.id).ok_or(Error::ShardNotFound)?;

        let data = match store.read_series(series.id, timestamp.timestamp_nanos_opt().unwrap_or(0))?
        {
            Some(d) => d,
            None => return Ok(None),
        };

        // Decode through the field catalog; unknown field ids are dropped.
        let mut values = HashMap::new();
        for (field_id, value) in codec::unmarshal_values(&data) {
            if let Some(f) = measurement.field(field_id) {
                values.insert(f.name.clone(), value);
            }
        }
        Ok(Some(values))
    }
}

fn marshal_point(series_id: u32, timestamp: i64, values: &BTreeMap<u8, FieldValue>) -> Vec<u8> {
    let mut data = codec::marshal_point_header(series_id, timestamp).to_vec();
    data.extend_from_slice(&codec::marshal_values(values));
    data
}

// -------------------------------------------------------------------------
// Apply engine
// -------------------------------------------------------------------------

/// Drains the delivery channel and applies messages serially, in log order.
async fn apply_loop(shared: Arc<Shared>, client: Arc<dyn BrokerClient>, mut delivery: Delivery) {
    while let Some(m) = delivery.recv().await {
        let index = m.index;

        // Dispatch under the exclusive topology lock.
        let (replica_id, subscriptions) = {
            let mut state = shared.state.write();
            // Messages arriving after close are silently dropped.
            if !state.opened() {
                continue;
            }
            let subscriptions = match state.apply(&m, &shared.config) {
                Ok(subscriptions) => subscriptions,
                Err(e) => {
                    debug!(index, "apply error: {e}");
                    state.errors.insert(index, e);
                    Vec::new()
                }
            };
            (state.id, subscriptions)
        };

        // Subscribe to newly assigned shard topics outside the lock.
        for topic_id in subscriptions {
            if let Err(e) = client.subscribe(replica_id, topic_id).await {
                warn!(
                    replica = replica_id,
                    topic = topic_id,
                    "unable to subscribe: {e}"
                );
            }
        }

        // Advance the high-water mark and wake `sync` waiters.
        shared.index_tx.send_modify(|v| {
            if index > *v {
                *v = index;
            }
        });
    }
}

impl State {
    /// Deterministically apply one log message. Returns shard topics this
    /// node must subscribe to as a result.
    fn apply(&mut self, m: &Message, config: &ServerConfig) -> Result<Vec<u64>> {
        match m.message_type {
            MessageType::CreateDataNode => self.apply_create_data_node(m)?,
            MessageType::DeleteDataNode => self.apply_delete_data_node(m)?,
            MessageType::CreateDatabase => self.apply_create_database(m)?,
            MessageType::DeleteDatabase => self.apply_delete_database(m)?,
            MessageType::CreateRetentionPolicy => self.apply_create_retention_policy(m)?,
            MessageType::UpdateRetentionPolicy => self.apply_update_retention_policy(m)?,
            MessageType::DeleteRetentionPolicy => self.apply_delete_retention_policy(m)?,
            MessageType::SetDefaultRetentionPolicy => self.apply_set_default_retention_policy(m)?,
            MessageType::CreateUser => self.apply_create_user(m, config)?,
            MessageType::UpdateUser => self.apply_update_user(m, config)?,
            MessageType::DeleteUser => self.apply_delete_user(m)?,
            MessageType::CreateShardGroupIfNotExists => {
                return self.apply_create_shard_group(m);
            }
            MessageType::CreateSeriesIfNotExists => self.apply_create_series(m)?,
            MessageType::WriteSeries => self.apply_write_series(m)?,
            MessageType::WriteRawSeries => self.apply_write_raw_series(m)?,
        }
        Ok(Vec::new())
    }

    fn apply_create_data_node(&mut self, m: &Message) -> Result<()> {
        let c: CreateDataNodeCommand = serde_json::from_slice(&m.data)?;
        if c.url.is_empty() {
            return Err(Error::DataNodeUrlRequired);
        }
        let url =
            Url::parse(&c.url).map_err(|e| Error::Serialization(format!("data node url: {e}")))?;
        if self.data_nodes.values().any(|n| n.url == url) {
            return Err(Error::DataNodeExists);
        }

        let node = self.meta()?.update(|tx| {
            let id = tx.next_data_node_id()?;
            let node = DataNode { id, url: url.clone() };
            tx.save_data_node(&node)?;
            Ok(node)
        })?;
        info!(id = node.id, url = %node.url, "created data node");
        self.data_nodes.insert(node.id, node);
        Ok(())
    }

    fn apply_delete_data_node(&mut self, m: &Message) -> Result<()> {
        let c: DeleteDataNodeCommand = serde_json::from_slice(&m.data)?;
        if !self.data_nodes.contains_key(&c.id) {
            return Err(Error::DataNodeNotFound);
        }
        self.meta()?.update(|tx| tx.delete_data_node(c.id))?;
        self.data_nodes.remove(&c.id);
        info!(id = c.id, "deleted data node");
        Ok(())
    }

    fn apply_create_database(&mut self, m: &Message) -> Result<()> {
        let c: CreateDatabaseCommand = serde_json::from_slice(&m.data)?;
        if self.databases.contains_key(&c.name) {
            return Err(Error::DatabaseExists);
        }
        let db = Database::new(&c.name);
        self.meta()?.update(|tx| tx.save_database(&db))?;
        info!(database = %c.name, "created database");
        self.databases.insert(c.name, db);
        Ok(())
    }

    fn apply_delete_database(&mut self, m: &Message) -> Result<()> {
        let c: DeleteDatabaseCommand = serde_json::from_slice(&m.data)?;
        if !self.databases.contains_key(&c.name) {
            return Err(Error::DatabaseNotFound);
        }
        // The database document carries its whole sub-graph, so the delete
        // cascades in the metastore.
        self.meta()?.update(|tx| tx.delete_database(&c.name))?;
        self.databases.remove(&c.name);
        info!(database = %c.name, "deleted database");
        Ok(())
    }

    fn apply_create_retention_policy(&mut self, m: &Message) -> Result<()> {
        let c: CreateRetentionPolicyCommand = serde_json::from_slice(&m.data)?;
        let meta = self.meta.as_ref().ok_or(Error::ServerClosed)?;
        let db = self
            .databases
            .get_mut(&c.database)
            .ok_or(Error::DatabaseNotFound)?;
        if c.name.is_empty() {
            return Err(Error::RetentionPolicyNameRequired);
        }
        if db.policies.contains_key(&c.name) {
            return Err(Error::RetentionPolicyExists);
        }

        db.policies.insert(
            c.name.clone(),
            RetentionPolicy {
                name: c.name.clone(),
                duration: c.duration,
                replica_n: c.replica_n,
                split_n: c.split_n,
                shard_groups: Vec::new(),
            },
        );
        if let Err(e) = meta.update(|tx| tx.save_database(db)) {
            db.policies.remove(&c.name);
            return Err(e);
        }
        Ok(())
    }

    fn apply_update_retention_policy(&mut self, m: &Message) -> Result<()> {
        let c: UpdateRetentionPolicyCommand = serde_json::from_slice(&m.data)?;
        let meta = self.meta.as_ref().ok_or(Error::ServerClosed)?;
        let db = self
            .databases
            .get_mut(&c.database)
            .ok_or(Error::DatabaseNotFound)?;
        if c.name.is_empty() {
            return Err(Error::RetentionPolicyNameRequired);
        }
        if !db.policies.contains_key(&c.name) {
            return Err(Error::RetentionPolicyNotFound);
        }

        // Rename is a delete and reinsert under the new key.
        let renamed = c.new_name != c.name && !c.new_name.is_empty();
        if renamed {
            let mut rp = db.policies.remove(&c.name).unwrap();
            rp.name = c.new_name.clone();
            if db.default_retention_policy.as_deref() == Some(c.name.as_str()) {
                db.default_retention_policy = Some(c.new_name.clone());
            }
            db.policies.insert(c.new_name.clone(), rp);
        }
        if let Err(e) = meta.update(|tx| tx.save_database(db)) {
            if renamed {
                let mut rp = db.policies.remove(&c.new_name).unwrap();
                rp.name = c.name.clone();
                if db.default_retention_policy.as_deref() == Some(c.new_name.as_str()) {
                    db.default_retention_policy = Some(c.name.clone());
                }
                db.policies.insert(c.name.clone(), rp);
            }
            return Err(e);
        }
        Ok(())
    }

    fn apply_delete_retention_policy(&mut self, m: &Message) -> Result<()> {
        let c: DeleteRetentionPolicyCommand = serde_json::from_slice(&m.data)?;
        let meta = self.meta.as_ref().ok_or(Error::ServerClosed)?;
        let db = self
            .databases
            .get_mut(&c.database)
            .ok_or(Error::DatabaseNotFound)?;
        if c.name.is_empty() {
            return Err(Error::RetentionPolicyNameRequired);
        }
        let rp = db
            .policies
            .remove(&c.name)
            .ok_or(Error::RetentionPolicyNotFound)?;
        if let Err(e) = meta.update(|tx| tx.save_database(db)) {
            db.policies.insert(c.name.clone(), rp);
            return Err(e);
        }
        Ok(())
    }

    fn apply_set_default_retention_policy(&mut self, m: &Message) -> Result<()> {
        let c: SetDefaultRetentionPolicyCommand = serde_json::from_slice(&m.data)?;
        let meta = self.meta.as_ref().ok_or(Error::ServerClosed)?;
        let db = self
            .databases
            .get_mut(&c.database)
            .ok_or(Error::DatabaseNotFound)?;
        if !db.policies.contains_key(&c.name) {
            return Err(Error::RetentionPolicyNotFound);
        }

        let previous = db.default_retention_policy.replace(c.name.clone());
        if let Err(e) = meta.update(|tx| tx.save_database(db)) {
            db.default_retention_policy = previous;
            return Err(e);
        }
        Ok(())
    }

    fn apply_create_user(&mut self, m: &Message, config: &ServerConfig) -> Result<()> {
        let c: CreateUserCommand = serde_json::from_slice(&m.data)?;
        if c.username.is_empty() {
            return Err(Error::UsernameRequired);
        }
        if self.users.contains_key(&c.username) {
            return Err(Error::UserExists);
        }

        let user = User {
            name: c.username.clone(),
            hash: auth::hash_password(&c.password, config.bcrypt_cost)?,
            admin: c.admin,
        };
        self.meta()?.update(|tx| tx.save_user(&user))?;
        info!(user = %user.name, admin = user.admin, "created user");
        self.users.insert(user.name.clone(), user);
        Ok(())
    }

    fn apply_update_user(&mut self, m: &Message, config: &ServerConfig) -> Result<()> {
        let c: UpdateUserCommand = serde_json::from_slice(&m.data)?;
        let mut user = self
            .users
            .get(&c.username)
            .cloned()
            .ok_or(Error::UserNotFound)?;

        // Only rehash when a new password was supplied.
        if !c.password.is_empty() {
            user.hash = auth::hash_password(&c.password, config.bcrypt_cost)?;
        }
        self.meta()?.update(|tx| tx.save_user(&user))?;
        self.users.insert(user.name.clone(), user);
        Ok(())
    }

    fn apply_delete_user(&mut self, m: &Message) -> Result<()> {
        let c: DeleteUserCommand = serde_json::from_slice(&m.data)?;
        if c.username.is_empty() {
            return Err(Error::UsernameRequired);
        }
        if !self.users.contains_key(&c.username) {
            return Err(Error::UserNotFound);
        }
        self.meta()?.update(|tx| tx.delete_user(&c.username))?;
        self.users.remove(&c.username);
        Ok(())
    }

    fn apply_create_shard_group(&mut self, m: &Message) -> Result<Vec<u64>> {
        let c: CreateShardGroupIfNotExistsCommand = serde_json::from_slice(&m.data)?;
        let local_id = self.id;
        let path = self.path.clone().ok_or(Error::ServerClosed)?;
        let meta = self.meta.as_ref().ok_or(Error::ServerClosed)?;

        // Placement needs a deterministic total order over the nodes that
        // every replica agrees on.
        let nodes: Vec<DataNode> = self.data_nodes.values().cloned().collect();
        if nodes.is_empty() {
            return Err(Error::DataNodeNotFound);
        }

        let db = self
            .databases
            .get_mut(&c.database)
            .ok_or(Error::DatabaseNotFound)?;
        let rp = db
            .policies
            .get(&c.policy)
            .ok_or(Error::RetentionPolicyNotFound)?;

        // A group already covering the timestamp means there is nothing to do.
        if rp.shard_group_by_timestamp(c.timestamp).is_some() {
            return Ok(Vec::new());
        }

        let start_time = truncate_timestamp(c.timestamp, rp.duration);
        let end_time = start_time
            + chrono::Duration::from_std(rp.duration)
                .map_err(|e| Error::Serialization(format!("retention duration: {e}")))?;

        // At least one replica, and no more replicas than nodes.
        let replica_n = (rp.replica_n.max(1) as usize).min(nodes.len());
        // Spreading nodes over shards at the replication factor.
        let shard_n = nodes.len() / replica_n;

        let mut group = ShardGroup {
            id: 0,
            start_time,
            end_time,
            shards: (0..shard_n)
                .map(|_| crate::meta::Shard {
                    id: 0,
                    data_node_ids: Vec::new(),
                })
                .collect(),
        };

        let result = meta.update(|tx| {
            group.id = tx.next_shard_group_id()?;
            for shard in &mut group.shards {
                shard.id = tx.next_shard_id()?;
            }

            // Assign data nodes to shards round robin, starting from a
            // repeatably "random" offset seeded by the log index so every
            // replica computes the same placement.
            let mut node_index = (m.index % nodes.len() as u64) as usize;
            for shard in &mut group.shards {
                for _ in 0..replica_n {
                    shard
                        .data_node_ids
                        .push(nodes[node_index % nodes.len()].id);
                    node_index += 1;
                }
            }

            let rp = db.policies.get_mut(&c.policy).unwrap();
            rp.shard_groups.push(group.clone());
            tx.save_database(db)
        });
        if let Err(e) = result {
            if let Some(rp) = db.policies.get_mut(&c.policy) {
                rp.shard_groups.pop();
            }
            return Err(e);
        }

        info!(
            group = group.id,
            database = %c.database,
            policy = %c.policy,
            shards = group.shards.len(),
            "created shard group"
        );

        // Open local stores for shards assigned to this node. A store that
        // cannot open leaves the shard unreadable on this replica, so fail
        // loudly and let supervision retry.
        let mut topics = Vec::new();
        for shard in &group.shards {
            if !shard.has_data_node(local_id) {
                continue;
            }
            let store = PointStore::open(shard_store_path(&path, shard.id))
                .unwrap_or_else(|e| panic!("unable to open shard {}: {e}", shard.id));
            self.stores.insert(shard.id, store);
            topics.push(shard.id);
        }
        Ok(topics)
    }

    fn apply_create_series(&mut self, m: &Message) -> Result<()> {
        let c: CreateSeriesIfNotExistsCommand = serde_json::from_slice(&m.data)?;
        let meta = self.meta.as_ref().ok_or(Error::ServerClosed)?;
        let db = self
            .databases
            .get_mut(&c.database)
            .ok_or(Error::DatabaseNotFound)?;

        if let (_, Some(_)) = db.measurement_and_series(&c.name, &c.tags) {
            return Ok(());
        }

        // Allocate a persistent id and index the series in one transaction.
        let tags: std::collections::BTreeMap<String, String> =
            c.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let result = meta.update(|tx| {
            let id = tx.next_series_id()? as u32;
            db.add_series_to_index(&c.name, Series { id, tags: tags.clone() });
            tx.save_database(db)
        });
        if let Err(e) = result {
            if let Some(measurement) = db.measurements.get_mut(&c.name) {
                measurement
                    .series
                    .remove(&crate::meta::tagset_key(&c.tags));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Applies a "non-raw" series write: fields may not exist yet, so the
    /// handler creates them, persists the schema change, and rewrites the
    /// values to the compact raw form before storing.
    fn apply_write_series(&mut self, m: &Message) -> Result<()> {
        let c: WriteSeriesCommand = serde_json::from_slice(&m.data)?;
        let store = self.stores.get(&m.topic_id).ok_or(Error::ShardNotFound)?;
        let meta = self.meta.as_ref().ok_or(Error::ServerClosed)?;
        let db = self
            .databases
            .get_mut(&c.database)
            .ok_or(Error::DatabaseNotFound)?;
        let measurement = db
            .measurements
            .get_mut(&c.measurement)
            .ok_or(Error::MeasurementNotFound)?;

        let mut raw_values = BTreeMap::new();
        for (name, value) in &c.values {
            match measurement.create_field_if_not_exists(name, FieldType::Number) {
                Ok(id) => {
                    raw_values.insert(id, *value);
                }
                // A full measurement drops the value but keeps the write.
                Err(Error::FieldOverflow) => {
                    warn!(measurement = %c.measurement, field = %name, "no more fields allowed");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        meta.update(|tx| tx.save_database(db))?;

        let data = codec::marshal_values(&raw_values);
        store.write_series(c.series_id, c.timestamp, &data, true)
    }

    /// Applies a raw series write: field names were already resolved by the
    /// publisher, so no schema work is needed.
    fn apply_write_raw_series(&mut self, m: &Message) -> Result<()> {
        let store = self.stores.get(&m.topic_id).ok_or(Error::ShardNotFound)?;
        let (series_id, timestamp) = codec::unmarshal_point_header(&m.data)?;
        store.write_series(series_id, timestamp, &m.data[codec::POINT_HEADER_SIZE..], true)
    }
}

// -------------------------------------------------------------------------
// Command payloads
// -------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct CreateDataNodeCommand {
    url: String,
}

#[derive(Serialize, Deserialize)]
struct DeleteDataNodeCommand {
    id: u64,
}

#[derive(Serialize, Deserialize)]
struct CreateDatabaseCommand {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct DeleteDatabaseCommand {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct CreateRetentionPolicyCommand {
    database: String,
    name: String,
    duration: Duration,
    #[serde(rename = "replicaN")]
    replica_n: u32,
    #[serde(rename = "splitN")]
    split_n: u32,
}

#[derive(Serialize, Deserialize)]
struct UpdateRetentionPolicyCommand {
    database: String,
    name: String,
    #[serde(rename = "newName")]
    new_name: String,
}

#[derive(Serialize, Deserialize)]
struct DeleteRetentionPolicyCommand {
    database: String,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct SetDefaultRetentionPolicyCommand {
    database: String,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct CreateUserCommand {
    username: String,
    password: String,
    #[serde(default)]
    admin: bool,
}

#[derive(Serialize, Deserialize)]
struct UpdateUserCommand {
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize, Deserialize)]
struct DeleteUserCommand {
    username: String,
}

#[derive(Serialize, Deserialize)]
struct CreateShardGroupIfNotExistsCommand {
    database: String,
    policy: String,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct CreateSeriesIfNotExistsCommand {
    database: String,
    name: String,
    tags: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct WriteSeriesCommand {
    database: String,
    measurement: String,
    #[serde(rename = "seriesID")]
    series_id: u32,
    timestamp: i64,
    values: HashMap<String, FieldValue>,
}

/// Wire shape of a data node in the join handshake.
#[derive(Serialize, Deserialize)]
pub struct DataNodeJson {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub url: String,
}
