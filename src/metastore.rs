//! Durable metadata store
//!
//! A transactional, single-writer embedded key/value store that mirrors the
//! topology for crash recovery. Databases are persisted with their entire
//! sub-graph (policies, shard groups, measurements, series) as one document,
//! so a `save_database` is atomic for everything the database owns.
//!
//! Monotonic id counters are persisted in the same transaction as the entity
//! they number, which keeps allocation deterministic across replays.

use crate::meta::{DataNode, Database, User};
use crate::{Error, Result};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use url::Url;

const SYSTEM: TableDefinition<&str, u64> = TableDefinition::new("system");
const DATABASES: TableDefinition<&str, &[u8]> = TableDefinition::new("databases");
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const DATA_NODES: TableDefinition<u64, &str> = TableDefinition::new("data_nodes");

const ID_KEY: &str = "id";
const DATA_NODE_ID_KEY: &str = "next_data_node_id";
const SHARD_GROUP_ID_KEY: &str = "next_shard_group_id";
const SHARD_ID_KEY: &str = "next_shard_id";
const SERIES_ID_KEY: &str = "next_series_id";

const COUNTER_KEYS: [&str; 4] = [
    DATA_NODE_ID_KEY,
    SHARD_GROUP_ID_KEY,
    SHARD_ID_KEY,
    SERIES_ID_KEY,
];

/// Durable, transactional store for topology snapshots.
pub struct Metastore {
    db: redb::Database,
    path: PathBuf,
}

impl Metastore {
    /// Opens (or creates) the store at the given file path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = redb::Database::create(&path)?;

        // Create all tables up front so read transactions never miss them.
        let tx = db.begin_write()?;
        {
            tx.open_table(SYSTEM)?;
            tx.open_table(DATABASES)?;
            tx.open_table(USERS)?;
            tx.open_table(DATA_NODES)?;
        }
        tx.commit()?;

        Ok(Self { db, path })
    }

    /// Path of the underlying store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs a read-only snapshot transaction.
    pub fn view<T>(&self, f: impl FnOnce(&MetaView) -> Result<T>) -> Result<T> {
        let tx = self.db.begin_read()?;
        f(&MetaView { tx: &tx })
    }

    /// Runs an exclusive write transaction. The transaction commits when the
    /// closure returns Ok and aborts otherwise.
    pub fn update<T>(&self, f: impl FnOnce(&MetaTx) -> Result<T>) -> Result<T> {
        let tx = self.db.begin_write()?;
        match f(&MetaTx { tx: &tx }) {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                tx.abort()?;
                Err(e)
            }
        }
    }

    /// Serializes a consistent image of the entire store.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.view(|tx| {
            let mut counters = HashMap::new();
            for key in COUNTER_KEYS {
                counters.insert(key.to_string(), tx.counter(key)?);
            }
            let image = SnapshotImage {
                id: tx.id()?,
                counters,
                data_nodes: tx.data_nodes()?,
                databases: tx.databases()?,
                users: tx.users()?,
            };
            Ok(serde_json::to_vec(&image)?)
        })
    }

    /// Streams a consistent image of the entire store to a writer.
    pub fn copy(&self, w: &mut dyn Write) -> Result<u64> {
        let data = self.snapshot()?;
        w.write_all(&data)?;
        Ok(data.len() as u64)
    }

    /// Builds a fresh store at `path` from a snapshot image, replacing any
    /// existing file.
    pub fn restore(path: impl AsRef<Path>, data: &[u8]) -> Result<Self> {
        let image: SnapshotImage = serde_json::from_slice(data)?;
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let store = Self::open(path)?;
        store.update(|tx| {
            tx.set_id(image.id)?;
            for (key, value) in &image.counters {
                tx.set_counter(key, *value)?;
            }
            for n in &image.data_nodes {
                tx.save_data_node(n)?;
            }
            for db in &image.databases {
                tx.save_database(db)?;
            }
            for u in &image.users {
                tx.save_user(u)?;
            }
            Ok(())
        })?;
        Ok(store)
    }
}

/// Self-describing byte image produced by [`Metastore::snapshot`].
#[derive(Serialize, Deserialize)]
struct SnapshotImage {
    id: u64,
    counters: HashMap<String, u64>,
    data_nodes: Vec<DataNode>,
    databases: Vec<Database>,
    users: Vec<User>,
}

/// Read-only snapshot view.
pub struct MetaView<'a> {
    tx: &'a redb::ReadTransaction,
}

impl MetaView<'_> {
    /// Returns this node's assigned id, zero when unassigned.
    pub fn id(&self) -> Result<u64> {
        self.counter(ID_KEY)
    }

    fn counter(&self, key: &str) -> Result<u64> {
        let table = self.tx.open_table(SYSTEM)?;
        let value = table.get(key)?.map(|g| g.value()).unwrap_or(0);
        Ok(value)
    }

    /// All persisted databases with their full sub-graphs.
    pub fn databases(&self) -> Result<Vec<Database>> {
        let table = self.tx.open_table(DATABASES)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// All persisted users.
    pub fn users(&self) -> Result<Vec<User>> {
        let table = self.tx.open_table(USERS)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// All persisted data nodes, ordered by id.
    pub fn data_nodes(&self) -> Result<Vec<DataNode>> {
        let table = self.tx.open_table(DATA_NODES)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let url = Url::parse(v.value())
                .map_err(|e| Error::Serialization(format!("data node url: {e}")))?;
            out.push(DataNode { id: k.value(), url });
        }
        Ok(out)
    }
}

/// Exclusive write transaction.
pub struct MetaTx<'a> {
    tx: &'a redb::WriteTransaction,
}

impl MetaTx<'_> {
    fn next_counter(&self, key: &str) -> Result<u64> {
        let mut table = self.tx.open_table(SYSTEM)?;
        let next = table.get(key)?.map(|g| g.value()).unwrap_or(0) + 1;
        table.insert(key, next)?;
        Ok(next)
    }

    fn set_counter(&self, key: &str, value: u64) -> Result<()> {
        let mut table = self.tx.open_table(SYSTEM)?;
        table.insert(key, value)?;
        Ok(())
    }

    fn counter(&self, key: &str) -> Result<u64> {
        let table = self.tx.open_table(SYSTEM)?;
        let value = table.get(key)?.map(|g| g.value()).unwrap_or(0);
        Ok(value)
    }

    /// Returns this node's assigned id, zero when unassigned.
    pub fn id(&self) -> Result<u64> {
        self.counter(ID_KEY)
    }

    /// Persists this node's assigned id.
    pub fn set_id(&self, id: u64) -> Result<()> {
        self.set_counter(ID_KEY, id)
    }

    /// Allocates the next data node id.
    pub fn next_data_node_id(&self) -> Result<u64> {
        self.next_counter(DATA_NODE_ID_KEY)
    }

    /// Allocates the next shard group id.
    pub fn next_shard_group_id(&self) -> Result<u64> {
        self.next_counter(SHARD_GROUP_ID_KEY)
    }

    /// Allocates the next shard id.
    pub fn next_shard_id(&self) -> Result<u64> {
        self.next_counter(SHARD_ID_KEY)
    }

    /// Allocates the next series id.
    pub fn next_series_id(&self) -> Result<u64> {
        self.next_counter(SERIES_ID_KEY)
    }

    /// Upserts a database and everything it owns atomically.
    pub fn save_database(&self, db: &Database) -> Result<()> {
        let data = serde_json::to_vec(db)?;
        let mut table = self.tx.open_table(DATABASES)?;
        table.insert(db.name.as_str(), data.as_slice())?;
        Ok(())
    }

    /// Deletes a database and its entire sub-graph.
    pub fn delete_database(&self, name: &str) -> Result<()> {
        let mut table = self.tx.open_table(DATABASES)?;
        table.remove(name)?;
        Ok(())
    }

    /// Upserts a user.
    pub fn save_user(&self, user: &User) -> Result<()> {
        let data = serde_json::to_vec(user)?;
        let mut table = self.tx.open_table(USERS)?;
        table.insert(user.name.as_str(), data.as_slice())?;
        Ok(())
    }

    /// Deletes a user.
    pub fn delete_user(&self, name: &str) -> Result<()> {
        let mut table = self.tx.open_table(USERS)?;
        table.remove(name)?;
        Ok(())
    }

    /// Upserts a data node.
    pub fn save_data_node(&self, node: &DataNode) -> Result<()> {
        let mut table = self.tx.open_table(DATA_NODES)?;
        table.insert(node.id, node.url.as_str())?;
        Ok(())
    }

    /// Deletes a data node.
    pub fn delete_data_node(&self, id: u64) -> Result<()> {
        let mut table = self.tx.open_table(DATA_NODES)?;
        table.remove(id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::RetentionPolicy;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Metastore {
        Metastore::open(dir.path().join("meta")).unwrap()
    }

    #[test]
    fn test_counters_are_monotonic_and_persisted() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            let a = store.update(|tx| tx.next_shard_id()).unwrap();
            let b = store.update(|tx| tx.next_shard_id()).unwrap();
            assert_eq!((a, b), (1, 2));
        }
        // Reopen and keep counting.
        let store = open_store(&dir);
        let c = store.update(|tx| tx.next_shard_id()).unwrap();
        assert_eq!(c, 3);
    }

    #[test]
    fn test_failed_update_aborts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let result: Result<()> = store.update(|tx| {
            tx.next_data_node_id()?;
            Err(Error::DataNodeExists)
        });
        assert!(result.is_err());
        // The allocation was rolled back.
        let id = store.update(|tx| tx.next_data_node_id()).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_database_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut db = Database::new("metrics");
        db.policies
            .insert("raw".to_string(), RetentionPolicy::new("raw"));
        db.default_retention_policy = Some("raw".to_string());
        store.update(|tx| tx.save_database(&db)).unwrap();

        let loaded = store.view(|tx| tx.databases()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], db);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store
            .update(|tx| {
                tx.set_id(3)?;
                tx.next_series_id()?;
                tx.save_data_node(&DataNode {
                    id: 1,
                    url: Url::parse("http://node1:8086").unwrap(),
                })?;
                tx.save_user(&User {
                    name: "alice".to_string(),
                    hash: "digest".to_string(),
                    admin: true,
                })?;
                tx.save_database(&Database::new("metrics"))
            })
            .unwrap();

        let image = store.snapshot().unwrap();
        let restored = Metastore::restore(dir.path().join("meta2"), &image).unwrap();

        restored
            .view(|tx| {
                assert_eq!(tx.id()?, 3);
                assert_eq!(tx.data_nodes()?.len(), 1);
                assert_eq!(tx.users()?[0].name, "alice");
                assert_eq!(tx.databases()?[0].name, "metrics");
                Ok(())
            })
            .unwrap();

        // Counters continue from the snapshot.
        let next = restored.update(|tx| tx.next_series_id()).unwrap();
        assert_eq!(next, 2);
    }
}
