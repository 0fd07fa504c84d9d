//! Local per-shard point storage
//!
//! Each shard replica owns one store file holding raw encoded values keyed
//! by `(series id, timestamp)`. A node opens a store for a shard only when
//! its own id is listed in the shard's replicas.

use crate::Result;
use redb::{ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};

const POINTS: TableDefinition<(u32, i64), &[u8]> = TableDefinition::new("points");

/// Durable point store for a single shard replica.
pub struct PointStore {
    db: redb::Database,
    path: PathBuf,
}

impl PointStore {
    /// Opens (or creates) the store at the given file path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = redb::Database::create(&path)?;
        let tx = db.begin_write()?;
        {
            tx.open_table(POINTS)?;
        }
        tx.commit()?;
        Ok(Self { db, path })
    }

    /// Path of the underlying store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes raw encoded values for one series and timestamp.
    ///
    /// With `overwrite` unset, an existing point for the key is kept.
    pub fn write_series(
        &self,
        series_id: u32,
        timestamp: i64,
        data: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(POINTS)?;
            if overwrite || table.get((series_id, timestamp))?.is_none() {
                table.insert((series_id, timestamp), data)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Reads the raw encoded values for one series and timestamp.
    pub fn read_series(&self, series_id: u32, timestamp: i64) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(POINTS)?;
        Ok(table.get((series_id, timestamp))?.map(|g| g.value().to_vec()))
    }
}
