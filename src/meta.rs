//! In-memory topology model
//!
//! Entities owned by the server: data nodes, databases, retention policies,
//! shard groups, shards, users, measurements and series. Databases own their
//! policies and measurements; shard groups own their shards; shards reference
//! data nodes by id only.

use crate::auth;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use url::Url;

/// Name of a database's default retention policy.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "default";

/// Default number of replicas data is written to.
pub const DEFAULT_REPLICA_N: u32 = 1;

/// Default number of partitions a shard is split into.
pub const DEFAULT_SPLIT_N: u32 = 1;

/// Default time window held by one shard group.
pub const DEFAULT_SHARD_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A data node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    /// Cluster-unique id, assigned monotonically from the metastore.
    pub id: u64,
    /// Address the node is reachable at. Unique across the cluster.
    pub url: Url,
}

/// A user account on the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// bcrypt digest of the user's password.
    pub hash: String,
    #[serde(default)]
    pub admin: bool,
}

impl User {
    /// Returns Ok if the password matches the user's stored hash.
    pub fn authenticate(&self, password: &str) -> Result<()> {
        if auth::verify_password(password, &self.hash)? {
            Ok(())
        } else {
            Err(Error::InvalidCredentials)
        }
    }
}

/// Scalar value carried by a point write.
///
/// The wire format keeps a reserved type byte per field so more variants can
/// be added without changing the layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
}

/// Field data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Number,
}

/// A named scalar column within a measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Identifier assigned on first write, 1..=255.
    pub id: u8,
    pub name: String,
    pub field_type: FieldType,
}

/// A unique (measurement, tag set) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    /// Stable id assigned on first sight, persisted across restarts.
    pub id: u32,
    pub tags: BTreeMap<String, String>,
}

/// Canonical fingerprint for a tag set: sorted `key=value` pairs.
pub fn tagset_key(tags: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = tags.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let mut out = String::new();
    for (k, v) in pairs {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

fn tagset_key_btree(tags: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in tags {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// A measurement and its schema: fields plus the series index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    /// Fields by id. Ids are assigned 1..=255 and never reused.
    pub fields: BTreeMap<u8, Field>,
    /// Series by canonical tag-set fingerprint.
    pub series: HashMap<String, Series>,
}

impl Measurement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns a field by id.
    pub fn field(&self, id: u8) -> Option<&Field> {
        self.fields.get(&id)
    }

    /// Returns a field by name.
    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.values().find(|f| f.name == name)
    }

    /// Returns the field for a name, creating it with the next free id when
    /// missing. Ids past 255 are an overflow.
    pub fn create_field_if_not_exists(
        &mut self,
        name: &str,
        field_type: FieldType,
    ) -> Result<u8> {
        if let Some(f) = self.field_by_name(name) {
            return Ok(f.id);
        }
        if self.fields.len() >= u8::MAX as usize {
            return Err(Error::FieldOverflow);
        }
        let id = self.fields.len() as u8 + 1;
        self.fields.insert(
            id,
            Field {
                id,
                name: name.to_string(),
                field_type,
            },
        );
        Ok(id)
    }

    /// Converts a string-keyed value map to a field-id-keyed map.
    ///
    /// Returns `None` when any key has no field yet; callers fall back to the
    /// non-raw write path which creates the missing fields on apply.
    pub fn map_values(
        &self,
        values: &HashMap<String, FieldValue>,
    ) -> Option<BTreeMap<u8, FieldValue>> {
        let mut out = BTreeMap::new();
        for (name, value) in values {
            let f = self.field_by_name(name)?;
            out.insert(f.id, *value);
        }
        Some(out)
    }

    /// Returns the series for an exact tag set.
    pub fn series_by_tags(&self, tags: &HashMap<String, String>) -> Option<&Series> {
        self.series.get(&tagset_key(tags))
    }

    fn add_series(&mut self, series: Series) {
        self.series.insert(tagset_key_btree(&series.tags), series);
    }
}

/// A shard is a storage unit replicated across the data nodes listed in
/// `data_node_ids`. Its id doubles as the broker topic id for its writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: u64,
    pub data_node_ids: Vec<u64>,
}

impl Shard {
    /// Returns true if the data node owns a replica of this shard.
    pub fn has_data_node(&self, id: u64) -> bool {
        self.data_node_ids.contains(&id)
    }
}

/// A set of shards collectively covering `[start_time, end_time)` for one
/// retention policy. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    pub id: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub shards: Vec<Shard>,
}

impl ShardGroup {
    /// Returns true if the timestamp falls within the group's window.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start_time && timestamp < self.end_time
    }

    /// Deterministic shard selection, stable per series.
    pub fn shard_by_series_id(&self, series_id: u32) -> &Shard {
        &self.shards[series_id as usize % self.shards.len()]
    }
}

/// A retention policy: shard-group window width, retention horizon, and the
/// replication factor for new shard groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    /// Both the shard-group window width and the retention horizon.
    pub duration: Duration,
    pub replica_n: u32,
    pub split_n: u32,
    pub shard_groups: Vec<ShardGroup>,
}

impl RetentionPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: DEFAULT_SHARD_DURATION,
            replica_n: DEFAULT_REPLICA_N,
            split_n: DEFAULT_SPLIT_N,
            shard_groups: Vec::new(),
        }
    }

    /// Returns the group whose window contains the timestamp.
    pub fn shard_group_by_timestamp(&self, timestamp: DateTime<Utc>) -> Option<&ShardGroup> {
        self.shard_groups.iter().find(|g| g.contains(timestamp))
    }
}

/// A database and everything it owns: retention policies, measurements, and
/// the series index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    /// Name of the default retention policy, if one is set. Always references
    /// an existing policy.
    pub default_retention_policy: Option<String>,
    pub policies: HashMap<String, RetentionPolicy>,
    pub measurements: HashMap<String, Measurement>,
    /// Sorted measurement names.
    pub names: Vec<String>,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Looks up a measurement and the series for an exact tag set.
    pub fn measurement_and_series(
        &self,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> (Option<&Measurement>, Option<&Series>) {
        match self.measurements.get(name) {
            Some(m) => (Some(m), m.series_by_tags(tags)),
            None => (None, None),
        }
    }

    /// Inserts a series into the index, creating the measurement if needed.
    pub fn add_series_to_index(&mut self, measurement: &str, series: Series) {
        let m = self
            .measurements
            .entry(measurement.to_string())
            .or_insert_with(|| Measurement::new(measurement));
        m.add_series(series);
        if let Err(pos) = self.names.binary_search(&measurement.to_string()) {
            self.names.insert(pos, measurement.to_string());
        }
    }

    /// Returns the group for a policy and timestamp.
    pub fn shard_group_by_timestamp(
        &self,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<&ShardGroup>> {
        let rp = self
            .policies
            .get(policy)
            .ok_or(Error::RetentionPolicyNotFound)?;
        Ok(rp.shard_group_by_timestamp(timestamp))
    }
}

/// A single point write: measurement name, tag set, timestamp and values.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<String, FieldValue>,
}

// Seconds from 0001-01-01T00:00:00Z to the Unix epoch. Truncation counts
// whole multiples of the window from the year-1 zero point, so weekly
// windows align to Monday.
const EPOCH_OFFSET_SECS: i128 = 62_135_596_800;

/// Rounds a timestamp down to the start of its window.
pub fn truncate_timestamp(timestamp: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_ns = window.as_nanos() as i128;
    if window_ns == 0 {
        return timestamp;
    }
    let ts_ns = timestamp.timestamp_nanos_opt().unwrap_or(0);
    let since_zero = ts_ns as i128 + EPOCH_OFFSET_SECS * 1_000_000_000;
    let rem = since_zero.rem_euclid(window_ns);
    DateTime::from_timestamp_nanos(ts_ns - rem as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_tagset_key_is_sorted() {
        let a = tagset_key(&tags(&[("host", "a"), ("region", "us")]));
        let b = tagset_key(&tags(&[("region", "us"), ("host", "a")]));
        assert_eq!(a, b);
        assert_eq!(a, "host=a,region=us");
    }

    #[test]
    fn test_truncate_weekly_window_starts_monday() {
        // 2023-01-02 is a Monday.
        let ts = Utc.with_ymd_and_hms(2023, 1, 4, 13, 30, 0).unwrap();
        let start = truncate_timestamp(ts, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap());

        // A timestamp on the boundary is its own window start.
        let boundary = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
        let start = truncate_timestamp(boundary, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(start, boundary);
    }

    #[test]
    fn test_field_ids_are_assigned_sequentially() {
        let mut m = Measurement::new("cpu");
        let a = m.create_field_if_not_exists("value", FieldType::Number).unwrap();
        let b = m.create_field_if_not_exists("load", FieldType::Number).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        // Idempotent for an existing name.
        let again = m.create_field_if_not_exists("value", FieldType::Number).unwrap();
        assert_eq!(again, 1);
    }

    #[test]
    fn test_field_overflow_past_255() {
        let mut m = Measurement::new("wide");
        for i in 0..255 {
            m.create_field_if_not_exists(&format!("f{i}"), FieldType::Number)
                .unwrap();
        }
        let err = m
            .create_field_if_not_exists("one_too_many", FieldType::Number)
            .unwrap_err();
        assert!(matches!(err, Error::FieldOverflow));
        // Existing fields keep working.
        assert_eq!(m.field_by_name("f0").unwrap().id, 1);
    }

    #[test]
    fn test_map_values_requires_all_fields_known() {
        let mut m = Measurement::new("cpu");
        m.create_field_if_not_exists("value", FieldType::Number).unwrap();

        let known = HashMap::from([("value".to_string(), FieldValue::Number(1.0))]);
        assert!(m.map_values(&known).is_some());

        let unknown = HashMap::from([
            ("value".to_string(), FieldValue::Number(1.0)),
            ("other".to_string(), FieldValue::Number(2.0)),
        ]);
        assert!(m.map_values(&unknown).is_none());
    }

    #[test]
    fn test_shard_selection_is_stable() {
        let group = ShardGroup {
            id: 1,
            start_time: Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2023, 1, 9, 0, 0, 0).unwrap(),
            shards: vec![
                Shard { id: 10, data_node_ids: vec![1] },
                Shard { id: 11, data_node_ids: vec![2] },
                Shard { id: 12, data_node_ids: vec![3] },
            ],
        };
        for series_id in [0u32, 1, 2, 100, 101] {
            let first = group.shard_by_series_id(series_id).id;
            let second = group.shard_by_series_id(series_id).id;
            assert_eq!(first, second);
        }
        assert_eq!(group.shard_by_series_id(4).id, 11);
    }

    #[test]
    fn test_series_index_creates_measurement() {
        let mut db = Database::new("metrics");
        db.add_series_to_index(
            "cpu",
            Series { id: 1, tags: BTreeMap::from([("host".to_string(), "a".to_string())]) },
        );
        let (m, s) = db.measurement_and_series("cpu", &tags(&[("host", "a")]));
        assert!(m.is_some());
        assert_eq!(s.unwrap().id, 1);
        assert_eq!(db.names, vec!["cpu".to_string()]);

        // Unknown tag set resolves the measurement but not a series.
        let (m, s) = db.measurement_and_series("cpu", &tags(&[("host", "b")]));
        assert!(m.is_some());
        assert!(s.is_none());
    }
}
