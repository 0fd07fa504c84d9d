//! End-to-end tests for cluster coordination and the write path
//!
//! Each test drives one or more servers with the deterministic in-memory
//! broker so applies happen exactly the way they would against a real log.

use chrono::{TimeZone, Utc};
use meridian::broker::{BrokerClient, LocalBroker, MessageType, BROADCAST_TOPIC_ID};
use meridian::meta::{FieldValue, Point, RetentionPolicy};
use meridian::server::{Server, ServerConfig};
use meridian::Error;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

fn test_config() -> ServerConfig {
    ServerConfig {
        bcrypt_cost: 4,
        sync_timeout: Duration::from_secs(5),
    }
}

/// Opens a server on its own data directory and wires it to the broker as
/// the given replica, subscribed to the broadcast topic.
async fn open_node(broker: &Arc<LocalBroker>, dir: &TempDir, replica_id: u64) -> Server {
    let server = Server::new(test_config());
    server
        .open(dir.path().join(format!("node{replica_id}")))
        .unwrap();
    broker.create_replica(replica_id).await.unwrap();
    broker
        .subscribe(replica_id, BROADCAST_TOPIC_ID)
        .await
        .unwrap();
    let delivery = broker.take_delivery(replica_id).unwrap();
    server.set_client(broker.clone(), delivery).unwrap();
    server
}

fn node_url(port: u16) -> Url {
    Url::parse(&format!("http://localhost:{port}")).unwrap()
}

fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn values(pairs: &[(&str, f64)]) -> HashMap<String, FieldValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), FieldValue::Number(*v)))
        .collect()
}

/// Creates `metrics` with a default weekly policy `raw` at the given
/// replication factor.
async fn create_metrics_database(server: &Server, replica_n: u32) {
    server.create_database("metrics").await.unwrap();
    let mut rp = RetentionPolicy::new("raw");
    rp.duration = Duration::from_secs(7 * 24 * 3600);
    rp.replica_n = replica_n;
    server.create_retention_policy("metrics", &rp).await.unwrap();
    server
        .set_default_retention_policy("metrics", "raw")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_single_node_write_read_round_trip() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();

    create_metrics_database(&server, 1).await;

    let timestamp = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
    let point = Point {
        name: "cpu".to_string(),
        tags: tags(&[("host", "a")]),
        timestamp,
        values: values(&[("value", 1.0)]),
    };
    let index = server.write_series("metrics", None, point).await.unwrap();
    assert!(index > 0);
    server.sync(index).await.unwrap();

    // One weekly group starting on the Monday boundary, with a single shard.
    let groups = server.shard_groups("metrics").unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(
        groups[0].start_time,
        Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap()
    );
    assert_eq!(
        groups[0].end_time,
        Utc.with_ymd_and_hms(2023, 1, 9, 0, 0, 0).unwrap()
    );
    assert_eq!(groups[0].shards.len(), 1);

    // The first write promoted `value` to field id 1.
    let measurement = server.measurement("metrics", "cpu").unwrap();
    let field = measurement.field_by_name("value").unwrap();
    assert_eq!(field.id, 1);

    let read = server
        .read_series("metrics", None, "cpu", &tags(&[("host", "a")]), timestamp)
        .unwrap()
        .unwrap();
    assert_eq!(read, values(&[("value", 1.0)]));
}

#[tokio::test]
async fn test_two_nodes_full_replication() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();
    server.create_data_node(&node_url(8087)).await.unwrap();

    create_metrics_database(&server, 2).await;

    let timestamp = Utc.with_ymd_and_hms(2023, 3, 6, 12, 0, 0).unwrap();
    server
        .create_shard_group_if_not_exists("metrics", "raw", timestamp)
        .await
        .unwrap();

    // Two nodes at replication factor two collapse to one shard holding both.
    let groups = server.shard_groups("metrics").unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].shards.len(), 1);
    let mut ids = groups[0].shards[0].data_node_ids.clone();
    ids.sort();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_replica_clamping_and_coercion() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();

    server.create_database("metrics").await.unwrap();

    // replica_n = 0 is coerced to 1.
    let mut zero = RetentionPolicy::new("zero");
    zero.replica_n = 0;
    server.create_retention_policy("metrics", &zero).await.unwrap();
    let ts = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
    server
        .create_shard_group_if_not_exists("metrics", "zero", ts)
        .await
        .unwrap();
    let group = server
        .shard_group_by_timestamp("metrics", "zero", ts)
        .unwrap()
        .unwrap();
    assert_eq!(group.shards.len(), 1);
    assert_eq!(group.shards[0].data_node_ids, vec![1]);

    // replica_n above the node count is clamped to the node count.
    let mut wide = RetentionPolicy::new("wide");
    wide.replica_n = 5;
    server.create_retention_policy("metrics", &wide).await.unwrap();
    server
        .create_shard_group_if_not_exists("metrics", "wide", ts)
        .await
        .unwrap();
    let group = server
        .shard_group_by_timestamp("metrics", "wide", ts)
        .unwrap()
        .unwrap();
    assert_eq!(group.shards.len(), 1);
    assert_eq!(group.shards[0].data_node_ids, vec![1]);
}

#[tokio::test]
async fn test_shard_group_requires_data_nodes() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;

    // No initialize: the cluster has no data nodes yet.
    create_metrics_database(&server, 1).await;
    let err = server
        .create_shard_group_if_not_exists(
            "metrics",
            "raw",
            Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DataNodeNotFound));
}

#[tokio::test]
async fn test_shard_group_creation_is_idempotent() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();
    create_metrics_database(&server, 1).await;

    let ts = Utc.with_ymd_and_hms(2023, 1, 3, 8, 0, 0).unwrap();
    server
        .create_shard_group_if_not_exists("metrics", "raw", ts)
        .await
        .unwrap();
    server
        .create_shard_group_if_not_exists("metrics", "raw", ts)
        .await
        .unwrap();

    assert_eq!(server.shard_groups("metrics").unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_values_write_is_ignored() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();
    create_metrics_database(&server, 1).await;

    let point = Point {
        name: "cpu".to_string(),
        tags: tags(&[("host", "a")]),
        timestamp: Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
        values: HashMap::new(),
    };
    let index = server.write_series("metrics", None, point).await.unwrap();
    assert_eq!(index, 0);
}

#[tokio::test]
async fn test_write_promotes_unknown_fields_to_raw() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();
    create_metrics_database(&server, 1).await;

    let ts = |secs: u32| Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, secs).unwrap();
    let write = |values_map: HashMap<String, FieldValue>, secs: u32| {
        let server = server.clone();
        let timestamp = ts(secs);
        async move {
            let point = Point {
                name: "cpu".to_string(),
                tags: tags(&[("host", "a")]),
                timestamp,
                values: values_map,
            };
            let index = server.write_series("metrics", None, point).await.unwrap();
            server.sync(index).await.unwrap();
        }
    };

    // Seed the series and the `value` field.
    write(values(&[("value", 1.0)]), 0).await;
    let shard_id = server.shard_groups("metrics").unwrap()[0].shards[0].id;

    // Watch the shard topic to observe the chosen encodings.
    broker.create_replica(99).await.unwrap();
    broker.subscribe(99, shard_id).await.unwrap();
    let mut shard_rx = broker.take_delivery(99).unwrap();

    // All fields known: raw encoding.
    write(values(&[("value", 2.0)]), 1).await;
    assert_eq!(
        shard_rx.recv().await.unwrap().message_type,
        MessageType::WriteRawSeries
    );

    // A new field name falls back to the non-raw form and promotes the field.
    write(values(&[("value", 3.0), ("load", 0.5)]), 2).await;
    assert_eq!(
        shard_rx.recv().await.unwrap().message_type,
        MessageType::WriteSeries
    );
    let measurement = server.measurement("metrics", "cpu").unwrap();
    assert!(measurement.field_by_name("load").is_some());

    // Subsequent writes of the promoted field go raw again.
    write(values(&[("load", 0.7)]), 3).await;
    assert_eq!(
        shard_rx.recv().await.unwrap().message_type,
        MessageType::WriteRawSeries
    );

    // The non-raw write is readable after apply.
    let read = server
        .read_series("metrics", None, "cpu", &tags(&[("host", "a")]), ts(2))
        .unwrap()
        .unwrap();
    assert_eq!(read, values(&[("value", 3.0), ("load", 0.5)]));
}

#[tokio::test]
async fn test_series_ids_are_stable_per_tag_set() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();
    create_metrics_database(&server, 1).await;

    let a = server
        .create_series_if_not_exists("metrics", "cpu", &tags(&[("host", "a")]))
        .await
        .unwrap();
    let b = server
        .create_series_if_not_exists("metrics", "cpu", &tags(&[("host", "b")]))
        .await
        .unwrap();
    let a_again = server
        .create_series_if_not_exists("metrics", "cpu", &tags(&[("host", "a")]))
        .await
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(a, a_again);
}

#[tokio::test]
async fn test_retention_policy_rename_round_trip() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();
    create_metrics_database(&server, 1).await;

    let before: Vec<String> = server
        .retention_policies("metrics")
        .unwrap()
        .into_iter()
        .map(|rp| rp.name)
        .collect();

    server
        .update_retention_policy("metrics", "raw", "cooked")
        .await
        .unwrap();
    assert!(server.retention_policy("metrics", "raw").unwrap().is_none());
    assert!(server.retention_policy("metrics", "cooked").unwrap().is_some());
    // The default follows the rename.
    assert_eq!(
        server.default_retention_policy("metrics").unwrap().unwrap().name,
        "cooked"
    );

    server
        .update_retention_policy("metrics", "cooked", "raw")
        .await
        .unwrap();
    let after: Vec<String> = server
        .retention_policies("metrics")
        .unwrap()
        .into_iter()
        .map(|rp| rp.name)
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_user_lifecycle_and_authentication() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();

    server.create_user("alice", "p@ss", false).await.unwrap();
    assert!(server.authenticate("alice", "p@ss").is_ok());
    assert!(matches!(
        server.authenticate("alice", "bad"),
        Err(Error::InvalidCredentials)
    ));
    assert!(matches!(
        server.authenticate("nobody", "p@ss"),
        Err(Error::UserNotFound)
    ));
    assert!(!server.admin_user_exists());

    let err = server.create_user("alice", "other", false).await.unwrap_err();
    assert!(matches!(err, Error::UserExists));

    server.update_user("alice", "n3w").await.unwrap();
    assert!(server.authenticate("alice", "n3w").is_ok());
    assert!(matches!(
        server.authenticate("alice", "p@ss"),
        Err(Error::InvalidCredentials)
    ));

    server.delete_user("alice").await.unwrap();
    assert!(server.user("alice").is_none());
    let err = server.delete_user("alice").await.unwrap_err();
    assert!(matches!(err, Error::UserNotFound));
}

#[tokio::test]
async fn test_replicas_converge_on_identical_topology() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server_a = open_node(&broker, &dir, 1).await;
    // A pure follower: applies the same broadcast stream, owns no shards.
    let server_b = open_node(&broker, &dir, 2).await;

    server_a.initialize(&node_url(8086)).await.unwrap();
    server_a.create_data_node(&node_url(8087)).await.unwrap();
    server_a.create_data_node(&node_url(8088)).await.unwrap();

    create_metrics_database(&server_a, 2).await;
    server_a
        .create_shard_group_if_not_exists(
            "metrics",
            "raw",
            Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap();
    server_a.create_user("root", "secret", true).await.unwrap();

    // Wait until the follower applied the full stream.
    server_b.sync(broker.index()).await.unwrap();

    assert_eq!(server_a.data_nodes(), server_b.data_nodes());
    assert_eq!(server_a.databases(), server_b.databases());
    let groups_a = server_a.shard_groups("metrics").unwrap();
    let groups_b = server_b.shard_groups("metrics").unwrap();
    assert_eq!(groups_a, groups_b);

    // Three nodes at replication factor two: one shard, two replicas,
    // placement reproducible from the log index.
    assert_eq!(groups_a.len(), 1);
    assert_eq!(groups_a[0].shards.len(), 1);
    assert_eq!(groups_a[0].shards[0].data_node_ids.len(), 2);
}

#[tokio::test]
async fn test_join_assigns_id_and_copies_metastore() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server_a = open_node(&broker, &dir, 1).await;
    server_a.initialize(&node_url(8086)).await.unwrap();
    server_a.create_database("metrics").await.unwrap();
    server_a.create_user("root", "secret", true).await.unwrap();

    // Serve the admin endpoints for the joining node.
    let router = meridian::api::build_admin_router(Arc::new(server_a.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let server_b = Server::new(test_config());
    server_b.open(dir.path().join("node2")).unwrap();
    let peer = Url::parse(&format!("http://{addr}")).unwrap();
    server_b.join(&node_url(8087), &peer).await.unwrap();

    assert_eq!(server_b.id(), 2);
    assert!(server_b.database_exists("metrics"));
    assert!(server_b.user("root").is_some());
    assert_eq!(server_a.data_nodes().len(), 2);

    // The snapshot also survives a restart of the joined node.
    server_b.close().unwrap();
    let reopened = Server::new(test_config());
    reopened.open(dir.path().join("node2")).unwrap();
    assert_eq!(reopened.id(), 2);
    assert!(reopened.database_exists("metrics"));
}

#[tokio::test]
async fn test_join_rejected_without_peer() {
    let dir = TempDir::new().unwrap();
    let server = Server::new(test_config());
    server.open(dir.path().join("node1")).unwrap();

    // A peer that answers but not with 201 surfaces as a join failure.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let router = axum::Router::new();
        axum::serve(listener, router).await.unwrap();
    });

    let peer = Url::parse(&format!("http://{addr}")).unwrap();
    let err = server.join(&node_url(8087), &peer).await.unwrap_err();
    assert!(matches!(err, Error::UnableToJoin));
}

#[tokio::test]
async fn test_delete_database_cascades() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();
    create_metrics_database(&server, 1).await;

    server.delete_database("metrics").await.unwrap();
    assert!(!server.database_exists("metrics"));
    let err = server.delete_database("metrics").await.unwrap_err();
    assert!(matches!(err, Error::DatabaseNotFound));

    // Recreating starts from a clean slate.
    server.create_database("metrics").await.unwrap();
    assert!(server.retention_policies("metrics").unwrap().is_empty());
}

#[tokio::test]
async fn test_data_node_url_conflicts() {
    let broker = Arc::new(LocalBroker::new());
    let dir = TempDir::new().unwrap();
    let server = open_node(&broker, &dir, 1).await;
    server.initialize(&node_url(8086)).await.unwrap();

    let err = server.create_data_node(&node_url(8086)).await.unwrap_err();
    assert!(matches!(err, Error::DataNodeExists));

    server.create_data_node(&node_url(8087)).await.unwrap();
    server.delete_data_node(2).await.unwrap();
    let err = server.delete_data_node(2).await.unwrap_err();
    assert!(matches!(err, Error::DataNodeNotFound));
}
