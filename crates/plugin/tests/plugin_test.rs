//! Plugin and server tests: lifecycle, selection, the framed sync/write/read
//! paths and the message size ceiling.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quarry_core::{resolver_fn, Client, ClientMeta, Column, ColumnType, SyncConfig, Table, Value};
use quarry_plugin::message::{ID_COLUMN, SOURCE_NAME_COLUMN, SYNC_TIME_COLUMN};
use quarry_plugin::{
    ClientFactory, Connection, DestinationClient, Frame, MemoryDestination, NewClientOptions,
    Plugin, PluginError, Server, SyncMessage, SyncOptions, TableOptions, WriteMessage,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct TestClient;

impl ClientMeta for TestClient {
    fn id(&self) -> String {
        "test".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out a fixed source client and/or destination.
struct StaticFactory {
    source: bool,
    destination: Option<Arc<MemoryDestination>>,
}

#[async_trait]
impl ClientFactory for StaticFactory {
    async fn new_client(
        &self,
        spec: &serde_json::Value,
        _options: NewClientOptions,
    ) -> anyhow::Result<Connection> {
        if spec.get("fail").is_some() {
            anyhow::bail!("bad credentials");
        }
        let source = Arc::new(TestClient) as Client;
        let destination = self
            .destination
            .clone()
            .map(|d| d as Arc<dyn DestinationClient>);
        Ok(match (self.source, destination) {
            (true, Some(d)) => Connection::source(source).with_destination(d),
            (true, None) => Connection::source(source),
            (false, Some(d)) => Connection::destination(d),
            (false, None) => Connection::default(),
        })
    }
}

fn items_table(name: &str, n: usize) -> Table {
    Table::new(name)
        .column(Column::new("name", ColumnType::String))
        .with_resolver(resolver_fn(move |_ctx, _client, _parent, tx| async move {
            tx.send_all((0..n).map(|i| json!({"Name": format!("{i}")})))?;
            Ok::<(), anyhow::Error>(())
        }))
}

fn source_tables() -> Vec<Table> {
    vec![
        items_table("repos", 2).relation(items_table("repo_issues", 3)),
        items_table("teams", 1),
    ]
}

fn source_plugin() -> Plugin {
    Plugin::new(
        "test-source",
        "1.2.3",
        source_tables(),
        Arc::new(StaticFactory { source: true, destination: None }),
    )
    .unwrap()
    .with_config(SyncConfig {
        concurrency: 100,
        ..SyncConfig::default()
    })
}

fn destination_plugin(dest: Arc<MemoryDestination>) -> Plugin {
    Plugin::new(
        "test-destination",
        "0.1.0",
        Vec::new(),
        Arc::new(StaticFactory {
            source: false,
            destination: Some(dest),
        }),
    )
    .unwrap()
}

async fn collect_sync(plugin: &Plugin, options: &SyncOptions) -> Vec<SyncMessage> {
    let (tx, mut rx) = mpsc::channel(8);
    let collector = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        out
    });
    plugin
        .sync(CancellationToken::new(), options, tx)
        .await
        .unwrap();
    collector.await.unwrap()
}

fn inserts_for<'a>(msgs: &'a [SyncMessage], table: &str) -> Vec<&'a quarry_core::Record> {
    msgs.iter()
        .filter_map(|m| match m {
            SyncMessage::Insert(r) if r.table == table => Some(r),
            _ => None,
        })
        .collect()
}

// ── Plugin lifecycle ─────────────────────────────────────────────────

#[test]
fn test_duplicate_table_names_are_rejected() {
    let tables = vec![items_table("repos", 1).relation(items_table("repos", 1))];
    let result = Plugin::new(
        "dup",
        "0.0.1",
        tables,
        Arc::new(StaticFactory { source: true, destination: None }),
    );
    assert!(matches!(
        result,
        Err(PluginError::Core(quarry_core::QuarryError::DuplicateTable(_)))
    ));
}

#[tokio::test]
async fn test_calls_before_init_fail() {
    let plugin = source_plugin();
    let (tx, _rx) = mpsc::channel(1);
    assert!(matches!(
        plugin.sync(CancellationToken::new(), &SyncOptions::default(), tx).await,
        Err(PluginError::NotInitialized)
    ));
    assert!(matches!(
        plugin.write_all(CancellationToken::new(), Vec::new()).await,
        Err(PluginError::NotInitialized)
    ));
    assert!(matches!(plugin.close().await, Err(PluginError::NotInitialized)));
}

#[tokio::test]
async fn test_init_surfaces_factory_errors() {
    let plugin = source_plugin();
    let err = plugin
        .init(&json!({"fail": true}), NewClientOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad credentials"));
}

#[tokio::test]
async fn test_missing_sides_are_unsupported() {
    let source = source_plugin();
    source.init(&json!({}), NewClientOptions::default()).await.unwrap();
    assert!(matches!(
        source.write_all(CancellationToken::new(), Vec::new()).await,
        Err(PluginError::Unsupported(_))
    ));

    let dest = destination_plugin(Arc::new(MemoryDestination::new()));
    dest.init(&json!({}), NewClientOptions::default()).await.unwrap();
    let (tx, _rx) = mpsc::channel(1);
    assert!(matches!(
        dest.sync(CancellationToken::new(), &SyncOptions::default(), tx).await,
        Err(PluginError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_close_forgets_the_client() {
    let plugin = source_plugin();
    plugin.init(&json!({}), NewClientOptions::default()).await.unwrap();
    plugin.close().await.unwrap();
    assert!(matches!(plugin.close().await, Err(PluginError::NotInitialized)));
}

// ── Sync ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_migrates_every_table_before_inserting() {
    let plugin = source_plugin();
    plugin.init(&json!({}), NewClientOptions::default()).await.unwrap();

    let msgs = collect_sync(&plugin, &SyncOptions::default()).await;

    let migrated: Vec<&str> = msgs
        .iter()
        .take_while(|m| matches!(m, SyncMessage::MigrateTable(_)))
        .map(|m| match m {
            SyncMessage::MigrateTable(s) => s.name.as_str(),
            SyncMessage::Insert(_) => unreachable!(),
        })
        .collect();
    assert_eq!(migrated, vec!["repos", "repo_issues", "teams"]);

    assert_eq!(inserts_for(&msgs, "repos").len(), 2);
    assert_eq!(inserts_for(&msgs, "repo_issues").len(), 6);
    assert_eq!(inserts_for(&msgs, "teams").len(), 1);

    let record = inserts_for(&msgs, "teams")[0];
    assert_eq!(record.values[SOURCE_NAME_COLUMN], Value::from("test-source"));
    assert!(matches!(record.values[SYNC_TIME_COLUMN], Value::Timestamp(_)));
    assert!(matches!(&record.values[ID_COLUMN], Value::Text(id) if uuid::Uuid::parse_str(id).is_ok()));
}

fn ids_by_name(msgs: &[SyncMessage], table: &str) -> Vec<(String, String)> {
    let mut ids: Vec<(String, String)> = inserts_for(msgs, table)
        .into_iter()
        .map(|r| {
            let text = |col: &str| match &r.values[col] {
                Value::Text(s) => s.clone(),
                other => panic!("expected text in {col}, got {other:?}"),
            };
            (text("name"), text(ID_COLUMN))
        })
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_deterministic_ids_are_stable_across_syncs() {
    let plugin = source_plugin();
    plugin.init(&json!({}), NewClientOptions::default()).await.unwrap();
    let options = SyncOptions {
        deterministic_id: true,
        ..SyncOptions::default()
    };

    let first = collect_sync(&plugin, &options).await;
    let second = collect_sync(&plugin, &options).await;

    let repos = ids_by_name(&first, "repos");
    assert_eq!(repos.len(), 2);
    assert_ne!(repos[0].1, repos[1].1);
    assert_eq!(repos, ids_by_name(&second, "repos"));
    assert_eq!(ids_by_name(&first, "teams"), ids_by_name(&second, "teams"));
}

#[tokio::test]
async fn test_random_ids_change_between_syncs() {
    let plugin = source_plugin();
    plugin.init(&json!({}), NewClientOptions::default()).await.unwrap();

    let first = collect_sync(&plugin, &SyncOptions::default()).await;
    let second = collect_sync(&plugin, &SyncOptions::default()).await;

    let (a, b) = (ids_by_name(&first, "teams"), ids_by_name(&second, "teams"));
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].0, b[0].0);
    assert_ne!(a[0].1, b[0].1);
    let id = uuid::Uuid::parse_str(&a[0].1).unwrap();
    assert_eq!(id.get_version_num(), 4);
}

#[tokio::test]
async fn test_sync_honours_table_selection() {
    let plugin = source_plugin();
    plugin.init(&json!({}), NewClientOptions::default()).await.unwrap();

    let options = SyncOptions {
        skip_dependent_tables: true,
        ..SyncOptions::tables(&["repos"])
    };
    let msgs = collect_sync(&plugin, &options).await;

    assert_eq!(inserts_for(&msgs, "repos").len(), 2);
    assert!(inserts_for(&msgs, "repo_issues").is_empty());
    assert!(inserts_for(&msgs, "teams").is_empty());

    let bad = SyncOptions::tables(&["*", "teams"]);
    let (tx, _rx) = mpsc::channel(1);
    assert!(matches!(
        plugin.sync(CancellationToken::new(), &bad, tx).await,
        Err(PluginError::Core(quarry_core::QuarryError::Selection(_)))
    ));
}

#[tokio::test]
async fn test_dropped_receiver_stops_sync() {
    let plugin = Plugin::new(
        "endless",
        "0.0.1",
        vec![Table::new("ticks")
            .column(Column::new("n", ColumnType::Int))
            .with_resolver(resolver_fn(|ctx: quarry_core::SyncContext, _client, _parent, tx| async move {
                let mut n = 0i64;
                while !ctx.is_cancelled() {
                    tx.send(json!({"N": n}))?;
                    n += 1;
                    tokio::task::yield_now().await;
                }
                Ok::<(), anyhow::Error>(())
            }))],
        Arc::new(StaticFactory { source: true, destination: None }),
    )
    .unwrap();
    plugin.init(&json!({}), NewClientOptions::default()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(4);
    let reader = tokio::spawn(async move {
        for _ in 0..10 {
            rx.recv().await;
        }
    });
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        plugin.sync(CancellationToken::new(), &SyncOptions::default(), tx),
    )
    .await
    .expect("sync must stop once the receiver is gone");
    reader.await.unwrap();

    assert!(matches!(result, Err(PluginError::Transport(_))));
}

// ── Source → destination ─────────────────────────────────────────────

#[tokio::test]
async fn test_sync_output_round_trips_through_a_destination() {
    let source = source_plugin();
    source.init(&json!({}), NewClientOptions::default()).await.unwrap();
    let msgs = collect_sync(&source, &SyncOptions::default()).await;

    let store = Arc::new(MemoryDestination::new());
    let destination = destination_plugin(store.clone());
    destination.init(&json!({}), NewClientOptions::default()).await.unwrap();

    let writes: Vec<WriteMessage> = msgs.into_iter().map(WriteMessage::from).collect();
    destination
        .write_all(CancellationToken::new(), writes)
        .await
        .unwrap();
    assert_eq!(store.rows("repo_issues").await.len(), 6);

    let schema = store.schema("repos").await.unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    destination.read(&schema, tx).await.unwrap();
    let mut read = 0;
    while rx.recv().await.is_some() {
        read += 1;
    }
    assert_eq!(read, 2);

    // A later sync makes every existing row stale.
    destination
        .write_all(
            CancellationToken::new(),
            vec![WriteMessage::DeleteStale {
                table_name: "repos".to_string(),
                source_name: "test-source".to_string(),
                sync_time: Utc::now() + chrono::Duration::seconds(1),
            }],
        )
        .await
        .unwrap();
    assert!(store.rows("repos").await.is_empty());
    assert_eq!(store.rows("teams").await.len(), 1);
}

// ── Server ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_metadata_and_tables() {
    let server = Server::new(Arc::new(source_plugin()));
    assert_eq!(server.name(), "test-source");
    assert_eq!(server.version(), "1.2.3");

    let all = server.get_tables(&TableOptions::default()).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[1].parent.as_deref(), Some("repos"));

    let skipped = server
        .get_tables(&TableOptions {
            tables: vec!["*".to_string()],
            skip_tables: vec!["repos".to_string()],
        })
        .unwrap();
    let names: Vec<&str> = skipped.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["teams"]);
}

#[tokio::test]
async fn test_server_init_rejects_malformed_spec() {
    let server = Server::new(Arc::new(source_plugin()));
    assert!(matches!(
        server.init(b"{not json", false).await,
        Err(PluginError::InvalidArgument(_))
    ));
    server.init(b"", true).await.unwrap();
}

#[tokio::test]
async fn test_server_sync_streams_frames() {
    let server = Server::new(Arc::new(source_plugin()));
    server.init(b"{}", false).await.unwrap();

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(8);
    let reader = tokio::spawn(async move {
        let mut msgs = Vec::new();
        while let Some(bytes) = rx.recv().await {
            msgs.push(Frame::from_bytes(&bytes).unwrap().decode_sync().unwrap());
        }
        msgs
    });
    let summary = server
        .sync(CancellationToken::new(), &SyncOptions::default(), &tx)
        .await
        .unwrap();
    drop(tx);
    let msgs = reader.await.unwrap();

    assert_eq!(msgs.len(), 3 + 2 + 6 + 1);
    assert_eq!(summary.metrics.totals.resources, 9);
    assert!(!summary.cancelled);
}

#[tokio::test]
async fn test_server_drops_oversize_frames() {
    let plugin = Plugin::new(
        "sizes",
        "0.0.1",
        vec![Table::new("blobs")
            .column(Column::new("body", ColumnType::String))
            .with_resolver(resolver_fn(|_ctx, _client, _parent, tx| async move {
                tx.send(json!({"Body": "small"}))?;
                tx.send(json!({"Body": "x".repeat(10_000)}))?;
                Ok::<(), anyhow::Error>(())
            }))],
        Arc::new(StaticFactory { source: true, destination: None }),
    )
    .unwrap();
    let server = Server::new(Arc::new(plugin)).with_max_msg_size(4096);
    server.init(b"{}", false).await.unwrap();

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(8);
    let reader = tokio::spawn(async move {
        let mut msgs = Vec::new();
        while let Some(bytes) = rx.recv().await {
            assert!(bytes.len() <= 4096);
            msgs.push(Frame::from_bytes(&bytes).unwrap().decode_sync().unwrap());
        }
        msgs
    });
    let summary = server
        .sync(CancellationToken::new(), &SyncOptions::default(), &tx)
        .await
        .unwrap();
    drop(tx);
    let msgs = reader.await.unwrap();

    // Both rows were resolved, only the small one made it onto the wire.
    assert_eq!(summary.metrics.totals.resources, 2);
    let inserts = inserts_for(&msgs, "blobs");
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].values["body"], Value::from("small"));
}

#[tokio::test]
async fn test_server_write_and_read_frames() {
    let store = Arc::new(MemoryDestination::new());
    let server = Server::new(Arc::new(destination_plugin(store.clone())));
    server.init(b"{}", false).await.unwrap();

    let schema = quarry_plugin::schemas(&[Arc::new(items_table("repos", 0))]).remove(0);
    let mut values = indexmap::IndexMap::new();
    values.insert("name".to_string(), Value::from("quarry"));
    let record = quarry_core::Record {
        table: "repos".to_string(),
        values,
    };

    let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
    for msg in [
        WriteMessage::MigrateTable { table: schema.clone(), migrate_force: false },
        WriteMessage::Insert(record.clone()),
    ] {
        tx.send(Frame::write(&msg).unwrap().to_bytes().unwrap()).await.unwrap();
    }
    drop(tx);
    server.write(CancellationToken::new(), rx).await.unwrap();
    assert_eq!(store.rows("repos").await, vec![record.clone()]);

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(8);
    server.read(&schema, &out_tx).await.unwrap();
    drop(out_tx);
    let frame = out_rx.recv().await.unwrap();
    assert_eq!(Frame::from_bytes(&frame).unwrap().decode_record().unwrap(), record);
    assert!(out_rx.recv().await.is_none());
}

#[tokio::test]
async fn test_server_write_rejects_undecodable_frames() {
    let store = Arc::new(MemoryDestination::new());
    let server = Server::new(Arc::new(destination_plugin(store.clone())));
    server.init(b"{}", false).await.unwrap();

    let (tx, rx) = mpsc::channel::<Vec<u8>>(2);
    tx.send(b"garbage".to_vec()).await.unwrap();
    drop(tx);

    assert!(matches!(
        server.write(CancellationToken::new(), rx).await,
        Err(PluginError::InvalidArgument(_))
    ));
}
