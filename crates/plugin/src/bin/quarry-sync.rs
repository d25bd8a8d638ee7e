//! quarry-sync: run the built-in demo source and print every synced record
//! as one JSON line on stdout.
//!
//! The demo plugin multiplexes one client per region and resolves a three
//! level tree: buckets → objects → object tags. Logs go to stderr.

use std::any::Any;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use quarry_core::config::load_dotenv;
use quarry_core::{
    column_fn, downcast_client, multiplex_fn, resolver_fn, Client, ClientMeta, Column, ColumnType,
    Config, ConstResolver, ParentColumnResolver, PathResolver, RawItem, Resource, Table, Value,
};
use quarry_plugin::{
    ClientFactory, Connection, Frame, NewClientOptions, Plugin, Server, SyncMessage, SyncOptions,
    TableOptions,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Sync the demo source and stream its records as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "quarry-sync", version, about)]
struct Cli {
    /// Path to a quarry.toml config file. Env vars are used when absent.
    #[arg(long, env = "QUARRY_CONFIG")]
    config: Option<String>,

    /// Override the total concurrency budget.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Override the expected table tree depth.
    #[arg(long)]
    max_depth: Option<usize>,

    /// Tables to sync (comma separated, `*` wildcards allowed).
    #[arg(long, value_delimiter = ',')]
    tables: Vec<String>,

    /// Tables to skip, together with their relations.
    #[arg(long, value_delimiter = ',')]
    skip_tables: Vec<String>,

    /// Do not pull in relations of selected tables automatically.
    #[arg(long)]
    skip_dependent_tables: bool,

    /// Derive record ids from record values instead of random uuids.
    #[arg(long)]
    deterministic_id: bool,

    /// Demo plugin spec as JSON, e.g. '{"regions":["us-east-1"],"buckets_per_region":5}'.
    #[arg(long, default_value = "{}")]
    spec: String,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

// ── Demo plugin ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DemoSpec {
    account: String,
    regions: Vec<String>,
    buckets_per_region: usize,
}

impl Default for DemoSpec {
    fn default() -> Self {
        Self {
            account: "demo".to_string(),
            regions: vec!["us-east-1".to_string(), "eu-west-1".to_string()],
            buckets_per_region: 2,
        }
    }
}

#[derive(Debug)]
struct DemoClient {
    spec: DemoSpec,
    region: Option<String>,
}

impl ClientMeta for DemoClient {
    fn id(&self) -> String {
        match &self.region {
            Some(region) => format!("{}:{}", self.spec.account, region),
            None => self.spec.account.clone(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn demo(client: &Client) -> anyhow::Result<&DemoClient> {
    downcast_client::<DemoClient>(client.as_ref()).ok_or_else(|| anyhow!("not a demo client"))
}

struct DemoFactory;

#[async_trait]
impl ClientFactory for DemoFactory {
    async fn new_client(
        &self,
        spec: &serde_json::Value,
        _options: NewClientOptions,
    ) -> anyhow::Result<Connection> {
        let spec = if spec.is_null() {
            DemoSpec::default()
        } else {
            serde_json::from_value(spec.clone())?
        };
        Ok(Connection::source(Arc::new(DemoClient { spec, region: None })))
    }
}

fn demo_tables() -> Vec<Table> {
    let tags = Table::new("demo_object_tags")
        .with_description("Tags attached to an object")
        .column(Column::new("object_key", ColumnType::String).with_resolver(ParentColumnResolver::new("key")))
        .column(Column::new("key", ColumnType::String))
        .column(Column::new("value", ColumnType::String))
        .column(Column::new("origin", ColumnType::String).with_resolver(ConstResolver::new("demo")))
        .with_resolver(resolver_fn(|_ctx, _client, _parent, tx| async move {
            tx.send_all([
                json!({"Key": "owner", "Value": "platform"}),
                json!({"Key": "tier", "Value": "standard"}),
            ])?;
            Ok::<(), anyhow::Error>(())
        }));

    let objects = Table::new("demo_bucket_objects")
        .with_description("Objects stored in a bucket")
        .column(Column::new("bucket_name", ColumnType::String).with_resolver(ParentColumnResolver::new("name")))
        .column(Column::new("key", ColumnType::String))
        .column(Column::new("size", ColumnType::Int))
        .column(Column::new("content_type", ColumnType::String).with_resolver(PathResolver::new("Meta.ContentType")))
        .relation(tags)
        .with_resolver(resolver_fn(
            |_ctx, _client, parent: Option<Arc<Resource>>, tx| async move {
                let parent = parent.ok_or_else(|| anyhow!("objects need a parent bucket"))?;
                let bucket = parent
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                for i in 0..3i64 {
                    tx.send(json!({
                        "Key": format!("{bucket}/object-{i}.json"),
                        "Size": 1024 * (i + 1),
                        "Meta": {"ContentType": "application/json"},
                    }))?;
                }
                Ok::<(), anyhow::Error>(())
            },
        ));

    let buckets = Table::new("demo_buckets")
        .with_description("Storage buckets, one client per region")
        .column(Column::new("name", ColumnType::String))
        .column(Column::new("created_at", ColumnType::Timestamp))
        .column(Column::new("region", ColumnType::String).with_resolver(column_fn(
            |_ctx, client, resource: &mut Resource, column| {
                if let Some(region) = &demo(client)?.region {
                    resource.set(&column.name, region.as_str())?;
                }
                Ok(())
            },
        )))
        .relation(objects)
        .with_multiplex(multiplex_fn(|client: &Client| match demo(client) {
            Ok(parent) => parent
                .spec
                .regions
                .iter()
                .map(|region| {
                    Arc::new(DemoClient {
                        spec: parent.spec.clone(),
                        region: Some(region.clone()),
                    }) as Client
                })
                .collect(),
            Err(_) => vec![client.clone()],
        }))
        .with_resolver(resolver_fn(|_ctx, client: Client, _parent, tx| async move {
            let demo = demo(&client)?;
            let region = demo.region.clone().unwrap_or_default();
            let items = (0..demo.spec.buckets_per_region).map(|i| {
                let mut fields = IndexMap::new();
                fields.insert("Name".to_string(), Value::from(format!("{region}-bucket-{i}")));
                fields.insert("CreatedAt".to_string(), Value::Timestamp(Utc::now()));
                RawItem::from(fields)
            });
            tx.send_all(items)?;
            Ok::<(), anyhow::Error>(())
        }));

    vec![buckets]
}

// ── main ────────────────────────────────────────────────────────────

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    if let Some(concurrency) = cli.concurrency {
        config.sync.concurrency = concurrency;
    }
    if let Some(max_depth) = cli.max_depth {
        config.sync.max_depth = max_depth;
    }
    config.validate()?;

    init_tracing(cli.json || config.logging.is_json());
    config.log_summary();

    let plugin = Plugin::new(
        "demo",
        env!("CARGO_PKG_VERSION"),
        demo_tables(),
        Arc::new(DemoFactory),
    )?
    .with_config(config.sync.clone());
    let server = Server::new(Arc::new(plugin));
    server.init(cli.spec.as_bytes(), false).await?;
    info!(plugin = %server.name(), version = %server.version(), "plugin ready");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling sync");
                cancel.cancel();
            }
        });
    }

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(1024);
    let printer = tokio::spawn(async move {
        let mut records = 0u64;
        while let Some(bytes) = frame_rx.recv().await {
            match Frame::from_bytes(&bytes).and_then(|f| f.decode_sync()) {
                Ok(SyncMessage::MigrateTable(schema)) => {
                    info!(table = %schema.name, columns = schema.columns.len(), "migrate table");
                }
                Ok(SyncMessage::Insert(record)) => {
                    records += 1;
                    println!("{}", json!({"table": record.table, "values": record.to_json()}));
                }
                Err(e) => error!(error = %e, "failed to decode frame"),
            }
        }
        records
    });

    let options = SyncOptions {
        selection: TableOptions {
            tables: cli.tables,
            skip_tables: cli.skip_tables,
        },
        skip_dependent_tables: cli.skip_dependent_tables,
        deterministic_id: cli.deterministic_id,
    };
    let result = server.sync(cancel, &options, &frame_tx).await;
    drop(frame_tx);
    let printed = printer.await?;
    let summary = result?;

    info!(
        sync_id = %summary.sync_id,
        records = printed,
        resources = summary.metrics.totals.resources,
        errors = summary.metrics.totals.errors,
        panics = summary.metrics.totals.panics,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        cancelled = summary.cancelled,
        "sync complete"
    );
    server.close().await?;
    Ok(())
}
