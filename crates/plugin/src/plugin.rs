use std::sync::Arc;

use async_trait::async_trait;
use quarry_core::{validate_unique_names, Client, Record, Resource, SyncConfig, SyncContext, Table, Value};
use quarry_scheduler::{CrashReporter, Scheduler, SyncSummary, TracingReporter};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::destination::DestinationClient;
use crate::error::{PluginError, Result};
use crate::message::{
    record_id, schemas, SyncMessage, TableSchema, WriteMessage, ID_COLUMN, SOURCE_NAME_COLUMN,
    SYNC_TIME_COLUMN,
};
use crate::selection::{select_tables, SyncOptions, TableOptions};

/// Buffer between the scheduler and the message stream.
const RESOURCE_BUFFER: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClientOptions {
    /// Build the client without connecting anywhere (schema queries only).
    pub no_connection: bool,
}

/// What a [`ClientFactory`] hands back: the source side, the destination
/// side, or both.
#[derive(Default)]
pub struct Connection {
    pub source: Option<Client>,
    pub destination: Option<Arc<dyn DestinationClient>>,
}

impl Connection {
    pub fn source(client: Client) -> Self {
        Self {
            source: Some(client),
            destination: None,
        }
    }

    pub fn destination(destination: Arc<dyn DestinationClient>) -> Self {
        Self {
            source: None,
            destination: Some(destination),
        }
    }

    pub fn with_destination(mut self, destination: Arc<dyn DestinationClient>) -> Self {
        self.destination = Some(destination);
        self
    }
}

/// Builds the plugin's clients from the user-supplied spec.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn new_client(
        &self,
        spec: &serde_json::Value,
        options: NewClientOptions,
    ) -> anyhow::Result<Connection>;
}

/// A source and/or destination plugin: static table definitions plus the
/// client created by [`Plugin::init`].
pub struct Plugin {
    name: String,
    version: String,
    tables: Vec<Arc<Table>>,
    factory: Arc<dyn ClientFactory>,
    config: SyncConfig,
    reporter: Arc<dyn CrashReporter>,
    connection: RwLock<Option<Connection>>,
}

impl Plugin {
    /// Fails when two tables anywhere in the forest share a name.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        tables: Vec<Table>,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        let tables: Vec<Arc<Table>> = tables.into_iter().map(Arc::new).collect();
        validate_unique_names(&tables)?;
        Ok(Self {
            name: name.into(),
            version: version.into(),
            tables,
            factory,
            config: SyncConfig::default(),
            reporter: Arc::new(TracingReporter),
            connection: RwLock::new(None),
        })
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_crash_reporter(mut self, reporter: Arc<dyn CrashReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Tables selected by `options`.
    pub fn tables(&self, options: &TableOptions) -> Result<Vec<Arc<Table>>> {
        Ok(select_tables(&self.tables, options, false)?)
    }

    pub async fn init(&self, spec: &serde_json::Value, options: NewClientOptions) -> Result<()> {
        let connection = self
            .factory
            .new_client(spec, options)
            .await
            .map_err(PluginError::Client)?;
        info!(
            plugin = %self.name,
            source = connection.source.is_some(),
            destination = connection.destination.is_some(),
            no_connection = options.no_connection,
            "plugin initialized"
        );
        *self.connection.write().await = Some(connection);
        Ok(())
    }

    /// Sync the selected tables, sending a `MigrateTable` for each of them
    /// followed by one `Insert` per resolved resource. Every record is
    /// stamped with its id, the source name and the sync time.
    pub async fn sync(
        &self,
        cancel: CancellationToken,
        options: &SyncOptions,
        tx: mpsc::Sender<SyncMessage>,
    ) -> Result<SyncSummary> {
        let client = self.source().await?;
        let tables = select_tables(&self.tables, &options.selection, options.skip_dependent_tables)?;

        for schema in schemas(&tables) {
            tx.send(SyncMessage::MigrateTable(schema))
                .await
                .map_err(|_| PluginError::Transport("sync receiver closed".to_string()))?;
        }

        // Child token: a vanished receiver stops this run without touching
        // the caller's token.
        let ctx = SyncContext::new(cancel.child_token());
        let scheduler = Scheduler::new(self.config.clone()).with_crash_reporter(self.reporter.clone());
        let (resource_tx, mut resource_rx) = mpsc::channel::<Arc<Resource>>(RESOURCE_BUFFER);

        let source_name = Value::from(self.name.as_str());
        let sync_time = Value::Timestamp(ctx.sync_time);
        let stop = ctx.cancel.clone();
        let deterministic_id = options.deterministic_id;
        let forward = async move {
            let mut receiver_gone = false;
            while let Some(resource) = resource_rx.recv().await {
                if receiver_gone {
                    continue;
                }
                let mut record: Record = resource.to_record();
                let id = record_id(&record, deterministic_id);
                record.values.insert(ID_COLUMN.to_string(), Value::from(id.to_string()));
                record.values.insert(SOURCE_NAME_COLUMN.to_string(), source_name.clone());
                record.values.insert(SYNC_TIME_COLUMN.to_string(), sync_time.clone());
                if tx.send(SyncMessage::Insert(record)).await.is_err() {
                    warn!("sync receiver closed, stopping sync");
                    receiver_gone = true;
                    stop.cancel();
                }
            }
            receiver_gone
        };

        let (summary, receiver_gone) = tokio::join!(
            scheduler.sync_with_context(ctx, client, &tables, resource_tx),
            forward
        );
        if receiver_gone {
            return Err(PluginError::Transport("sync receiver closed".to_string()));
        }
        Ok(summary)
    }

    /// Stream the stored rows of `table` from the destination.
    pub async fn read(&self, table: &TableSchema, tx: mpsc::Sender<Record>) -> Result<()> {
        let destination = self.destination().await?;
        destination.read(table, tx).await.map_err(PluginError::Client)
    }

    pub async fn write(&self, cancel: CancellationToken, rx: mpsc::Receiver<WriteMessage>) -> Result<()> {
        let destination = self.destination().await?;
        destination.write(cancel, rx).await.map_err(PluginError::Client)
    }

    /// Write a fixed list of messages.
    pub async fn write_all(&self, cancel: CancellationToken, messages: Vec<WriteMessage>) -> Result<()> {
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for msg in messages {
            // Capacity covers every message, so this never waits.
            tx.send(msg)
                .await
                .map_err(|_| PluginError::Transport("write channel closed".to_string()))?;
        }
        drop(tx);
        self.write(cancel, rx).await
    }

    /// Close the destination (if any) and forget the client.
    pub async fn close(&self) -> Result<()> {
        let connection = self
            .connection
            .write()
            .await
            .take()
            .ok_or(PluginError::NotInitialized)?;
        if let Some(destination) = connection.destination {
            destination.close().await.map_err(PluginError::Client)?;
        }
        info!(plugin = %self.name, "plugin closed");
        Ok(())
    }

    async fn source(&self) -> Result<Client> {
        match self.connection.read().await.as_ref() {
            None => Err(PluginError::NotInitialized),
            Some(c) => c.source.clone().ok_or(PluginError::Unsupported("sync")),
        }
    }

    async fn destination(&self) -> Result<Arc<dyn DestinationClient>> {
        match self.connection.read().await.as_ref() {
            None => Err(PluginError::NotInitialized),
            Some(c) => c
                .destination
                .clone()
                .ok_or(PluginError::Unsupported("write")),
        }
    }
}
