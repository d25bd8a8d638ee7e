use std::collections::HashMap;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use indexmap::IndexMap;
use quarry_core::{Record, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::message::{TableSchema, WriteMessage, SOURCE_NAME_COLUMN, SYNC_TIME_COLUMN};

/// Write side of a plugin.
#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Apply messages until `rx` closes. The first failure ends the write.
    async fn write(
        &self,
        cancel: CancellationToken,
        rx: mpsc::Receiver<WriteMessage>,
    ) -> anyhow::Result<()>;

    /// Stream back every stored row of `table`.
    async fn read(&self, table: &TableSchema, tx: mpsc::Sender<Record>) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

// ── In-memory destination ────────────────────────────────────────────

#[derive(Debug, Default)]
struct Store {
    schemas: IndexMap<String, TableSchema>,
    rows: HashMap<String, Vec<Record>>,
}

/// Keeps everything in memory. Reference implementation used by tests and
/// the demo binary.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    store: RwLock<Store>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn schema(&self, table: &str) -> Option<TableSchema> {
        self.store.read().await.schemas.get(table).cloned()
    }

    pub async fn rows(&self, table: &str) -> Vec<Record> {
        self.store
            .read()
            .await
            .rows
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn row_count(&self) -> usize {
        self.store.read().await.rows.values().map(Vec::len).sum()
    }

    async fn apply(&self, msg: WriteMessage) -> anyhow::Result<()> {
        let mut store = self.store.write().await;
        match msg {
            WriteMessage::MigrateTable {
                table,
                migrate_force,
            } => {
                let changed = store
                    .schemas
                    .get(&table.name)
                    .is_some_and(|existing| existing.columns != table.columns);
                if changed && migrate_force {
                    info!(table = %table.name, "schema changed, dropping rows");
                    store.rows.remove(&table.name);
                }
                debug!(table = %table.name, columns = table.columns.len(), "table migrated");
                store.rows.entry(table.name.clone()).or_default();
                store.schemas.insert(table.name.clone(), table);
            }
            WriteMessage::Insert(record) => {
                let Some(schema) = store.schemas.get(&record.table) else {
                    bail!("table {} was not migrated", record.table);
                };
                if let Some(unknown) = record.values.keys().find(|k| schema.column(k).is_none()) {
                    bail!("column {unknown} does not exist in table {}", record.table);
                }
                store
                    .rows
                    .entry(record.table.clone())
                    .or_default()
                    .push(record);
            }
            WriteMessage::DeleteStale {
                table_name,
                source_name,
                sync_time,
            } => {
                let rows = store
                    .rows
                    .get_mut(&table_name)
                    .ok_or_else(|| anyhow!("table {table_name} was not migrated"))?;
                let before = rows.len();
                rows.retain(|row| {
                    let same_source =
                        row.values.get(SOURCE_NAME_COLUMN) == Some(&Value::from(source_name.as_str()));
                    let stale = match row.values.get(SYNC_TIME_COLUMN) {
                        Some(Value::Timestamp(t)) => *t < sync_time,
                        _ => false,
                    };
                    !(same_source && stale)
                });
                debug!(table = %table_name, deleted = before - rows.len(), "stale rows deleted");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationClient for MemoryDestination {
    async fn write(
        &self,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<WriteMessage>,
    ) -> anyhow::Result<()> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("write cancelled"),
                msg = rx.recv() => msg,
            };
            match msg {
                Some(msg) => self.apply(msg).await?,
                None => return Ok(()),
            }
        }
    }

    async fn read(&self, table: &TableSchema, tx: mpsc::Sender<Record>) -> anyhow::Result<()> {
        for row in self.rows(&table.name).await {
            tx.send(row)
                .await
                .map_err(|_| anyhow!("read receiver closed"))?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
