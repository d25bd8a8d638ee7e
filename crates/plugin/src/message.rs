//! Messages exchanged between a source, the framework and a destination.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quarry_core::{ColumnType, Record, Table};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Column stamped on every synced record with its row id.
pub const ID_COLUMN: &str = "_quarry_id";
/// Column stamped on every synced record with the source plugin name.
pub const SOURCE_NAME_COLUMN: &str = "_quarry_source_name";
/// Column stamped on every synced record with the sync start time.
pub const SYNC_TIME_COLUMN: &str = "_quarry_sync_time";

// ── Schemas ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub description: String,
}

/// Serializable description of one table, detached from its resolvers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parent: Option<String>,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Schema of `table` including the sync bookkeeping columns.
    pub fn from_table(table: &Table, parent: Option<&str>) -> Self {
        let mut columns: Vec<ColumnSchema> = table
            .columns
            .iter()
            .map(|c| ColumnSchema {
                name: c.name.clone(),
                column_type: c.column_type,
                description: c.description.clone(),
            })
            .collect();
        columns.push(ColumnSchema {
            name: ID_COLUMN.to_string(),
            column_type: ColumnType::String,
            description: "Unique id of the row".to_string(),
        });
        columns.push(ColumnSchema {
            name: SOURCE_NAME_COLUMN.to_string(),
            column_type: ColumnType::String,
            description: "Name of the source plugin that produced the row".to_string(),
        });
        columns.push(ColumnSchema {
            name: SYNC_TIME_COLUMN.to_string(),
            column_type: ColumnType::Timestamp,
            description: "Start time of the sync that produced the row".to_string(),
        });
        Self {
            name: table.name.clone(),
            description: table.description.clone(),
            parent: parent.map(str::to_string),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Row id for `record`. A deterministic id is a v5 uuid over the table name
/// and the resolved values, so an unchanged row keeps its id across syncs.
/// Call it before any bookkeeping column is stamped.
pub fn record_id(record: &Record, deterministic: bool) -> Uuid {
    if !deterministic {
        return Uuid::new_v4();
    }
    // serde_json objects serialize with sorted keys.
    let mut key = record.table.clone().into_bytes();
    key.push(0);
    key.extend_from_slice(record.to_json().to_string().as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &key)
}

/// Schemas for every table in the forest, parents before their relations.
pub fn schemas(tables: &[Arc<Table>]) -> Vec<TableSchema> {
    fn walk(tables: &[Arc<Table>], parent: Option<&str>, out: &mut Vec<TableSchema>) {
        for table in tables {
            out.push(TableSchema::from_table(table, parent));
            walk(&table.relations, Some(&table.name), out);
        }
    }
    let mut out = Vec::new();
    walk(tables, None, &mut out);
    out
}

// ── Messages ─────────────────────────────────────────────────────────

/// Produced by a source sync: every selected table is announced before any
/// of its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    MigrateTable(TableSchema),
    Insert(Record),
}

/// Consumed by a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteMessage {
    MigrateTable {
        table: TableSchema,
        migrate_force: bool,
    },
    Insert(Record),
    /// Remove rows of `table_name` written by `source_name` before `sync_time`.
    DeleteStale {
        table_name: String,
        source_name: String,
        sync_time: DateTime<Utc>,
    },
}

impl From<SyncMessage> for WriteMessage {
    fn from(msg: SyncMessage) -> Self {
        match msg {
            SyncMessage::MigrateTable(table) => WriteMessage::MigrateTable {
                table,
                migrate_force: false,
            },
            SyncMessage::Insert(record) => WriteMessage::Insert(record),
        }
    }
}
