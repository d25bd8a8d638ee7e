use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};
use crate::table::Table;
use crate::value::{RawItem, Value};

/// One row of a table: the raw item a resolver produced plus the column
/// values resolved from it.
///
/// A resource is mutable only while it is being resolved. Once the scheduler
/// emits it, it lives behind an `Arc` and is read-only.
#[derive(Debug)]
pub struct Resource {
    table: Arc<Table>,
    parent: Option<Weak<Resource>>,
    item: RawItem,
    data: IndexMap<String, Value>,
}

impl Resource {
    pub fn new(table: Arc<Table>, parent: Option<&Arc<Resource>>, item: RawItem) -> Self {
        Self {
            table,
            parent: parent.map(Arc::downgrade),
            item,
            data: IndexMap::new(),
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    /// The parent resource, if it is still alive.
    pub fn parent(&self) -> Option<Arc<Resource>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn item(&self) -> &RawItem {
        &self.item
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    /// Assign a column value. The column must exist on the table.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        if self.table.column_by_name(column).is_none() {
            return Err(QuarryError::ColumnNotFound {
                table: self.table.name.clone(),
                column: column.to_string(),
            });
        }
        self.data.insert(column.to_string(), value.into());
        Ok(())
    }

    pub fn data(&self) -> &IndexMap<String, Value> {
        &self.data
    }

    /// Snapshot of the resolved values in column order, with `Null` for
    /// columns that were never set.
    pub fn to_record(&self) -> Record {
        let values = self
            .table
            .columns
            .iter()
            .map(|c| {
                let v = self.data.get(&c.name).cloned().unwrap_or(Value::Null);
                (c.name.clone(), v)
            })
            .collect();
        Record {
            table: self.table.name.clone(),
            values,
        }
    }
}

/// A resolved row detached from its table definition; what travels to
/// destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub table: String,
    pub values: IndexMap<String, Value>,
}

impl Record {
    /// Plain JSON object of the values, without variant tags.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}
