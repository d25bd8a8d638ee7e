//! Stock column resolvers for the common cases the name-based default
//! lookup cannot express.

use async_trait::async_trait;

use crate::client::Client;
use crate::context::SyncContext;
use crate::resource::Resource;
use crate::table::{Column, ColumnResolver};
use crate::value::Value;

/// Read the column from an explicit (dotted) path on the raw item.
pub struct PathResolver {
    path: String,
}

impl PathResolver {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ColumnResolver for PathResolver {
    async fn resolve(
        &self,
        _ctx: &SyncContext,
        _client: &Client,
        resource: &mut Resource,
        column: &Column,
    ) -> anyhow::Result<()> {
        if let Some(v) = resource.item().field(&self.path) {
            resource.set(&column.name, v)?;
        }
        Ok(())
    }
}

/// Copy a column from the parent resource, e.g. a foreign key.
pub struct ParentColumnResolver {
    parent_column: String,
}

impl ParentColumnResolver {
    pub fn new(parent_column: impl Into<String>) -> Self {
        Self {
            parent_column: parent_column.into(),
        }
    }
}

#[async_trait]
impl ColumnResolver for ParentColumnResolver {
    async fn resolve(
        &self,
        _ctx: &SyncContext,
        _client: &Client,
        resource: &mut Resource,
        column: &Column,
    ) -> anyhow::Result<()> {
        let parent = resource
            .parent()
            .ok_or_else(|| anyhow::anyhow!("column '{}' needs a parent resource", column.name))?;
        let value = parent
            .get(&self.parent_column)
            .cloned()
            .unwrap_or(Value::Null);
        resource.set(&column.name, value)?;
        Ok(())
    }
}

/// Always assign the same value.
pub struct ConstResolver {
    value: Value,
}

impl ConstResolver {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl ColumnResolver for ConstResolver {
    async fn resolve(
        &self,
        _ctx: &SyncContext,
        _client: &Client,
        resource: &mut Resource,
        column: &Column,
    ) -> anyhow::Result<()> {
        resource.set(&column.name, self.value.clone())?;
        Ok(())
    }
}
