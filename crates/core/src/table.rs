//! Table and column definitions plus the callback traits resolvers implement.
//!
//! A source plugin describes its data as a tree of [`Table`]s. Each table has
//! a [`TableResolver`] that produces raw items, optional hooks around each
//! item, and columns that are filled in either by a [`ColumnResolver`] or by
//! the default name-based lookup.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::client::Client;
use crate::context::SyncContext;
use crate::error::{QuarryError, Result};
use crate::resource::Resource;
use crate::value::RawItem;

// ── Callback traits ──────────────────────────────────────────────────

/// Produces the raw items of a table. Invoked once per client for root
/// tables and once per parent resource for relations.
///
/// Items are pushed through `tx`; returning ends the stream.
#[async_trait]
pub trait TableResolver: Send + Sync {
    async fn resolve(
        &self,
        ctx: &SyncContext,
        client: &Client,
        parent: Option<&Arc<Resource>>,
        tx: ItemSender,
    ) -> anyhow::Result<()>;
}

/// Splits one client into several (per account, per region, ...).
pub trait Multiplexer: Send + Sync {
    fn multiplex(&self, client: &Client) -> Vec<Client>;
}

/// Runs before or after the columns of a resource are resolved.
#[async_trait]
pub trait ResourceHook: Send + Sync {
    async fn call(
        &self,
        ctx: &SyncContext,
        client: &Client,
        resource: &mut Resource,
    ) -> anyhow::Result<()>;
}

/// Resolves a single column of a resource.
#[async_trait]
pub trait ColumnResolver: Send + Sync {
    async fn resolve(
        &self,
        ctx: &SyncContext,
        client: &Client,
        resource: &mut Resource,
        column: &Column,
    ) -> anyhow::Result<()>;
}

// ── Item channel ─────────────────────────────────────────────────────

/// Sending half of the stream a table resolver writes its items into.
#[derive(Debug, Clone)]
pub struct ItemSender {
    tx: mpsc::UnboundedSender<Vec<RawItem>>,
}

impl ItemSender {
    pub fn new(tx: mpsc::UnboundedSender<Vec<RawItem>>) -> Self {
        Self { tx }
    }

    /// Push a single item.
    pub fn send(&self, item: impl Into<RawItem>) -> Result<()> {
        self.tx
            .send(vec![item.into()])
            .map_err(|_| QuarryError::Cancelled)
    }

    /// Push a page of items. They are fanned out together.
    pub fn send_all<I, T>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<RawItem>,
    {
        let batch: Vec<RawItem> = items.into_iter().map(Into::into).collect();
        if batch.is_empty() {
            return Ok(());
        }
        self.tx.send(batch).map_err(|_| QuarryError::Cancelled)
    }
}

// ── Closure adapters ─────────────────────────────────────────────────

/// Table resolver backed by an async closure taking owned arguments.
pub struct FnTableResolver<F>(F);

/// Wrap an async closure as a [`TableResolver`].
///
/// ```ignore
/// let producer = resolver_fn(|_ctx, _client, _parent, tx| async move {
///     tx.send(serde_json::json!({"Id": 1}))?;
///     Ok(())
/// });
/// ```
pub fn resolver_fn<F, Fut>(f: F) -> FnTableResolver<F>
where
    F: Fn(SyncContext, Client, Option<Arc<Resource>>, ItemSender) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnTableResolver(f)
}

#[async_trait]
impl<F, Fut> TableResolver for FnTableResolver<F>
where
    F: Fn(SyncContext, Client, Option<Arc<Resource>>, ItemSender) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn resolve(
        &self,
        ctx: &SyncContext,
        client: &Client,
        parent: Option<&Arc<Resource>>,
        tx: ItemSender,
    ) -> anyhow::Result<()> {
        (self.0)(ctx.clone(), client.clone(), parent.cloned(), tx).await
    }
}

pub struct FnMultiplexer<F>(F);

pub fn multiplex_fn<F>(f: F) -> FnMultiplexer<F>
where
    F: Fn(&Client) -> Vec<Client> + Send + Sync,
{
    FnMultiplexer(f)
}

impl<F> Multiplexer for FnMultiplexer<F>
where
    F: Fn(&Client) -> Vec<Client> + Send + Sync,
{
    fn multiplex(&self, client: &Client) -> Vec<Client> {
        (self.0)(client)
    }
}

/// Hook backed by a synchronous closure.
pub struct FnHook<F>(F);

pub fn hook_fn<F>(f: F) -> FnHook<F>
where
    F: Fn(&SyncContext, &Client, &mut Resource) -> anyhow::Result<()> + Send + Sync,
{
    FnHook(f)
}

#[async_trait]
impl<F> ResourceHook for FnHook<F>
where
    F: Fn(&SyncContext, &Client, &mut Resource) -> anyhow::Result<()> + Send + Sync,
{
    async fn call(
        &self,
        ctx: &SyncContext,
        client: &Client,
        resource: &mut Resource,
    ) -> anyhow::Result<()> {
        (self.0)(ctx, client, resource)
    }
}

/// Column resolver backed by a synchronous closure.
pub struct FnColumnResolver<F>(F);

pub fn column_fn<F>(f: F) -> FnColumnResolver<F>
where
    F: Fn(&SyncContext, &Client, &mut Resource, &Column) -> anyhow::Result<()> + Send + Sync,
{
    FnColumnResolver(f)
}

#[async_trait]
impl<F> ColumnResolver for FnColumnResolver<F>
where
    F: Fn(&SyncContext, &Client, &mut Resource, &Column) -> anyhow::Result<()> + Send + Sync,
{
    async fn resolve(
        &self,
        ctx: &SyncContext,
        client: &Client,
        resource: &mut Resource,
        column: &Column,
    ) -> anyhow::Result<()> {
        (self.0)(ctx, client, resource, column)
    }
}

// ── Column ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    String,
    Json,
    Timestamp,
    StringArray,
}

#[derive(Clone)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub description: String,
    pub resolver: Option<Arc<dyn ColumnResolver>>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            description: String::new(),
            resolver: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_resolver(mut self, resolver: impl ColumnResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("column_type", &self.column_type)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

// ── Table ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Table {
    pub name: String,
    pub description: String,
    pub columns: Vec<Column>,
    pub relations: Vec<Arc<Table>>,
    pub resolver: Option<Arc<dyn TableResolver>>,
    pub multiplex: Option<Arc<dyn Multiplexer>>,
    pub pre_resource_resolver: Option<Arc<dyn ResourceHook>>,
    pub post_resource_resolver: Option<Arc<dyn ResourceHook>>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            columns: Vec::new(),
            relations: Vec::new(),
            resolver: None,
            multiplex: None,
            pre_resource_resolver: None,
            post_resource_resolver: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, table: Table) -> Self {
        self.relations.push(Arc::new(table));
        self
    }

    pub fn with_resolver(mut self, resolver: impl TableResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_multiplex(mut self, multiplex: impl Multiplexer + 'static) -> Self {
        self.multiplex = Some(Arc::new(multiplex));
        self
    }

    pub fn with_pre_resource_resolver(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.pre_resource_resolver = Some(Arc::new(hook));
        self
    }

    pub fn with_post_resource_resolver(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.post_resource_resolver = Some(Arc::new(hook));
        self
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Number of levels in this table's subtree (a leaf has height 1).
    pub fn height(&self) -> usize {
        1 + self.relations.iter().map(|r| r.height()).max().unwrap_or(0)
    }

    /// Clients this table is synced with, as a root table.
    pub fn clients_for(&self, client: &Client) -> Vec<Client> {
        match &self.multiplex {
            Some(m) => m.multiplex(client),
            None => vec![client.clone()],
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("relations", &self.relations)
            .field("multiplex", &self.multiplex.is_some())
            .finish()
    }
}

// ── Tree helpers ─────────────────────────────────────────────────────

/// Height of the tallest tree in `tables`; 0 for an empty slice.
pub fn tree_height(tables: &[Arc<Table>]) -> usize {
    tables.iter().map(|t| t.height()).max().unwrap_or(0)
}

/// Every table in the forest, parents before their relations.
pub fn flatten(tables: &[Arc<Table>]) -> Vec<Arc<Table>> {
    let mut out = Vec::new();
    for table in tables {
        out.push(table.clone());
        out.extend(flatten(&table.relations));
    }
    out
}

/// Table names must be unique across the whole forest; metrics and
/// destinations key on them.
pub fn validate_unique_names(tables: &[Arc<Table>]) -> Result<()> {
    let mut seen = HashSet::new();
    for table in flatten(tables) {
        if !seen.insert(table.name.clone()) {
            return Err(QuarryError::DuplicateTable(table.name.clone()));
        }
    }
    Ok(())
}
