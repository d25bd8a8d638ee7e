//! Depth-first traversal of a table tree.
//!
//! One branch covers a (table, client, parent) triple. Its producer runs in
//! its own task and streams batches of raw items; each batch is fanned out
//! under the resource gate, every resolved resource is emitted and then used
//! as the parent of the table's relations one level deeper. The caller holds
//! the depth permit for the whole lifetime of the branch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use quarry_core::{Client, ItemSender, NameCasing, RawItem, Resource, SyncContext, Table};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::guard::{catch_panic, Crash, CrashReporter};
use crate::limiter::Limiter;
use crate::metrics::{Metrics, TableClientMetrics};

/// State shared by every branch of one sync run.
pub(crate) struct Run {
    pub(crate) ctx: SyncContext,
    pub(crate) limiter: Limiter,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) sink: mpsc::Sender<Arc<Resource>>,
    pub(crate) reporter: Arc<dyn CrashReporter>,
    pub(crate) casing: NameCasing,
    pub(crate) resource_timeout: Duration,
}

impl Run {
    /// Traverse `table` for one client. `parent` is `None` for root tables.
    pub(crate) fn resolve_table(
        self: Arc<Self>,
        table: Arc<Table>,
        client: Client,
        parent: Option<Arc<Resource>>,
        depth: usize,
    ) -> BoxFuture<'static, ()> {
        async move { self.traverse(table, client, parent, depth).await }.boxed()
    }

    async fn traverse(
        self: Arc<Self>,
        table: Arc<Table>,
        client: Client,
        parent: Option<Arc<Resource>>,
        depth: usize,
    ) {
        let start = Instant::now();
        let client_id = client.id();
        let is_root = parent.is_none();
        if is_root {
            info!(table = %table.name, client = %client_id, "top level table resolver started");
        }

        let metrics = match self.metrics.get(&table.name, &client_id) {
            Some(m) => m,
            None => {
                warn!(table = %table.name, client = %client_id, "no metrics registered for table and client");
                Arc::new(TableClientMetrics::default())
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let producer = {
            let run = self.clone();
            let table = table.clone();
            let client = client.clone();
            let parent = parent.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                run.produce(&table, &client, parent.as_ref(), ItemSender::new(tx), &metrics)
                    .await;
            })
        };

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.resolve_resources(&table, &client, parent.as_ref(), batch, depth, &metrics)
                .await;
        }
        drop(rx);

        if self.ctx.is_cancelled() {
            producer.abort();
        }
        if let Err(e) = producer.await {
            if !e.is_cancelled() {
                error!(table = %table.name, client = %client_id, error = %e, "table producer task failed");
            }
        }

        if is_root {
            info!(
                table = %table.name,
                client = %client_id,
                resources = metrics.resources(),
                errors = metrics.errors(),
                duration_ms = start.elapsed().as_millis() as u64,
                "table sync finished"
            );
            self.metrics.log_table_summaries(&table.relations, &client_id);
        }
    }

    /// Run the table's producer inside the fault boundary.
    async fn produce(
        &self,
        table: &Table,
        client: &Client,
        parent: Option<&Arc<Resource>>,
        tx: ItemSender,
        metrics: &TableClientMetrics,
    ) {
        let Some(resolver) = &table.resolver else {
            debug!(table = %table.name, "table has no resolver");
            return;
        };
        let start = Instant::now();

        match catch_panic(resolver.resolve(&self.ctx, client, parent, tx)).await {
            Ok(Ok(())) => {
                debug!(
                    table = %table.name,
                    client = %client.id(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "table resolver finished"
                );
            }
            Ok(Err(e)) if self.ctx.is_cancelled() => {
                debug!(table = %table.name, client = %client.id(), error = %e, "table resolver stopped by cancellation");
            }
            Ok(Err(e)) => {
                error!(
                    table = %table.name,
                    client = %client.id(),
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "table resolver finished with error"
                );
                metrics.add_error();
            }
            Err(panic) => {
                error!(
                    table = %table.name,
                    client = %client.id(),
                    error = %panic.message,
                    duration_ms = start.elapsed().as_millis() as u64,
                    stack = %panic.backtrace,
                    "table resolver finished with panic"
                );
                metrics.add_panic();
                self.reporter.report(&Crash {
                    table: table.name.clone(),
                    client: client.id(),
                    column: None,
                    message: panic.message,
                    backtrace: panic.backtrace,
                });
            }
        }
    }

    /// Resolve one batch concurrently, emit each resource and descend into
    /// its relations. Returns once every item and child branch is done.
    async fn resolve_resources(
        self: &Arc<Self>,
        table: &Arc<Table>,
        client: &Client,
        parent: Option<&Arc<Resource>>,
        batch: Vec<RawItem>,
        depth: usize,
        metrics: &Arc<TableClientMetrics>,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<Resource>(batch.len().max(1));

        let fan_out = {
            let run = self.clone();
            let table = table.clone();
            let client = client.clone();
            let parent = parent.cloned();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let mut inflight = JoinSet::new();
                for item in batch {
                    let permit = match run.limiter.acquire_resource().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            debug!(table = %table.name, "cancelled before every item was started");
                            break;
                        }
                    };
                    let run = run.clone();
                    let table = table.clone();
                    let client = client.clone();
                    let parent = parent.clone();
                    let metrics = metrics.clone();
                    let done_tx = done_tx.clone();
                    inflight.spawn(async move {
                        let resolved = run
                            .resolve_resource(&table, &client, parent.as_ref(), item, &metrics)
                            .await;
                        drop(permit);
                        if let Some(resource) = resolved {
                            let _ = done_tx.send(resource).await;
                        }
                    });
                }
                drop(done_tx);
                while inflight.join_next().await.is_some() {}
            })
        };

        let mut children = JoinSet::new();
        'resources: while let Some(resource) = done_rx.recv().await {
            let resource = Arc::new(resource);
            if !self.emit(table, resource.clone()).await {
                continue;
            }
            for relation in &table.relations {
                let permit = match self.limiter.acquire_table(depth + 1).await {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!(table = %relation.name, depth = depth + 1, "cancelled before relation was admitted");
                        break 'resources;
                    }
                };
                let run = self.clone();
                let relation = relation.clone();
                let client = client.clone();
                let resource = resource.clone();
                children.spawn(async move {
                    run.resolve_table(relation, client, Some(resource), depth + 1)
                        .await;
                    drop(permit);
                });
            }
        }
        // Unblock any resolved items still waiting to be handed over.
        drop(done_rx);

        while children.join_next().await.is_some() {}
        if let Err(e) = fan_out.await {
            error!(table = %table.name, error = %e, "fan-out task failed");
        }
    }

    /// Push a finished resource to the output stream. `false` when the run was
    /// cancelled or the consumer is gone.
    async fn emit(&self, table: &Table, resource: Arc<Resource>) -> bool {
        let sent = tokio::select! {
            biased;
            sent = self.sink.send(resource) => sent.is_ok(),
            _ = self.ctx.cancel.cancelled() => false,
        };
        if !sent {
            debug!(table = %table.name, "resource not emitted");
        }
        sent
    }
}
