use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quarry_core::{Client, RawItem, Resource, SyncContext, Table};
use tokio::time::Instant as Deadline;
use tracing::{debug, error};

use crate::guard::{catch_panic, Crash};
use crate::metrics::TableClientMetrics;
use crate::traversal::Run;

/// Deadline used when the configured timeout overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Outcome of one step run against the item deadline.
enum Step {
    Done(anyhow::Result<()>),
    TimedOut,
}

async fn within<F>(deadline: Deadline, ctx: &SyncContext, fut: F) -> Step
where
    F: Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => Step::Done(result),
        Err(_) => {
            ctx.cancel.cancel();
            Step::TimedOut
        }
    }
}

impl Run {
    /// Turn one raw item into a resource. `None` means the item was dropped:
    /// the pre-hook failed or something panicked.
    pub(crate) async fn resolve_resource(
        &self,
        table: &Arc<Table>,
        client: &Client,
        parent: Option<&Arc<Resource>>,
        item: RawItem,
        metrics: &TableClientMetrics,
    ) -> Option<Resource> {
        let start = Instant::now();
        let client_id = client.id();
        // Scoped to this item; cancelled when its deadline passes.
        let ctx = self.ctx.child();
        let now = Deadline::now();
        let deadline = now.checked_add(self.resource_timeout).unwrap_or(now + FAR_FUTURE);

        let outcome = catch_panic(self.resolve_resource_inner(
            &ctx, deadline, table, client, &client_id, parent, item, metrics,
        ))
        .await;

        match outcome {
            Ok(resource) => resource,
            Err(panic) => {
                error!(
                    table = %table.name,
                    client = %client_id,
                    error = %panic.message,
                    duration_ms = start.elapsed().as_millis() as u64,
                    stack = %panic.backtrace,
                    "resource resolver finished with panic"
                );
                metrics.add_panic();
                self.reporter.report(&Crash {
                    table: table.name.clone(),
                    client: client_id,
                    column: None,
                    message: panic.message,
                    backtrace: panic.backtrace,
                });
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_resource_inner(
        &self,
        ctx: &SyncContext,
        deadline: Deadline,
        table: &Arc<Table>,
        client: &Client,
        client_id: &str,
        parent: Option<&Arc<Resource>>,
        item: RawItem,
        metrics: &TableClientMetrics,
    ) -> Option<Resource> {
        let mut resource = Resource::new(table.clone(), parent, item);

        if let Some(hook) = &table.pre_resource_resolver {
            let step = within(deadline, ctx, hook.call(ctx, client, &mut resource)).await;
            match step {
                Step::Done(Ok(())) => {}
                Step::Done(Err(e)) => {
                    error!(table = %table.name, client = %client_id, error = %e, "pre resource resolver failed");
                    metrics.add_error();
                    return None;
                }
                Step::TimedOut => {
                    error!(table = %table.name, client = %client_id, timeout = ?self.resource_timeout, "pre resource resolver timed out");
                    metrics.add_error();
                    return None;
                }
            }
        }

        let columns = async {
            for column in &table.columns {
                self.resolve_column(ctx, client, client_id, metrics, &mut resource, column)
                    .await;
            }
            Ok::<(), anyhow::Error>(())
        };
        let columns_timed_out = matches!(within(deadline, ctx, columns).await, Step::TimedOut);
        if columns_timed_out {
            error!(table = %table.name, client = %client_id, timeout = ?self.resource_timeout, "column resolution timed out");
            metrics.add_error();
        }

        match &table.post_resource_resolver {
            None => {}
            // The deadline is spent and the item already counted one error.
            Some(_) if columns_timed_out => {
                debug!(table = %table.name, client = %client_id, "skipping post resource resolver after timeout");
            }
            Some(hook) => match within(deadline, ctx, hook.call(ctx, client, &mut resource)).await {
                Step::Done(Ok(())) => {}
                Step::Done(Err(e)) => {
                    error!(table = %table.name, client = %client_id, error = %e, "post resource resolver finished with error");
                    metrics.add_error();
                }
                Step::TimedOut => {
                    error!(table = %table.name, client = %client_id, timeout = ?self.resource_timeout, "post resource resolver timed out");
                    metrics.add_error();
                }
            },
        }

        metrics.add_resource();
        Some(resource)
    }
}
