use std::time::Instant;

use quarry_core::{Client, Column, Resource, SyncContext};
use tracing::{error, trace};

use crate::guard::{catch_panic, Crash};
use crate::metrics::TableClientMetrics;
use crate::traversal::Run;

impl Run {
    /// Resolve one column of `resource`. Failures are logged and counted;
    /// they never stop the remaining columns.
    pub(crate) async fn resolve_column(
        &self,
        ctx: &SyncContext,
        client: &Client,
        client_id: &str,
        metrics: &TableClientMetrics,
        resource: &mut Resource,
        column: &Column,
    ) {
        let start = Instant::now();
        let table = resource.table_name().to_string();

        let outcome = catch_panic(async {
            match &column.resolver {
                Some(resolver) => resolver.resolve(ctx, client, resource, column).await,
                None => {
                    self.default_lookup(resource, column);
                    Ok(())
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    table = %table,
                    client = %client_id,
                    column = %column.name,
                    error = %e,
                    "column resolver finished with error"
                );
                metrics.add_error();
            }
            Err(panic) => {
                error!(
                    table = %table,
                    client = %client_id,
                    column = %column.name,
                    error = %panic.message,
                    duration_ms = start.elapsed().as_millis() as u64,
                    stack = %panic.backtrace,
                    "column resolver finished with panic"
                );
                metrics.add_panic();
                self.reporter.report(&Crash {
                    table,
                    client: client_id.to_string(),
                    column: Some(column.name.clone()),
                    message: panic.message,
                    backtrace: panic.backtrace,
                });
            }
        }
    }

    /// Look the column up on the raw item under its conventionally-cased
    /// name. Zero values are written; missing fields and nulls are skipped.
    fn default_lookup(&self, resource: &mut Resource, column: &Column) {
        let field = self.casing.convert(&column.name);
        match resource.item().field(&field) {
            Some(value) if !value.is_null() => {
                if let Err(e) = resource.set(&column.name, value) {
                    trace!(column = %column.name, error = %e, "default lookup could not set column");
                }
            }
            _ => trace!(column = %column.name, field = %field, "field not present on item"),
        }
    }
}
