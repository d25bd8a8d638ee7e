use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use quarry_core::{tree_height, Client, Resource, SyncConfig, SyncContext, Table};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::guard::{install_panic_hook, CrashReporter, TracingReporter};
use crate::limiter::Limiter;
use crate::metrics::{spawn_periodic_logger, Metrics, MetricsSnapshot};
use crate::traversal::Run;

/// Scheduler settings. Loaded through `quarry_core::Config`.
pub type SchedulerConfig = SyncConfig;

/// Outcome of one [`Scheduler::sync`] call.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub sync_id: Uuid,
    pub sync_time: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// Runs table trees for a client and streams the resolved resources.
pub struct Scheduler {
    config: SchedulerConfig,
    reporter: Arc<dyn CrashReporter>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_crash_reporter(mut self, reporter: Arc<dyn CrashReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Sync `tables` for `client`, sending every resource into `sink`.
    ///
    /// Returns once all branches have drained or `cancel` fired. Failures of
    /// individual resolvers are logged and counted, never returned.
    pub async fn sync(
        &self,
        cancel: CancellationToken,
        client: Client,
        tables: &[Arc<Table>],
        sink: mpsc::Sender<Arc<Resource>>,
    ) -> SyncSummary {
        self.sync_with_context(SyncContext::new(cancel), client, tables, sink)
            .await
    }

    /// Same as [`sync`](Self::sync) with a caller-built context, so the sync
    /// id and time are known before the run starts.
    pub async fn sync_with_context(
        &self,
        ctx: SyncContext,
        client: Client,
        tables: &[Arc<Table>],
        sink: mpsc::Sender<Arc<Resource>>,
    ) -> SyncSummary {
        install_panic_hook();
        let start = Instant::now();

        let max_depth = self.config.max_depth.max(tree_height(tables)).max(1);
        let limiter = Limiter::new(
            self.config.concurrency,
            self.config.resource_fanout,
            max_depth,
            ctx.cancel.clone(),
        );
        info!(
            sync_id = %ctx.sync_id,
            tables = tables.len(),
            max_depth,
            table_concurrency = limiter.table_capacity(1),
            resource_concurrency = limiter.resource_capacity(),
            "starting sync"
        );

        // Multiplex every root up front so the metrics key set is complete
        // before any branch runs.
        let mut metrics = Metrics::new();
        let mut roots = Vec::new();
        for table in tables {
            let clients = table.clients_for(&client);
            metrics.init_with_clients(table, &clients);
            roots.extend(clients.into_iter().map(|c| (table.clone(), c)));
        }
        let metrics = Arc::new(metrics);

        let logger_cancel = ctx.cancel.child_token();
        let logger = spawn_periodic_logger(
            metrics.clone(),
            self.config.metrics_interval(),
            logger_cancel.clone(),
        );

        let run = Arc::new(Run {
            ctx: ctx.clone(),
            limiter,
            metrics: metrics.clone(),
            sink,
            reporter: self.reporter.clone(),
            casing: self.config.name_casing,
            resource_timeout: self.config.resource_timeout(),
        });

        let mut branches = JoinSet::new();
        for (table, client) in roots {
            let permit = match run.limiter.acquire_table(1).await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(table = %table.name, "sync cancelled before every root table started");
                    break;
                }
            };
            let run = run.clone();
            branches.spawn(async move {
                run.resolve_table(table, client, None, 1).await;
                drop(permit);
            });
        }
        drop(run);

        while let Some(joined) = branches.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "table branch task failed");
            }
        }

        logger_cancel.cancel();
        if let Err(e) = logger.await {
            error!(error = %e, "metrics logger task failed");
        }

        let snapshot = metrics.snapshot();
        let elapsed = start.elapsed();
        let cancelled = ctx.is_cancelled();
        info!(
            sync_id = %ctx.sync_id,
            resources = snapshot.totals.resources,
            errors = snapshot.totals.errors,
            panics = snapshot.totals.panics,
            duration_ms = elapsed.as_millis() as u64,
            cancelled,
            "sync finished"
        );

        SyncSummary {
            sync_id: ctx.sync_id,
            sync_time: ctx.sync_time,
            metrics: snapshot,
            elapsed,
            cancelled,
        }
    }
}
