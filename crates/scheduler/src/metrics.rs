//! Per (table, client) counters for a sync run.
//!
//! The key set is built once, before any traversal task starts, and frozen
//! behind an `Arc`. From then on only atomic increments touch it, so readers
//! and writers never need a lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_core::{Client, Table};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

// ── Per-key counters ─────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TableClientMetrics {
    resources: AtomicU64,
    errors: AtomicU64,
    panics: AtomicU64,
}

impl TableClientMetrics {
    pub fn add_resource(&self) {
        self.resources.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resources(&self) -> u64 {
        self.resources.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            resources: self.resources(),
            errors: self.errors(),
            panics: self.panics(),
        }
    }
}

// ── Snapshots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub resources: u64,
    pub errors: u64,
    pub panics: u64,
}

impl CounterSnapshot {
    fn add(&mut self, other: &CounterSnapshot) {
        self.resources += other.resources;
        self.errors += other.errors;
        self.panics += other.panics;
    }
}

/// Point-in-time copy of every counter, table → client → counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tables: BTreeMap<String, BTreeMap<String, CounterSnapshot>>,
    pub totals: CounterSnapshot,
}

impl MetricsSnapshot {
    /// Counters for one table summed across clients. Zero if unknown.
    pub fn table(&self, name: &str) -> CounterSnapshot {
        let mut sum = CounterSnapshot::default();
        if let Some(clients) = self.tables.get(name) {
            for c in clients.values() {
                sum.add(c);
            }
        }
        sum
    }

    pub fn table_client(&self, table: &str, client: &str) -> Option<CounterSnapshot> {
        self.tables.get(table).and_then(|m| m.get(client)).copied()
    }
}

// ── Metrics ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Metrics {
    table_client: HashMap<String, HashMap<String, Arc<TableClientMetrics>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create counters for `table` and all its relations for every client.
    /// Must run before the metrics are shared.
    pub fn init_with_clients(&mut self, table: &Table, clients: &[Client]) {
        let entry = self.table_client.entry(table.name.clone()).or_default();
        for client in clients {
            entry.entry(client.id()).or_default();
        }
        for relation in &table.relations {
            self.init_with_clients(relation, clients);
        }
    }

    pub fn get(&self, table: &str, client: &str) -> Option<Arc<TableClientMetrics>> {
        self.table_client.get(table).and_then(|m| m.get(client)).cloned()
    }

    pub fn total_resources(&self) -> u64 {
        self.counters().map(|m| m.resources()).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.counters().map(|m| m.errors()).sum()
    }

    pub fn total_panics(&self) -> u64 {
        self.counters().map(|m| m.panics()).sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        for (table, clients) in &self.table_client {
            let per_client = snapshot.tables.entry(table.clone()).or_default();
            for (client, m) in clients {
                let counters = m.snapshot();
                snapshot.totals.add(&counters);
                per_client.insert(client.clone(), counters);
            }
        }
        snapshot
    }

    /// Log the final counters of `tables` and their relations for one client.
    pub fn log_table_summaries(&self, tables: &[Arc<Table>], client: &str) {
        for table in tables {
            if let Some(m) = self.get(&table.name, client) {
                info!(
                    table = %table.name,
                    client = %client,
                    resources = m.resources(),
                    errors = m.errors(),
                    "table sync finished"
                );
            }
            self.log_table_summaries(&table.relations, client);
        }
    }

    fn counters(&self) -> impl Iterator<Item = &Arc<TableClientMetrics>> {
        self.table_client.values().flat_map(|m| m.values())
    }
}

/// Spawn the background task that logs running totals every `interval`
/// until `cancel` fires.
pub fn spawn_periodic_logger(
    metrics: Arc<Metrics>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // interval() panics on a zero period
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        // Skip the immediate first tick
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    info!(
                        total_resources = metrics.total_resources(),
                        total_errors = metrics.total_errors(),
                        total_panics = metrics.total_panics(),
                        "sync in progress"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    use quarry_core::ClientMeta;

    #[derive(Debug)]
    struct Region(&'static str);

    impl ClientMeta for Region {
        fn id(&self) -> String {
            self.0.to_string()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn clients() -> Vec<Client> {
        vec![Arc::new(Region("us-east-1")), Arc::new(Region("eu-west-1"))]
    }

    #[test]
    fn init_covers_relations_for_every_client() {
        let table = Table::new("instances").relation(Table::new("instance_tags"));
        let mut metrics = Metrics::new();
        metrics.init_with_clients(&table, &clients());

        assert!(metrics.get("instances", "us-east-1").is_some());
        assert!(metrics.get("instance_tags", "eu-west-1").is_some());
        assert!(metrics.get("instance_tags", "ap-south-1").is_none());
    }

    #[test]
    fn totals_sum_all_keys() {
        let table = Table::new("instances").relation(Table::new("instance_tags"));
        let mut metrics = Metrics::new();
        metrics.init_with_clients(&table, &clients());

        metrics.get("instances", "us-east-1").unwrap().add_resource();
        metrics.get("instances", "eu-west-1").unwrap().add_resource();
        metrics.get("instance_tags", "eu-west-1").unwrap().add_error();
        metrics.get("instance_tags", "eu-west-1").unwrap().add_panic();

        assert_eq!(metrics.total_resources(), 2);
        assert_eq!(metrics.total_errors(), 1);
        assert_eq!(metrics.total_panics(), 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.totals.resources, 2);
        assert_eq!(snap.table("instances").resources, 2);
        assert_eq!(
            snap.table_client("instance_tags", "eu-west-1"),
            Some(CounterSnapshot { resources: 0, errors: 1, panics: 1 })
        );
        assert_eq!(snap.table("unknown"), CounterSnapshot::default());
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let mut metrics = Metrics::new();
        metrics.init_with_clients(&Table::new("t"), &clients());
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["tables"]["t"]["us-east-1"]["resources"], 0);
        assert_eq!(json["totals"]["errors"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_logger_stops_on_cancel() {
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let handle = spawn_periodic_logger(metrics, Duration::from_secs(30), cancel.clone());
        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
