//! Two-tier admission control for the DFS scheduler.
//!
//! One gate per tree depth bounds how many table branches run at that level;
//! a single global gate bounds how many items are being resolved. Table
//! capacity halves with every level (floored at 1), moving the budget from
//! table-level to resource-level parallelism as the tree deepens.

use std::sync::Arc;

use quarry_core::QuarryError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Lower bound for any gate.
const MIN_TABLE_CONCURRENCY: usize = 1;

pub struct Limiter {
    tables: Vec<Arc<Semaphore>>,
    table_capacities: Vec<usize>,
    resources: Arc<Semaphore>,
    resource_capacity: usize,
    cancel: CancellationToken,
}

impl Limiter {
    /// `concurrency` is the total budget; `fanout` is how many resource
    /// slots back each depth-1 table slot.
    pub fn new(
        concurrency: usize,
        fanout: usize,
        max_depth: usize,
        cancel: CancellationToken,
    ) -> Self {
        let fanout = fanout.max(1);
        let base = (concurrency / fanout).max(MIN_TABLE_CONCURRENCY);
        let table_capacities: Vec<usize> = (0..max_depth.max(1))
            .map(|level| {
                base.checked_shr(level as u32)
                    .unwrap_or(0)
                    .max(MIN_TABLE_CONCURRENCY)
            })
            .collect();
        let tables = table_capacities
            .iter()
            .map(|&cap| Arc::new(Semaphore::new(cap)))
            .collect();
        let resource_capacity = base * fanout;
        Self {
            tables,
            table_capacities,
            resources: Arc::new(Semaphore::new(resource_capacity)),
            resource_capacity,
            cancel,
        }
    }

    /// Number of depth levels with their own gate.
    pub fn max_depth(&self) -> usize {
        self.tables.len()
    }

    /// Capacity of the gate at `depth` (1-based).
    pub fn table_capacity(&self, depth: usize) -> usize {
        self.table_capacities[self.level(depth)]
    }

    pub fn resource_capacity(&self) -> usize {
        self.resource_capacity
    }

    /// Admit one table branch at `depth`. Blocks until a slot frees or the
    /// run is cancelled.
    pub async fn acquire_table(&self, depth: usize) -> Result<OwnedSemaphorePermit, QuarryError> {
        let gate = self.tables[self.level(depth)].clone();
        self.acquire(gate).await
    }

    /// Admit one item resolution.
    pub async fn acquire_resource(&self) -> Result<OwnedSemaphorePermit, QuarryError> {
        self.acquire(self.resources.clone()).await
    }

    fn level(&self, depth: usize) -> usize {
        depth.saturating_sub(1).min(self.tables.len() - 1)
    }

    async fn acquire(&self, gate: Arc<Semaphore>) -> Result<OwnedSemaphorePermit, QuarryError> {
        if self.cancel.is_cancelled() {
            return Err(QuarryError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QuarryError::Cancelled),
            permit = gate.acquire_owned() => permit.map_err(|_| QuarryError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn capacities_halve_per_depth() {
        let limiter = Limiter::new(1000, 100, 5, CancellationToken::new());
        assert_eq!(limiter.table_capacity(1), 10);
        assert_eq!(limiter.table_capacity(2), 5);
        assert_eq!(limiter.table_capacity(3), 2);
        assert_eq!(limiter.table_capacity(4), 1);
        assert_eq!(limiter.table_capacity(5), 1);
        assert_eq!(limiter.resource_capacity(), 1000);
    }

    #[test]
    fn tiny_budget_floors_at_one() {
        let limiter = Limiter::new(5, 100, 2, CancellationToken::new());
        assert_eq!(limiter.table_capacity(1), 1);
        assert_eq!(limiter.table_capacity(2), 1);
        assert_eq!(limiter.resource_capacity(), 100);
    }

    #[test]
    fn depth_past_the_end_uses_last_gate() {
        let limiter = Limiter::new(800, 100, 2, CancellationToken::new());
        assert_eq!(limiter.max_depth(), 2);
        assert_eq!(limiter.table_capacity(9), limiter.table_capacity(2));
    }

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let limiter = Limiter::new(100, 100, 1, CancellationToken::new());
        let first = limiter.acquire_table(1).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), limiter.acquire_table(1)).await;
        assert!(blocked.is_err(), "gate of size 1 should be exhausted");
        drop(first);
        assert!(limiter.acquire_table(1).await.is_ok());
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiters() {
        let cancel = CancellationToken::new();
        let limiter = Arc::new(Limiter::new(100, 100, 1, cancel.clone()));
        let _held = limiter.acquire_table(1).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_table(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake up")
            .unwrap();
        assert!(matches!(result, Err(QuarryError::Cancelled)));
    }

    #[tokio::test]
    async fn no_permits_after_cancellation() {
        let cancel = CancellationToken::new();
        let limiter = Limiter::new(10_000, 100, 1, cancel.clone());
        cancel.cancel();
        assert!(limiter.acquire_table(1).await.is_err());
        assert!(limiter.acquire_resource().await.is_err());
    }
}
