//! Depth-first resolution scheduler.
//!
//! Walks table trees, resolves every produced item into a resource under a
//! two-tier concurrency budget, and streams the resources to one consumer.
//! Resolver failures and panics are contained per column, item and table and
//! surface only through logs and [`Metrics`].

pub mod guard;
pub mod limiter;
pub mod metrics;
pub mod scheduler;

mod column;
mod resource;
mod traversal;

pub use guard::{catch_panic, Crash, CrashReporter, Panic, TracingReporter};
pub use limiter::Limiter;
pub use metrics::{CounterSnapshot, Metrics, MetricsSnapshot, TableClientMetrics};
pub use scheduler::{Scheduler, SchedulerConfig, SyncSummary};
