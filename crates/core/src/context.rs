use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-sync context passed into every resolver and hook.
///
/// Cloning is cheap. `cancel` is the cancellation signal for the unit of work
/// the callback belongs to: the whole run for table resolvers, the single
/// item (with its own deadline) for hooks and column resolvers.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub sync_id: Uuid,
    pub sync_time: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl SyncContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            sync_id: Uuid::new_v4(),
            sync_time: Utc::now(),
            cancel,
        }
    }

    /// Same sync identity, scoped to a child cancellation token.
    pub fn child(&self) -> Self {
        Self {
            sync_id: self.sync_id,
            sync_time: self.sync_time,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
