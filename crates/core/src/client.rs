use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Capability handed to every resolver: an authenticated connection to the
/// data source, possibly scoped to one account/region by a multiplexer.
///
/// Clients are shared read-only across all concurrent branches that use them.
pub trait ClientMeta: Send + Sync + fmt::Debug {
    /// Stable identity, used as a metrics dimension and a logging field.
    fn id(&self) -> String;

    /// Downcast hook so resolvers can reach the concrete client type.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a client.
pub type Client = Arc<dyn ClientMeta>;

/// Downcast a shared client to its concrete type.
pub fn downcast_client<T: 'static>(client: &dyn ClientMeta) -> Option<&T> {
    client.as_any().downcast_ref::<T>()
}
