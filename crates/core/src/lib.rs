//! Data model shared by the scheduler and the plugin layer: table trees,
//! resources, raw items, clients and configuration.

pub mod caser;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod resolvers;
pub mod resource;
pub mod table;
pub mod value;

pub use caser::NameCasing;
pub use client::{downcast_client, Client, ClientMeta};
pub use config::{Config, SyncConfig};
pub use context::SyncContext;
pub use error::*;
pub use resolvers::{ConstResolver, ParentColumnResolver, PathResolver};
pub use resource::{Record, Resource};
pub use table::*;
pub use value::{RawItem, Value};
