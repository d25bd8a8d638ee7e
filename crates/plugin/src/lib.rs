//! Plugin layer on top of the scheduler: table selection, the sync and write
//! message model, a MessagePack frame codec and the framed server.

pub mod codec;
pub mod destination;
pub mod error;
pub mod message;
pub mod plugin;
pub mod selection;
pub mod server;

pub use codec::{Frame, FrameKind, FrameSink, MAX_MSG_SIZE};
pub use destination::{DestinationClient, MemoryDestination};
pub use error::{PluginError, Result};
pub use message::{record_id, schemas, ColumnSchema, SyncMessage, TableSchema, WriteMessage};
pub use plugin::{ClientFactory, Connection, NewClientOptions, Plugin};
pub use selection::{select_tables, SyncOptions, TableOptions};
pub use server::Server;
