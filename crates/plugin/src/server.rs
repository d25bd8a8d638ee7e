//! Framed front end of a [`Plugin`].
//!
//! Every message crossing the boundary is a MessagePack [`Frame`]. Outbound
//! frames larger than the configured ceiling are logged and dropped instead
//! of failing the stream.

use std::sync::Arc;

use quarry_scheduler::SyncSummary;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::codec::{Frame, FrameSink, MAX_MSG_SIZE};
use crate::error::{PluginError, Result};
use crate::message::{schemas, SyncMessage, TableSchema, WriteMessage};
use crate::plugin::{NewClientOptions, Plugin};
use crate::selection::{SyncOptions, TableOptions};

/// Buffer between the frame readers/writers and the plugin.
const CHANNEL_CAPACITY: usize = 1000;

pub struct Server {
    plugin: Arc<Plugin>,
    max_msg_size: usize,
}

impl Server {
    pub fn new(plugin: Arc<Plugin>) -> Self {
        Self {
            plugin,
            max_msg_size: MAX_MSG_SIZE,
        }
    }

    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn version(&self) -> &str {
        self.plugin.version()
    }

    pub fn get_tables(&self, options: &TableOptions) -> Result<Vec<TableSchema>> {
        Ok(schemas(&self.plugin.tables(options)?))
    }

    pub async fn init(&self, spec: &[u8], no_connection: bool) -> Result<()> {
        let spec: serde_json::Value = if spec.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(spec)
                .map_err(|e| PluginError::InvalidArgument(format!("invalid spec: {e}")))?
        };
        self.plugin
            .init(&spec, NewClientOptions { no_connection })
            .await
    }

    /// Run a sync and push every message to `sink` as a frame.
    pub async fn sync(
        &self,
        cancel: CancellationToken,
        options: &SyncOptions,
        sink: &dyn FrameSink,
    ) -> Result<SyncSummary> {
        let (tx, mut rx) = mpsc::channel::<SyncMessage>(CHANNEL_CAPACITY);

        let forward = async move {
            let mut sent = 0u64;
            let mut dropped = 0u64;
            while let Some(msg) = rx.recv().await {
                let bytes = Frame::sync(&msg)?.to_bytes()?;
                if bytes.len() > self.max_msg_size {
                    error!(bytes = bytes.len(), max = self.max_msg_size, "message exceeds max size");
                    dropped += 1;
                    continue;
                }
                sink.send_frame(bytes).await?;
                sent += 1;
            }
            info!(sent, dropped, "sync stream finished");
            Ok::<(), PluginError>(())
        };

        let (synced, forwarded) = tokio::join!(self.plugin.sync(cancel, options, tx), forward);
        // A failed sink is the root cause of any transport error the sync saw.
        forwarded?;
        synced
    }

    /// Decode write frames from `frames` and hand them to the plugin. A frame
    /// that fails to decode ends the write with `InvalidArgument`.
    pub async fn write(
        &self,
        cancel: CancellationToken,
        mut frames: mpsc::Receiver<Vec<u8>>,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<WriteMessage>(CHANNEL_CAPACITY);

        let feed = async move {
            while let Some(bytes) = frames.recv().await {
                let msg = match Frame::from_bytes(&bytes).and_then(|f| f.decode_write()) {
                    Ok(msg) => msg,
                    Err(e) => return Err(PluginError::InvalidArgument(format!("failed to decode write message: {e}"))),
                };
                if tx.send(msg).await.is_err() {
                    // Writer stopped early; its error is reported below.
                    break;
                }
            }
            Ok(())
        };

        let (written, fed) = tokio::join!(self.plugin.write(cancel, rx), feed);
        match (fed, written) {
            (Err(decode), Err(write)) => Err(PluginError::InvalidArgument(format!(
                "{decode} and write failed: {write}"
            ))),
            (Err(decode), Ok(())) => Err(decode),
            (Ok(()), written) => written,
        }
    }

    /// Stream the stored rows of `table` to `sink` as record frames.
    pub async fn read(&self, table: &TableSchema, sink: &dyn FrameSink) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let forward = async move {
            while let Some(record) = rx.recv().await {
                sink.send_frame(Frame::record(&record)?.to_bytes()?).await?;
            }
            Ok::<(), PluginError>(())
        };
        let (read, forwarded) = tokio::join!(self.plugin.read(table, tx), forward);
        forwarded?;
        read
    }

    pub async fn close(&self) -> Result<()> {
        self.plugin.close().await
    }
}
