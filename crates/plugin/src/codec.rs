use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::Record;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{PluginError, Result};
use crate::message::{SyncMessage, WriteMessage};

/// Largest encoded frame the server will send (100 MiB).
pub const MAX_MSG_SIZE: usize = 100 * 1024 * 1024;

/// What a frame's payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Sync,
    Write,
    Record,
}

/// Wire envelope. The payload is the MessagePack encoding of a
/// [`SyncMessage`], [`WriteMessage`] or [`Record`] depending on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    /// Consumers should check this before decoding the payload.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Frame {
    fn new<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Self> {
        Ok(Self {
            kind,
            payload: rmp_serde::to_vec(payload)?,
            timestamp: Utc::now(),
            version: 1,
        })
    }

    pub fn sync(msg: &SyncMessage) -> Result<Self> {
        Self::new(FrameKind::Sync, msg)
    }

    pub fn write(msg: &WriteMessage) -> Result<Self> {
        Self::new(FrameKind::Write, msg)
    }

    pub fn record(record: &Record) -> Result<Self> {
        Self::new(FrameKind::Record, record)
    }

    pub fn decode_sync(&self) -> Result<SyncMessage> {
        self.ensure_kind(FrameKind::Sync)?;
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn decode_write(&self) -> Result<WriteMessage> {
        self.ensure_kind(FrameKind::Write)?;
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn decode_record(&self) -> Result<Record> {
        self.ensure_kind(FrameKind::Record)?;
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn ensure_kind(&self, kind: FrameKind) -> Result<()> {
        if self.kind != kind {
            return Err(PluginError::InvalidArgument(format!(
                "expected a {kind:?} frame, got {:?}",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Handle `Vec<u8>` as raw MessagePack bytes instead of an integer array.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

// ── Frame sinks ──────────────────────────────────────────────────────

/// Outbound half of a framed stream.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, bytes: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl FrameSink for mpsc::Sender<Vec<u8>> {
    async fn send_frame(&self, bytes: Vec<u8>) -> Result<()> {
        self.send(bytes)
            .await
            .map_err(|_| PluginError::Transport("frame receiver closed".to_string()))
    }
}
