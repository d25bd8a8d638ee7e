use quarry_core::QuarryError;
use thiserror::Error;

/// Errors surfaced by the plugin façade and the framed server.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin is not initialized, call init first")]
    NotInitialized,

    #[error("plugin does not support {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Core(#[from] QuarryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("client error: {0:#}")]
    Client(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PluginError>;
