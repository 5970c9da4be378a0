use std::io;
use std::time::Duration;

use crate::relay::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to connect to target {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to target {target} timed out after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    #[error("client connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
