//! Watermark store error types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("run lease held by {holder} until {expires_at}")]
    Locked {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
