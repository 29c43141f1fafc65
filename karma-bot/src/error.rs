use std::{io, path::PathBuf};

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures the bot distinguishes between.
///
/// Configuration and parse errors are fatal at startup. Network errors end
/// the session. Io errors come from persisting the karma file and are fatal,
/// since the ledger in memory no longer matches the one on disk.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("karma file {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("network error: {0}")]
    Network(#[source] io::Error),

    #[error("failed to persist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("karma store is closed")]
    StoreClosed,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
