use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// This process already owns an instance, or the identity is already in its service
    #[error("already registered")]
    AlreadyRegistered,

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("not found in storage: {0}")]
    StorageKeyNotFound(String),

    #[error("unsupported backend type \"{0}\"")]
    BackendUnsupported(String),

    /// Passed through from the database unchanged
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to read config file {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
