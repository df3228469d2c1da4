//! rollcall-store — Persistence for the gallery and the attendance ledger.
//!
//! Embeddings live as one JSON file per person; attendance lives in
//! SQLite. A process-wide advisory lock keeps a single writer per data
//! directory.

pub mod faces;
pub mod ledger;
pub mod lock;

pub use faces::FileEmbeddingStore;
pub use ledger::{NewUser, SqliteLedger, User};
pub use lock::StoreLock;

use rollcall_core::PersistenceError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed embedding file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode embedding file {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("label {0:?} cannot name a file in the store")]
    UnsafeLabel(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("data directory {0} is locked by another process")]
    Locked(PathBuf),
    #[error("unreadable ledger row: {0}")]
    BadRow(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Locked(path) => {
                PersistenceError::Unavailable(format!("{} is locked", path.display()))
            }
            other => PersistenceError::backend("store", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_and_parse_failures_read_differently() {
        let json_err = || serde_json::from_str::<u8>("x").unwrap_err();
        let write = StoreError::Encode {
            path: PathBuf::from("faces/alice.json"),
            source: json_err(),
        };
        let read = StoreError::Malformed {
            path: PathBuf::from("faces/alice.json"),
            source: json_err(),
        };
        assert!(write.to_string().starts_with("cannot encode embedding file"));
        assert!(read.to_string().starts_with("malformed embedding file"));
    }
}
