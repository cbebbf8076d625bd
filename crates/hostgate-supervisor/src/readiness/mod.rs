//! Readiness channel between the backend and the host
//!
//! The backend writes a small JSON status document (see
//! [`hostgate_types::ReadinessMessage`]) to a well known file once it is
//! listening. [`ReadinessBus`] owns that file, watches it and turns the first
//! valid message of each start into the published backend address.

pub mod bus;
pub mod watcher;

pub use bus::ReadinessBus;
pub use watcher::{BusWatch, WatchMode, read_message};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Readiness channel I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid readiness message: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Readiness channel path has no parent directory: {0}")]
    NoParent(PathBuf),
}

impl ReadinessError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
