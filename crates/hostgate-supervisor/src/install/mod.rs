//! Backend dependency installation
//!
//! Dependencies are (re)installed when the backend's lock file digest differs
//! from the one recorded after the last successful install.

pub mod hash;
pub mod installer;
pub mod log;

pub use hash::lock_file_digest;
pub use installer::DependencyInstaller;
pub use log::{FINISH_MARKER, InstallLog};

use crate::process::ProcessError;
use crate::store::StoreError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start {step}: {source}")]
    Spawn {
        step: &'static str,
        #[source]
        source: ProcessError,
    },

    #[error("{step} exited with code {code:?}")]
    Failed {
        step: &'static str,
        code: Option<i32>,
    },

    #[error("{step} did not finish within {timeout_secs}s")]
    Timeout { step: &'static str, timeout_secs: u64 },

    #[error("Failed to record lock file digest: {0}")]
    Store(#[from] StoreError),
}
