//! Application self-update
//!
//! Releases are looked up on a primary feed; once that fails the coordinator
//! switches to the GitHub release feed for the rest of the run.

pub mod coordinator;
pub mod feed;
pub mod version;

pub use coordinator::UpdateCoordinator;
pub use feed::{
    GenericFeed, GitHubReleaseFeed, ManifestFile, ReleaseManifest, UpdateFeed, channel_file,
};
pub use version::{Version, VersionError};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Invalid release manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("Invalid release description: {0}")]
    Release(String),

    #[error("Release {release} has no {name} asset")]
    MissingAsset { name: String, release: String },

    #[error("Invalid download url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("Release manifest lists no files")]
    NoFiles,

    #[error("No update available to download")]
    NoPendingUpdate,

    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(PathBuf),

    #[error("Update I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
