use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Which update feed is in use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFeedKind {
    #[default]
    Primary,
    Fallback,
}

impl fmt::Display for UpdateFeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateFeedKind::Primary => write!(f, "primary"),
            UpdateFeedKind::Fallback => write!(f, "fallback"),
        }
    }
}

/// Feed selection for the current run; only ever moves primary -> fallback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFeedState {
    pub active: UpdateFeedKind,
}

/// Successful update check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckInfo {
    pub update_available: bool,
    pub current_version: String,
    pub new_version: String,
    pub feed: UpdateFeedKind,
}

/// Failed update check, reported as a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckFailure {
    pub message: String,
    pub error: String,
}

impl UpdateCheckFailure {
    pub fn new(message: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            message: message.into(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for UpdateCheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.error)
    }
}

/// Download progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub transferred: u64,
    pub total: Option<u64>,
    pub percent: f64,
    pub bytes_per_second: u64,
}

/// Events reported while an update downloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    Error { message: String },
}

/// A fully downloaded update ready to be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedUpdate {
    pub version: String,
    pub path: PathBuf,
}
