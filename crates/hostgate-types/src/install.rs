use serde::{Deserialize, Serialize};

/// Store key holding the digest of the last successfully installed lock file
pub const LOCK_HASH_KEY: &str = "lockHash";

/// Digest of a dependency lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHash {
    pub algorithm: String,
    pub digest_hex: String,
}

impl LockHash {
    pub fn md5(digest_hex: impl Into<String>) -> Self {
        Self {
            algorithm: "md5".to_string(),
            digest_hex: digest_hex.into(),
        }
    }

    /// Byte-for-byte comparison against a persisted digest
    pub fn matches(&self, stored: &str) -> bool {
        self.digest_hex.as_bytes() == stored.as_bytes()
    }
}

/// What `ensure` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    /// No lock file, nothing to install
    Skipped,
    /// Lock file unchanged and dependencies present
    UpToDate,
    /// Dependencies were (re)installed
    Installed,
}
