//! Small persistent key-value store kept as a JSON object on disk

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CLIENT_ID_KEY: &str = "clientId";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode store value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Store write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Key-value preferences persisted to a single JSON file.
///
/// Every write replaces the file atomically.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl Store {
    /// Load the store at `path`. A missing file is an empty store; a corrupt
    /// one is logged and replaced on the next write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Preferences file is corrupt, starting empty");
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        debug!(path = %path.display(), keys = data.len(), "Opened preferences store");
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock().await;
        let value = data.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key, error = %e, "Stored value has unexpected shape");
                None
            }
        }
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).await
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        let mut data = self.data.lock().await;
        let mut updated = data.clone();
        updated.insert(key.to_string(), value);
        self.persist(&updated).await?;
        *data = updated;
        Ok(())
    }

    pub async fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set(key, &value).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        if !data.contains_key(key) {
            return Ok(false);
        }
        let mut updated = data.clone();
        updated.remove(key);
        self.persist(&updated).await?;
        *data = updated;
        Ok(true)
    }

    /// Stable anonymous id for this installation, created on first use
    pub async fn client_id(&self) -> Result<String, StoreError> {
        if let Some(id) = self.get_string(CLIENT_ID_KEY).await {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set_string(CLIENT_ID_KEY, &id).await?;
        Ok(id)
    }

    async fn persist(&self, data: &Map<String, Value>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(data)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await??;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;

    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
