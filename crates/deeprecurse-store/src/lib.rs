use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

mod remote;

pub use remote::RemoteContextStore;

const LOG_EXT: &str = "log";
const KEY_EXT: &str = "key";

/// Keyed, append-only text log. Appends to one key are applied one at a time;
/// different keys never wait on each other.
#[async_trait]
pub trait ContextStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Full log for `key`, or an empty string when the key was never written.
    async fn read(&self, key: &str) -> Result<String, StoreError>;

    /// Appends `text` and returns only after the write is durable.
    async fn append(&self, key: &str, text: &str) -> Result<(), StoreError>;

    /// Like `append`, but writes `separator` first when the log already has
    /// content. The emptiness check happens under the same per-key turn as the
    /// write.
    async fn append_separated(
        &self,
        key: &str,
        separator: &str,
        text: &str,
    ) -> Result<(), StoreError>;

    /// Every written key starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("stored log for key {key} is not valid utf-8")]
    Corrupt { key: String },
    #[error("log file for key {key} already belongs to another key")]
    KeyCollision { key: String },
    #[error("remote store error: status={status}, body={body}")]
    Remote { status: u16, body: String },
}

/// One log file per key under `root`, named by the SHA-256 of the key so any
/// key length maps to a bounded file name that stays inside the root. A
/// `.key` sidecar holds the original key for listing and collision checks.
pub struct FileContextStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct KeyPaths {
    log: PathBuf,
    key: PathBuf,
}

impl FileContextStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        self.paths_for(key).map(|paths| paths.log)
    }

    fn paths_for(&self, key: &str) -> Result<KeyPaths, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
        }
        let stem = hash_key(key);
        Ok(KeyPaths {
            log: self.root.join(format!("{stem}.{LOG_EXT}")),
            key: self.root.join(format!("{stem}.{KEY_EXT}")),
        })
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // Drops the registry entry once nobody else holds or waits on it.
    fn release_key(&self, key: &str) {
        let mut locks = self.locks.lock();
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }

    async fn read_locked(path: &Path, key: &str) -> Result<String, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| StoreError::Corrupt {
                key: key.to_string(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    // The sidecar is durable before the first log byte is written.
    async fn claim_key(path: &Path, key: &str) -> Result<(), StoreError> {
        match tokio::fs::read(path).await {
            Ok(stored) if stored == key.as_bytes() => Ok(()),
            Ok(_) => Err(StoreError::KeyCollision {
                key: key.to_string(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let mut file = tokio::fs::File::create(path).await?;
                file.write_all(key.as_bytes()).await?;
                file.flush().await?;
                file.sync_data().await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn append_locked(
        paths: &KeyPaths,
        key: &str,
        separator: &str,
        text: &str,
    ) -> Result<(), StoreError> {
        Self::claim_key(&paths.key, key).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.log)
            .await?;
        let committed_len = file.metadata().await?.len();
        let separator = if committed_len > 0 { separator } else { "" };

        let written = async {
            file.write_all(separator.as_bytes()).await?;
            file.write_all(text.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(err) = written {
            // Roll the log back to the last acknowledged length.
            if let Err(truncate_err) = file.set_len(committed_len).await {
                warn!(
                    path = %paths.log.display(),
                    error = %truncate_err,
                    "failed to roll back partial append"
                );
            }
            return Err(err.into());
        }
        Ok(())
    }

    async fn append_with(&self, key: &str, separator: &str, text: &str) -> Result<(), StoreError> {
        let paths = self.paths_for(key)?;
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            Self::append_locked(&paths, key, separator, text).await
        };
        drop(lock);
        self.release_key(key);
        if result.is_ok() {
            debug!(key, bytes = text.len(), "appended to context log");
        }
        result
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn read(&self, key: &str) -> Result<String, StoreError> {
        let paths = self.paths_for(key)?;
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            Self::read_locked(&paths.log, key).await
        };
        drop(lock);
        self.release_key(key);
        result
    }

    async fn append(&self, key: &str, text: &str) -> Result<(), StoreError> {
        self.append_with(key, "", text).await
    }

    async fn append_separated(
        &self,
        key: &str,
        separator: &str,
        text: &str,
    ) -> Result<(), StoreError> {
        self.append_with(key, separator, text).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_EXT) {
                continue;
            }
            let stored = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let Ok(key) = String::from_utf8(stored) else {
                warn!(path = %path.display(), "skipping unreadable key sidecar");
                continue;
            };
            // A sidecar whose first append never landed names no log.
            let has_log = tokio::fs::try_exists(path.with_extension(LOG_EXT))
                .await
                .unwrap_or(false);
            if has_log && key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
