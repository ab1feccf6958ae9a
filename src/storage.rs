//! File storage for produced audio and feed manifests.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Location of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub key: String,
    pub size_bytes: i64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
    #[error("storage io error for '{key}': {source}")]
    Io {
        key: String,
        source: std::io::Error,
    },
}

#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Copies a local file into storage under `key`. Readers never observe
    /// a partially written object.
    async fn store(&self, local_path: &Path, key: &str) -> Result<StoredFile, StorageError>;

    /// Writes `bytes` under `key`, replacing any previous object atomically.
    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<StoredFile, StorageError>;

    /// Public URL of the object stored under `key`.
    fn url_for(&self, key: &str) -> String;
}

fn is_key_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Storage key for the audio file of a content id. Ids that need escaping
/// get a digest suffix so distinct ids never share a key.
pub fn audio_key(content_id: &str) -> String {
    if !content_id.is_empty() && content_id.chars().all(is_key_safe) {
        return format!("audio/{content_id}.mp3");
    }

    let safe: String = content_id
        .chars()
        .map(|c| if is_key_safe(c) { c } else { '_' })
        .collect();
    let digest = Sha256::digest(content_id.as_bytes());
    format!("audio/{safe}-{}.mp3", hex::encode(&digest[..8]))
}

/// Filesystem-backed storage served by the API under `/api/files`.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(key, source))?;
        }
        Ok(())
    }
}

fn staging_path(destination: &Path) -> PathBuf {
    destination.with_extension(format!("{}.tmp", Uuid::new_v4().simple()))
}

/// Moves a fully written staging file over `destination`.
async fn publish(staging: &Path, destination: &Path, key: &str) -> Result<(), StorageError> {
    if let Err(source) = tokio::fs::rename(staging, destination).await {
        let _ = tokio::fs::remove_file(staging).await;
        return Err(io_error(key, source));
    }
    Ok(())
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store(&self, local_path: &Path, key: &str) -> Result<StoredFile, StorageError> {
        let destination = self.resolve(key)?;
        self.ensure_parent(key, &destination).await?;

        let staging = staging_path(&destination);
        let size = match tokio::fs::copy(local_path, &staging).await {
            Ok(size) => size,
            Err(source) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(io_error(key, source));
            }
        };
        publish(&staging, &destination, key).await?;

        debug!(key, size, "stored file");
        Ok(StoredFile {
            key: key.to_string(),
            size_bytes: size as i64,
        })
    }

    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<StoredFile, StorageError> {
        let destination = self.resolve(key)?;
        self.ensure_parent(key, &destination).await?;

        let staging = staging_path(&destination);
        if let Err(source) = tokio::fs::write(&staging, bytes).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io_error(key, source));
        }
        publish(&staging, &destination, key).await?;

        Ok(StoredFile {
            key: key.to_string(),
            size_bytes: bytes.len() as i64,
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/api/files/{}", self.public_base_url, key)
    }
}
