//! Blob storage for uploaded files and proto bundles.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file {0} not found")]
    NotFound(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blob-by-key storage used for body files and proto bundles.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn upload_file(&self, file_id: &str, data: Vec<u8>) -> Result<String, StorageError>;
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, StorageError>;
    async fn delete_file(&self, file_id: &str) -> Result<(), StorageError>;
}

/// Filesystem-backed storage rooted at a configurable directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LocalStorageConfig {
    pub storage_path: String,
    /// Places the storage directory under the system temp dir, which is the
    /// right default for test servers.
    pub use_temp_dir: bool,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            storage_path: "uploaded_files".to_string(),
            use_temp_dir: true,
        }
    }
}

impl LocalStorage {
    pub fn new(config: LocalStorageConfig) -> Self {
        let root = if config.use_temp_dir {
            std::env::temp_dir().join(&config.storage_path)
        } else {
            PathBuf::from(&config.storage_path)
        };

        Self { root }
    }

    fn file_path(&self, file_id: &str) -> PathBuf {
        // File ids are opaque keys; never let them escape the root
        let name = Path::new(file_id)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| file_id.replace('/', "_").into());
        self.root.join(name)
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn upload_file(&self, file_id: &str, data: Vec<u8>) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.file_path(file_id);
        tokio::fs::write(&path, data).await?;
        info!("uploaded file {file_id} to {}", path.display());
        Ok(file_id.to_string())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.file_path(file_id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(file_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), StorageError> {
        let path = self.file_path(file_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
