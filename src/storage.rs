//! # Storage Abstraction Module
//!
//! Unified interface for reading objects from the local filesystem and from
//! HTTP object stores. The catalog document, the catalog
//! table and the consolidated zarr metadata all go through this layer.
//!
//! ## Path Patterns
//!
//! - **HTTP paths**: `https://storage.googleapis.com/cmip6/pangeo-cmip6.json`
//! - **GCS paths**: `gs://cmip6/CMIP6/...` (read through the public HTTPS endpoint)
//! - **Local paths**: `/absolute/path/to/file` or `relative/path/to/file`
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use cm4fetch::storage::{StorageFactory, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = StorageFactory::from_path("gs://cmip6/pangeo-cmip6.json")?;
//!     let data = storage.read("gs://cmip6/pangeo-cmip6.json").await?;
//!     println!("{} bytes", data.len());
//!     Ok(())
//! }
//! ```

use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// Public HTTPS endpoint serving Google Cloud Storage buckets
pub const GCS_HTTP_ENDPOINT: &str = "https://storage.googleapis.com";

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid path format: {0}")]
    InvalidPath(String),
}

impl StorageError {
    /// Network failures and server-side errors may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Http(_) => true,
            StorageError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait defining the interface for storage backends
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads the entire contents of an object
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;
}

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStorage;

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        match fs::read(path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::PathNotFound(path.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::PermissionDenied(path.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Read-only HTTP(S) storage backend
///
/// `gs://bucket/key` locations are rewritten to the public GCS endpoint, so the
/// anonymous CMIP6 bucket can be read without credentials.
#[derive(Debug, Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
}

impl HttpStorage {
    pub fn new() -> Self {
        HttpStorage {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for HttpStorage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let url = to_http_url(path)?;
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::PathNotFound(url));
        }
        if !status.is_success() {
            return Err(StorageError::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Rewrites a `gs://` location to its public HTTPS URL; HTTP URLs pass through.
pub fn to_http_url(path: &str) -> StorageResult<String> {
    if let Some(rest) = path.strip_prefix("gs://") {
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() || rest.starts_with('/') {
            return Err(StorageError::InvalidPath(format!(
                "Expected 'gs://bucket/key': {}",
                path
            )));
        }
        Ok(format!("{}/{}", GCS_HTTP_ENDPOINT, rest))
    } else if path.starts_with("http://") || path.starts_with("https://") {
        Ok(path.to_string())
    } else {
        Err(StorageError::InvalidPath(format!(
            "Not a remote location: {}",
            path
        )))
    }
}

/// Joins a relative object name onto a base location (local directory or URL).
pub fn join_location(base: &str, name: &str) -> String {
    if StorageFactory::is_remote_path(base) {
        format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
    } else {
        Path::new(base).join(name).to_string_lossy().to_string()
    }
}

/// Parent location of an object, used to resolve relative catalog files.
pub fn parent_location(path: &str) -> String {
    if StorageFactory::is_remote_path(path) {
        match path.rfind('/') {
            Some(idx) if idx > path.find("//").map(|i| i + 1).unwrap_or(0) => {
                path[..idx].to_string()
            }
            _ => path.to_string(),
        }
    } else {
        Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Storage backend enumeration
#[derive(Debug)]
pub enum Storage {
    Local(LocalStorage),
    Http(HttpStorage),
}

#[async_trait::async_trait]
impl StorageBackend for Storage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        match self {
            Storage::Local(storage) => storage.read(path).await,
            Storage::Http(storage) => storage.read(path).await,
        }
    }
}

/// Factory for creating storage backends based on path patterns
///
/// - Paths starting with `gs://`, `http://` or `https://` use [`HttpStorage`]
/// - All other paths use [`LocalStorage`]
pub struct StorageFactory;

impl StorageFactory {
    pub fn from_path(path: &str) -> StorageResult<Storage> {
        if Self::is_remote_path(path) {
            Ok(Storage::Http(HttpStorage::new()))
        } else {
            Ok(Storage::Local(LocalStorage))
        }
    }

    pub fn is_remote_path(path: &str) -> bool {
        path.starts_with("gs://") || path.starts_with("http://") || path.starts_with("https://")
    }
}


#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires network access to the public CMIP6 bucket
    async fn test_http_storage_real_catalog() -> Result<(), Box<dyn std::error::Error>> {
        let storage = StorageFactory::from_path(crate::config::DEFAULT_CATALOG_URL)?;
        let data = storage.read(crate::config::DEFAULT_CATALOG_URL).await?;
        assert!(!data.is_empty());
        Ok(())
    }
}
