//! Storage backend trait definition
//!
//! Defines the async interface the checkpoint reader and writer use to reach
//! shard files.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async trait for storage backends
///
/// Paths are relative to the backend's root, e.g. `.metadata` or
/// `__0_0.distcp`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a whole file
    ///
    /// # Errors
    /// `StoragePathNotFound` if the path doesn't exist, `Storage` otherwise
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Read `length` bytes starting at `offset`
    ///
    /// # Errors
    /// `StoragePathNotFound` if the path doesn't exist, `Storage` if the
    /// file ends before the requested range does
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Write data to the given path
    ///
    /// Creates parent directories if they don't exist. The write is atomic:
    /// data goes to a temporary file which is then renamed into place.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all file paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
