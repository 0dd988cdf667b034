//! Local filesystem storage backend
//!
//! Async file I/O rooted at a checkpoint directory. Writes go through a
//! temporary file and a rename so partial files are never visible. Outputs
//! that must not replace anything are published with a no-clobber link.

use std::io::{BufWriter, ErrorKind, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at `base_path`
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path to a full path
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Generate a unique temporary file path next to the target
    fn temp_path(&self, path: &str) -> PathBuf {
        let full_path = self.resolve_path(path);
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    /// Create `path` from the bytes `fill` streams out, never replacing an
    /// existing file
    ///
    /// `fill` writes through a buffer into a temporary file next to the
    /// target. The temporary file is linked into place only if nothing exists
    /// there yet, otherwise the call fails with [`Error::OutputExists`] and
    /// the temporary file is removed. Blocking.
    #[instrument(skip(self, fill), fields(backend = "local"))]
    pub fn write_new_with<F>(&self, path: &str, fill: F) -> Result<u64>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let full_path = self.resolve_path(path);
        let parent = match full_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| Error::Storage {
            message: format!("Failed to create directory {:?}: {}", parent, e),
        })?;

        let mut temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| Error::Storage {
                message: format!("Failed to create temp file in {:?}: {}", parent, e),
            })?;
        debug!(?full_path, temp_path = ?temp.path(), "Streaming new file");

        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            fill(&mut writer)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        let size = temp.as_file().metadata()?.len();

        temp.persist_noclobber(&full_path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                Error::OutputExists {
                    path: full_path.display().to_string(),
                }
            } else {
                Error::Storage {
                    message: format!("Failed to publish {:?}: {}", full_path, e.error),
                }
            }
        })?;

        debug!(?full_path, size, "File written successfully");
        Ok(size)
    }

    fn map_read_error(path: &str, e: std::io::Error) -> Error {
        if e.kind() == ErrorKind::NotFound {
            Error::StoragePathNotFound {
                path: path.to_string(),
            }
        } else {
            Error::Storage {
                message: format!("Failed to read {}: {}", path, e),
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Reading file");

        fs::read(&full_path)
            .await
            .map(Bytes::from)
            .map_err(|e| Self::map_read_error(path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, offset, length, "Reading byte range");

        let mut file = fs::File::open(&full_path)
            .await
            .map_err(|e| Self::map_read_error(path, e))?;

        let file_len = file
            .metadata()
            .await
            .map_err(|e| Self::map_read_error(path, e))?
            .len();
        let end = offset.checked_add(length).ok_or_else(|| Error::Storage {
            message: format!("Byte range overflows for {}", path),
        })?;
        if end > file_len {
            return Err(Error::Storage {
                message: format!(
                    "Range {}..{} is past the end of {} ({} bytes)",
                    offset, end, path, file_len
                ),
            });
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Self::map_read_error(path, e))?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(length as usize)
            .map_err(|_| Error::AllocationFailed {
                fqn: format!("{}@{}", path, offset),
                bytes: length,
            })?;
        buf.resize(length as usize, 0);
        file.read_exact(&mut buf)
            .await
            .map_err(|e| Self::map_read_error(path, e))?;

        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = self.temp_path(path);
        let size = data.len() as u64;

        debug!(?full_path, ?temp_path, size, "Writing file atomically");

        if let Some(parent) = full_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Storage {
                        message: format!("Failed to create directory {:?}: {}", parent, e),
                    })?;
            }
        }

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create temp file {:?}: {}", temp_path, e),
            })?;

        let written = async {
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!("Failed to write {:?}: {}", temp_path, e),
            });
        }
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!("Failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            });
        }

        debug!(?full_path, size, "File written successfully");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path);
        Ok(fs::metadata(&full_path).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Storage {
                        message: format!("Failed to list {:?}: {}", dir, e),
                    })
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    stack.push(entry_path);
                } else if file_type.is_file() {
                    if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                        let relative_str = relative.to_string_lossy().to_string();
                        if relative_str.starts_with(prefix) {
                            results.push(relative_str);
                        }
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Found files");
        Ok(results)
    }
}
