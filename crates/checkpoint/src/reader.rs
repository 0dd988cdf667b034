//! File-system reader for sharded checkpoints

use std::path::Path;

use runtime_core::config::METADATA_FILE_NAME;
use runtime_core::{Error, Result, StateDict};
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, info, instrument};

use crate::chunk::copy_chunk_into;
use crate::metadata::Metadata;

/// Extension of shard data files
pub const SHARD_FILE_EXTENSION: &str = ".distcp";

/// Reads metadata and chunk data from a checkpoint folder
#[derive(Debug, Clone)]
pub struct FileSystemReader {
    storage: LocalStorage,
}

impl FileSystemReader {
    /// Create a reader for the checkpoint folder at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            storage: LocalStorage::new(path),
        }
    }

    /// Folder this reader loads from
    pub fn path(&self) -> &Path {
        self.storage.base_path()
    }

    /// Read and validate the `.metadata` file
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub async fn read_metadata(&self) -> Result<Metadata> {
        let metadata_path = self.storage.resolve_path(METADATA_FILE_NAME);
        let display_path = metadata_path.display().to_string();

        let bytes = self
            .storage
            .read(METADATA_FILE_NAME)
            .await
            .map_err(|e| match e {
                Error::StoragePathNotFound { .. } => Error::MetadataNotFound {
                    path: display_path.clone(),
                },
                other => Error::MetadataCorrupted {
                    path: display_path.clone(),
                    reason: other.to_string(),
                },
            })?;

        let metadata = Metadata::decode(&bytes, &display_path)?;
        debug!(
            tensors = metadata.tensor_count(),
            chunks = metadata.storage_data.len(),
            "Read checkpoint metadata"
        );
        Ok(metadata)
    }

    /// Shard data files present in the folder
    pub async fn shard_files(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list("")
            .await?
            .into_iter()
            .filter(|name| name.ends_with(SHARD_FILE_EXTENSION))
            .collect())
    }

    /// Fill every tensor of `state` from the shard files
    ///
    /// Each placeholder must match the metadata entry of the same name in
    /// shape and dtype. Tensors in the metadata but not in `state` are
    /// skipped.
    #[instrument(skip(self, metadata, state), fields(path = %self.path().display(), tensors = state.len()))]
    pub async fn load_state_dict(&self, metadata: &Metadata, state: &mut StateDict) -> Result<()> {
        let folder = self.path().display().to_string();
        let mut bytes_read = 0u64;

        for (fqn, tensor) in state.iter_mut() {
            let tensor_meta = metadata
                .state_dict_metadata
                .get(fqn)
                .ok_or_else(|| Error::MissingTensor { fqn: fqn.clone() })?;

            if tensor.dtype() != tensor_meta.properties.dtype {
                return Err(Error::DTypeMismatch {
                    expected: tensor_meta.properties.dtype.to_string(),
                    actual: tensor.dtype().to_string(),
                });
            }
            if tensor.shape() != tensor_meta.size.as_slice() {
                return Err(Error::ShapeMismatch {
                    fqn: fqn.clone(),
                    expected: tensor_meta.size.clone(),
                    actual: tensor.shape().to_vec(),
                });
            }
            tensor_meta
                .check_coverage()
                .map_err(|reason| Error::CheckpointCorrupted {
                    path: folder.clone(),
                    reason: format!("{}: {}", fqn, reason),
                })?;

            for chunk in &tensor_meta.chunks {
                let info = metadata.storage_for(fqn, &chunk.offsets).ok_or_else(|| {
                    Error::CheckpointCorrupted {
                        path: folder.clone(),
                        reason: format!("{}: no storage for chunk at {:?}", fqn, chunk.offsets),
                    }
                })?;

                let data = self
                    .storage
                    .read_range(&info.relative_path, info.offset, info.length)
                    .await?;
                copy_chunk_into(fqn, tensor, chunk, &data)?;
                bytes_read += info.length;

                debug!(
                    fqn = %fqn,
                    file = %info.relative_path,
                    offsets = ?chunk.offsets,
                    length = info.length,
                    "Loaded chunk"
                );
            }
        }

        info!(bytes_read, "Loaded sharded state");
        Ok(())
    }
}
