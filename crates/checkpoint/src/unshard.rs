//! Merge a sharded checkpoint folder into one consolidated file
//!
//! The whole checkpoint is held in memory at once, plus one chunk while it
//! is being read. `memory_limit_bytes` turns an oversized checkpoint into an
//! error before anything is allocated, and allocation failures are reported
//! rather than aborting.

use std::path::PathBuf;

use runtime_core::{Device, Error, Result, StateDict, Tensor, UnshardConfig};
use tracing::{info, instrument};

use crate::consolidated::{save_consolidated, ConsolidatedMetadata};
use crate::metadata::Metadata;
use crate::reader::FileSystemReader;

/// What a successful merge produced
#[derive(Debug, Clone)]
pub struct UnshardSummary {
    pub output_path: PathBuf,
    pub tensor_count: usize,
    pub total_bytes: u64,
    pub shard_files: Vec<String>,
}

/// Allocate a zeroed CPU tensor for every entry in `metadata`
pub fn allocate_placeholders(metadata: &Metadata) -> Result<StateDict> {
    let mut state = StateDict::new();
    for (fqn, tensor_meta) in &metadata.state_dict_metadata {
        let tensor = Tensor::empty(&tensor_meta.size, tensor_meta.properties.dtype, Device::Cpu)
            .map_err(|e| match e {
                Error::AllocationFailed { bytes, .. } => Error::AllocationFailed {
                    fqn: fqn.clone(),
                    bytes,
                },
                other => other,
            })?;
        state.insert(fqn.clone(), tensor);
    }
    Ok(state)
}

/// Peak tensor memory of a merge: every placeholder plus the one chunk
/// buffer the reader holds while copying
///
/// Writing adds only a fixed-size buffer, since the output is streamed.
pub fn required_memory(metadata: &Metadata) -> u64 {
    metadata
        .total_nbytes()
        .saturating_add(metadata.largest_chunk_nbytes())
}

/// Convert the sharded checkpoint in `config.checkpoint_folder` into a
/// single file
///
/// Shards and metadata are read from `config.shard_source()`. The output
/// must not exist yet; it is written only once every tensor has been read.
#[instrument(skip(config), fields(checkpoint_folder = %config.checkpoint_folder.display()))]
pub async fn unshard_checkpoint(config: &UnshardConfig) -> Result<UnshardSummary> {
    config.validate()?;

    let folder = &config.checkpoint_folder;
    let not_found = || Error::CheckpointFolderNotFound {
        path: folder.display().to_string(),
    };
    match tokio::fs::metadata(folder).await {
        Ok(m) if m.is_dir() => {}
        Ok(_) => return Err(not_found()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(Error::Io(e)),
    }

    let output_path = config.output_path()?;
    if tokio::fs::try_exists(&output_path).await? {
        return Err(Error::OutputExists {
            path: output_path.display().to_string(),
        });
    }

    let reader = FileSystemReader::new(config.shard_source());
    let metadata = reader.read_metadata().await?;

    let total_bytes = metadata.total_nbytes();
    let required_bytes = required_memory(&metadata);
    if let Some(limit) = config.memory_limit_bytes {
        if required_bytes > limit {
            return Err(Error::CheckpointTooLarge {
                required_bytes,
                limit_bytes: limit,
            });
        }
    }
    info!(
        tensors = metadata.tensor_count(),
        total_bytes,
        required_bytes,
        shard_source = %reader.path().display(),
        "Merging sharded checkpoint"
    );

    let mut state = allocate_placeholders(&metadata)?;
    reader.load_state_dict(&metadata, &mut state).await?;

    let shard_files = reader.shard_files().await?;
    let header = ConsolidatedMetadata::new(folder, shard_files.clone(), total_bytes);
    save_consolidated(&output_path, &state, &header).await?;

    Ok(UnshardSummary {
        output_path,
        tensor_count: state.len(),
        total_bytes,
        shard_files,
    })
}
