//! Sharded checkpoint metadata
//!
//! The `.metadata` file describes every tensor of a sharded checkpoint: its
//! global size and dtype, the chunks it was split into, and where in which
//! shard file each chunk's bytes live.

use runtime_core::types::{checked_nbytes, checked_numel};
use runtime_core::{DType, Error, Result, TensorName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::codec;

/// Magic bytes at the start of a metadata record
pub const METADATA_MAGIC: [u8; 4] = *b"DCPM";

/// Metadata format version
pub const METADATA_VERSION: u32 = 1;

/// Per-tensor properties needed to allocate a placeholder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TensorProperties {
    pub dtype: DType,
}

/// One rectangular block of a tensor, in global coordinates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkStorageMetadata {
    pub offsets: Vec<usize>,
    pub sizes: Vec<usize>,
}

impl ChunkStorageMetadata {
    pub fn numel(&self) -> Option<usize> {
        checked_numel(&self.sizes)
    }

    fn overlaps(&self, other: &ChunkStorageMetadata) -> bool {
        self.offsets
            .iter()
            .zip(&self.sizes)
            .zip(other.offsets.iter().zip(&other.sizes))
            .all(|((&a_off, &a_len), (&b_off, &b_len))| {
                a_off < b_off.saturating_add(b_len) && b_off < a_off.saturating_add(a_len)
            })
    }
}

/// Global description of one tensor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TensorStorageMetadata {
    pub properties: TensorProperties,
    pub size: Vec<usize>,
    pub chunks: Vec<ChunkStorageMetadata>,
}

impl TensorStorageMetadata {
    /// Payload size in bytes, `None` if it overflows
    pub fn nbytes(&self) -> Option<usize> {
        checked_nbytes(&self.size, self.properties.dtype)
    }

    /// Check that the chunks tile the tensor exactly once
    ///
    /// Returns the reason when they don't.
    pub fn check_coverage(&self) -> std::result::Result<(), String> {
        let expected = checked_numel(&self.size).ok_or("tensor size overflows")?;

        let mut covered = 0usize;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let numel = chunk.numel().ok_or("chunk size overflows")?;
            if numel == 0 {
                continue;
            }
            if let Some(other) = self.chunks[..i]
                .iter()
                .find(|other| other.numel() != Some(0) && chunk.overlaps(other))
            {
                return Err(format!(
                    "chunk at {:?} overlaps chunk at {:?}",
                    chunk.offsets, other.offsets
                ));
            }
            covered = covered.saturating_add(numel);
        }

        if covered != expected {
            return Err(format!(
                "chunks cover {} of {} elements",
                covered, expected
            ));
        }
        Ok(())
    }
}

/// Key of a chunk's storage location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetadataIndex {
    pub fqn: TensorName,
    pub offset: Vec<usize>,
}

/// Byte range of a chunk inside a shard file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageInfo {
    pub relative_path: String,
    pub offset: u64,
    pub length: u64,
}

/// Contents of a checkpoint's `.metadata` file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    magic: [u8; 4],
    version: u32,
    pub state_dict_metadata: BTreeMap<TensorName, TensorStorageMetadata>,
    pub storage_data: BTreeMap<MetadataIndex, StorageInfo>,
}

impl Metadata {
    pub fn new(
        state_dict_metadata: BTreeMap<TensorName, TensorStorageMetadata>,
        storage_data: BTreeMap<MetadataIndex, StorageInfo>,
    ) -> Self {
        Self {
            magic: METADATA_MAGIC,
            version: METADATA_VERSION,
            state_dict_metadata,
            storage_data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec::encode(self)?)
    }

    /// Decode and validate a metadata record read from `path`
    pub fn decode(bytes: &[u8], path: &str) -> Result<Self> {
        let corrupted = |reason: String| Error::MetadataCorrupted {
            path: path.to_string(),
            reason,
        };

        if bytes.len() < METADATA_MAGIC.len() || bytes[..METADATA_MAGIC.len()] != METADATA_MAGIC {
            return Err(corrupted("not a checkpoint metadata file".to_string()));
        }

        let metadata: Metadata = codec::decode(bytes).map_err(|e| corrupted(e.to_string()))?;
        if metadata.version != METADATA_VERSION {
            return Err(corrupted(format!(
                "unsupported metadata version {} (expected {})",
                metadata.version, METADATA_VERSION
            )));
        }
        metadata.validate().map_err(corrupted)?;
        Ok(metadata)
    }

    /// Storage location of the chunk of `fqn` starting at `offsets`
    pub fn storage_for(&self, fqn: &str, offsets: &[usize]) -> Option<&StorageInfo> {
        self.storage_data.get(&MetadataIndex {
            fqn: fqn.to_string(),
            offset: offsets.to_vec(),
        })
    }

    /// Sum of all tensor payloads in bytes
    pub fn total_nbytes(&self) -> u64 {
        self.state_dict_metadata
            .values()
            .map(|t| t.nbytes().map_or(u64::MAX, |n| n as u64))
            .fold(0u64, u64::saturating_add)
    }

    /// Size of the biggest single chunk, which the reader buffers while
    /// copying it into place
    pub fn largest_chunk_nbytes(&self) -> u64 {
        self.storage_data.values().map(|info| info.length).max().unwrap_or(0)
    }

    pub fn tensor_count(&self) -> usize {
        self.state_dict_metadata.len()
    }

    /// Structural checks: chunk geometry and storage entries
    fn validate(&self) -> std::result::Result<(), String> {
        for (fqn, tensor) in &self.state_dict_metadata {
            let dtype = tensor.properties.dtype;
            if tensor.nbytes().is_none() {
                return Err(format!("{}: size {:?} overflows", fqn, tensor.size));
            }

            for chunk in &tensor.chunks {
                let rank = tensor.size.len();
                if chunk.offsets.len() != rank || chunk.sizes.len() != rank {
                    return Err(format!(
                        "{}: chunk at {:?} has {} dims, tensor has {}",
                        fqn,
                        chunk.offsets,
                        chunk.sizes.len(),
                        rank
                    ));
                }

                let in_bounds = chunk
                    .offsets
                    .iter()
                    .zip(&chunk.sizes)
                    .zip(&tensor.size)
                    .all(|((&off, &len), &dim)| off.checked_add(len).is_some_and(|end| end <= dim));
                if !in_bounds {
                    return Err(format!(
                        "{}: chunk at {:?} with sizes {:?} exceeds size {:?}",
                        fqn, chunk.offsets, chunk.sizes, tensor.size
                    ));
                }

                let info = self
                    .storage_for(fqn, &chunk.offsets)
                    .ok_or_else(|| format!("{}: no storage for chunk at {:?}", fqn, chunk.offsets))?;
                let expected = checked_nbytes(&chunk.sizes, dtype)
                    .ok_or_else(|| format!("{}: chunk size overflows", fqn))?;
                if info.length != expected as u64 {
                    return Err(format!(
                        "{}: chunk at {:?} stores {} bytes, expected {}",
                        fqn, chunk.offsets, info.length, expected
                    ));
                }
            }
        }

        if let Some((index, info)) = self
            .storage_data
            .iter()
            .find(|(_, info)| !is_plain_file_name(&info.relative_path))
        {
            return Err(format!(
                "{}: shard path {:?} is not a file name in the checkpoint folder",
                index.fqn, info.relative_path
            ));
        }

        if let Some(orphan) = self
            .storage_data
            .keys()
            .find(|index| !self.state_dict_metadata.contains_key(&index.fqn))
        {
            return Err(format!("storage entry for unknown tensor {}", orphan.fqn));
        }

        Ok(())
    }
}

/// Shard files live directly in the checkpoint folder
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    !name.contains(['/', '\\'])
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
}
