//! File-system writer for sharded checkpoints
//!
//! Every rank writes the chunks it owns into its own `__<rank>_0.distcp`
//! file. Rank zero then gathers the chunk records and writes `.metadata`.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use runtime_core::config::METADATA_FILE_NAME;
use runtime_core::{rank_zero_only, DType, Error, RankContext, Result, StateDict, Tensor, TensorName};
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, info, instrument};

use crate::chunk::extract_chunk;
use crate::metadata::{
    ChunkStorageMetadata, Metadata, MetadataIndex, StorageInfo, TensorProperties,
    TensorStorageMetadata,
};
use crate::reader::SHARD_FILE_EXTENSION;

/// The part of a global tensor held by one rank
#[derive(Debug, Clone)]
pub struct LocalShard {
    pub fqn: TensorName,
    pub global_size: Vec<usize>,
    pub offsets: Vec<usize>,
    pub tensor: Tensor,
}

impl LocalShard {
    fn chunk(&self) -> ChunkStorageMetadata {
        ChunkStorageMetadata {
            offsets: self.offsets.clone(),
            sizes: self.tensor.shape().to_vec(),
        }
    }
}

/// Where one rank stored one chunk
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub fqn: TensorName,
    pub dtype: DType,
    pub global_size: Vec<usize>,
    pub chunk: ChunkStorageMetadata,
    pub storage: StorageInfo,
}

/// Name of the shard file written by `rank`
pub fn shard_file_name(rank: usize) -> String {
    format!("__{}_0{}", rank, SHARD_FILE_EXTENSION)
}

/// Split every tensor of `state` along its first dimension across ranks
///
/// Rows are dealt out as evenly as possible, earlier ranks taking the
/// remainder. Scalars and tensors with no rows belong to rank 0 alone.
pub fn plan_row_shards(state: &StateDict, world_size: usize) -> Result<Vec<Vec<LocalShard>>> {
    if world_size == 0 {
        return Err(Error::InvalidConfig {
            message: "world size must be at least 1".to_string(),
        });
    }

    let mut plan: Vec<Vec<LocalShard>> = vec![Vec::new(); world_size];
    for (fqn, tensor) in state {
        let shape = tensor.shape();
        let rows = shape.first().copied().unwrap_or(0);

        if rows == 0 {
            plan[0].push(LocalShard {
                fqn: fqn.clone(),
                global_size: shape.to_vec(),
                offsets: vec![0; shape.len()],
                tensor: tensor.clone(),
            });
            continue;
        }

        let base = rows / world_size;
        let remainder = rows % world_size;
        let mut start = 0;
        for (rank, shards) in plan.iter_mut().enumerate() {
            let count = base + usize::from(rank < remainder);
            if count == 0 {
                continue;
            }

            let mut offsets = vec![0; shape.len()];
            offsets[0] = start;
            let mut sizes = shape.to_vec();
            sizes[0] = count;

            let chunk = ChunkStorageMetadata { offsets, sizes };
            let data = extract_chunk(fqn, tensor, &chunk)?;
            shards.push(LocalShard {
                fqn: fqn.clone(),
                global_size: shape.to_vec(),
                offsets: chunk.offsets,
                tensor: Tensor::from_bytes(&chunk.sizes, tensor.dtype(), data)?,
            });
            start += count;
        }
    }

    Ok(plan)
}

/// Writes a sharded checkpoint into a folder
#[derive(Debug, Clone)]
pub struct FileSystemWriter {
    storage: LocalStorage,
}

impl FileSystemWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            storage: LocalStorage::new(path),
        }
    }

    /// Write the shards owned by `ctx`'s rank into its shard file
    #[instrument(skip(self, shards), fields(rank = ctx.rank(), shards = shards.len()))]
    pub async fn write_rank(&self, ctx: &RankContext, shards: &[LocalShard]) -> Result<Vec<WriteResult>> {
        let relative_path = shard_file_name(ctx.rank());
        let mut buffer = Vec::new();
        let mut results = Vec::with_capacity(shards.len());

        for shard in shards {
            let chunk = shard.chunk();
            let in_bounds = chunk.offsets.len() == shard.global_size.len()
                && chunk.sizes.len() == shard.global_size.len()
                && chunk
                    .offsets
                    .iter()
                    .zip(&chunk.sizes)
                    .zip(&shard.global_size)
                    .all(|((&off, &len), &dim)| off.checked_add(len).is_some_and(|end| end <= dim));
            if !in_bounds {
                return Err(Error::ShapeMismatch {
                    fqn: shard.fqn.clone(),
                    expected: shard.global_size.clone(),
                    actual: chunk.sizes,
                });
            }

            let offset = buffer.len() as u64;
            buffer.extend_from_slice(shard.tensor.as_bytes());
            results.push(WriteResult {
                fqn: shard.fqn.clone(),
                dtype: shard.tensor.dtype(),
                global_size: shard.global_size.clone(),
                chunk,
                storage: StorageInfo {
                    relative_path: relative_path.clone(),
                    offset,
                    length: shard.tensor.nbytes() as u64,
                },
            });
        }

        let size = self
            .storage
            .write(&relative_path, Bytes::from(buffer))
            .await?;
        debug!(file = %relative_path, size_bytes = size, "Shard file written");

        Ok(results)
    }

    /// Gather every rank's write results and write `.metadata`
    ///
    /// Only rank zero writes; other ranks get `None`.
    pub async fn finish(&self, ctx: &RankContext, results: Vec<Vec<WriteResult>>) -> Result<Option<Metadata>> {
        let Some(metadata) = rank_zero_only(ctx, || build_metadata(results)).transpose()? else {
            return Ok(None);
        };

        let size = self
            .storage
            .write(METADATA_FILE_NAME, Bytes::from(metadata.encode()?))
            .await?;
        info!(
            path = %self.storage.base_path().display(),
            tensors = metadata.tensor_count(),
            size_bytes = size,
            "Sharded checkpoint metadata written"
        );

        Ok(Some(metadata))
    }
}

fn build_metadata(results: Vec<Vec<WriteResult>>) -> Result<Metadata> {
    let mut tensors: BTreeMap<TensorName, TensorStorageMetadata> = BTreeMap::new();
    let mut storage_data = BTreeMap::new();

    for result in results.into_iter().flatten() {
        let entry = tensors
            .entry(result.fqn.clone())
            .or_insert_with(|| TensorStorageMetadata {
                properties: TensorProperties { dtype: result.dtype },
                size: result.global_size.clone(),
                chunks: Vec::new(),
            });

        if entry.properties.dtype != result.dtype {
            return Err(Error::DTypeMismatch {
                expected: entry.properties.dtype.to_string(),
                actual: result.dtype.to_string(),
            });
        }
        if entry.size != result.global_size {
            return Err(Error::ShapeMismatch {
                fqn: result.fqn,
                expected: entry.size.clone(),
                actual: result.global_size,
            });
        }

        let index = MetadataIndex {
            fqn: result.fqn.clone(),
            offset: result.chunk.offsets.clone(),
        };
        if storage_data.insert(index, result.storage).is_some() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "{} has two chunks at offsets {:?}",
                    result.fqn, result.chunk.offsets
                ),
            });
        }
        entry.chunks.push(result.chunk);
    }

    Ok(Metadata::new(tensors, storage_data))
}

/// Shard `state` row-wise across `world_size` ranks and write it to `folder`
///
/// All ranks run in this process, one after another.
pub async fn save_sharded<P: AsRef<Path>>(folder: P, state: &StateDict, world_size: usize) -> Result<Metadata> {
    let writer = FileSystemWriter::new(folder);
    let plan = plan_row_shards(state, world_size)?;

    let mut results = Vec::with_capacity(world_size);
    for (rank, shards) in plan.iter().enumerate() {
        let ctx = RankContext::new(rank, world_size)?;
        results.push(writer.write_rank(&ctx, shards).await?);
    }

    let primary = RankContext::new(0, world_size)?;
    writer
        .finish(&primary, results)
        .await?
        .ok_or_else(|| Error::Internal {
            message: "rank zero did not produce checkpoint metadata".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state() -> StateDict {
        let mut state = StateDict::new();
        let values: Vec<i32> = (0..10).collect();
        state.insert("rows".into(), Tensor::from_slice(&[5, 2], &values).unwrap());
        state.insert("step".into(), Tensor::from_slice(&[], &[7i64]).unwrap());
        state
    }

    #[test]
    fn test_plan_row_split() {
        let plan = plan_row_shards(&state(), 3).unwrap();
        let rows: Vec<Vec<(usize, usize)>> = plan
            .iter()
            .map(|shards| {
                shards
                    .iter()
                    .filter(|s| s.fqn == "rows")
                    .map(|s| (s.offsets[0], s.tensor.shape()[0]))
                    .collect()
            })
            .collect();
        assert_eq!(rows, vec![vec![(0, 2)], vec![(2, 2)], vec![(4, 1)]]);

        // scalar lives on rank 0 only
        let scalar_ranks: Vec<usize> = plan
            .iter()
            .enumerate()
            .filter(|(_, shards)| shards.iter().any(|s| s.fqn == "step"))
            .map(|(rank, _)| rank)
            .collect();
        assert_eq!(scalar_ranks, vec![0]);
    }

    #[test]
    fn test_plan_more_ranks_than_rows() {
        let plan = plan_row_shards(&state(), 8).unwrap();
        let holders = plan
            .iter()
            .filter(|shards| shards.iter().any(|s| s.fqn == "rows"))
            .count();
        assert_eq!(holders, 5);
        assert!(plan_row_shards(&state(), 0).is_err());
    }

    #[tokio::test]
    async fn test_only_rank_zero_writes_metadata() {
        let dir = tempdir().unwrap();
        let writer = FileSystemWriter::new(dir.path());
        let secondary = RankContext::new(1, 2).unwrap();

        let result = writer.finish(&secondary, Vec::new()).await.unwrap();
        assert!(result.is_none());
        assert!(!dir.path().join(METADATA_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_save_sharded_layout() {
        let dir = tempdir().unwrap();
        let metadata = save_sharded(dir.path(), &state(), 2).await.unwrap();

        assert!(dir.path().join(".metadata").exists());
        assert!(dir.path().join("__0_0.distcp").exists());
        assert!(dir.path().join("__1_0.distcp").exists());
        assert_eq!(metadata.tensor_count(), 2);
        assert_eq!(metadata.state_dict_metadata["rows"].chunks.len(), 2);

        // rank 0 holds rows 0..3 followed by the scalar
        let rank0 = std::fs::metadata(dir.path().join("__0_0.distcp")).unwrap();
        assert_eq!(rank0.len(), 3 * 2 * 4 + 8);
    }

    #[tokio::test]
    async fn test_conflicting_shards_rejected() {
        let dir = tempdir().unwrap();
        let writer = FileSystemWriter::new(dir.path());
        let ctx = RankContext::single_process();

        let shard = |size: Vec<usize>| LocalShard {
            fqn: "w".into(),
            global_size: size,
            offsets: vec![0],
            tensor: Tensor::from_slice(&[2], &[1.0f32, 2.0]).unwrap(),
        };
        let a = writer.write_rank(&ctx, &[shard(vec![4])]).await.unwrap();
        let b = writer.write_rank(&ctx, &[shard(vec![6])]).await.unwrap();

        let err = writer.finish(&ctx, vec![a, b]).await.unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
