//! End-to-end tests for merging sharded checkpoints
//!
//! Each test writes a sharded checkpoint to a temporary folder, runs the
//! unshard operation, and loads the consolidated file back.

use anyhow::Result;
use checkpoint::metadata::{
    ChunkStorageMetadata, MetadataIndex, StorageInfo, TensorProperties, TensorStorageMetadata,
};
use checkpoint::{
    load_consolidated, read_consolidated_header, save_sharded, unshard_checkpoint,
    FileSystemWriter, LocalShard, Metadata,
};
use runtime_core::{
    move_data_to_device, DType, Device, Error, RankContext, StateDict, Tensor, UnshardConfig,
};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A small model state covering every dtype and a few awkward shapes
fn model_state() -> Result<StateDict> {
    let mut state = StateDict::new();

    let weight: Vec<f32> = (0..42).map(|v| (v as f32).sin()).collect();
    state.insert("decoder.proj.weight".into(), Tensor::from_slice(&[7, 6], &weight)?);

    let bias: Vec<f64> = (0..7).map(|v| 1.0 / (v as f64 + 1.0)).collect();
    state.insert("decoder.proj.bias".into(), Tensor::from_slice(&[7], &bias)?);

    let cube: Vec<u8> = (0..60).collect();
    state.insert("buffers.cube".into(), Tensor::from_slice(&[5, 3, 4], &cube)?);

    let quantized: Vec<i8> = (-8..8).collect();
    state.insert("quant.values".into(), Tensor::from_slice(&[4, 4], &quantized)?);

    let halves: Vec<u8> = (0..24).map(|v| v * 7).collect();
    state.insert("norm.scale".into(), Tensor::from_bytes(&[3, 4], DType::BF16, halves)?);

    state.insert("mask".into(), Tensor::from_bytes(&[5], DType::Bool, vec![1, 0, 0, 1, 1])?);
    state.insert("optimizer.step".into(), Tensor::from_slice(&[], &[1234i64])?);
    state.insert("empty.rows".into(), Tensor::from_slice::<f32>(&[0, 4], &[])?);

    Ok(state)
}

fn folder_listing(folder: &Path) -> Result<Vec<(String, u64)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        entries.push((
            entry.file_name().to_string_lossy().to_string(),
            entry.metadata()?.len(),
        ));
    }
    entries.sort();
    Ok(entries)
}

#[tokio::test]
async fn test_roundtrip_is_bit_identical() -> Result<()> {
    init_tracing();
    let state = model_state()?;

    for world_size in 1..=4 {
        let dir = tempdir()?;
        let folder = dir.path().join(format!("ws{}", world_size));
        save_sharded(&folder, &state, world_size).await?;

        let summary = unshard_checkpoint(&UnshardConfig::new(&folder)).await?;
        let merged = load_consolidated(&summary.output_path).await?;

        assert_eq!(merged.len(), state.len());
        for (name, original) in &state {
            let restored = &merged[name];
            assert_eq!(restored.shape(), original.shape(), "{}", name);
            assert_eq!(restored.dtype(), original.dtype(), "{}", name);
            assert_eq!(restored.as_bytes(), original.as_bytes(), "{}", name);
        }
        assert_eq!(summary.shard_files.len(), world_size);
    }
    Ok(())
}

#[tokio::test]
async fn test_column_sharded_checkpoint() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let folder = dir.path().join("tp");

    // 4 x 6 matrix split into two column blocks, as tensor parallel training would
    let full: Vec<i32> = (0..24).collect();
    let left: Vec<i32> = full.chunks(6).flat_map(|row| row[..2].to_vec()).collect();
    let right: Vec<i32> = full.chunks(6).flat_map(|row| row[2..].to_vec()).collect();

    let writer = FileSystemWriter::new(&folder);
    let rank0 = RankContext::new(0, 2)?;
    let rank1 = RankContext::new(1, 2)?;
    let r0 = writer
        .write_rank(
            &rank0,
            &[LocalShard {
                fqn: "attn.qkv".into(),
                global_size: vec![4, 6],
                offsets: vec![0, 0],
                tensor: Tensor::from_slice(&[4, 2], &left)?,
            }],
        )
        .await?;
    let r1 = writer
        .write_rank(
            &rank1,
            &[LocalShard {
                fqn: "attn.qkv".into(),
                global_size: vec![4, 6],
                offsets: vec![0, 2],
                tensor: Tensor::from_slice(&[4, 4], &right)?,
            }],
        )
        .await?;
    assert!(writer.finish(&rank1, vec![]).await?.is_none());
    writer.finish(&rank0, vec![r0, r1]).await?;

    let summary = unshard_checkpoint(&UnshardConfig::new(&folder)).await?;
    let merged = load_consolidated(&summary.output_path).await?;
    assert_eq!(merged["attn.qkv"].shape(), &[4, 6]);
    assert_eq!(merged["attn.qkv"].to_vec::<i32>()?, full);
    Ok(())
}

#[tokio::test]
async fn test_default_output_name() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt_dir");
    save_sharded(&folder, &model_state()?, 2).await?;

    let summary = unshard_checkpoint(&UnshardConfig::new(&folder)).await?;
    assert_eq!(summary.output_path, dir.path().join("ckpt_dir.merged"));
    assert!(summary.output_path.is_file());

    let dotted = dir.path().join("epoch=3.ckpt");
    save_sharded(&dotted, &model_state()?, 2).await?;
    let summary = unshard_checkpoint(&UnshardConfig::new(&dotted)).await?;
    assert_eq!(summary.output_path, dir.path().join("epoch=3.ckpt.merged"));
    Ok(())
}

#[tokio::test]
async fn test_input_folder_untouched() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    save_sharded(&folder, &model_state()?, 3).await?;
    let before = folder_listing(&folder)?;

    unshard_checkpoint(&UnshardConfig::new(&folder)).await?;

    assert_eq!(folder_listing(&folder)?, before);
    Ok(())
}

#[tokio::test]
async fn test_missing_metadata() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    save_sharded(&folder, &model_state()?, 2).await?;
    std::fs::remove_file(folder.join(".metadata"))?;

    let err = unshard_checkpoint(&UnshardConfig::new(&folder)).await.unwrap_err();
    assert!(matches!(err, Error::MetadataNotFound { .. }), "{}", err);
    assert!(!dir.path().join("ckpt.merged").exists());
    Ok(())
}

#[tokio::test]
async fn test_corrupt_metadata() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    save_sharded(&folder, &model_state()?, 2).await?;
    std::fs::write(folder.join(".metadata"), b"\x80\x04 pickled bytes")?;

    let err = unshard_checkpoint(&UnshardConfig::new(&folder)).await.unwrap_err();
    assert!(matches!(err, Error::MetadataCorrupted { .. }), "{}", err);
    assert!(!dir.path().join("ckpt.merged").exists());
    Ok(())
}

#[tokio::test]
async fn test_existing_output_is_not_overwritten() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    save_sharded(&folder, &model_state()?, 2).await?;
    let target = dir.path().join("merged.bin");
    std::fs::write(&target, b"earlier result")?;

    let config = UnshardConfig::new(&folder).with_output_file(&target);
    let err = unshard_checkpoint(&config).await.unwrap_err();
    assert!(matches!(err, Error::OutputExists { .. }), "{}", err);
    assert_eq!(std::fs::read(&target)?, b"earlier result");
    Ok(())
}

#[tokio::test]
async fn test_memory_limit_fails_before_writing() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    let metadata = save_sharded(&folder, &model_state()?, 2).await?;
    let total = metadata.total_nbytes();

    let config = UnshardConfig::new(&folder).with_memory_limit(total - 1);
    let err = unshard_checkpoint(&config).await.unwrap_err();
    assert!(err.is_memory_exhausted());
    assert!(!dir.path().join("ckpt.merged").exists());
    Ok(())
}

#[tokio::test]
async fn test_shard_folder_override() -> Result<()> {
    let dir = tempdir()?;
    let named = dir.path().join("model.ckpt");
    let shards = dir.path().join("shards");
    std::fs::create_dir_all(&named)?;
    save_sharded(&shards, &model_state()?, 2).await?;

    let err = unshard_checkpoint(&UnshardConfig::new(&named)).await.unwrap_err();
    assert!(matches!(err, Error::MetadataNotFound { .. }));

    let config = UnshardConfig::new(&named).with_shard_folder(&shards);
    let summary = unshard_checkpoint(&config).await?;
    assert_eq!(summary.output_path, dir.path().join("model.ckpt.merged"));

    let header = read_consolidated_header(&summary.output_path).await?;
    assert_eq!(header.metadata.source, named.display().to_string());
    assert_eq!(header.metadata.shard_files.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_shard_file_leaves_no_output() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    save_sharded(&folder, &model_state()?, 3).await?;
    std::fs::remove_file(folder.join("__2_0.distcp"))?;

    let err = unshard_checkpoint(&UnshardConfig::new(&folder)).await.unwrap_err();
    assert!(matches!(err, Error::StoragePathNotFound { .. }), "{}", err);
    assert!(!dir.path().join("ckpt.merged").exists());
    Ok(())
}

#[tokio::test]
async fn test_truncated_shard_file() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    save_sharded(&folder, &model_state()?, 2).await?;

    let shard = folder.join("__1_0.distcp");
    let bytes = std::fs::read(&shard)?;
    std::fs::write(&shard, &bytes[..bytes.len() / 2])?;

    let err = unshard_checkpoint(&UnshardConfig::new(&folder)).await.unwrap_err();
    assert!(matches!(err, Error::Storage { .. }), "{}", err);
    assert!(!dir.path().join("ckpt.merged").exists());
    Ok(())
}

#[tokio::test]
async fn test_metadata_cannot_point_outside_folder() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    std::fs::create_dir_all(&folder)?;
    std::fs::write(dir.path().join("secret.txt"), b"TOPSECRT")?;

    let mut tensors = BTreeMap::new();
    tensors.insert(
        "x".to_string(),
        TensorStorageMetadata {
            properties: TensorProperties { dtype: DType::U8 },
            size: vec![8],
            chunks: vec![ChunkStorageMetadata {
                offsets: vec![0],
                sizes: vec![8],
            }],
        },
    );
    let mut storage = BTreeMap::new();
    storage.insert(
        MetadataIndex {
            fqn: "x".to_string(),
            offset: vec![0],
        },
        StorageInfo {
            relative_path: "../secret.txt".to_string(),
            offset: 0,
            length: 8,
        },
    );
    std::fs::write(folder.join(".metadata"), Metadata::new(tensors, storage).encode()?)?;

    let err = unshard_checkpoint(&UnshardConfig::new(&folder)).await.unwrap_err();
    assert!(matches!(err, Error::MetadataCorrupted { .. }), "{}", err);
    assert!(!dir.path().join("ckpt.merged").exists());
    Ok(())
}

#[tokio::test]
async fn test_merged_state_moves_to_device() -> Result<()> {
    let dir = tempdir()?;
    let folder = dir.path().join("ckpt");
    save_sharded(&folder, &model_state()?, 2).await?;

    let summary = unshard_checkpoint(&UnshardConfig::new(&folder)).await?;
    let merged = load_consolidated(&summary.output_path).await?;
    assert!(merged.values().all(|t| t.device().is_cpu()));

    let on_gpu = move_data_to_device(merged, "cuda:1".parse::<Device>()?);
    assert!(on_gpu.values().all(|t| t.device() == Device::Cuda(1)));
    Ok(())
}
