//! Consolidated (single-file) checkpoint format
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! magic "CKPT" | version u32 | tensor_count u64 | data_size u64
//! | metadata_len u32 | metadata_json | payload (data_size bytes)
//! ```
//!
//! The payload is the bincode-encoded state dict.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use runtime_core::{Error, Result, StateDict};
use serde::{Deserialize, Serialize};
use storage::{LocalStorage, StorageBackend};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument};

use crate::codec;

/// Magic bytes for consolidated checkpoint files
pub const CONSOLIDATED_MAGIC: [u8; 4] = *b"CKPT";

/// Consolidated format version
pub const CONSOLIDATED_VERSION: u32 = 2;

/// Fixed-size part of the header: magic, version, tensor count, data size,
/// metadata length
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4;

/// Provenance recorded in the header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidatedMetadata {
    /// Checkpoint folder the file was merged from
    pub source: String,

    /// When the merge finished
    pub created_at: DateTime<Utc>,

    /// Shard files that were read
    pub shard_files: Vec<String>,

    /// Tensor payload size in bytes
    pub total_bytes: u64,
}

impl ConsolidatedMetadata {
    pub fn new(source: &Path, shard_files: Vec<String>, total_bytes: u64) -> Self {
        Self {
            source: source.display().to_string(),
            created_at: Utc::now(),
            shard_files,
            total_bytes,
        }
    }
}

/// Consolidated file header
#[derive(Debug, Clone)]
pub struct ConsolidatedHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub data_size: u64,
    pub metadata: ConsolidatedMetadata,
}

/// Stream `state` with its header into `writer`
///
/// The payload is encoded directly into `writer`, so no second copy of the
/// tensor data is built. Returns the number of bytes written.
pub fn write_consolidated<W: Write>(
    mut writer: W,
    state: &StateDict,
    metadata: &ConsolidatedMetadata,
) -> Result<u64> {
    let data_size = codec::encoded_size(state)?;
    let metadata_json = serde_json::to_vec(metadata)?;
    let metadata_len = u32::try_from(metadata_json.len()).map_err(|_| Error::Internal {
        message: format!("header metadata of {} bytes is too large", metadata_json.len()),
    })?;

    writer.write_all(&CONSOLIDATED_MAGIC)?;
    writer.write_all(&CONSOLIDATED_VERSION.to_le_bytes())?;
    writer.write_all(&(state.len() as u64).to_le_bytes())?;
    writer.write_all(&data_size.to_le_bytes())?;
    writer.write_all(&metadata_len.to_le_bytes())?;
    writer.write_all(&metadata_json)?;
    codec::encode_into(&mut writer, state)?;

    Ok(FIXED_HEADER_LEN as u64 + metadata_json.len() as u64 + data_size)
}

/// Serialize `state` with its header into one buffer
pub fn encode_consolidated(state: &StateDict, metadata: &ConsolidatedMetadata) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_consolidated(&mut buf, state, metadata)?;
    Ok(buf)
}

fn parse_fixed_header(path: &str, fixed: &[u8; FIXED_HEADER_LEN]) -> Result<(u32, u64, u64, u32)> {
    if fixed[..4] != CONSOLIDATED_MAGIC {
        return Err(Error::CheckpointCorrupted {
            path: path.to_string(),
            reason: "invalid checkpoint magic".to_string(),
        });
    }

    let u32_at = |at: usize| u32::from_le_bytes([fixed[at], fixed[at + 1], fixed[at + 2], fixed[at + 3]]);
    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&fixed[at..at + 8]);
        u64::from_le_bytes(bytes)
    };

    let version = u32_at(4);
    if version != CONSOLIDATED_VERSION {
        return Err(Error::CheckpointCorrupted {
            path: path.to_string(),
            reason: format!(
                "unsupported checkpoint version {} (expected {})",
                version, CONSOLIDATED_VERSION
            ),
        });
    }

    Ok((version, u64_at(8), u64_at(16), u32_at(24)))
}

fn parse_metadata(path: &str, bytes: &[u8]) -> Result<ConsolidatedMetadata> {
    serde_json::from_slice(bytes).map_err(|e| Error::CheckpointCorrupted {
        path: path.to_string(),
        reason: format!("invalid header metadata: {}", e),
    })
}

/// Split a consolidated file into header and state dict
pub fn decode_consolidated(path: &str, bytes: &[u8]) -> Result<(ConsolidatedHeader, StateDict)> {
    let truncated = || Error::CheckpointCorrupted {
        path: path.to_string(),
        reason: "file is truncated".to_string(),
    };

    let fixed: &[u8; FIXED_HEADER_LEN] = bytes
        .get(..FIXED_HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(truncated)?;
    let (version, tensor_count, data_size, metadata_len) = parse_fixed_header(path, fixed)?;

    let metadata_end = FIXED_HEADER_LEN + metadata_len as usize;
    let metadata = parse_metadata(path, bytes.get(FIXED_HEADER_LEN..metadata_end).ok_or_else(truncated)?)?;

    let payload_end = usize::try_from(data_size)
        .ok()
        .and_then(|size| metadata_end.checked_add(size))
        .ok_or_else(truncated)?;
    let payload = bytes.get(metadata_end..payload_end).ok_or_else(truncated)?;
    if payload_end != bytes.len() {
        return Err(Error::CheckpointCorrupted {
            path: path.to_string(),
            reason: format!("{} trailing bytes", bytes.len() - payload_end),
        });
    }

    let state: StateDict = codec::decode(payload).map_err(|e| Error::CheckpointCorrupted {
        path: path.to_string(),
        reason: format!("invalid payload: {}", e),
    })?;
    if state.len() as u64 != tensor_count {
        return Err(Error::CheckpointCorrupted {
            path: path.to_string(),
            reason: format!("header lists {} tensors, payload has {}", tensor_count, state.len()),
        });
    }
    for (fqn, tensor) in &state {
        tensor.validate().map_err(|e| Error::CheckpointCorrupted {
            path: path.to_string(),
            reason: format!("{}: {}", fqn, e),
        })?;
    }

    let header = ConsolidatedHeader {
        version,
        tensor_count,
        data_size,
        metadata,
    };
    Ok((header, state))
}

/// Write a consolidated checkpoint to `path`
///
/// Refuses to replace an existing file, including one that appears while
/// the payload is being written. The payload is streamed to a temporary
/// file that is linked into place at the end, so a failure part way leaves
/// nothing behind and memory use stays at one buffer beyond `state`.
#[instrument(skip(state, metadata), fields(path = %path.display(), tensors = state.len()))]
pub async fn save_consolidated(path: &Path, state: &StateDict, metadata: &ConsolidatedMetadata) -> Result<u64> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidConfig {
            message: format!("output path {} has no file name", path.display()),
        })?
        .to_string_lossy()
        .to_string();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let storage = LocalStorage::new(parent);

    if storage.exists(&file_name).await? {
        return Err(Error::OutputExists {
            path: path.display().to_string(),
        });
    }

    let start = std::time::Instant::now();
    let size = storage.write_new_with(&file_name, |writer| {
        write_consolidated(writer, state, metadata).map(|_| ())
    })?;
    let elapsed = start.elapsed();

    info!(
        size_bytes = size,
        elapsed_ms = elapsed.as_millis(),
        throughput_mbps = (size as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON),
        "Consolidated checkpoint written"
    );
    Ok(size)
}

/// Read only the header of a consolidated checkpoint
pub async fn read_consolidated_header(path: &Path) -> Result<ConsolidatedHeader> {
    let display_path = path.display().to_string();
    let mut file = File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::StoragePathNotFound {
            path: display_path.clone(),
        },
        _ => Error::Io(e),
    })?;

    let mut fixed = [0u8; FIXED_HEADER_LEN];
    file.read_exact(&mut fixed).await.map_err(|_| Error::CheckpointCorrupted {
        path: display_path.clone(),
        reason: "file is truncated".to_string(),
    })?;
    let (version, tensor_count, data_size, metadata_len) = parse_fixed_header(&display_path, &fixed)?;

    let file_len = file.metadata().await?.len();
    let declared_len = (FIXED_HEADER_LEN as u64)
        .checked_add(u64::from(metadata_len))
        .and_then(|len| len.checked_add(data_size));
    if declared_len.map_or(true, |len| len > file_len) {
        return Err(Error::CheckpointCorrupted {
            path: display_path,
            reason: format!(
                "header declares {} metadata and {} payload bytes, file has {}",
                metadata_len, data_size, file_len
            ),
        });
    }

    let mut metadata_bytes = vec![0u8; metadata_len as usize];
    file.read_exact(&mut metadata_bytes)
        .await
        .map_err(|_| Error::CheckpointCorrupted {
            path: display_path.clone(),
            reason: "file is truncated".to_string(),
        })?;

    Ok(ConsolidatedHeader {
        version,
        tensor_count,
        data_size,
        metadata: parse_metadata(&display_path, &metadata_bytes)?,
    })
}

/// Load a consolidated checkpoint written by [`save_consolidated`]
pub async fn load_consolidated(path: &Path) -> Result<StateDict> {
    let display_path = path.display().to_string();
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::StoragePathNotFound {
            path: display_path.clone(),
        },
        _ => Error::Io(e),
    })?;

    let (header, state) = decode_consolidated(&display_path, &bytes)?;
    debug!(
        path = %display_path,
        tensors = header.tensor_count,
        source = %header.metadata.source,
        "Loaded consolidated checkpoint"
    );
    Ok(state)
}
