//! Unshard configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Suffix appended to the checkpoint folder name when no output file is given
pub const MERGED_SUFFIX: &str = "merged";

/// Name of the metadata file inside a sharded checkpoint folder
pub const METADATA_FILE_NAME: &str = ".metadata";

/// Settings for merging one sharded checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnshardConfig {
    /// Folder written by the sharded checkpoint writer
    pub checkpoint_folder: PathBuf,

    /// Destination file, derived from the folder name when unset
    pub output_file: Option<PathBuf>,

    /// Folder the shard reader is pointed at, defaults to `checkpoint_folder`
    pub shard_folder: Option<PathBuf>,

    /// Refuse checkpoints whose tensor payload exceeds this many bytes
    pub memory_limit_bytes: Option<u64>,
}

impl UnshardConfig {
    pub fn new(checkpoint_folder: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_folder: checkpoint_folder.into(),
            ..Default::default()
        }
    }

    pub fn with_output_file(mut self, output_file: impl Into<PathBuf>) -> Self {
        self.output_file = Some(output_file.into());
        self
    }

    pub fn with_shard_folder(mut self, shard_folder: impl Into<PathBuf>) -> Self {
        self.shard_folder = Some(shard_folder.into());
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    /// Where the merged checkpoint is written
    pub fn output_path(&self) -> Result<PathBuf> {
        match &self.output_file {
            Some(path) => Ok(path.clone()),
            None => default_output_path(&self.checkpoint_folder),
        }
    }

    /// Folder the storage reader loads shards and metadata from
    pub fn shard_source(&self) -> &Path {
        self.shard_folder
            .as_deref()
            .unwrap_or(&self.checkpoint_folder)
    }

    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_folder.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                message: "checkpoint folder must not be empty".to_string(),
            });
        }
        if let Some(output) = &self.output_file {
            if output.as_os_str().is_empty() {
                return Err(Error::InvalidConfig {
                    message: "output file must not be empty".to_string(),
                });
            }
        }
        if self.memory_limit_bytes == Some(0) {
            return Err(Error::InvalidConfig {
                message: "memory limit must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Sibling of `checkpoint_folder` with `.merged` appended to its name
///
/// `ckpt_dir` becomes `ckpt_dir.merged` and `epoch=1.ckpt` becomes
/// `epoch=1.ckpt.merged`.
pub fn default_output_path(checkpoint_folder: &Path) -> Result<PathBuf> {
    let name = checkpoint_folder
        .file_name()
        .ok_or_else(|| Error::InvalidConfig {
            message: format!(
                "cannot derive an output file name from {}, pass an explicit output file",
                checkpoint_folder.display()
            ),
        })?;

    let mut merged = name.to_os_string();
    merged.push(".");
    merged.push(MERGED_SUFFIX);
    Ok(checkpoint_folder.with_file_name(merged))
}

/// Parse a byte size such as `512`, `64MB` or `8GiB`
pub fn parse_byte_size(s: &str) -> Result<u64> {
    let normalized = s.trim().to_uppercase();
    let invalid = || Error::InvalidConfig {
        message: format!("Invalid byte size: {}", s),
    };

    const UNITS: [(&str, f64); 6] = [
        ("GIB", 1_073_741_824.0),
        ("MIB", 1_048_576.0),
        ("KIB", 1_024.0),
        ("GB", 1_000_000_000.0),
        ("MB", 1_000_000.0),
        ("KB", 1_000.0),
    ];

    for (suffix, multiplier) in UNITS {
        if let Some(number) = normalized.strip_suffix(suffix) {
            let value: f64 = number.trim().parse().map_err(|_| invalid())?;
            if !value.is_finite() || value < 0.0 {
                return Err(invalid());
            }
            return Ok((value * multiplier) as u64);
        }
    }

    normalized
        .strip_suffix('B')
        .unwrap_or(&normalized)
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid())
}
