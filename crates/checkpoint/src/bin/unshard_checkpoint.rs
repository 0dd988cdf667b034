//! Command-line entry point for merging a sharded checkpoint
//!
//! ```text
//! unshard-checkpoint <checkpoint_folder> [--output_file <path>]
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use checkpoint::unshard_checkpoint;
use clap::Parser;
use runtime_core::{parse_byte_size, rank_zero_info, RankContext, UnshardConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Merges a sharded checkpoint into a single file.
#[derive(Parser, Debug)]
#[command(name = "unshard-checkpoint")]
#[command(about = "Merges a sharded checkpoint into a single file", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a checkpoint folder containing the `.metadata` file and the
    /// shard files written by the sharded checkpoint writer
    checkpoint_folder: PathBuf,

    /// Path to the file where the merged checkpoint should be saved. The file
    /// must not already exist. If no path is provided, the file is saved next
    /// to the input checkpoint folder with the same name and a '.merged'
    /// suffix
    #[arg(long = "output_file", visible_alias = "output-file")]
    output_file: Option<PathBuf>,

    /// Folder to read shard files and metadata from, if different from the
    /// checkpoint folder
    #[arg(long = "shard_folder", visible_alias = "shard-folder")]
    shard_folder: Option<PathBuf>,

    /// Fail instead of merging when the tensors need more memory than this
    /// (e.g. 512MB, 16GiB)
    #[arg(long = "memory_limit", visible_alias = "memory-limit", value_parser = parse_memory_limit)]
    memory_limit: Option<u64>,
}

fn parse_memory_limit(s: &str) -> std::result::Result<u64, String> {
    parse_byte_size(s).map_err(|e| e.to_string())
}

impl Cli {
    fn into_config(self) -> UnshardConfig {
        UnshardConfig {
            checkpoint_folder: self.checkpoint_folder,
            output_file: self.output_file,
            shard_folder: self.shard_folder,
            memory_limit_bytes: self.memory_limit,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unshard_checkpoint=info,checkpoint=info,storage=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Cli::parse().into_config();
    let folder = config.checkpoint_folder.display().to_string();

    let summary = match unshard_checkpoint(&config).await {
        Ok(summary) => summary,
        Err(e) if e.is_memory_exhausted() => {
            tracing::error!("The whole checkpoint must fit in memory to be merged");
            return Err(e).with_context(|| format!("Failed to merge {}", folder));
        }
        Err(e) if e.is_corrupt_input() => {
            tracing::error!("The checkpoint folder is incomplete or was not written as a sharded checkpoint");
            return Err(e).with_context(|| format!("Failed to merge {}", folder));
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to merge {}", folder)),
    };

    rank_zero_info(
        &RankContext::single_process(),
        &format!(
            "Merged {} tensors ({} bytes) into {}",
            summary.tensor_count,
            summary.total_bytes,
            summary.output_path.display()
        ),
    );
    Ok(())
}
