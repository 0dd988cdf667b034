//! Sharded checkpoint reading, writing and consolidation
//!
//! A sharded checkpoint is a folder holding a `.metadata` file and one
//! `__<rank>_0.distcp` file per rank. [`unshard_checkpoint`] reads such a
//! folder in a single process and writes one consolidated file that
//! [`load_consolidated`] can load without any distributed setup.

mod codec;

pub mod chunk;
pub mod consolidated;
pub mod metadata;
pub mod reader;
pub mod unshard;
pub mod writer;

pub use consolidated::{
    load_consolidated, read_consolidated_header, save_consolidated, ConsolidatedHeader,
    ConsolidatedMetadata,
};
pub use metadata::{Metadata, TensorStorageMetadata};
pub use reader::FileSystemReader;
pub use unshard::{allocate_placeholders, required_memory, unshard_checkpoint, UnshardSummary};
pub use writer::{plan_row_shards, save_sharded, FileSystemWriter, LocalShard};
