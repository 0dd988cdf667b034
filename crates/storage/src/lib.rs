//! Storage - Backends for checkpoint shard and metadata files
//!
//! Provides async storage operations over a root directory:
//! - Whole-file and ranged reads (a shard chunk is a byte range)
//! - Atomic writes, so a reader never observes a half-written file
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoint");
//! storage.write("__0_0.distcp", Bytes::from(vec![1, 2, 3, 4])).await?;
//! let chunk = storage.read_range("__0_0.distcp", 1, 2).await?;
//! assert_eq!(&chunk[..], &[2, 3]);
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
