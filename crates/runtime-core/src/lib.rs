//! Runtime Core - Foundation for sharded checkpoint tooling
//!
//! Provides tensor types, error handling, configuration, and the
//! helpers shared by the storage and checkpoint crates: device data
//! movement, accelerator enums and rank-zero guards.

pub mod config;
pub mod device;
pub mod enums;
pub mod error;
pub mod rank_zero;
pub mod types;

pub use config::{default_output_path, parse_byte_size, UnshardConfig};
pub use device::{move_data_to_device, Device, MoveToDevice};
pub use enums::AcceleratorType;
pub use error::{Error, Result};
pub use rank_zero::{
    rank_zero_debug, rank_zero_deprecation, rank_zero_info, rank_zero_only, rank_zero_warn,
    RankContext,
};
pub use types::*;
