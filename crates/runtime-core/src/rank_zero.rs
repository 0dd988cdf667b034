//! Rank-zero guards
//!
//! In a distributed job only the primary process should perform side effects
//! such as logging or writing shared files. The process position is passed
//! in explicitly as a [`RankContext`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Position of the current process in a distributed job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankContext {
    rank: usize,
    world_size: usize,
}

impl RankContext {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world size must be at least 1".to_string(),
            });
        }
        if rank >= world_size {
            return Err(Error::InvalidConfig {
                message: format!("rank {} is out of range for world size {}", rank, world_size),
            });
        }
        Ok(Self { rank, world_size })
    }

    /// Context for a plain, non-distributed process
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_global_zero(&self) -> bool {
        self.rank == 0
    }
}

impl Default for RankContext {
    fn default() -> Self {
        Self::single_process()
    }
}

/// Run `f` on rank zero only
pub fn rank_zero_only<T, F>(ctx: &RankContext, f: F) -> Option<T>
where
    F: FnOnce() -> T,
{
    if ctx.is_global_zero() {
        Some(f())
    } else {
        None
    }
}

pub fn rank_zero_debug(ctx: &RankContext, message: &str) {
    if ctx.is_global_zero() {
        debug!(world_size = ctx.world_size, "{}", message);
    }
}

pub fn rank_zero_info(ctx: &RankContext, message: &str) {
    if ctx.is_global_zero() {
        info!(world_size = ctx.world_size, "{}", message);
    }
}

pub fn rank_zero_warn(ctx: &RankContext, message: &str) {
    if ctx.is_global_zero() {
        warn!(world_size = ctx.world_size, "{}", message);
    }
}

/// Deprecation notices go to their own `deprecation` target so they can be
/// filtered independently
pub fn rank_zero_deprecation(ctx: &RankContext, message: &str) {
    if ctx.is_global_zero() {
        warn!(target: "deprecation", world_size = ctx.world_size, "{}", message);
    }
}
