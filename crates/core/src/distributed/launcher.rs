//! Rank discovery from the environment.
//!
//! - `RANK`: global rank (default 0)
//! - `WORLD_SIZE`: number of ranks (default 1)
//! - `LOCAL_RANK`: rank on this host (defaults to `RANK`)

use std::env;

use super::error::Result;
use super::process_group::LocalProcessGroup;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl DistributedConfig {
    /// Read the rank layout, falling back to a single rank when unset.
    pub fn from_env() -> Self {
        let rank = env_usize("RANK").unwrap_or(0);
        let world_size = env_usize("WORLD_SIZE").unwrap_or(1);
        let local_rank = env_usize("LOCAL_RANK").unwrap_or(rank);
        Self {
            rank,
            world_size,
            local_rank,
        }
    }

    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn process_group(&self) -> Result<LocalProcessGroup> {
        LocalProcessGroup::with_rank(self.rank, self.world_size)
    }
}
