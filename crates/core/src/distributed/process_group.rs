//! Rank identity within a group of decode workers.

use super::error::{DistributedError, Result};

/// Identity of one participant in a collective group.
pub trait ProcessGroup: Send + Sync {
    /// Global rank (0..world_size).
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Rank on this host.
    fn local_rank(&self) -> usize;

    /// Rank 0 owns the outbound result channel.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Process group that lives entirely in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// A single-rank group.
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// A group member with an explicit rank.
    pub fn with_rank(rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.rank
    }
}
