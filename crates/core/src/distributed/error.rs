//! Error types for collective operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistributedError {
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Participants contributed tensors of different shapes.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A peer panicked while holding the rendezvous.
    #[error("collective rendezvous poisoned")]
    Poisoned,

    #[error("rank {rank} did not contribute to the collective")]
    MissingContribution { rank: usize },

    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
