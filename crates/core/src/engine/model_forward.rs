//! ModelForward trait for the forward pass.

use candle_core::{Device, Tensor};

use crate::kv_cache::SequenceInfo;

/// The forward pass the decode loop drives.
///
/// Each call sees the tokens fed this step through `info`, including every
/// sequence's start position and owned cache pages, and returns one
/// `[sequence_length, vocab]` logits tensor per sequence in slot order.
pub trait ModelForward {
    fn compute_logits(&self, info: &SequenceInfo) -> candle_core::Result<Vec<Tensor>>;

    fn device(&self) -> &Device;
}
