//! Deterministic stand-in for a language model.

use candle_core::{Device, Tensor};
use microbatch_core::engine::ModelForward;
use microbatch_core::kv_cache::SequenceInfo;

/// Scores each position from its token id and absolute position only, so
/// every rank computes identical logits without weights or a cache.
pub struct SyntheticModel {
    vocab_size: usize,
    device: Device,
}

impl SyntheticModel {
    pub fn new(vocab_size: usize, device: Device) -> Self {
        Self { vocab_size, device }
    }

    /// Token the model favours after `token` at `position`.
    pub fn preferred_successor(&self, token: u32, position: usize) -> usize {
        (token as usize * 31 + position * 7 + 1) % self.vocab_size
    }

    fn row(&self, token: u32, position: usize) -> impl Iterator<Item = f32> + '_ {
        let peak = self.preferred_successor(token, position);
        (0..self.vocab_size).map(move |i| {
            if i == peak {
                8.0
            } else {
                ((token as usize + i) % 13) as f32 * 0.1
            }
        })
    }
}

impl ModelForward for SyntheticModel {
    fn compute_logits(&self, info: &SequenceInfo) -> candle_core::Result<Vec<Tensor>> {
        info.input_ids()
            .iter()
            .zip(info.input_positions())
            .map(|(ids, &start)| {
                let data: Vec<f32> = ids
                    .iter()
                    .enumerate()
                    .flat_map(|(offset, &token)| self.row(token, start + offset))
                    .collect();
                Tensor::from_vec(data, (ids.len(), self.vocab_size), &self.device)
            })
            .collect()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
