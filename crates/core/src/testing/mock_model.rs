use std::cell::Cell;

use candle_core::{DType, Device, Tensor};

use crate::engine::ModelForward;
use crate::kv_cache::SequenceInfo;

/// Returns zero logits of the right shape for every sequence, so greedy
/// decoding always picks token 0.
pub struct MockModelForward {
    vocab_size: usize,
    device: Device,
}

impl MockModelForward {
    pub fn new(vocab_size: usize, device: Device) -> Self {
        Self { vocab_size, device }
    }

    pub fn cpu(vocab_size: usize) -> Self {
        Self::new(vocab_size, Device::Cpu)
    }
}

impl ModelForward for MockModelForward {
    fn compute_logits(&self, info: &SequenceInfo) -> candle_core::Result<Vec<Tensor>> {
        info.sequence_lengths()
            .iter()
            .map(|&len| Tensor::zeros((len, self.vocab_size), DType::F32, &self.device))
            .collect()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Emits a fixed token script per sequence: at decode step `s`, sequence
/// `b` gets a sharp peak on `scripts[b][s]` (token 0 once the script runs
/// out). A call where every position is 0 is taken as the prefill step.
pub struct ScriptedModel {
    vocab_size: usize,
    scripts: Vec<Vec<u32>>,
    device: Device,
    step: Cell<usize>,
    calls: Cell<usize>,
}

impl ScriptedModel {
    pub fn cpu(vocab_size: usize, scripts: Vec<Vec<u32>>) -> Self {
        Self {
            vocab_size,
            scripts,
            device: Device::Cpu,
            step: Cell::new(0),
            calls: Cell::new(0),
        }
    }

    /// Forward passes run so far.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    fn token_for(&self, sequence: usize, step: usize) -> usize {
        self.scripts
            .get(sequence)
            .and_then(|s| s.get(step))
            .map_or(0, |&t| t as usize)
    }
}

impl ModelForward for ScriptedModel {
    fn compute_logits(&self, info: &SequenceInfo) -> candle_core::Result<Vec<Tensor>> {
        let step = if info.input_positions().iter().all(|&p| p == 0) {
            0
        } else {
            self.step.get() + 1
        };
        self.step.set(step);
        self.calls.set(self.calls.get() + 1);

        info.sequence_lengths()
            .iter()
            .enumerate()
            .map(|(b, &len)| {
                let target = self.token_for(b, step) % self.vocab_size;
                let mut data = vec![-10.0f32; len * self.vocab_size];
                for row in data.chunks_mut(self.vocab_size) {
                    row[target] = 10.0;
                }
                Tensor::from_vec(data, (len, self.vocab_size), &self.device)
            })
            .collect()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Predicts `(last input token + 1) % vocab` for every sequence, so the
/// output depends only on the request and not on how it was batched.
pub struct EchoModel {
    vocab_size: usize,
    device: Device,
}

impl EchoModel {
    pub fn cpu(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            device: Device::Cpu,
        }
    }
}

impl ModelForward for EchoModel {
    fn compute_logits(&self, info: &SequenceInfo) -> candle_core::Result<Vec<Tensor>> {
        info.input_ids()
            .iter()
            .map(|ids| {
                let mut data = vec![0.0f32; ids.len() * self.vocab_size];
                for (row, &token) in data.chunks_mut(self.vocab_size).zip(ids) {
                    row[(token as usize + 1) % self.vocab_size] = 1.0;
                }
                Tensor::from_vec(data, (ids.len(), self.vocab_size), &self.device)
            })
            .collect()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
