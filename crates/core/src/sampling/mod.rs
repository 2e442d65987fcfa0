//! Token sampling for the batched decode loop.
//!
//! - Greedy decoding: argmax of the raw logits.
//! - Top-k: temperature scaling, top-k masking, softmax, then one draw per
//!   row with the exponential-noise trick.

mod batched;

pub use batched::{greedy_search, logits_to_probs, multinomial_sample_one_no_sync, sample_tokens};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Parameters shared by every request of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Maximum number of generated tokens.
    pub max_tokens: usize,
    /// `None` selects greedy decoding.
    pub top_k: Option<usize>,
    /// Only read on the top-k path; defaults to 1.0 there.
    pub temperature: Option<f32>,
    /// Token sequences that end generation when they appear as a suffix.
    pub stop_words: Vec<Vec<u32>>,
    /// Keep the matched stop tokens in the output.
    pub include_stop_str_in_output: bool,
    pub return_generation_logits: bool,
    pub return_context_logits: bool,
    /// Only 1 is supported.
    pub best_of: usize,
    /// Reseeds the engine sampler before the batch when set.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 16,
            top_k: None,
            temperature: None,
            stop_words: Vec::new(),
            include_stop_str_in_output: false,
            return_generation_logits: false,
            return_context_logits: false,
            best_of: 1,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.top_k.is_none()
    }
}

/// Random source for the noise draws of one engine.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// One draw from Exp(1), kept strictly positive.
    pub fn next_exponential(&mut self) -> f32 {
        // 1 - U lies in (0, 1], so the log is finite.
        let u: f32 = self.rng.gen::<f32>();
        (-(1.0 - u).ln()).max(f32::MIN_POSITIVE)
    }
}
