use std::fmt;

use candle_core::Tensor;

use crate::sampling::SamplingParams;

pub type RequestId = u64;

/// A prompt to complete. The executor assigns `id` when it is left empty.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Option<RequestId>,
    pub prompt_token_ids: Vec<u32>,
    pub sampling_params: SamplingParams,
}

impl Request {
    pub fn new(prompt_token_ids: Vec<u32>, sampling_params: SamplingParams) -> Self {
        Self {
            id: None,
            prompt_token_ids,
            sampling_params,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop sequence matched before `max_tokens`.
    Stop,
    /// `max_tokens` tokens were produced.
    Length,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generated tokens for one request.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    /// Candidate index; always 0 since `best_of` is 1.
    pub index: usize,
    pub token_ids: Vec<u32>,
    pub finish_reason: FinishReason,
    /// `[num_tokens, vocab]` last-position logits per generated token.
    pub generation_logits: Option<Tensor>,
    /// `[prompt_len, vocab]` prefill logits.
    pub context_logits: Option<Tensor>,
}
