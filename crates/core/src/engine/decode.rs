//! Batched autoregressive decoding over a paged cache.
//!
//! One call to [`DecodeEngine::generate_tokens_batched`] runs a prefill step
//! followed by single-token decode steps until every sequence has stopped or
//! `max_tokens` steps have run:
//!
//! ```text
//! reset tracker -> nest prompts
//! loop:
//!   assign pages -> forward -> last-position logits -> sample
//!   advance positions -> nest sampled tokens -> stop checks
//! ```
//!
//! Stopped sequences stay in the batch and keep being fed to the model; only
//! their output is frozen.

use candle_core::{DType, Tensor};

use super::context::DecodeContext;
use super::model_forward::ModelForward;
use super::types::{EngineError, RequestOutput};
use crate::config::EngineConfig;
use crate::kv_cache::SequenceInfo;
use crate::request::Request;
use crate::sampling::{sample_tokens, SamplerState, SamplingParams};

/// A model plus the sequence tracker and sampler that drive it.
pub struct DecodeEngine<M: ModelForward> {
    model: M,
    sequence_info: SequenceInfo,
    sampler: SamplerState,
}

impl<M: ModelForward> DecodeEngine<M> {
    pub fn new(model: M, config: &EngineConfig) -> Self {
        Self {
            model,
            sequence_info: SequenceInfo::new(config),
            sampler: SamplerState::new(Some(config.sampler_seed)),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn sequence_info(&self) -> &SequenceInfo {
        &self.sequence_info
    }

    /// Complete a single request.
    pub fn generate(&mut self, request: Request) -> Result<RequestOutput, EngineError> {
        let mut outputs = self.generate_tokens_batched(std::slice::from_ref(&request))?;
        outputs
            .pop()
            .ok_or_else(|| EngineError::Consistency("no output for a single request".into()))
    }

    /// Decode every request together. All requests must share one
    /// [`SamplingParams`]; returns one completion list per request, in order.
    pub fn generate_tokens_batched(
        &mut self,
        requests: &[Request],
    ) -> Result<Vec<RequestOutput>, EngineError> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        let params = &first.sampling_params;
        validate_batch(requests, params)?;

        let span = tracing::debug_span!("decode_batch", batch_size = requests.len());
        let _enter = span.enter();

        if let Some(seed) = params.seed {
            self.sampler.reseed(seed);
        }
        self.sequence_info.reset()?;
        self.sequence_info.nest_sequences(
            requests
                .iter()
                .map(|r| r.prompt_token_ids.clone())
                .collect(),
        )?;

        let mut ctx = DecodeContext::new(params, requests.len());
        for step in 0..params.max_tokens {
            self.step(step, params, &mut ctx)?;
            if ctx.all_stopped(step) {
                break;
            }
        }
        tracing::debug!(steps = ctx.steps_run(), "Decode finished");
        ctx.finish()
    }

    fn step(
        &mut self,
        step: usize,
        params: &SamplingParams,
        ctx: &mut DecodeContext<'_>,
    ) -> Result<(), EngineError> {
        self.sequence_info.assign_pages()?;

        let logits = self.model.compute_logits(&self.sequence_info)?;
        if logits.len() != self.sequence_info.num_sequences() {
            return Err(EngineError::Consistency(format!(
                "model returned logits for {} sequences, expected {}",
                logits.len(),
                self.sequence_info.num_sequences()
            )));
        }
        let last = last_position_logits(&logits)?;

        let (token_ids, _probs) = sample_tokens(&last, params, &mut self.sampler)?;
        let tokens: Vec<u32> = token_ids.flatten_all()?.to_vec1()?;

        let lengths = self.sequence_info.sequence_lengths().to_vec();
        self.sequence_info.update_pos(&lengths)?;
        self.sequence_info
            .nest_sequences(tokens.iter().map(|&t| vec![t]).collect())?;

        ctx.record_tokens(step, &tokens);
        ctx.record_logits(step, &last, &logits)?;
        Ok(())
    }
}

fn validate_batch(requests: &[Request], params: &SamplingParams) -> Result<(), EngineError> {
    if requests[1..].iter().any(|r| &r.sampling_params != params) {
        return Err(EngineError::InvalidRequest(
            "all requests of a batch must share the same sampling parameters".into(),
        ));
    }
    if params.best_of != 1 {
        return Err(EngineError::InvalidRequest(format!(
            "best_of must be 1, got {}",
            params.best_of
        )));
    }
    if params.max_tokens == 0 {
        return Err(EngineError::InvalidRequest(
            "max_tokens must be at least 1".into(),
        ));
    }
    if let Some(r) = requests.iter().find(|r| r.prompt_token_ids.is_empty()) {
        return Err(EngineError::InvalidRequest(format!(
            "request {:?} has an empty prompt",
            r.id
        )));
    }
    Ok(())
}

/// Stack the final row of each `[seq_len, vocab]` tensor into `[batch, 1, vocab]`.
fn last_position_logits(logits: &[Tensor]) -> candle_core::Result<Tensor> {
    let rows = logits
        .iter()
        .map(|l| {
            let seq_len = l.dim(0)?;
            l.narrow(0, seq_len.saturating_sub(1), 1)
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Tensor::stack(&rows, 0)?.to_dtype(DType::F32)
}
