//! Per-call decode state threaded through every step.

use candle_core::Tensor;

use super::types::{EngineError, RequestOutput};
use crate::request::{CompletionOutput, FinishReason};
use crate::sampling::SamplingParams;

/// State of one `generate_tokens_batched` call.
///
/// Stop indices are signed: excluding a stop sequence that matched within
/// the first few steps moves the index below zero, which marks an empty
/// output. A sequence is stopped once its index is below the current step.
pub(crate) struct DecodeContext<'a> {
    params: &'a SamplingParams,
    stop_words: Vec<&'a [u32]>,
    new_tokens: Vec<Vec<u32>>,
    stop_indices: Vec<isize>,
    generation_logits: Option<Vec<Tensor>>,
    context_logits: Option<Vec<Tensor>>,
    steps_run: usize,
}

impl<'a> DecodeContext<'a> {
    pub(crate) fn new(params: &'a SamplingParams, batch_size: usize) -> Self {
        Self {
            params,
            // An empty stop sequence would match every step.
            stop_words: params
                .stop_words
                .iter()
                .filter(|w| !w.is_empty())
                .map(Vec::as_slice)
                .collect(),
            new_tokens: vec![Vec::new(); batch_size],
            stop_indices: vec![params.max_tokens as isize - 1; batch_size],
            generation_logits: params.return_generation_logits.then(Vec::new),
            context_logits: None,
            steps_run: 0,
        }
    }

    /// Append each sequence's sampled token unless it already stopped, and
    /// look for stop sequences at the tail of its output.
    pub(crate) fn record_tokens(&mut self, step: usize, tokens: &[u32]) {
        let step = step as isize;
        self.steps_run += 1;
        for ((output, stop), &token) in self
            .new_tokens
            .iter_mut()
            .zip(self.stop_indices.iter_mut())
            .zip(tokens)
        {
            if *stop < step {
                continue;
            }
            output.push(token);
            if let Some(matched) = self.stop_words.iter().find(|w| output.ends_with(w)) {
                *stop = step;
                if !self.params.include_stop_str_in_output {
                    output.truncate(output.len() - matched.len());
                    *stop -= matched.len() as isize;
                }
            }
        }
    }

    /// Keep this step's `[batch, 1, vocab]` logits and, on the first step,
    /// the full prefill logits, when the caller asked for them.
    pub(crate) fn record_logits(
        &mut self,
        step: usize,
        last: &Tensor,
        full: &[Tensor],
    ) -> candle_core::Result<()> {
        if let Some(steps) = self.generation_logits.as_mut() {
            steps.push(last.squeeze(1)?);
        }
        if step == 0 && self.params.return_context_logits {
            self.context_logits = Some(full.to_vec());
        }
        Ok(())
    }

    pub(crate) fn all_stopped(&self, step: usize) -> bool {
        let step = step as isize;
        self.stop_indices.iter().all(|&stop| stop <= step)
    }

    pub(crate) fn steps_run(&self) -> usize {
        self.steps_run
    }

    /// Check the bookkeeping and build one completion list per sequence.
    pub(crate) fn finish(self) -> Result<Vec<RequestOutput>, EngineError> {
        for (b, (output, &stop)) in self.new_tokens.iter().zip(&self.stop_indices).enumerate() {
            if output.len() as isize != stop + 1 {
                return Err(EngineError::Consistency(format!(
                    "sequence {b} produced {} tokens but stopped at index {stop}",
                    output.len()
                )));
            }
        }

        // [steps, batch, vocab] -> [batch, steps, vocab]
        let generation_logits = match self.generation_logits {
            Some(steps) if !steps.is_empty() => {
                Some(Tensor::stack(&steps, 0)?.transpose(0, 1)?)
            }
            _ => None,
        };
        let mut context_logits = self.context_logits.map(Vec::into_iter);

        let max_tokens = self.params.max_tokens;
        self.new_tokens
            .into_iter()
            .enumerate()
            .map(|(b, token_ids)| -> Result<RequestOutput, EngineError> {
                let generation_logits = match &generation_logits {
                    Some(all) => Some(all.get(b)?.narrow(0, 0, token_ids.len())?.contiguous()?),
                    None => None,
                };
                let finish_reason = if token_ids.len() < max_tokens {
                    FinishReason::Stop
                } else {
                    FinishReason::Length
                };
                Ok(vec![CompletionOutput {
                    index: 0,
                    token_ids,
                    finish_reason,
                    generation_logits,
                    context_logits: context_logits.as_mut().and_then(Iterator::next),
                }])
            })
            .collect()
    }
}
