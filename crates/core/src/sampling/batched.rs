//! Tensor-level sampling over a whole batch of last-position logits.

use candle_core::{bail, DType, Result, Tensor, D};

use super::{SamplerState, SamplingParams};

/// Lowest temperature used for scaling; avoids dividing by zero.
const MIN_TEMPERATURE: f32 = 1e-5;

/// Temperature-scale `[batch, vocab]` logits, keep the `top_k` largest per
/// row (ties with the k-th value survive), and softmax.
pub fn logits_to_probs(logits: &Tensor, temperature: f32, top_k: Option<usize>) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    let scaled = logits.affine(1.0 / temperature.max(MIN_TEMPERATURE) as f64, 0.0)?;
    let filtered = match top_k {
        Some(k) => mask_below_kth(&scaled, k)?,
        None => scaled,
    };
    candle_nn::ops::softmax(&filtered, D::Minus1)
}

fn mask_below_kth(logits: &Tensor, k: usize) -> Result<Tensor> {
    let vocab = logits.dim(D::Minus1)?;
    if vocab == 0 {
        bail!("cannot apply top-k to an empty vocabulary");
    }
    let k = k.clamp(1, vocab);
    if k == vocab {
        return Ok(logits.clone());
    }
    let order = logits.arg_sort_last_dim(false)?;
    let kth = order.narrow(D::Minus1, k - 1, 1)?.contiguous()?;
    let pivot = logits.gather(&kth, D::Minus1)?;
    let below = logits.broadcast_lt(&pivot)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, logits.dims(), logits.device())?;
    below.where_cond(&neg_inf, logits)
}

/// Draw one index per row of `[batch, vocab]` probabilities as
/// `argmax(probs / q)` with `q ~ Exp(1)` drawn independently per entry.
///
/// Returns `[batch, 1]` u32 token ids.
pub fn multinomial_sample_one_no_sync(probs: &Tensor, state: &mut SamplerState) -> Result<Tensor> {
    let (batch, vocab) = probs.dims2()?;
    let noise: Vec<f32> = (0..batch * vocab)
        .map(|_| state.next_exponential())
        .collect();
    let q = Tensor::from_vec(noise, (batch, vocab), probs.device())?;
    probs.div(&q)?.argmax_keepdim(D::Minus1)
}

/// Argmax of raw `[batch, vocab]` logits, plus their softmax.
pub fn greedy_search(logits: &Tensor) -> Result<(Tensor, Tensor)> {
    let logits = logits.to_dtype(DType::F32)?;
    let ids = logits.argmax_keepdim(D::Minus1)?;
    let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
    Ok((ids, probs))
}

/// Sample one token per sequence from `[batch, 1, vocab]` logits.
///
/// Returns token ids shaped like the input without its vocab axis
/// (`[batch, 1]`) and the `[batch, vocab]` distribution sampled from.
pub fn sample_tokens(
    logits: &Tensor,
    params: &SamplingParams,
    state: &mut SamplerState,
) -> Result<(Tensor, Tensor)> {
    let dims = logits.dims();
    let Some((&vocab, leading)) = dims.split_last() else {
        bail!("logits must have at least one dimension");
    };
    if vocab == 0 {
        bail!("logits have an empty vocabulary");
    }
    let batch = logits.elem_count() / vocab;
    let flat = logits.reshape((batch, vocab))?;

    let (ids, probs) = match params.top_k {
        Some(k) => {
            let probs = logits_to_probs(&flat, params.temperature.unwrap_or(1.0), Some(k))?;
            let ids = multinomial_sample_one_no_sync(&probs, state)?;
            (ids, probs)
        }
        None => greedy_search(&flat)?,
    };
    Ok((ids.reshape(leading.to_vec())?, probs))
}
