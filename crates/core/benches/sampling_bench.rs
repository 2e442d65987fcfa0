//! Criterion benchmarks for batched token sampling and the decode loop.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{Device, Tensor};
use microbatch_core::config::EngineConfig;
use microbatch_core::engine::DecodeEngine;
use microbatch_core::request::Request;
use microbatch_core::sampling::{
    greedy_search, logits_to_probs, multinomial_sample_one_no_sync, sample_tokens, SamplerState,
    SamplingParams,
};
use microbatch_core::testing::EchoModel;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deterministic `[batch_size, 1, vocab_size]` logits on CPU.
fn make_logits_tensor(batch_size: usize, vocab_size: usize) -> Tensor {
    let data: Vec<f32> = (0..batch_size * vocab_size)
        .map(|i| ((i as f32 * 0.013).sin() * 5.0))
        .collect();
    Tensor::from_vec(data, (batch_size, 1, vocab_size), &Device::Cpu)
        .expect("failed to create logits tensor")
}

fn top_k_params(k: usize) -> SamplingParams {
    SamplingParams {
        top_k: Some(k),
        temperature: Some(0.8),
        ..SamplingParams::greedy(1)
    }
}

// ---------------------------------------------------------------------------
// Sampler benchmarks
// ---------------------------------------------------------------------------

fn bench_greedy(c: &mut Criterion) {
    let mut group = c.benchmark_group("greedy_search");
    for &batch_size in &[1, 8, 32] {
        let logits = make_logits_tensor(batch_size, 32_000)
            .squeeze(1)
            .expect("squeeze");
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, _| {
            b.iter(|| greedy_search(black_box(&logits)).expect("greedy"));
        });
    }
    group.finish();
}

fn bench_logits_to_probs(c: &mut Criterion) {
    let mut group = c.benchmark_group("logits_to_probs");
    let logits = make_logits_tensor(8, 32_000).squeeze(1).expect("squeeze");
    for &k in &[1, 50, 1000] {
        group.bench_with_input(BenchmarkId::new("top_k", k), &k, |b, &k| {
            b.iter(|| logits_to_probs(black_box(&logits), 0.8, Some(k)).expect("probs"));
        });
    }
    group.finish();
}

fn bench_exponential_noise_draw(c: &mut Criterion) {
    let mut group = c.benchmark_group("multinomial_sample_one_no_sync");
    for &vocab_size in &[32_000, 128_000] {
        let logits = make_logits_tensor(8, vocab_size).squeeze(1).expect("squeeze");
        let probs = logits_to_probs(&logits, 1.0, None).expect("probs");
        group.bench_with_input(BenchmarkId::new("vocab", vocab_size), &vocab_size, |b, _| {
            let mut state = SamplerState::new(Some(42));
            b.iter(|| multinomial_sample_one_no_sync(black_box(&probs), &mut state).expect("draw"));
        });
    }
    group.finish();
}

fn bench_sample_tokens(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_tokens");
    let logits = make_logits_tensor(8, 32_000);
    let greedy = SamplingParams::greedy(1);
    let top_k = top_k_params(50);
    group.bench_function("greedy", |b| {
        let mut state = SamplerState::new(Some(0));
        b.iter(|| sample_tokens(black_box(&logits), &greedy, &mut state).expect("sample"));
    });
    group.bench_function("top_k_50", |b| {
        let mut state = SamplerState::new(Some(0));
        b.iter(|| sample_tokens(black_box(&logits), &top_k, &mut state).expect("sample"));
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// Decode loop
// ---------------------------------------------------------------------------

fn bench_decode_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_tokens_batched");
    for &batch_size in &[1, 8] {
        let config = EngineConfig {
            page_size: 16,
            num_pages: 1024,
            max_batch_size: batch_size,
            ..Default::default()
        };
        let mut engine = DecodeEngine::new(EchoModel::cpu(1024), &config);
        let requests: Vec<Request> = (0..batch_size)
            .map(|i| Request::new(vec![i as u32; 32], SamplingParams::greedy(32)))
            .collect();
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, _| {
            b.iter(|| {
                engine
                    .generate_tokens_batched(black_box(&requests))
                    .expect("decode")
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_greedy,
    bench_logits_to_probs,
    bench_exponential_noise_draw,
    bench_sample_tokens,
    bench_decode_batch,
);
criterion_main!(benches);
