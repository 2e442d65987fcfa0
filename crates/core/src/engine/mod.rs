//! Micro-batching decode engine.
//!
//! - [`DecodeEngine`] runs one batch of requests to completion over a paged
//!   cache, driving a [`ModelForward`] implementation.
//! - [`run_rank_worker`] is the per-rank loop: collect a batch that every
//!   rank agrees on, decode it, report results.
//! - [`Executor`] is what callers hold. It either owns an engine directly or
//!   fans requests out to one thread per rank.
//!
//! # Example
//!
//! ```ignore
//! let config = ExecutorConfig { world_size: 2, ..Default::default() };
//! let mut executor = Executor::new(&config, |_rank| {
//!     Ok(DecodeEngine::new(load_model()?, &EngineConfig::default()))
//! })?;
//! let result = executor.submit(Request::new(prompt, SamplingParams::greedy(32)))?;
//! let completions = result.wait()?;
//! executor.shutdown()?;
//! ```

mod context;
mod decode;
mod executor;
mod model_forward;
mod types;
mod worker;

pub use decode::DecodeEngine;
pub use executor::{Executor, GenerationResult};
pub use model_forward::ModelForward;
pub use types::{EngineError, RankMessage, RequestOutput};
pub use worker::{
    agree_batch_size, collect_batch, run_rank_worker, CollectedBatch, RankChannels, WorkerStats,
};
