//! Core types for the decode engine.

use thiserror::Error;

use crate::distributed::DistributedError;
use crate::kv_cache::CacheError;
use crate::request::{CompletionOutput, Request, RequestId};

// ─── Engine errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),
    #[error("collective error: {0}")]
    Distributed(#[from] DistributedError),
    #[error(
        "ranks out of sync: agreed on {expected} requests, received {received} within {timeout_ms}ms"
    )]
    Desync {
        expected: usize,
        received: usize,
        timeout_ms: u64,
    },
    #[error("inconsistent decode state: {0}")]
    Consistency(String),
    #[error("aborting request {request_id} is not supported")]
    AbortUnsupported { request_id: RequestId },
    #[error("failed to spawn rank thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("rank {rank} worker panicked")]
    WorkerPanicked { rank: usize },
    #[error("engine has shut down")]
    Shutdown,
}

// ─── Rank channel messages ────────────────────────────────────────────────

/// What a rank's inbound channel carries.
#[derive(Debug, Clone)]
pub enum RankMessage {
    Request(Request),
    /// Finish the current batch, then leave the loop.
    Shutdown,
}

/// Completions of one request, in request order.
pub type RequestOutput = Vec<CompletionOutput>;
