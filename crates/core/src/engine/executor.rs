//! Executor - the caller-owned handle that feeds requests to the ranks.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

use super::decode::DecodeEngine;
use super::model_forward::ModelForward;
use super::types::{EngineError, RankMessage, RequestOutput};
use super::worker::{run_rank_worker, RankChannels, WorkerStats};
use crate::config::ExecutorConfig;
use crate::distributed::LocalGroupCommunicator;
use crate::request::{Request, RequestId};

/// Pending completion of one submitted request.
pub struct GenerationResult {
    request_id: RequestId,
    rx: Receiver<RequestOutput>,
}

impl GenerationResult {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Block until the completion arrives.
    pub fn wait(self) -> Result<RequestOutput, EngineError> {
        self.rx.recv().map_err(|_| EngineError::Shutdown)
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout` with `Ok(None)`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<RequestOutput>, EngineError> {
        match self.rx.recv_timeout(timeout) {
            Ok(output) => Ok(Some(output)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Shutdown),
        }
    }
}

/// Waiters for rank 0's results, oldest first. `None` once the dispatcher
/// has exited and no further result can arrive.
type Pending = Arc<Mutex<Option<VecDeque<Sender<RequestOutput>>>>>;

/// Rank threads plus the dispatcher that routes rank 0's results back to
/// their submissions.
struct RankPool {
    senders: Vec<Sender<RankMessage>>,
    workers: Vec<JoinHandle<Result<WorkerStats, EngineError>>>,
    pending: Pending,
    dispatcher: JoinHandle<()>,
}

impl RankPool {
    fn spawn<M, F>(config: &ExecutorConfig, factory: F) -> Result<Self, EngineError>
    where
        M: ModelForward,
        F: Fn(usize) -> Result<DecodeEngine<M>, EngineError> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let (out_tx, out_rx) = flume::unbounded::<RequestOutput>();
        let mut senders = Vec::with_capacity(config.world_size);
        let mut workers = Vec::with_capacity(config.world_size);

        for (rank, comm) in LocalGroupCommunicator::group(config.world_size)?
            .into_iter()
            .enumerate()
        {
            let (tx, rx) = flume::unbounded();
            senders.push(tx);
            let channels = RankChannels {
                inbound: rx,
                outbound: (rank == 0).then(|| out_tx.clone()),
            };
            let factory = Arc::clone(&factory);
            let worker_config = config.worker.clone();
            let handle = thread::Builder::new()
                .name(format!("decode-rank-{rank}"))
                .spawn(move || {
                    let mut engine = factory(rank)?;
                    run_rank_worker(&mut engine, &comm, &channels, &worker_config)
                })
                .map_err(EngineError::Spawn)?;
            workers.push(handle);
        }
        // Rank 0 now holds the only sender; its exit ends the dispatcher.
        drop(out_tx);

        let pending: Pending = Arc::new(Mutex::new(Some(VecDeque::new())));
        let dispatcher = {
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("decode-dispatch".into())
                .spawn(move || dispatch(out_rx, pending))
                .map_err(EngineError::Spawn)?
        };

        Ok(Self {
            senders,
            workers,
            pending,
            dispatcher,
        })
    }

    fn submit(&self, request_id: RequestId, request: Request) -> Result<GenerationResult, EngineError> {
        let (tx, rx) = flume::bounded(1);
        // Registered before the broadcast so rank 0 cannot answer first.
        self.pending
            .lock()
            .map_err(|_| EngineError::Shutdown)?
            .as_mut()
            .ok_or(EngineError::Shutdown)?
            .push_back(tx);
        for sender in &self.senders {
            sender
                .send(RankMessage::Request(request.clone()))
                .map_err(|_| EngineError::Shutdown)?;
        }
        Ok(GenerationResult { request_id, rx })
    }

    fn shutdown(self) -> Result<(), EngineError> {
        for (rank, sender) in self.senders.iter().enumerate() {
            if sender.send(RankMessage::Shutdown).is_err() {
                tracing::debug!(rank, "Rank already stopped");
            }
        }
        drop(self.senders);

        let mut first_error = None;
        for (rank, handle) in self.workers.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(stats)) => tracing::debug!(
                    rank,
                    batches = stats.batches,
                    catch_up_reads = stats.catch_up_reads,
                    "Rank joined"
                ),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(EngineError::WorkerPanicked { rank });
                }
            }
        }
        if self.dispatcher.join().is_err() {
            tracing::warn!("Result dispatcher panicked");
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Hand each result from rank 0 to the oldest unanswered submission.
/// Rank 0 emits results in submission order. On exit every remaining waiter
/// is dropped, so its `wait` reports [`EngineError::Shutdown`].
fn dispatch(outputs: Receiver<RequestOutput>, pending: Pending) {
    for output in outputs.iter() {
        let waiter = match pending.lock() {
            Ok(mut queue) => queue.as_mut().and_then(VecDeque::pop_front),
            Err(_) => break,
        };
        match waiter {
            // A dropped GenerationResult just discards its output.
            Some(tx) => {
                let _ = tx.send(output);
            }
            None => tracing::warn!("Result arrived without a pending submission"),
        }
    }

    let orphaned = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .map_or(0, |queue| queue.len());
    if orphaned > 0 {
        tracing::warn!(orphaned, "Rank 0 stopped with submissions still pending");
    }
}

enum Backend<M: ModelForward> {
    Inline(DecodeEngine<M>),
    Ranks(RankPool),
    Stopped,
}

/// Entry point for callers: submits requests, either to an engine running
/// in the caller's thread or to a group of rank threads.
pub struct Executor<M: ModelForward> {
    backend: Backend<M>,
    next_client_id: RequestId,
}

impl<M: ModelForward> Executor<M> {
    /// Decode in the caller's thread.
    pub fn inline(engine: DecodeEngine<M>) -> Self {
        Self {
            backend: Backend::Inline(engine),
            next_client_id: 0,
        }
    }

    /// Build an inline executor when `config.world_size == 0`, otherwise
    /// one thread per rank, each owning the engine `factory(rank)` builds.
    pub fn new<F>(config: &ExecutorConfig, factory: F) -> Result<Self, EngineError>
    where
        F: Fn(usize) -> Result<DecodeEngine<M>, EngineError> + Send + Sync + 'static,
    {
        if config.is_inline() {
            return Ok(Self::inline(factory(0)?));
        }
        tracing::info!(world_size = config.world_size, "Spawning rank workers");
        Ok(Self {
            backend: Backend::Ranks(RankPool::spawn(config, factory)?),
            next_client_id: 0,
        })
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.backend, Backend::Inline(_))
    }

    fn next_client_id(&mut self) -> RequestId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    /// Queue a request. Requests without an id get the next client id.
    pub fn submit(&mut self, mut request: Request) -> Result<GenerationResult, EngineError> {
        let request_id = match request.id {
            Some(id) => id,
            None => {
                let id = self.next_client_id();
                request.id = Some(id);
                id
            }
        };

        match &mut self.backend {
            Backend::Inline(engine) => {
                let output = engine.generate(request)?;
                let (tx, rx) = flume::bounded(1);
                tx.send(output).map_err(|_| EngineError::Shutdown)?;
                Ok(GenerationResult { request_id, rx })
            }
            Backend::Ranks(pool) => pool.submit(request_id, request),
            Backend::Stopped => Err(EngineError::Shutdown),
        }
    }

    /// Requests always run to completion.
    pub fn abort_request(&self, request_id: RequestId) -> Result<(), EngineError> {
        tracing::warn!(request_id, "Abort is not supported, request will run to completion");
        Err(EngineError::AbortUnsupported { request_id })
    }

    /// Stop every rank and wait for it, reporting the first rank failure.
    /// Later calls do nothing.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        match mem::replace(&mut self.backend, Backend::Stopped) {
            Backend::Ranks(pool) => pool.shutdown(),
            Backend::Inline(_) | Backend::Stopped => Ok(()),
        }
    }
}

impl<M: ModelForward> Drop for Executor<M> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Executor shutdown reported an error");
        }
    }
}
