//! Per-rank request loop.
//!
//! Every rank receives the same request stream but may observe it at a
//! different moment. Before each batch the ranks agree on its size:
//!
//! 1. block for the first message
//! 2. drain whatever else is already queued, up to `max_batch_size`
//! 3. all-reduce (max) the local count
//! 4. a rank that drained fewer waits, with a timeout, for the rest
//!
//! so every rank decodes the same requests in the same order and the
//! collectives inside the forward pass line up.

use std::time::Duration;

use candle_core::{Device, Tensor};
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::decode::DecodeEngine;
use super::model_forward::ModelForward;
use super::types::{EngineError, RankMessage, RequestOutput};
use crate::config::WorkerConfig;
use crate::distributed::{DeviceCommunicator, ReduceOp};
use crate::request::Request;

/// Channels owned by one rank. Only rank 0 reports results.
pub struct RankChannels {
    pub inbound: Receiver<RankMessage>,
    pub outbound: Option<Sender<RequestOutput>>,
}

/// A batch every rank agreed on.
#[derive(Debug)]
pub struct CollectedBatch {
    pub requests: Vec<Request>,
    /// Requests that arrived after the size agreement.
    pub catch_up_reads: usize,
    /// A shutdown message was seen while draining.
    pub shutdown_requested: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches: usize,
    pub requests: usize,
    pub catch_up_reads: usize,
}

/// All-reduce (max) this rank's request count.
pub fn agree_batch_size(comm: &dyn DeviceCommunicator, local: usize) -> Result<usize, EngineError> {
    let count = Tensor::new(&[local as u32], &Device::Cpu)?;
    let agreed = comm.all_reduce(&count, ReduceOp::Max)?;
    let agreed = agreed.to_vec1::<u32>()?;
    agreed
        .first()
        .map(|&n| n as usize)
        .ok_or_else(|| EngineError::Consistency("empty batch-size reduction".into()))
}

/// Collect the next batch from `inbound`.
///
/// Returns `Ok(None)` when the first read sees a shutdown message or a
/// closed channel. Any shortfall that `catch_up_timeout` does not cover is
/// reported as [`EngineError::Desync`].
pub fn collect_batch(
    inbound: &Receiver<RankMessage>,
    max_batch_size: usize,
    comm: &dyn DeviceCommunicator,
    catch_up_timeout: Duration,
) -> Result<Option<CollectedBatch>, EngineError> {
    let first = match inbound.recv() {
        Ok(RankMessage::Request(request)) => request,
        Ok(RankMessage::Shutdown) | Err(_) => return Ok(None),
    };

    let mut requests = vec![first];
    let mut shutdown_requested = false;
    while requests.len() < max_batch_size {
        match inbound.try_recv() {
            Ok(RankMessage::Request(request)) => requests.push(request),
            Ok(RankMessage::Shutdown) | Err(TryRecvError::Disconnected) => {
                shutdown_requested = true;
                break;
            }
            Err(TryRecvError::Empty) => break,
        }
    }

    let agreed = agree_batch_size(comm, requests.len())?;
    let drained = requests.len();
    while requests.len() < agreed {
        match inbound.recv_timeout(catch_up_timeout) {
            Ok(RankMessage::Request(request)) => requests.push(request),
            Ok(RankMessage::Shutdown)
            | Err(RecvTimeoutError::Timeout)
            | Err(RecvTimeoutError::Disconnected) => {
                return Err(EngineError::Desync {
                    expected: agreed,
                    received: requests.len(),
                    timeout_ms: catch_up_timeout.as_millis() as u64,
                });
            }
        }
    }

    Ok(Some(CollectedBatch {
        catch_up_reads: requests.len() - drained,
        requests,
        shutdown_requested,
    }))
}

/// Serve batches until shutdown. An error ends the loop; the other ranks of
/// the group are not notified.
pub fn run_rank_worker<M: ModelForward>(
    engine: &mut DecodeEngine<M>,
    comm: &dyn DeviceCommunicator,
    channels: &RankChannels,
    config: &WorkerConfig,
) -> Result<WorkerStats, EngineError> {
    let rank = comm.process_group().rank();
    tracing::info!(
        rank,
        world_size = comm.process_group().world_size(),
        "Rank worker starting"
    );

    let result = serve(engine, comm, channels, config, rank);
    match &result {
        Ok(stats) => tracing::info!(
            rank,
            batches = stats.batches,
            requests = stats.requests,
            "Rank worker exiting"
        ),
        Err(e) => tracing::error!(error = %e, rank, "Rank worker failed"),
    }
    result
}

fn serve<M: ModelForward>(
    engine: &mut DecodeEngine<M>,
    comm: &dyn DeviceCommunicator,
    channels: &RankChannels,
    config: &WorkerConfig,
    rank: usize,
) -> Result<WorkerStats, EngineError> {
    let max_batch_size = engine.sequence_info().max_batch_size();
    let mut stats = WorkerStats::default();

    while let Some(batch) = collect_batch(
        &channels.inbound,
        max_batch_size,
        comm,
        config.catch_up_timeout(),
    )? {
        tracing::debug!(
            rank,
            num_requests = batch.requests.len(),
            catch_up_reads = batch.catch_up_reads,
            "Running batch"
        );
        let outputs = engine.generate_tokens_batched(&batch.requests)?;

        if let Some(outbound) = &channels.outbound {
            for output in outputs {
                if outbound.send(output).is_err() {
                    tracing::warn!(rank, "Result receiver dropped, discarding output");
                }
            }
        }

        stats.batches += 1;
        stats.requests += batch.requests.len();
        stats.catch_up_reads += batch.catch_up_reads;
        if batch.shutdown_requested {
            break;
        }
    }
    Ok(stats)
}
