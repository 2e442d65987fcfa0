//! Cross-rank batch agreement with real rank threads.
//!
//! Every test builds a `LocalGroupCommunicator` group, so the batch-size
//! all-reduce is an actual rendezvous between threads.

use std::thread;
use std::time::Duration;

use flume::Sender;
use microbatch_core::{
    config::{EngineConfig, ExecutorConfig, WorkerConfig},
    distributed::LocalGroupCommunicator,
    engine::{
        collect_batch, run_rank_worker, DecodeEngine, EngineError, Executor, RankChannels,
        RankMessage,
    },
    request::Request,
    sampling::SamplingParams,
    testing::{EchoModel, MockModelForward},
};

const CATCH_UP: Duration = Duration::from_secs(1);

fn request(id: u64) -> Request {
    Request::new(vec![id as u32], SamplingParams::greedy(3)).with_id(id)
}

fn send_requests(tx: &Sender<RankMessage>, ids: &[u64]) {
    for &id in ids {
        tx.send(RankMessage::Request(request(id))).unwrap();
    }
}

#[test]
fn lagging_rank_catches_up_to_agreed_size() {
    let mut comms = LocalGroupCommunicator::group(2).unwrap().into_iter();
    let (comm0, comm1) = (comms.next().unwrap(), comms.next().unwrap());
    let (tx0, rx0) = flume::unbounded();
    let (tx1, rx1) = flume::unbounded();
    send_requests(&tx0, &[1, 2, 3]);
    send_requests(&tx1, &[1, 2]);

    let rank1 = thread::spawn(move || collect_batch(&rx1, 8, &comm1, CATCH_UP));
    let rank0 = thread::spawn(move || collect_batch(&rx0, 8, &comm0, CATCH_UP));

    // Rank 0 only returns after the reduction, so rank 1 has already drained
    // its two requests by the time the third one shows up.
    let batch0 = rank0.join().unwrap().unwrap().unwrap();
    send_requests(&tx1, &[3]);
    let batch1 = rank1.join().unwrap().unwrap().unwrap();

    let ids = |b: &microbatch_core::engine::CollectedBatch| {
        b.requests.iter().filter_map(|r| r.id).collect::<Vec<_>>()
    };
    assert_eq!(ids(&batch0), vec![1, 2, 3]);
    assert_eq!(ids(&batch1), vec![1, 2, 3]);
    assert_eq!(batch0.catch_up_reads, 0);
    assert_eq!(batch1.catch_up_reads, 1);
}

#[test]
fn missing_request_after_agreement_is_desync() {
    let mut comms = LocalGroupCommunicator::group(2).unwrap().into_iter();
    let (comm0, comm1) = (comms.next().unwrap(), comms.next().unwrap());
    let (tx0, rx0) = flume::unbounded();
    let (tx1, rx1) = flume::unbounded();
    send_requests(&tx0, &[1, 2]);
    send_requests(&tx1, &[1]);

    let timeout = Duration::from_millis(50);
    let rank0 = thread::spawn(move || collect_batch(&rx0, 8, &comm0, timeout));
    let rank1 = thread::spawn(move || collect_batch(&rx1, 8, &comm1, timeout));

    assert_eq!(rank0.join().unwrap().unwrap().unwrap().requests.len(), 2);
    match rank1.join().unwrap() {
        Err(EngineError::Desync {
            expected,
            received,
            timeout_ms,
        }) => {
            assert_eq!((expected, received, timeout_ms), (2, 1, 50));
        }
        other => panic!("expected desync, got {other:?}"),
    }
    drop((tx0, tx1));
}

#[test]
fn rank_workers_decode_identical_batches() {
    let comms = LocalGroupCommunicator::group(2).unwrap();
    let (out_tx, out_rx) = flume::unbounded();
    let mut senders = Vec::new();
    let mut handles = Vec::new();

    for (rank, comm) in comms.into_iter().enumerate() {
        let (tx, rx) = flume::unbounded();
        senders.push(tx);
        let channels = RankChannels {
            inbound: rx,
            outbound: (rank == 0).then(|| out_tx.clone()),
        };
        handles.push(thread::spawn(move || {
            let mut engine = DecodeEngine::new(EchoModel::cpu(64), &EngineConfig::default());
            run_rank_worker(&mut engine, &comm, &channels, &WorkerConfig::default())
        }));
    }
    drop(out_tx);

    for tx in &senders {
        send_requests(tx, &[10, 20, 30, 40]);
        tx.send(RankMessage::Shutdown).unwrap();
    }

    let stats: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert_eq!(stats[0].requests, 4);
    assert_eq!(stats[0].requests, stats[1].requests);
    assert_eq!(stats[0].batches, stats[1].batches);

    let outputs: Vec<Vec<u32>> = out_rx.iter().map(|o| o[0].token_ids.clone()).collect();
    assert_eq!(
        outputs,
        vec![
            vec![11, 12, 13],
            vec![21, 22, 23],
            vec![31, 32, 33],
            vec![41, 42, 43]
        ]
    );
}

#[test]
fn executor_matches_results_to_submissions() {
    let config = ExecutorConfig {
        world_size: 2,
        engine: EngineConfig {
            max_batch_size: 3,
            ..Default::default()
        },
        worker: WorkerConfig::default(),
    };
    let mut executor = Executor::new(&config, |_rank| {
        Ok(DecodeEngine::new(EchoModel::cpu(128), &EngineConfig {
            max_batch_size: 3,
            ..Default::default()
        }))
    })
    .unwrap();

    let results: Vec<_> = (0..7u32)
        .map(|i| {
            executor
                .submit(Request::new(vec![i * 10], SamplingParams::greedy(2)))
                .unwrap()
        })
        .collect();

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.request_id(), i as u64);
        let out = result.wait().unwrap();
        let base = i as u32 * 10;
        assert_eq!(out[0].token_ids, vec![base + 1, base + 2]);
    }
    executor.shutdown().unwrap();
    assert!(matches!(
        executor.submit(Request::new(vec![1], SamplingParams::greedy(1))),
        Err(EngineError::Shutdown)
    ));
}

#[test]
fn unseeded_top_k_ranks_sample_the_same_tokens() {
    let params = SamplingParams {
        top_k: Some(8),
        stop_words: vec![vec![3]],
        ..SamplingParams::greedy(8)
    };
    let comms = LocalGroupCommunicator::group(2).unwrap();
    let mut outputs = Vec::new();
    let mut handles = Vec::new();

    for comm in comms {
        let (tx, rx) = flume::unbounded();
        let (out_tx, out_rx) = flume::unbounded();
        for i in 0..3u32 {
            tx.send(RankMessage::Request(Request::new(vec![i + 1, 7], params.clone())))
                .unwrap();
        }
        tx.send(RankMessage::Shutdown).unwrap();
        outputs.push(out_rx);
        let channels = RankChannels {
            inbound: rx,
            outbound: Some(out_tx),
        };
        handles.push(thread::spawn(move || {
            let mut engine =
                DecodeEngine::new(MockModelForward::cpu(16), &EngineConfig::default());
            run_rank_worker(&mut engine, &comm, &channels, &WorkerConfig::default())
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let tokens: Vec<Vec<Vec<u32>>> = outputs
        .iter()
        .map(|rx| rx.drain().map(|o| o[0].token_ids.clone()).collect())
        .collect();
    assert_eq!(tokens[0].len(), 3);
    assert_eq!(tokens[0], tokens[1]);
}
