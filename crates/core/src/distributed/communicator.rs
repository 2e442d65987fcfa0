//! Collective operations between decode ranks.
//!
//! The decode loop only needs a handful of primitives: agreeing on a batch
//! size (all-reduce max), broadcasting, and a barrier.

use std::sync::{Arc, Barrier, Mutex};

use candle_core::{DType, Tensor};

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
    /// Sum divided by world size.
    Average,
}

/// Collective communication between the ranks of one group.
///
/// Every call is a rendezvous: it returns only once all ranks of the group
/// have made the same call.
pub trait DeviceCommunicator: Send + Sync {
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Element-wise reduction across ranks; every rank gets the result.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// Every rank receives `src_rank`'s tensor.
    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor>;

    fn barrier(&self) -> Result<()>;
}

/// Communicator for a single rank. Every collective is the identity.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn broadcast(&self, tensor: &Tensor, _src_rank: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

impl Rendezvous {
    /// Publish this rank's tensor and collect everyone's, in rank order.
    fn exchange(&self, rank: usize, tensor: &Tensor) -> Result<Vec<Tensor>> {
        {
            let mut slots = self.slots.lock().map_err(|_| DistributedError::Poisoned)?;
            slots[rank] = Some(tensor.clone());
        }
        self.barrier.wait();
        let gathered = match self.slots.lock() {
            Ok(slots) => slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone()
                        .ok_or(DistributedError::MissingContribution { rank })
                })
                .collect(),
            Err(_) => Err(DistributedError::Poisoned),
        };
        // Nobody may overwrite a slot until every rank has read them all.
        self.barrier.wait();
        gathered
    }
}

/// Communicator connecting rank threads inside one process.
///
/// Built as a group with [`LocalGroupCommunicator::group`]; hand one handle
/// to each rank thread. Collectives block until every handle has joined.
pub struct LocalGroupCommunicator {
    process_group: LocalProcessGroup,
    shared: Arc<Rendezvous>,
}

impl LocalGroupCommunicator {
    /// One handle per rank, in rank order.
    pub fn group(world_size: usize) -> Result<Vec<Self>> {
        let shared = Arc::new(Rendezvous {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| {
                Ok(Self {
                    process_group: LocalProcessGroup::with_rank(rank, world_size)?,
                    shared: Arc::clone(&shared),
                })
            })
            .collect()
    }
}

fn reduce(tensors: &[Tensor], op: ReduceOp) -> Result<Tensor> {
    let (first, rest) = tensors
        .split_first()
        .ok_or(DistributedError::MissingContribution { rank: 0 })?;
    let mut acc = first.clone();
    for t in rest {
        if t.dims() != acc.dims() {
            return Err(DistributedError::ShapeMismatch {
                expected: acc.dims().to_vec(),
                actual: t.dims().to_vec(),
            });
        }
        acc = match op {
            ReduceOp::Sum | ReduceOp::Average => acc.add(t)?,
            ReduceOp::Product => acc.mul(t)?,
            ReduceOp::Min => acc.minimum(t)?,
            ReduceOp::Max => acc.maximum(t)?,
        };
    }
    if op == ReduceOp::Average {
        let dtype = acc.dtype();
        acc = acc
            .to_dtype(DType::F64)?
            .affine(1.0 / tensors.len() as f64, 0.0)?
            .to_dtype(dtype)?;
    }
    Ok(acc)
}

impl DeviceCommunicator for LocalGroupCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let gathered = self.shared.exchange(self.process_group.rank(), tensor)?;
        reduce(&gathered, op)
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        let mut gathered = self.shared.exchange(self.process_group.rank(), tensor)?;
        Ok(gathered.swap_remove(src_rank))
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}
