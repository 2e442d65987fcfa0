//! Collective primitives shared by decode ranks.
//!
//! - [`ProcessGroup`] - rank identity (rank, world size)
//! - [`DeviceCommunicator`] - all-reduce, broadcast, barrier
//!
//! A single rank uses [`MockCommunicator`], where every collective is the
//! identity. Rank threads inside one process share a
//! [`LocalGroupCommunicator`] group.
//!
//! # Usage
//!
//! ```ignore
//! use microbatch_core::distributed::{DeviceCommunicator, LocalGroupCommunicator, ReduceOp};
//!
//! for comm in LocalGroupCommunicator::group(2)? {
//!     std::thread::spawn(move || {
//!         let local = Tensor::new(&[3u32], &Device::Cpu)?;
//!         let agreed = comm.all_reduce(&local, ReduceOp::Max)?;
//!         // ...
//!     });
//! }
//! ```

mod communicator;
mod error;
mod launcher;
mod process_group;

pub use communicator::{DeviceCommunicator, LocalGroupCommunicator, MockCommunicator, ReduceOp};
pub use error::{DistributedError, Result};
pub use launcher::DistributedConfig;
pub use process_group::{LocalProcessGroup, ProcessGroup};
