//! Paged KV-cache bookkeeping.
//!
//! The cache itself lives inside the model; this module only tracks which
//! fixed-size pages each in-flight sequence owns, plus the per-step token
//! layout ([`SequenceInfo`]) the forward pass reads.

mod error;
mod page_pool;
mod sequence_info;

pub use error::CacheError;
pub use page_pool::{PageId, PagePool};
pub use sequence_info::SequenceInfo;
