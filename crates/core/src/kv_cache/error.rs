use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("out of pages: requested {requested}, available {available}")]
    OutOfPages { requested: usize, available: usize },

    #[error("page {page_id} is not owned by any sequence")]
    PageNotOwned { page_id: usize },

    #[error("batch of {requested} sequences exceeds max batch size {max_batch_size}")]
    BatchTooLarge {
        requested: usize,
        max_batch_size: usize,
    },

    #[error("sequence count mismatch: tracker holds {expected}, got {got}")]
    SequenceCountMismatch { expected: usize, got: usize },
}
