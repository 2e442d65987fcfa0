use super::error::CacheError;
use super::page_pool::{PageId, PagePool};
use crate::config::EngineConfig;

/// Per-batch sequence state shared between the decode loop and the forward
/// pass: the tokens fed this step, how many of them there are, where they
/// start, and which cache pages each sequence owns.
///
/// Slot `i` of every list refers to the same sequence for the lifetime of a
/// batch. Slots are only created by the first [`nest_sequences`] after a
/// [`reset`].
///
/// [`nest_sequences`]: SequenceInfo::nest_sequences
/// [`reset`]: SequenceInfo::reset
pub struct SequenceInfo {
    page_size: usize,
    max_batch_size: usize,
    pool: PagePool,
    input_ids: Vec<Vec<u32>>,
    sequence_lengths: Vec<usize>,
    input_positions: Vec<usize>,
    page_assignments: Vec<Vec<PageId>>,
}

impl SequenceInfo {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_capacity(config.page_size, config.num_pages, config.max_batch_size)
    }

    pub fn with_capacity(page_size: usize, num_pages: usize, max_batch_size: usize) -> Self {
        assert!(page_size > 0, "page_size must be positive");
        Self {
            page_size,
            max_batch_size,
            pool: PagePool::new(num_pages),
            input_ids: Vec::new(),
            sequence_lengths: Vec::new(),
            input_positions: Vec::new(),
            page_assignments: Vec::new(),
        }
    }

    /// Drop every sequence and return all pages to the pool.
    pub fn reset(&mut self) -> Result<(), CacheError> {
        for pages in self.page_assignments.drain(..) {
            self.pool.release(&pages)?;
        }
        self.input_ids.clear();
        self.sequence_lengths.clear();
        self.input_positions.clear();
        Ok(())
    }

    /// Replace the tokens fed to each sequence on the next forward pass.
    ///
    /// On an empty tracker this opens one slot per sequence at position 0
    /// with no pages. Afterwards the number of sequences is fixed until the
    /// next reset.
    pub fn nest_sequences(&mut self, sequences: Vec<Vec<u32>>) -> Result<(), CacheError> {
        if sequences.len() > self.max_batch_size {
            return Err(CacheError::BatchTooLarge {
                requested: sequences.len(),
                max_batch_size: self.max_batch_size,
            });
        }
        if self.input_positions.is_empty() {
            self.input_positions = vec![0; sequences.len()];
            self.page_assignments = vec![Vec::new(); sequences.len()];
        } else if self.input_positions.len() != sequences.len() {
            return Err(CacheError::SequenceCountMismatch {
                expected: self.input_positions.len(),
                got: sequences.len(),
            });
        }
        self.sequence_lengths = sequences.iter().map(Vec::len).collect();
        self.input_ids = sequences;
        Ok(())
    }

    /// Advance every sequence's start position by the matching delta.
    pub fn update_pos(&mut self, deltas: &[usize]) -> Result<(), CacheError> {
        if deltas.len() != self.input_positions.len() {
            return Err(CacheError::SequenceCountMismatch {
                expected: self.input_positions.len(),
                got: deltas.len(),
            });
        }
        for (pos, delta) in self.input_positions.iter_mut().zip(deltas) {
            *pos += delta;
        }
        Ok(())
    }

    /// Grow each sequence's page list until it covers
    /// `input_position + sequence_length` tokens. Sequences are served in
    /// slot order. Pages are never taken away here.
    ///
    /// Returns the number of pages handed out.
    pub fn assign_pages(&mut self) -> Result<usize, CacheError> {
        let Self {
            page_size,
            pool,
            sequence_lengths,
            input_positions,
            page_assignments,
            ..
        } = self;

        let mut assigned = 0;
        for ((pages, &len), &pos) in page_assignments
            .iter_mut()
            .zip(sequence_lengths.iter())
            .zip(input_positions.iter())
        {
            let required = (len + pos).div_ceil(*page_size);
            if pages.len() < required {
                let fresh = pool.allocate(required - pages.len())?;
                assigned += fresh.len();
                pages.extend(fresh);
            }
        }
        tracing::trace!(
            assigned,
            free = pool.num_free(),
            "assigned cache pages"
        );
        Ok(assigned)
    }

    pub fn input_ids(&self) -> &[Vec<u32>] {
        &self.input_ids
    }

    pub fn sequence_lengths(&self) -> &[usize] {
        &self.sequence_lengths
    }

    pub fn input_positions(&self) -> &[usize] {
        &self.input_positions
    }

    pub fn page_assignments(&self) -> &[Vec<PageId>] {
        &self.page_assignments
    }

    pub fn num_sequences(&self) -> usize {
        self.input_positions.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.pool.num_total()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn num_free_pages(&self) -> usize {
        self.pool.num_free()
    }
}
