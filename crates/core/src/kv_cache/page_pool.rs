use super::error::CacheError;

pub type PageId = usize;

/// Free-page bookkeeping: a LIFO free list plus an ownership bitmap.
pub struct PagePool {
    num_pages: usize,
    free_list: Vec<PageId>,
    owned: Vec<bool>,
}

impl PagePool {
    pub fn new(num_pages: usize) -> Self {
        // Reversed so that pops hand out low ids first.
        let free_list: Vec<PageId> = (0..num_pages).rev().collect();
        Self {
            num_pages,
            free_list,
            owned: vec![false; num_pages],
        }
    }

    /// Take one free page.
    pub fn pop(&mut self) -> Result<PageId, CacheError> {
        let id = self.free_list.pop().ok_or(CacheError::OutOfPages {
            requested: 1,
            available: 0,
        })?;
        self.owned[id] = true;
        Ok(id)
    }

    /// Take `n` free pages, or none at all if fewer than `n` are left.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<PageId>, CacheError> {
        if n > self.free_list.len() {
            return Err(CacheError::OutOfPages {
                requested: n,
                available: self.free_list.len(),
            });
        }
        (0..n).map(|_| self.pop()).collect()
    }

    /// Return pages to the pool. Double release and unknown ids are rejected.
    pub fn release(&mut self, pages: &[PageId]) -> Result<(), CacheError> {
        for &id in pages {
            if id >= self.num_pages || !self.owned[id] {
                return Err(CacheError::PageNotOwned { page_id: id });
            }
            self.owned[id] = false;
            self.free_list.push(id);
        }
        Ok(())
    }

    pub fn is_owned(&self, id: PageId) -> bool {
        self.owned.get(id).copied().unwrap_or(false)
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_total(&self) -> usize {
        self.num_pages
    }

    pub fn num_owned(&self) -> usize {
        self.num_pages - self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_has_all_free() {
        let pool = PagePool::new(64);
        assert_eq!(pool.num_free(), 64);
        assert_eq!(pool.num_owned(), 0);
        assert_eq!(pool.num_total(), 64);
    }

    #[test]
    fn pop_hands_out_low_ids_first() {
        let mut pool = PagePool::new(8);
        assert_eq!(pool.pop().unwrap(), 0);
        assert_eq!(pool.pop().unwrap(), 1);
        assert!(pool.is_owned(0));
        assert!(!pool.is_owned(2));
    }

    #[test]
    fn allocate_returns_unique_ids() {
        let mut pool = PagePool::new(64);
        let ids = pool.allocate(10).unwrap();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 10);
        assert_eq!(pool.num_free(), 54);
    }

    #[test]
    fn release_returns_pages() {
        let mut pool = PagePool::new(16);
        let ids = pool.allocate(4).unwrap();
        pool.release(&ids).unwrap();
        assert_eq!(pool.num_free(), 16);
        assert!(ids.iter().all(|&id| !pool.is_owned(id)));
    }

    #[test]
    fn allocate_exhausted_is_all_or_nothing() {
        let mut pool = PagePool::new(4);
        let result = pool.allocate(5);
        match result.unwrap_err() {
            CacheError::OutOfPages {
                requested,
                available,
            } => {
                assert_eq!(requested, 5);
                assert_eq!(available, 4);
            }
            _ => panic!("wrong error variant"),
        }
        assert_eq!(pool.num_free(), 4);
    }

    #[test]
    fn pop_on_empty_pool_fails() {
        let mut pool = PagePool::new(1);
        pool.pop().unwrap();
        assert!(matches!(
            pool.pop(),
            Err(CacheError::OutOfPages { available: 0, .. })
        ));
    }

    #[test]
    fn double_release_rejected() {
        let mut pool = PagePool::new(4);
        let ids = pool.allocate(1).unwrap();
        pool.release(&ids).unwrap();
        assert_eq!(
            pool.release(&ids),
            Err(CacheError::PageNotOwned { page_id: ids[0] })
        );
    }

    #[test]
    fn out_of_range_release_rejected() {
        let mut pool = PagePool::new(4);
        assert_eq!(
            pool.release(&[99]),
            Err(CacheError::PageNotOwned { page_id: 99 })
        );
    }
}
