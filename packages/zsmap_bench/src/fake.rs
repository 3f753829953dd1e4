//! An allocator test double that checks how the benchmark uses it.

#![cfg_attr(coverage_nightly, coverage(off))]

use std::collections::HashMap;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::{AllocationPool, Allocator, Error, MapMode};

/// Handles carry the ID of the pool that issued them, so any cross-pool use is detectable.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct FakeHandle {
    pub(crate) pool_id: usize,
    pub(crate) index: usize,
}

/// What one pool observed over its lifetime, recorded when the pool is destroyed.
#[derive(Clone, Debug)]
pub(crate) struct PoolSummary {
    pub(crate) pool_id: usize,
    pub(crate) owner: ThreadId,
    pub(crate) allocations: usize,
    pub(crate) allocations_before_first_map: Option<usize>,
    pub(crate) free_counts: HashMap<usize, u32>,
    pub(crate) maps: u64,
    pub(crate) unmaps: u64,
    pub(crate) outstanding_mapping: bool,
    pub(crate) foreign_handle_uses: usize,
    pub(crate) foreign_thread_uses: usize,
}

impl PoolSummary {
    /// Every allocated handle was freed exactly once and nothing else was freed.
    pub(crate) fn freed_each_handle_once(&self) -> bool {
        self.free_counts.len() == self.allocations
            && (0..self.allocations).all(|index| self.free_counts.get(&index) == Some(&1))
    }
}

#[derive(Debug, Default)]
struct Shared {
    next_pool_id: AtomicUsize,
    pool_creations: AtomicUsize,
    fail_pool_creation: bool,
    fail_allocation_at: Option<usize>,
    fail_map_at: Option<u64>,
    fail_pool_ids: Vec<usize>,
    not_spanning: bool,
    summaries: Mutex<Vec<PoolSummary>>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct FakeAllocator {
    shared: Arc<Shared>,
}

impl FakeAllocator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn configure(mut self, f: impl FnOnce(&mut Shared)) -> Self {
        f(Arc::get_mut(&mut self.shared).expect("configured before being shared"));
        self
    }

    pub(crate) fn failing_pool_creation(self) -> Self {
        self.configure(|s| s.fail_pool_creation = true)
    }

    /// The allocation with this zero-based index fails in every pool.
    pub(crate) fn failing_allocation_at(self, index: usize) -> Self {
        self.configure(|s| s.fail_allocation_at = Some(index))
    }

    /// The map with this zero-based index fails in every pool.
    pub(crate) fn failing_map_at(self, index: u64) -> Self {
        self.configure(|s| s.fail_map_at = Some(index))
    }

    /// Pools with these IDs (in creation order, from zero) fail their first allocation.
    pub(crate) fn failing_pools(self, pool_ids: impl IntoIterator<Item = usize>) -> Self {
        let ids = pool_ids.into_iter().collect();
        self.configure(|s| s.fail_pool_ids = ids)
    }

    /// Pools report that no object crosses a page boundary.
    pub(crate) fn not_spanning(self) -> Self {
        self.configure(|s| s.not_spanning = true)
    }

    pub(crate) fn pool_creations(&self) -> usize {
        self.shared.pool_creations.load(atomic::Ordering::SeqCst)
    }

    pub(crate) fn summaries(&self) -> Vec<PoolSummary> {
        self.shared.summaries.lock().unwrap().clone()
    }
}

impl Allocator for FakeAllocator {
    type Pool = FakePool;

    fn create_pool(&self) -> Result<FakePool, Error> {
        self.shared
            .pool_creations
            .fetch_add(1, atomic::Ordering::SeqCst);

        if self.shared.fail_pool_creation {
            return Err(Error::out_of_memory("fake pool"));
        }

        let pool_id = self
            .shared
            .next_pool_id
            .fetch_add(1, atomic::Ordering::SeqCst);

        Ok(FakePool {
            shared: Arc::clone(&self.shared),
            buffer: Vec::new(),
            mapped: None,
            summary: PoolSummary {
                pool_id,
                owner: thread::current().id(),
                allocations: 0,
                allocations_before_first_map: None,
                free_counts: HashMap::new(),
                maps: 0,
                unmaps: 0,
                outstanding_mapping: false,
                foreign_handle_uses: 0,
                foreign_thread_uses: 0,
            },
        })
    }
}

#[derive(Debug)]
pub(crate) struct FakePool {
    shared: Arc<Shared>,
    buffer: Vec<u8>,
    mapped: Option<FakeHandle>,
    summary: PoolSummary,
}

impl FakePool {
    fn check_use(&mut self, handle: FakeHandle) {
        if handle.pool_id != self.summary.pool_id || handle.index >= self.summary.allocations {
            self.summary.foreign_handle_uses += 1;
        }

        if thread::current().id() != self.summary.owner {
            self.summary.foreign_thread_uses += 1;
        }
    }
}

impl AllocationPool for FakePool {
    type Handle = FakeHandle;

    fn allocate(&mut self, size: usize) -> Result<FakeHandle, Error> {
        let index = self.summary.allocations;

        if self.shared.fail_allocation_at == Some(index)
            || (index == 0 && self.shared.fail_pool_ids.contains(&self.summary.pool_id))
        {
            return Err(Error::out_of_memory("fake object"));
        }

        self.buffer.resize(self.buffer.len().max(size), 0);
        self.summary.allocations += 1;

        Ok(FakeHandle {
            pool_id: self.summary.pool_id,
            index,
        })
    }

    fn map(&mut self, handle: FakeHandle, _mode: MapMode) -> Result<&mut [u8], Error> {
        self.check_use(handle);

        if self.summary.allocations_before_first_map.is_none() {
            self.summary.allocations_before_first_map = Some(self.summary.allocations);
        }

        if self.shared.fail_map_at == Some(self.summary.maps) || self.mapped.is_some() {
            return Err(Error::map_failed(&handle));
        }

        self.summary.maps += 1;
        self.mapped = Some(handle);

        Ok(self.buffer.as_mut_slice())
    }

    fn unmap(&mut self, handle: FakeHandle) {
        self.check_use(handle);

        if self.mapped == Some(handle) {
            self.mapped = None;
            self.summary.unmaps += 1;
        }
    }

    fn free(&mut self, handle: FakeHandle) {
        self.check_use(handle);

        *self.summary.free_counts.entry(handle.index).or_default() += 1;
    }

    fn spans_pages(&self, handle: FakeHandle) -> Option<bool> {
        _ = handle;
        Some(!self.shared.not_spanning)
    }
}

impl Drop for FakePool {
    fn drop(&mut self) {
        self.summary.outstanding_mapping = self.mapped.is_some();

        self.shared
            .summaries
            .lock()
            .unwrap()
            .push(self.summary.clone());
    }
}
