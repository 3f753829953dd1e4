use std::num::NonZero;

use crate::{AllocationPool, Error, Result, pages_per_zspage};

/// How many objects a worker allocates and which of them it maps.
///
/// Objects of `object_size` bytes are packed back to back into two pages, so the set holds
/// `(2 * page_size) / object_size` objects. The middle object is the one that starts in the
/// first page and ends in the second. Creating a layout fails if no object would be placed
/// across the page boundary at that index, or if a zsmalloc-style allocator would not pack
/// objects of that size into two-page zspages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HandleSetLayout {
    object_size: NonZero<usize>,
    handle_count: NonZero<usize>,
    spanned_index: usize,
}

impl HandleSetLayout {
    /// Computes the layout for objects of `object_size` bytes on pages of `page_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the objects do not pack into two pages with the
    /// middle object crossing the page boundary, or if [`pages_per_zspage()`] does not choose
    /// two pages for them.
    pub fn new(object_size: NonZero<usize>, page_size: NonZero<usize>) -> Result<Self> {
        let size = object_size.get();
        let page = page_size.get();

        if size > page {
            return Err(Error::invalid_config(format!(
                "object size {size} is larger than the page size {page}"
            )));
        }

        let handle_count = page
            .checked_mul(2)
            .and_then(|two_pages| two_pages.checked_div(size))
            .and_then(NonZero::new)
            .ok_or_else(|| Error::invalid_config("two pages overflow the address space"))?;

        let spanned_index = handle_count.get() / 2;

        let start = spanned_index.saturating_mul(size);
        let end = start.saturating_add(size);

        if !(start < page && end > page) {
            return Err(Error::invalid_config(format!(
                "object {spanned_index} of {handle_count} ({size} bytes each) does not cross \
                 the boundary of {page} byte pages"
            )));
        }

        let zspage_pages = pages_per_zspage(size, page);
        if zspage_pages != 2 {
            return Err(Error::invalid_config(format!(
                "objects of {size} bytes are packed into zspages of {zspage_pages} pages \
                 instead of 2 pages of {page} bytes"
            )));
        }

        Ok(Self {
            object_size,
            handle_count,
            spanned_index,
        })
    }

    /// The size of every object in the set.
    #[must_use]
    pub fn object_size(&self) -> NonZero<usize> {
        self.object_size
    }

    /// How many objects the set holds.
    #[must_use]
    pub fn handle_count(&self) -> NonZero<usize> {
        self.handle_count
    }

    /// The index of the object that crosses the page boundary.
    #[must_use]
    pub fn spanned_index(&self) -> usize {
        self.spanned_index
    }
}

/// A pool together with the objects a worker allocated from it.
///
/// Dropping the set frees every handle, in reverse allocation order, and then destroys the
/// pool. This also happens when [`allocate()`][Self::allocate] fails partway, so a failed
/// construction leaks nothing.
#[derive(Debug)]
pub struct HandleSet<P: AllocationPool> {
    // Dropped after the Drop impl has freed the handles.
    pool: P,
    handles: Vec<P::Handle>,
    layout: HandleSetLayout,
}

impl<P: AllocationPool> HandleSet<P> {
    /// Allocates all the objects of the layout from the pool.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error if any allocation fails. Returns [`Error::InvalidConfig`]
    /// if the pool reports that the object at the spanned index does not cross a page
    /// boundary. In both cases the objects allocated so far are freed and the pool is
    /// destroyed before this returns.
    pub fn allocate(pool: P, layout: HandleSetLayout) -> Result<Self> {
        let mut set = Self {
            pool,
            handles: Vec::with_capacity(layout.handle_count().get()),
            layout,
        };

        for _ in 0..layout.handle_count().get() {
            let handle = set.pool.allocate(layout.object_size().get())?;
            set.handles.push(handle);
        }

        let spanned = set.spanned();
        if set.pool.spans_pages(spanned) == Some(false) {
            return Err(Error::invalid_config(format!(
                "the allocator did not place object {} of {} across a page boundary",
                layout.spanned_index(),
                layout.handle_count()
            )));
        }

        Ok(set)
    }

    /// The handle of the object that crosses the page boundary.
    #[must_use]
    pub fn spanned(&self) -> P::Handle {
        *self
            .handles
            .get(self.layout.spanned_index())
            .expect("a fully allocated set contains the spanned index")
    }

    /// All the handles, in allocation order.
    #[must_use]
    pub fn handles(&self) -> &[P::Handle] {
        &self.handles
    }

    /// The layout the set was allocated with.
    #[must_use]
    pub fn layout(&self) -> HandleSetLayout {
        self.layout
    }

    /// The pool the objects were allocated from.
    #[must_use]
    pub fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }
}

impl<P: AllocationPool> Drop for HandleSet<P> {
    fn drop(&mut self) {
        while let Some(handle) = self.handles.pop() {
            self.pool.free(handle);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::fake::FakeAllocator;
    use crate::{Allocator, default_object_size};

    #[test]
    fn benchmark_layout_has_five_handles_and_middle_spans() {
        let layout = HandleSetLayout::new(nz!(1632), nz!(4096)).unwrap();

        assert_eq!(layout.handle_count().get(), 5);
        assert_eq!(layout.spanned_index(), 2);
        assert_eq!(layout.object_size().get(), 1632);
    }

    #[test]
    fn layout_scales_with_page_size() {
        let layout = HandleSetLayout::new(nz!(6528), nz!(16384)).unwrap();

        assert_eq!(layout.handle_count().get(), 5);
        assert_eq!(layout.spanned_index(), 2);
    }

    #[test]
    fn default_size_packs_into_two_page_zspages_on_large_pages() {
        for page_size in [nz!(4096), nz!(16384), nz!(65536)] {
            let layout = HandleSetLayout::new(default_object_size(page_size), page_size).unwrap();

            assert_eq!(layout.handle_count().get(), 5);
            assert_eq!(layout.spanned_index(), 2);

            let allocator = crate::ReferenceAllocator::with_page_size(page_size);
            let mut set = HandleSet::allocate(allocator.create_pool().unwrap(), layout).unwrap();
            let spanned = set.spanned();

            assert_eq!(set.pool_mut().spans_pages(spanned), Some(true));
            assert_eq!(set.pool_mut().allocated_pages(), 2);
        }
    }

    #[test]
    fn size_packed_into_single_page_zspages_is_rejected() {
        // Ten 1632 byte objects fill a 16 KiB page, so the allocator never spans pages.
        assert!(matches!(
            HandleSetLayout::new(nz!(1632), nz!(16384)),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn non_spanning_placement_fails_and_frees_everything() {
        let allocator = FakeAllocator::new().not_spanning();
        let layout = HandleSetLayout::new(nz!(1632), nz!(4096)).unwrap();

        let result = HandleSet::allocate(allocator.create_pool().unwrap(), layout);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));

        let summaries = allocator.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].allocations, 5);
        assert!(summaries[0].freed_each_handle_once());
    }

    #[test]
    fn object_larger_than_page_is_rejected() {
        assert!(matches!(
            HandleSetLayout::new(nz!(4097), nz!(4096)),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn exactly_dividing_size_is_rejected() {
        // 4 objects of 2048 bytes; object 2 starts exactly on the second page.
        assert!(matches!(
            HandleSetLayout::new(nz!(2048), nz!(4096)),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn allocates_every_handle_before_returning() {
        let allocator = FakeAllocator::new();
        let layout = HandleSetLayout::new(nz!(1632), nz!(4096)).unwrap();

        let set = HandleSet::allocate(allocator.create_pool().unwrap(), layout).unwrap();

        assert_eq!(set.handles().len(), 5);
        assert_eq!(set.spanned(), set.handles()[2]);

        drop(set);

        let summaries = allocator.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].allocations, 5);
        assert!(summaries[0].freed_each_handle_once());
    }

    #[test]
    fn failed_allocation_frees_earlier_handles_at_every_index() {
        let layout = HandleSetLayout::new(nz!(1632), nz!(4096)).unwrap();

        for failing_index in 0..layout.handle_count().get() {
            let allocator = FakeAllocator::new().failing_allocation_at(failing_index);

            let result = HandleSet::allocate(allocator.create_pool().unwrap(), layout);
            assert!(matches!(result, Err(Error::OutOfMemory { .. })));

            let summaries = allocator.summaries();
            assert_eq!(summaries.len(), 1, "pool destroyed exactly once");
            assert_eq!(summaries[0].allocations, failing_index);
            assert!(summaries[0].freed_each_handle_once());
        }
    }

    #[test]
    fn works_with_reference_pool() {
        let allocator = crate::ReferenceAllocator::with_page_size(nz!(4096));
        let layout = HandleSetLayout::new(nz!(1632), nz!(4096)).unwrap();

        let mut set = HandleSet::allocate(allocator.create_pool().unwrap(), layout).unwrap();
        let spanned = set.spanned();

        assert_eq!(set.pool_mut().spans_pages(spanned), Some(true));
        assert_eq!(set.pool_mut().allocated_objects(), 5);
    }
}
