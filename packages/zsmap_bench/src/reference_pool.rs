//! An in-process allocator that reproduces the storage model of a compacting slab allocator.
//!
//! Objects of one size class are packed back to back into "zspages", each made of up to
//! [`MAX_PAGES_PER_ZSPAGE`] separately allocated pages. An object near the end of one page
//! continues at the start of the next page, which is not adjacent in memory. Mapping such an
//! object copies both fragments into a scratch buffer and unmapping copies the buffer back,
//! which makes page-spanning objects the expensive case the benchmark is interested in.
//!
//! This exists so the benchmark has something real to bind against. It is single-threaded by
//! construction: every worker creates its own pool.

use std::num::NonZero;

use crate::{AllocationPool, Allocator, Error, MapMode, host_page_size};

/// The largest number of pages a zspage may consist of.
pub const MAX_PAGES_PER_ZSPAGE: usize = 4;

/// Creates [`ReferencePool`] instances.
#[derive(Clone, Copy, Debug)]
pub struct ReferenceAllocator {
    page_size: NonZero<usize>,
}

impl ReferenceAllocator {
    /// Creates an allocator whose pools use the host page size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(host_page_size())
    }

    /// Creates an allocator whose pools use the specified page size.
    #[must_use]
    pub fn with_page_size(page_size: NonZero<usize>) -> Self {
        Self { page_size }
    }

    /// The page size used by pools of this allocator.
    #[must_use]
    pub fn page_size(&self) -> NonZero<usize> {
        self.page_size
    }
}

impl Default for ReferenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for ReferenceAllocator {
    type Pool = ReferencePool;

    fn create_pool(&self) -> Result<ReferencePool, Error> {
        Ok(ReferencePool::new(self.page_size))
    }
}

/// Identifies one object in a [`ReferencePool`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectHandle {
    class: usize,
    zspage: usize,
    slot: usize,
}

/// A pool of objects packed into multi-page zspages.
#[derive(Debug)]
pub struct ReferencePool {
    page_size: usize,
    classes: Vec<SizeClass>,

    // Holds the contents of a page-spanning object while it is mapped.
    scratch: Vec<u8>,
    mapped: Option<(ObjectHandle, MapMode)>,
}

impl ReferencePool {
    fn new(page_size: NonZero<usize>) -> Self {
        Self {
            page_size: page_size.get(),
            classes: Vec::new(),
            scratch: Vec::new(),
            mapped: None,
        }
    }

    /// The number of objects currently allocated from the pool.
    #[must_use]
    pub fn allocated_objects(&self) -> usize {
        self.classes
            .iter()
            .flat_map(|class| &class.zspages)
            .map(|zspage| zspage.in_use)
            .sum()
    }

    /// The number of pages currently backing the pool.
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.classes
            .iter()
            .flat_map(|class| &class.zspages)
            .map(|zspage| zspage.pages.len())
            .sum()
    }

    fn class_index(&mut self, size: usize) -> usize {
        if let Some(index) = self.classes.iter().position(|class| class.size == size) {
            return index;
        }

        self.classes.push(SizeClass::new(size, self.page_size));
        self.classes.len().wrapping_sub(1)
    }

    fn locate(&self, handle: ObjectHandle) -> Option<Placement> {
        let class = self.classes.get(handle.class)?;
        let zspage = class.zspages.get(handle.zspage)?;

        if !zspage.used.get(handle.slot).copied().unwrap_or(false) {
            return None;
        }

        let offset = handle.slot.checked_mul(class.size)?;

        Some(Placement {
            page: offset.checked_div(self.page_size)?,
            offset: offset.checked_rem(self.page_size)?,
            size: class.size,
        })
    }
}

impl AllocationPool for ReferencePool {
    type Handle = ObjectHandle;

    fn allocate(&mut self, size: usize) -> Result<ObjectHandle, Error> {
        if size == 0 || size > self.page_size {
            return Err(Error::out_of_memory(format!(
                "no size class for {size} byte objects with {} byte pages",
                self.page_size
            )));
        }

        let page_size = self.page_size;
        let class_index = self.class_index(size);
        let class = self
            .classes
            .get_mut(class_index)
            .expect("class_index() always returns an existing class");

        let (zspage, slot) = class.allocate(page_size)?;

        Ok(ObjectHandle {
            class: class_index,
            zspage,
            slot,
        })
    }

    fn map(&mut self, handle: ObjectHandle, mode: MapMode) -> Result<&mut [u8], Error> {
        if self.mapped.is_some() {
            // One mapping at a time, like the per-processor mapping area of the real allocator.
            return Err(Error::map_failed(&handle));
        }

        let placement = self
            .locate(handle)
            .ok_or_else(|| Error::map_failed(&handle))?;

        self.mapped = Some((handle, mode));

        let page_size = self.page_size;
        let pages = &mut self
            .classes
            .get_mut(handle.class)
            .and_then(|class| class.zspages.get_mut(handle.zspage))
            .ok_or_else(|| Error::map_failed(&handle))?
            .pages;

        let end = placement.offset.saturating_add(placement.size);

        if end <= page_size {
            return pages
                .get_mut(placement.page)
                .and_then(|page| page.get_mut(placement.offset..end))
                .ok_or_else(|| Error::map_failed(&handle));
        }

        let first_len = page_size.saturating_sub(placement.offset);
        let second_len = placement.size.saturating_sub(first_len);

        self.scratch.resize(placement.size, 0);

        if mode != MapMode::WriteOnly {
            let (first, second) = spanned_fragments(pages, &placement, first_len, second_len)
                .ok_or_else(|| Error::map_failed(&handle))?;

            let (head, tail) = self.scratch.split_at_mut(first_len);
            head.copy_from_slice(first);
            tail.copy_from_slice(second);
        }

        Ok(self.scratch.as_mut_slice())
    }

    fn unmap(&mut self, handle: ObjectHandle) {
        let Some((mapped_handle, mode)) = self.mapped else {
            return;
        };

        if mapped_handle != handle {
            return;
        }

        self.mapped = None;

        if mode == MapMode::ReadOnly {
            return;
        }

        let Some(placement) = self.locate(handle) else {
            return;
        };

        let page_size = self.page_size;

        if placement.offset.saturating_add(placement.size) <= page_size {
            // The caller wrote directly into the page.
            return;
        }

        let first_len = page_size.saturating_sub(placement.offset);

        let Some(pages) = self
            .classes
            .get_mut(handle.class)
            .and_then(|class| class.zspages.get_mut(handle.zspage))
            .map(|zspage| &mut zspage.pages)
        else {
            return;
        };

        let (head, tail) = self.scratch.split_at(first_len);

        if let Some(first) = pages
            .get_mut(placement.page)
            .and_then(|page| page.get_mut(placement.offset..))
        {
            first.copy_from_slice(head);
        }

        if let Some(second) = pages
            .get_mut(placement.page.wrapping_add(1))
            .and_then(|page| page.get_mut(..tail.len()))
        {
            second.copy_from_slice(tail);
        }
    }

    fn free(&mut self, handle: ObjectHandle) {
        if self.mapped.is_some_and(|(mapped, _)| mapped == handle) {
            self.mapped = None;
        }

        if let Some(class) = self.classes.get_mut(handle.class) {
            class.free(handle.zspage, handle.slot);
        }
    }

    fn spans_pages(&self, handle: ObjectHandle) -> Option<bool> {
        let placement = self.locate(handle)?;

        Some(placement.offset.saturating_add(placement.size) > self.page_size)
    }
}

fn spanned_fragments<'a>(
    pages: &'a [Box<[u8]>],
    placement: &Placement,
    first_len: usize,
    second_len: usize,
) -> Option<(&'a [u8], &'a [u8])> {
    let first = pages
        .get(placement.page)?
        .get(placement.offset..placement.offset.checked_add(first_len)?)?;
    let second = pages.get(placement.page.checked_add(1)?)?.get(..second_len)?;

    Some((first, second))
}

#[derive(Debug)]
struct Placement {
    page: usize,
    offset: usize,
    size: usize,
}

#[derive(Debug)]
struct SizeClass {
    size: usize,
    pages_per_zspage: usize,
    objects_per_zspage: usize,
    zspages: Vec<Zspage>,
}

impl SizeClass {
    fn new(size: usize, page_size: usize) -> Self {
        let pages_per_zspage = pages_per_zspage(size, page_size);

        Self {
            size,
            pages_per_zspage,
            objects_per_zspage: pages_per_zspage
                .saturating_mul(page_size)
                .checked_div(size)
                .expect("size classes are only created for non-zero sizes"),
            zspages: Vec::new(),
        }
    }

    fn allocate(&mut self, page_size: usize) -> Result<(usize, usize), Error> {
        // Fill partially used zspages first, then revive released ones, then grow.
        let zspage_index = match self
            .zspages
            .iter()
            .position(|zspage| !zspage.pages.is_empty() && zspage.in_use < self.objects_per_zspage)
        {
            Some(index) => index,
            None => {
                let pages = allocate_pages(self.pages_per_zspage, page_size)?;

                if let Some(index) = self.zspages.iter().position(|zspage| zspage.pages.is_empty())
                {
                    let zspage = self
                        .zspages
                        .get_mut(index)
                        .expect("position() returned an existing index");
                    zspage.pages = pages;
                    index
                } else {
                    self.zspages.push(Zspage {
                        pages,
                        used: vec![false; self.objects_per_zspage],
                        in_use: 0,
                    });
                    self.zspages.len().wrapping_sub(1)
                }
            }
        };

        let zspage = self
            .zspages
            .get_mut(zspage_index)
            .expect("zspage index was just selected from the list");

        let slot = zspage
            .used
            .iter()
            .position(|used| !used)
            .expect("selected zspage has a free slot");

        *zspage
            .used
            .get_mut(slot)
            .expect("position() returned an existing slot") = true;
        zspage.in_use = zspage.in_use.wrapping_add(1);

        Ok((zspage_index, slot))
    }

    fn free(&mut self, zspage_index: usize, slot: usize) {
        let Some(zspage) = self.zspages.get_mut(zspage_index) else {
            return;
        };

        let Some(used) = zspage.used.get_mut(slot) else {
            return;
        };

        if !*used {
            return;
        }

        *used = false;
        zspage.in_use = zspage.in_use.wrapping_sub(1);

        if zspage.in_use == 0 {
            // Return the memory of empty zspages, as the real allocator does.
            zspage.pages = Vec::new();
        }
    }
}

#[derive(Debug)]
struct Zspage {
    // Empty when the zspage has been released.
    pages: Vec<Box<[u8]>>,
    used: Vec<bool>,
    in_use: usize,
}

fn allocate_pages(count: usize, page_size: usize) -> Result<Vec<Box<[u8]>>, Error> {
    let mut pages = Vec::new();
    pages
        .try_reserve_exact(count)
        .map_err(|e| Error::out_of_memory(format!("zspage page list: {e}")))?;

    for _ in 0..count {
        let mut page = Vec::new();
        page.try_reserve_exact(page_size)
            .map_err(|e| Error::out_of_memory(format!("zspage page: {e}")))?;
        page.resize(page_size, 0_u8);

        pages.push(page.into_boxed_slice());
    }

    Ok(pages)
}

/// Selects how many pages a zspage of the size class consists of: the page count in
/// `1..=MAX_PAGES_PER_ZSPAGE` that wastes the smallest share of the zspage. The lowest page
/// count wins ties.
#[must_use]
pub fn pages_per_zspage(size: usize, page_size: usize) -> usize {
    let mut best_pages = 1;
    let mut best_used_percent = 0;

    for pages in 1..=MAX_PAGES_PER_ZSPAGE {
        let zspage_size = pages.saturating_mul(page_size);
        let waste = zspage_size.checked_rem(size).unwrap_or(zspage_size);
        let used_percent = zspage_size
            .saturating_sub(waste)
            .saturating_mul(100)
            .checked_div(zspage_size)
            .unwrap_or(0);

        if used_percent > best_used_percent {
            best_pages = pages;
            best_used_percent = used_percent;
        }
    }

    best_pages
}
