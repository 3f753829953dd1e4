//! The interface the benchmark consumes from the allocator under test.

use std::fmt::Debug;

use derive_more::Display;

use crate::Error;

/// How a mapped object is going to be accessed.
///
/// An allocator may use this to skip copying data that is not going to be read or
/// written back.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "mirrors the three mapping modes of the allocator interface"
)]
pub enum MapMode {
    /// The mapped bytes are only read.
    #[display("ro")]
    ReadOnly,

    /// The mapped bytes are only written.
    #[display("wo")]
    WriteOnly,

    /// The mapped bytes are read and written.
    #[display("rw")]
    ReadWrite,
}

/// Creates allocation pools for benchmark workers.
///
/// The benchmark creates one pool per worker, on the worker's own thread, so the pools
/// themselves do not need to be thread-safe. The allocator is shared by all workers.
pub trait Allocator: Debug + Send + Sync + 'static {
    /// The pool type created by this allocator.
    type Pool: AllocationPool;

    /// Creates a new, empty pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the pool cannot be created.
    fn create_pool(&self) -> Result<Self::Pool, Error>;
}

/// One pool of a compacting slab-style allocator.
///
/// Dropping the pool destroys it. The benchmark frees every handle it allocated before the
/// pool is dropped.
pub trait AllocationPool: Debug {
    /// Opaque identifier of one allocated object.
    type Handle: Copy + Debug + Eq;

    /// Allocates an object of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the object cannot be allocated.
    fn allocate(&mut self, size: usize) -> Result<Self::Handle, Error>;

    /// Maps the object so its bytes can be accessed.
    ///
    /// The returned buffer borrows the pool, so it is necessarily released before
    /// [`unmap()`][Self::unmap] is called for the same handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MapFailed`] if the allocator refuses to map the object.
    fn map(&mut self, handle: Self::Handle, mode: MapMode) -> Result<&mut [u8], Error>;

    /// Releases the mapping created by the latest [`map()`][Self::map] of the handle.
    fn unmap(&mut self, handle: Self::Handle);

    /// Frees the object. Freeing a handle that is no longer allocated is a no-op.
    fn free(&mut self, handle: Self::Handle);

    /// Reports whether the object's bytes cross a boundary between two underlying pages.
    ///
    /// Returns `None` if the allocator does not expose object placement.
    fn spans_pages(&self, handle: Self::Handle) -> Option<bool> {
        _ = handle;
        None
    }
}
