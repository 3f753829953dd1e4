#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Cycle-accurate measurement of the cost of mapping and unmapping an object that a compacting
//! slab allocator has split across two pages.
//!
//! Allocators in the zsmalloc family pack same-sized objects back to back into a handful of
//! pages that need not be contiguous. An object that crosses a page boundary cannot be handed
//! out as a plain pointer: mapping it involves gathering both fragments and unmapping it
//! involves scattering them back. This crate measures exactly that operation.
//!
//! # How a run works
//!
//! 1. One worker thread is started per online processor (or only on the lowest-numbered one)
//!    and pinned to it.
//! 2. Every worker creates its own pool from the [`Allocator`] under test and fills it with a
//!    [`HandleSet`]: as many objects as fit into two pages, the middle one crossing the
//!    boundary between them.
//! 3. All workers are released together. Each one samples its cycle counter, then maps and
//!    unmaps the spanning object in a loop, yielding the processor after every iteration.
//! 4. After the configured duration every worker is stopped, samples its cycle counter again
//!    and frees everything it allocated.
//!
//! The result is a [`RunReport`] with elapsed cycles, completed map/unmap pairs and cycles per
//! pair for every worker.
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use zsmap_bench::{Benchmark, ReferenceAllocator, RunOutcome};
//!
//! let benchmark = Benchmark::builder(ReferenceAllocator::new())
//!     .duration(Duration::from_millis(250))
//!     .build()
//!     .unwrap();
//!
//! let report = benchmark.run().unwrap();
//! println!("{report}");
//!
//! assert_eq!(report.outcome(), RunOutcome::Success);
//! ```
//!
//! # Allocators
//!
//! Any allocator can be measured by implementing [`Allocator`] and [`AllocationPool`]. The
//! crate ships [`ReferenceAllocator`], a user-space model of the zspage storage layout, which
//! the `zsmap_bench` binary measures.
//!
//! # Cycle counters
//!
//! [`CounterKind::Timestamp`] reads the free-running processor timestamp counter.
//! [`CounterKind::Perf`] uses a hardware cycle counter from the Linux performance monitoring
//! subsystem, reset when measurement starts. Both are only ever compared against readings
//! from the same processor.

mod allocator;
mod benchmark;
mod config;
mod error;
mod handle_set;
mod pal;
mod reference_pool;
mod report;
mod start_gate;
mod worker;

#[cfg(test)]
mod fake;

pub use allocator::*;
pub use benchmark::*;
pub use config::*;
pub use error::Error;
pub(crate) use error::Result;
pub use handle_set::*;
pub use reference_pool::*;
pub use report::*;
