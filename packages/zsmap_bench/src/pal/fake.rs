#![cfg_attr(coverage_nightly, coverage(off))]

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{self, AtomicU64};
use std::thread::{self, ThreadId};

use many_cpus::ProcessorId;

use crate::CounterKind;
use crate::pal::{CycleCounterFacade, MockCycleCounter, Platform};

thread_local! {
    static PINNED_TO: Cell<Option<ProcessorId>> = const { Cell::new(None) };
}

/// Cycles that pass between `start()` and `finish()` of every fake counter.
pub(crate) const FAKE_CYCLES_PER_WINDOW: u64 = 1_000_000;

/// A platform with a configurable set of processors that only pretends to pin threads.
///
/// It records which processor every thread was pinned to and, on every yield, which processor
/// the yielding thread believed it was on. Cycle counters are mocks whose window always spans
/// [`FAKE_CYCLES_PER_WINDOW`] cycles.
#[derive(Debug)]
pub(crate) struct FakePlatform {
    processors: Vec<ProcessorId>,
    refuse_counters: bool,

    next_counter_base: AtomicU64,
    pins: Mutex<Vec<(ThreadId, ProcessorId)>>,
    yields: Mutex<HashMap<(ThreadId, Option<ProcessorId>), u64>>,
}

impl FakePlatform {
    pub(crate) fn with_processors(processors: impl IntoIterator<Item = ProcessorId>) -> Self {
        let mut processors = processors.into_iter().collect::<Vec<_>>();
        processors.sort_unstable();

        assert!(!processors.is_empty(), "a platform has at least one processor");

        Self {
            processors,
            refuse_counters: false,
            next_counter_base: AtomicU64::new(1_000),
            pins: Mutex::new(Vec::new()),
            yields: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn refusing_counters(mut self) -> Self {
        self.refuse_counters = true;
        self
    }

    /// Every (thread, processor) pinning that took place.
    pub(crate) fn pins(&self) -> Vec<(ThreadId, ProcessorId)> {
        self.pins.lock().unwrap().clone()
    }

    /// Yield counts keyed by the yielding thread and the processor it was pinned to.
    pub(crate) fn yields(&self) -> HashMap<(ThreadId, Option<ProcessorId>), u64> {
        self.yields.lock().unwrap().clone()
    }
}

impl Platform for FakePlatform {
    fn online_processors(&self) -> Vec<ProcessorId> {
        self.processors.clone()
    }

    fn pin_current_thread_to(&self, processor_id: ProcessorId) -> bool {
        if !self.processors.contains(&processor_id) {
            return false;
        }

        PINNED_TO.set(Some(processor_id));
        self.pins
            .lock()
            .unwrap()
            .push((thread::current().id(), processor_id));
        true
    }

    fn current_processor_id(&self) -> ProcessorId {
        PINNED_TO
            .get()
            .unwrap_or_else(|| *self.processors.first().unwrap())
    }

    fn new_cycle_counter(&self, kind: CounterKind) -> io::Result<CycleCounterFacade> {
        if self.refuse_counters {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("fake {kind} counter refused"),
            ));
        }

        // Each counter gets a different base to show that only same-counter readings are diffed.
        let base = self
            .next_counter_base
            .fetch_add(1_000_000_000, atomic::Ordering::Relaxed);

        let mut counter = MockCycleCounter::new();
        counter.expect_start().returning(move || Ok(base));
        counter
            .expect_finish()
            .returning(move || Ok(base + FAKE_CYCLES_PER_WINDOW));

        Ok(counter.into())
    }

    fn yield_now(&self) {
        *self
            .yields
            .lock()
            .unwrap()
            .entry((thread::current().id(), PINNED_TO.get()))
            .or_default() += 1;

        thread::yield_now();
    }
}
