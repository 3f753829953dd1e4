use std::fmt::Debug;
use std::io;

use many_cpus::ProcessorId;

use crate::CounterKind;
use crate::pal::CycleCounterFacade;

pub(crate) trait Platform: Debug + Send + Sync + 'static {
    /// Online processors in ascending ID order. Never empty.
    fn online_processors(&self) -> Vec<ProcessorId>;

    /// Returns `false` if the processor is not known to the platform.
    fn pin_current_thread_to(&self, processor_id: ProcessorId) -> bool;

    fn current_processor_id(&self) -> ProcessorId;

    /// Counters measure the calling thread, so this must be called on the measuring thread.
    fn new_cycle_counter(&self, kind: CounterKind) -> io::Result<CycleCounterFacade>;

    fn yield_now(&self);
}

/// A per-processor cycle count source.
///
/// Readings are only comparable when taken on the same processor.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait CycleCounter: Debug + Send {
    /// Prepares the counter for a measurement window and returns the starting value.
    fn start(&mut self) -> io::Result<u64>;

    /// Returns the value at the end of the measurement window and releases the counter.
    fn finish(&mut self) -> io::Result<u64>;
}
