use std::io;
use std::thread;

use itertools::Itertools;
use many_cpus::{Processor, ProcessorId, SystemHardware};

use crate::CounterKind;
use crate::pal::{CycleCounterFacade, Platform};

pub(crate) static BUILD_TARGET_PLATFORM: BuildTargetPlatform = BuildTargetPlatform;

/// The real platform, with processor topology and thread pinning provided by `many_cpus`.
#[derive(Debug)]
pub(crate) struct BuildTargetPlatform;

impl Platform for BuildTargetPlatform {
    #[cfg_attr(test, mutants::skip)] // Result depends on the host.
    fn online_processors(&self) -> Vec<ProcessorId> {
        SystemHardware::current()
            .processors()
            .iter()
            .map(Processor::id)
            .sorted_unstable()
            .collect()
    }

    fn pin_current_thread_to(&self, processor_id: ProcessorId) -> bool {
        let Some(processors) = SystemHardware::current()
            .processors()
            .filter(|p| p.id() == processor_id)
        else {
            return false;
        };

        processors.pin_current_thread_to();
        true
    }

    #[cfg_attr(test, mutants::skip)] // Result depends on the host.
    fn current_processor_id(&self) -> ProcessorId {
        SystemHardware::current().current_processor_id()
    }

    fn new_cycle_counter(&self, kind: CounterKind) -> io::Result<CycleCounterFacade> {
        match kind {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
            CounterKind::Timestamp => Ok(crate::pal::TimestampCounter::new().into()),
            #[cfg(target_os = "linux")]
            CounterKind::Perf => Ok(crate::pal::PerfCycleCounter::open()?.into()),
            #[allow(
                unreachable_patterns,
                reason = "only reachable on targets missing one of the counters"
            )]
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("the {kind} cycle counter is not available on this platform"),
            )),
        }
    }

    #[inline]
    #[cfg_attr(test, mutants::skip)] // Scheduling hint, no observable effect.
    fn yield_now(&self) {
        thread::yield_now();
    }
}

#[cfg(test)]
#[cfg(not(miri))] // Miri cannot talk to the real platform.
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn online_processors_are_sorted_and_unique() {
        let processors = BUILD_TARGET_PLATFORM.online_processors();

        assert!(!processors.is_empty());
        assert!(processors.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn pinning_to_unknown_processor_is_refused() {
        let unknown = BUILD_TARGET_PLATFORM
            .online_processors()
            .last()
            .copied()
            .unwrap()
            .saturating_add(1000);

        assert!(!BUILD_TARGET_PLATFORM.pin_current_thread_to(unknown));
    }

    #[test]
    fn pinned_thread_runs_on_its_processor() {
        let target = *BUILD_TARGET_PLATFORM.online_processors().first().unwrap();

        let observed = thread::spawn(move || {
            assert!(BUILD_TARGET_PLATFORM.pin_current_thread_to(target));
            BUILD_TARGET_PLATFORM.current_processor_id()
        })
        .join()
        .unwrap();

        assert_eq!(observed, target);
    }
}
