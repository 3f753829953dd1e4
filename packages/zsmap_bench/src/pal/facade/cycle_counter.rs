use std::fmt::Debug;
use std::io;

#[cfg(test)]
use crate::pal::MockCycleCounter;
#[cfg(target_os = "linux")]
use crate::pal::PerfCycleCounter;
#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
use crate::pal::TimestampCounter;
use crate::pal::CycleCounter;

pub(crate) enum CycleCounterFacade {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
    Timestamp(TimestampCounter),

    #[cfg(target_os = "linux")]
    Perf(PerfCycleCounter),

    #[cfg(test)]
    Mock(Box<MockCycleCounter>),
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
impl From<TimestampCounter> for CycleCounterFacade {
    fn from(counter: TimestampCounter) -> Self {
        Self::Timestamp(counter)
    }
}

#[cfg(target_os = "linux")]
impl From<PerfCycleCounter> for CycleCounterFacade {
    fn from(counter: PerfCycleCounter) -> Self {
        Self::Perf(counter)
    }
}

#[cfg(test)]
impl From<MockCycleCounter> for CycleCounterFacade {
    fn from(counter: MockCycleCounter) -> Self {
        Self::Mock(Box::new(counter))
    }
}

impl CycleCounter for CycleCounterFacade {
    #[inline]
    fn start(&mut self) -> io::Result<u64> {
        match self {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
            Self::Timestamp(counter) => counter.start(),
            #[cfg(target_os = "linux")]
            Self::Perf(counter) => counter.start(),
            #[cfg(test)]
            Self::Mock(counter) => counter.start(),
        }
    }

    #[inline]
    fn finish(&mut self) -> io::Result<u64> {
        match self {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
            Self::Timestamp(counter) => counter.finish(),
            #[cfg(target_os = "linux")]
            Self::Perf(counter) => counter.finish(),
            #[cfg(test)]
            Self::Mock(counter) => counter.finish(),
        }
    }
}

impl Debug for CycleCounterFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
            Self::Timestamp(counter) => counter.fmt(f),
            #[cfg(target_os = "linux")]
            Self::Perf(counter) => counter.fmt(f),
            #[cfg(test)]
            Self::Mock(counter) => counter.fmt(f),
        }
    }
}
