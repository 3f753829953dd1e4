use std::fmt::Debug;
use std::io;
#[cfg(test)]
use std::sync::Arc;

use many_cpus::ProcessorId;

use crate::CounterKind;
#[cfg(test)]
use crate::pal::FakePlatform;
use crate::pal::{BUILD_TARGET_PLATFORM, BuildTargetPlatform, CycleCounterFacade, Platform};

#[derive(Clone)]
pub(crate) enum PlatformFacade {
    Real(&'static BuildTargetPlatform),

    #[cfg(test)]
    Fake(Arc<FakePlatform>),
}

impl PlatformFacade {
    pub(crate) fn real() -> Self {
        Self::Real(&BUILD_TARGET_PLATFORM)
    }

    #[cfg(test)]
    pub(crate) fn from_fake(fake: FakePlatform) -> Self {
        Self::Fake(Arc::new(fake))
    }
}

impl Platform for PlatformFacade {
    fn online_processors(&self) -> Vec<ProcessorId> {
        match self {
            Self::Real(p) => p.online_processors(),
            #[cfg(test)]
            Self::Fake(p) => p.online_processors(),
        }
    }

    fn pin_current_thread_to(&self, processor_id: ProcessorId) -> bool {
        match self {
            Self::Real(p) => p.pin_current_thread_to(processor_id),
            #[cfg(test)]
            Self::Fake(p) => p.pin_current_thread_to(processor_id),
        }
    }

    fn current_processor_id(&self) -> ProcessorId {
        match self {
            Self::Real(p) => p.current_processor_id(),
            #[cfg(test)]
            Self::Fake(p) => p.current_processor_id(),
        }
    }

    fn new_cycle_counter(&self, kind: CounterKind) -> io::Result<CycleCounterFacade> {
        match self {
            Self::Real(p) => p.new_cycle_counter(kind),
            #[cfg(test)]
            Self::Fake(p) => p.new_cycle_counter(kind),
        }
    }

    #[inline]
    fn yield_now(&self) {
        match self {
            Self::Real(p) => p.yield_now(),
            #[cfg(test)]
            Self::Fake(p) => p.yield_now(),
        }
    }
}

impl From<&'static BuildTargetPlatform> for PlatformFacade {
    fn from(p: &'static BuildTargetPlatform) -> Self {
        Self::Real(p)
    }
}

#[cfg(test)]
impl From<FakePlatform> for PlatformFacade {
    fn from(p: FakePlatform) -> Self {
        Self::Fake(Arc::new(p))
    }
}

impl Debug for PlatformFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real(p) => p.fmt(f),
            #[cfg(test)]
            Self::Fake(p) => p.fmt(f),
        }
    }
}
