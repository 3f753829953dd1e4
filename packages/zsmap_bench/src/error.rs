use many_cpus::ProcessorId;
use thiserror::Error;

/// Errors that can end a benchmark worker or prevent a benchmark from starting.
///
/// Apart from [`Error::Construction`] returned by [`Benchmark::run()`][crate::Benchmark::run],
/// these are reported per worker and never abort sibling workers.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The allocator could not create a pool or allocate an object.
    #[error("out of memory: {context}")]
    OutOfMemory {
        /// What was being allocated when the failure occurred.
        context: String,
    },

    /// The allocator refused to map an object.
    #[error("failed to map object {handle}")]
    MapFailed {
        /// Debug rendering of the handle that could not be mapped.
        handle: String,
    },

    /// A worker could not be constructed from the provided configuration or host resources.
    #[error("cannot construct worker for processor {processor_id}: {problem}")]
    Construction {
        /// The processor the worker was meant to run on.
        processor_id: ProcessorId,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// The cycle counter could not be started or read.
    #[error("cycle counter failed: {problem}")]
    CycleCounter {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The benchmark configuration is not usable.
    #[error("invalid benchmark configuration: {problem}")]
    InvalidConfig {
        /// A human-readable description of the problem.
        problem: String,
    },
}

impl Error {
    pub(crate) fn out_of_memory(context: impl Into<String>) -> Self {
        Self::OutOfMemory {
            context: context.into(),
        }
    }

    pub(crate) fn map_failed(handle: &impl std::fmt::Debug) -> Self {
        Self::MapFailed {
            handle: format!("{handle:?}"),
        }
    }

    pub(crate) fn construction(processor_id: ProcessorId, problem: impl Into<String>) -> Self {
        Self::Construction {
            processor_id,
            problem: problem.into(),
        }
    }

    pub(crate) fn cycle_counter(error: &std::io::Error) -> Self {
        Self::CycleCounter {
            problem: error.to_string(),
        }
    }

    pub(crate) fn invalid_config(problem: impl Into<String>) -> Self {
        Self::InvalidConfig {
            problem: problem.into(),
        }
    }
}

/// A specialized `Result` type for benchmark operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
