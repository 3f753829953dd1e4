use std::fmt::{self, Display};
use std::time::{Duration, Instant};

use many_cpus::ProcessorId;

use crate::{BenchmarkConfig, Error};

/// The raw numbers one worker collected over its measurement window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Measurement {
    pub(crate) start_cycles: u64,
    pub(crate) end_cycles: u64,
    pub(crate) operations: u64,
    pub(crate) started_at: Instant,
    pub(crate) stopped_at: Instant,
}

impl Measurement {
    /// Cycle counter value sampled right before the first operation.
    #[must_use]
    pub fn start_cycles(&self) -> u64 {
        self.start_cycles
    }

    /// Cycle counter value sampled after the stop signal was observed.
    #[must_use]
    pub fn end_cycles(&self) -> u64 {
        self.end_cycles
    }

    /// Cycles elapsed between the two samples.
    ///
    /// Both samples come from the same processor, so the counter cannot have gone backwards.
    /// A counter reset by the host in between is reported as zero elapsed cycles.
    #[must_use]
    pub fn elapsed_cycles(&self) -> u64 {
        self.end_cycles.saturating_sub(self.start_cycles)
    }

    /// Completed map/unmap pairs.
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.operations
    }

    /// Mean cycles per map/unmap pair, or `None` if no operation completed.
    #[must_use]
    pub fn cycles_per_operation(&self) -> Option<u64> {
        self.elapsed_cycles().checked_div(self.operations)
    }

    /// Whether at least one operation completed, making the measurement meaningful.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.operations > 0
    }

    /// When the worker entered its measurement loop.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the worker observed the stop signal.
    #[must_use]
    pub fn stopped_at(&self) -> Instant {
        self.stopped_at
    }

    /// Wall-clock length of the measurement window.
    #[must_use]
    pub fn wall_time(&self) -> Duration {
        self.stopped_at.saturating_duration_since(self.started_at)
    }
}

/// How a worker ended.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum WorkerOutcome {
    /// The worker ran until stopped. The measurement may still contain no operations.
    Measured(Measurement),

    /// The worker failed, either before measuring or in the middle of it.
    Failed(Error),
}

/// The result of one worker, bound to one processor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerReport {
    processor_id: ProcessorId,
    outcome: WorkerOutcome,
}

impl WorkerReport {
    pub(crate) fn new(processor_id: ProcessorId, outcome: WorkerOutcome) -> Self {
        Self {
            processor_id,
            outcome,
        }
    }

    /// The processor the worker was pinned to.
    #[must_use]
    pub fn processor_id(&self) -> ProcessorId {
        self.processor_id
    }

    /// How the worker ended.
    #[must_use]
    pub fn outcome(&self) -> &WorkerOutcome {
        &self.outcome
    }

    /// The measurement, if the worker did not fail.
    #[must_use]
    pub fn measurement(&self) -> Option<&Measurement> {
        match &self.outcome {
            WorkerOutcome::Measured(measurement) => Some(measurement),
            WorkerOutcome::Failed(_) => None,
        }
    }

    /// The error, if the worker failed.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            WorkerOutcome::Measured(_) => None,
            WorkerOutcome::Failed(error) => Some(error),
        }
    }

    /// Whether the worker produced a measurement with at least one operation.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.measurement().is_some_and(Measurement::has_data)
    }
}

impl Display for WorkerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "processor {}: ", self.processor_id)?;

        match &self.outcome {
            WorkerOutcome::Measured(measurement) => match measurement.cycles_per_operation() {
                Some(per_op) => write!(
                    f,
                    "{} cycles, {} mappings, {per_op} cycles/map",
                    measurement.elapsed_cycles(),
                    measurement.operations()
                ),
                None => write!(
                    f,
                    "{} cycles, no mappings completed (no data)",
                    measurement.elapsed_cycles()
                ),
            },
            WorkerOutcome::Failed(error) => write!(f, "failed: {error}"),
        }
    }
}

/// Aggregate result of a benchmark run.
#[derive(Clone, Copy, Debug, derive_more::Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum RunOutcome {
    /// Every worker produced data.
    #[display("success")]
    Success,

    /// Some workers produced data and some did not.
    #[display("partial failure")]
    PartialFailure,

    /// No worker produced data.
    #[display("total failure")]
    TotalFailure,
}

/// The results of all the workers of one benchmark run, in processor order.
#[derive(Clone, Debug)]
pub struct RunReport {
    config: BenchmarkConfig,
    workers: Vec<WorkerReport>,
}

impl RunReport {
    pub(crate) fn new(config: BenchmarkConfig, mut workers: Vec<WorkerReport>) -> Self {
        workers.sort_by_key(WorkerReport::processor_id);

        Self { config, workers }
    }

    /// The configuration the run used.
    #[must_use]
    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// One report per worker, ordered by processor ID.
    #[must_use]
    pub fn workers(&self) -> &[WorkerReport] {
        &self.workers
    }

    /// Classifies the run by how many workers produced data.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        let with_data = self.workers.iter().filter(|w| w.has_data()).count();

        if with_data == 0 {
            RunOutcome::TotalFailure
        } else if with_data == self.workers.len() {
            RunOutcome::Success
        } else {
            RunOutcome::PartialFailure
        }
    }

    /// Map/unmap pairs completed by all workers together.
    #[must_use]
    pub fn total_operations(&self) -> u64 {
        self.workers
            .iter()
            .filter_map(WorkerReport::measurement)
            .map(Measurement::operations)
            .fold(0, u64::saturating_add)
    }

    /// Cycles per map/unmap pair over all workers that produced data, or `None` if none did.
    #[must_use]
    pub fn mean_cycles_per_operation(&self) -> Option<u64> {
        let (cycles, operations) = self
            .workers
            .iter()
            .filter_map(WorkerReport::measurement)
            .filter(|m| m.has_data())
            .fold((0_u64, 0_u64), |(cycles, operations), m| {
                (
                    cycles.saturating_add(m.elapsed_cycles()),
                    operations.saturating_add(m.operations()),
                )
            });

        cycles.checked_div(operations)
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for worker in &self.workers {
            writeln!(f, "{worker}")?;
        }

        let with_data = self.workers.iter().filter(|w| w.has_data()).count();

        write!(
            f,
            "{}: {with_data} of {} workers produced data, {} mappings",
            self.outcome(),
            self.workers.len(),
            self.total_operations()
        )?;

        match self.mean_cycles_per_operation() {
            Some(per_op) => write!(f, ", {per_op} cycles/map"),
            None => write!(f, ", no data"),
        }
    }
}
