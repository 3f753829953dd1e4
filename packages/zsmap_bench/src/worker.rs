//! One measuring thread per processor.

use std::hint::black_box;
use std::panic;
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use derive_more::Display;
use many_cpus::ProcessorId;
use tracing::debug;

use crate::pal::{CycleCounter, Platform, PlatformFacade};
use crate::report::{Measurement, WorkerOutcome, WorkerReport};
use crate::start_gate::StartGate;
use crate::{AllocationPool, Allocator, CounterKind, Error, HandleSet, HandleSetLayout, MapMode};

/// Lifecycle of a [`MeasurementWorker`]. Transitions only ever move forward.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub(crate) enum WorkerState {
    #[display("idle")]
    Idle,
    #[display("running")]
    Running,
    #[display("stopping")]
    Stopping,
    #[display("stopped")]
    Stopped,
}

/// Readiness of one worker, sent once the thread is pinned and has its cycle counter.
pub(crate) type Readiness = (ProcessorId, crate::Result<()>);

/// Runs the timed map/unmap loop on the thread it is called from.
///
/// Owns nothing shared except the stop flag, which it only ever reads.
#[derive(Debug)]
pub(crate) struct MeasurementWorker {
    processor_id: ProcessorId,
    platform: PlatformFacade,
    stop: Arc<AtomicBool>,
    state: WorkerState,

    #[cfg(test)]
    history: Vec<WorkerState>,
}

impl MeasurementWorker {
    pub(crate) fn new(
        processor_id: ProcessorId,
        platform: PlatformFacade,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            processor_id,
            platform,
            stop,
            state: WorkerState::Idle,
            #[cfg(test)]
            history: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    /// Every state entered after `Idle`, in order.
    #[cfg(test)]
    pub(crate) fn history(&self) -> &[WorkerState] {
        &self.history
    }

    fn transition(&mut self, to: WorkerState) {
        debug!(
            processor_id = self.processor_id,
            from = %self.state,
            to = %to,
            "worker state changed"
        );

        self.state = to;

        #[cfg(test)]
        self.history.push(to);
    }

    /// Builds the worker's pool and handle set, measures until stopped and cleans up.
    ///
    /// Every handle is freed and the pool destroyed before this returns, whatever the outcome.
    pub(crate) fn run<A, C>(
        &mut self,
        allocator: &A,
        layout: HandleSetLayout,
        counter: &mut C,
    ) -> WorkerOutcome
    where
        A: Allocator,
        C: CycleCounter,
    {
        assert_eq!(
            self.state,
            WorkerState::Idle,
            "a measurement worker runs only once"
        );

        self.transition(WorkerState::Running);

        let handles = allocator
            .create_pool()
            .and_then(|pool| HandleSet::allocate(pool, layout));

        let mut handles = match handles {
            Ok(handles) => handles,
            Err(error) => {
                debug!(processor_id = self.processor_id, %error, "worker setup failed");
                self.transition(WorkerState::Stopped);
                return WorkerOutcome::Failed(error);
            }
        };

        debug!(
            processor_id = self.processor_id,
            handles = layout.handle_count().get(),
            spanned_index = layout.spanned_index(),
            "handle set allocated"
        );

        let result = self.measure(&mut handles, counter);

        self.transition(WorkerState::Stopping);

        drop(handles);

        self.transition(WorkerState::Stopped);

        match result {
            Ok(measurement) => {
                debug!(
                    processor_id = self.processor_id,
                    operations = measurement.operations(),
                    cycles = measurement.elapsed_cycles(),
                    "measurement completed"
                );

                WorkerOutcome::Measured(measurement)
            }
            Err(error) => WorkerOutcome::Failed(error),
        }
    }

    fn measure<P, C>(&self, handles: &mut HandleSet<P>, counter: &mut C) -> crate::Result<Measurement>
    where
        P: AllocationPool,
        C: CycleCounter,
    {
        let spanned = handles.spanned();
        let pool = handles.pool_mut();

        let mut operations: u64 = 0;
        let mut failure = None;

        let started_at = Instant::now();
        let start_cycles = counter
            .start()
            .map_err(|error| Error::cycle_counter(&error))?;

        while !self.stop.load(atomic::Ordering::Relaxed) {
            match pool.map(spanned, MapMode::ReadWrite) {
                Ok(buffer) => {
                    black_box(buffer);
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }

            pool.unmap(spanned);
            operations = operations.wrapping_add(1);

            self.platform.yield_now();
        }

        // Called after a map failure too, leaving the counter disabled.
        let end_cycles = counter.finish();
        let stopped_at = Instant::now();

        if let Some(error) = failure {
            debug!(
                processor_id = self.processor_id,
                operations,
                %error,
                "map failed, measurement aborted"
            );

            return Err(error);
        }

        let end_cycles = end_cycles.map_err(|error| {
            debug!(
                processor_id = self.processor_id,
                operations,
                %error,
                "cycle counter could not be read, measurement discarded"
            );

            Error::cycle_counter(&error)
        })?;

        Ok(Measurement {
            start_cycles,
            end_cycles,
            operations,
            started_at,
            stopped_at,
        })
    }
}

/// What a worker thread needs from the benchmark that spawns it.
#[derive(Debug)]
pub(crate) struct WorkerContext<A> {
    pub(crate) allocator: Arc<A>,
    pub(crate) platform: PlatformFacade,
    pub(crate) layout: HandleSetLayout,
    pub(crate) counter: CounterKind,
    pub(crate) gate: Arc<StartGate>,
    pub(crate) ready: mpsc::Sender<Readiness>,
}

/// A spawned worker thread pinned to one processor.
#[derive(Debug)]
pub(crate) struct WorkerThread {
    processor_id: ProcessorId,
    stop: Arc<AtomicBool>,
    join_handle: JoinHandle<WorkerReport>,
}

impl WorkerThread {
    /// Spawns the thread. It pins itself, opens its cycle counter, reports readiness and then
    /// waits for the start gate.
    pub(crate) fn spawn<A: Allocator>(
        processor_id: ProcessorId,
        context: WorkerContext<A>,
    ) -> crate::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));

        let join_handle = thread::Builder::new()
            .name(format!("zsmap-p{processor_id}"))
            .spawn({
                let stop = Arc::clone(&stop);
                move || worker_entrypoint(processor_id, context, stop)
            })
            .map_err(|e| {
                Error::construction(processor_id, format!("cannot spawn worker thread: {e}"))
            })?;

        Ok(Self {
            processor_id,
            stop,
            join_handle,
        })
    }

    pub(crate) fn processor_id(&self) -> ProcessorId {
        self.processor_id
    }

    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, atomic::Ordering::Relaxed);
    }

    /// Waits for the thread to exit. A panic in the worker is propagated to the caller.
    pub(crate) fn join(self) -> WorkerReport {
        match self.join_handle.join() {
            Ok(report) => report,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

fn worker_entrypoint<A: Allocator>(
    processor_id: ProcessorId,
    context: WorkerContext<A>,
    stop: Arc<AtomicBool>,
) -> WorkerReport {
    let WorkerContext {
        allocator,
        platform,
        layout,
        counter,
        gate,
        ready,
    } = context;

    // The orchestrator may have given up already, in which case nobody is listening.
    let mut counter = match prepare(processor_id, &platform, counter) {
        Ok(counter) => {
            _ = ready.send((processor_id, Ok(())));
            counter
        }
        Err(error) => {
            _ = ready.send((processor_id, Err(error.clone())));
            return WorkerReport::new(processor_id, WorkerOutcome::Failed(error));
        }
    };

    drop(ready);

    if !gate.wait() {
        debug!(processor_id, "start cancelled");
        return WorkerReport::new(
            processor_id,
            WorkerOutcome::Failed(Error::construction(
                processor_id,
                "benchmark start was cancelled",
            )),
        );
    }

    let mut worker = MeasurementWorker::new(processor_id, platform, stop);
    let outcome = worker.run(allocator.as_ref(), layout, &mut counter);

    WorkerReport::new(processor_id, outcome)
}

fn prepare(
    processor_id: ProcessorId,
    platform: &PlatformFacade,
    counter: CounterKind,
) -> crate::Result<crate::pal::CycleCounterFacade> {
    if !platform.pin_current_thread_to(processor_id) {
        return Err(Error::construction(
            processor_id,
            "cannot pin worker thread to its processor",
        ));
    }

    let current = platform.current_processor_id();
    if current != processor_id {
        return Err(Error::construction(
            processor_id,
            format!("pinned worker thread is running on processor {current}"),
        ));
    }

    debug!(processor_id, "worker thread pinned");

    platform.new_cycle_counter(counter).map_err(|e| {
        Error::construction(processor_id, format!("cannot open {counter} cycle counter: {e}"))
    })
}
