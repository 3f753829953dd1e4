//! Run orchestration: one pinned worker per processor, released together, stopped together.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::time::{Duration, Instant};

use many_cpus::ProcessorId;
use tracing::{debug, info, warn};

use crate::pal::{Platform, PlatformFacade};
use crate::start_gate::StartGate;
use crate::worker::{Readiness, WorkerContext, WorkerThread};
use crate::{
    Allocator, BenchmarkConfig, CounterKind, Error, HandleSetLayout, Result, RunReport,
    WorkerReport, default_object_size,
};

/// Measures the cycle cost of mapping and unmapping a page-spanning object, on every online
/// processor at once or on the lowest-numbered one only.
///
/// Each worker thread is pinned to its processor, builds its own pool from the allocator and
/// allocates a [`HandleSet`][crate::HandleSet] into it. After all workers are ready they are
/// released together, measure for the configured duration and are then stopped and joined.
///
/// # Lifetime
///
/// [`stop()`][Self::stop] may be called from another thread to end a run early. Dropping the
/// benchmark calls it too, so no worker thread outlives the benchmark.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use zsmap_bench::{Benchmark, ReferenceAllocator};
///
/// let benchmark = Benchmark::builder(ReferenceAllocator::new())
///     .single_threaded(true)
///     .duration(Duration::from_millis(100))
///     .build()
///     .unwrap();
///
/// let report = benchmark.run().unwrap();
/// println!("{report}");
/// ```
pub struct Benchmark<A: Allocator> {
    allocator: Arc<A>,
    config: BenchmarkConfig,
    layout: HandleSetLayout,
    platform: PlatformFacade,

    // Serializes runs. Not taken by `stop()`.
    run_lock: Mutex<()>,

    workers: Mutex<WorkerRegistry>,

    aborted: Mutex<bool>,
    abort_signal: Condvar,
}

/// The workers of the current run, keyed by the processor they are pinned to.
#[derive(Debug, Default)]
struct WorkerRegistry {
    running: BTreeMap<ProcessorId, WorkerThread>,
    gate: Option<Arc<StartGate>>,
    completed: Vec<WorkerReport>,
}

impl<A: Allocator> Benchmark<A> {
    /// Creates a builder for a benchmark against the given allocator.
    #[must_use]
    pub fn builder(allocator: A) -> BenchmarkBuilder<A> {
        BenchmarkBuilder::new(allocator)
    }

    /// The configuration of every run of this benchmark.
    #[must_use]
    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// The handle set layout every worker allocates.
    #[must_use]
    pub fn layout(&self) -> HandleSetLayout {
        self.layout
    }

    /// Runs the benchmark and blocks until every worker has been stopped and joined.
    ///
    /// Workers that fail after the run has started are reported in the returned
    /// [`RunReport`] and do not affect the others.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::Construction`] if any worker cannot be spawned, pinned or
    /// given a cycle counter. No worker starts measuring in that case and all the workers that
    /// were constructed are joined before this returns.
    ///
    /// # Panics
    ///
    /// Propagates a panic from a worker thread.
    pub fn run(&self) -> Result<RunReport> {
        let _run = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let processors = self.target_processors();

        info!(
            workers = processors.len(),
            duration = ?self.config.duration,
            object_size = self.layout.object_size().get(),
            handles = self.layout.handle_count().get(),
            counter = %self.config.counter,
            "starting benchmark"
        );

        if let Err(error) = self.construct_workers(&processors) {
            warn!(%error, "worker construction failed, cancelling the run");

            if let Some(gate) = self.registry().gate.take() {
                gate.cancel();
            }

            self.halt_workers();
            self.registry().completed.clear();

            return Err(error);
        }

        {
            let registry = self.registry();

            // A stopped benchmark releases its workers only to let them exit.
            if self.is_aborted() {
                for worker in registry.running.values() {
                    worker.signal_stop();
                }
            }

            if let Some(gate) = registry.gate.as_ref() {
                gate.open();
            }
        }

        debug!("all workers released");

        self.sleep(self.config.duration);
        self.halt_workers();

        let reports = mem::take(&mut self.registry().completed);

        for report in &reports {
            info!(processor_id = report.processor_id(), "{report}");
        }

        let report = RunReport::new(self.config.clone(), reports);

        info!(outcome = %report.outcome(), "benchmark finished");

        Ok(report)
    }

    /// Signals every worker of the current run to stop and waits for them to exit.
    ///
    /// A run in progress returns early with whatever the workers measured so far. Any later
    /// run stops as soon as its workers start. Calling this more than once has no further
    /// effect.
    ///
    /// # Panics
    ///
    /// Propagates a panic from a worker thread.
    pub fn stop(&self) {
        {
            let mut aborted = self.aborted.lock().unwrap_or_else(PoisonError::into_inner);
            *aborted = true;
            self.abort_signal.notify_all();
        }

        self.halt_workers();
    }

    fn target_processors(&self) -> Vec<ProcessorId> {
        let mut processors = self.platform.online_processors();

        if self.config.single_threaded {
            processors.truncate(1);
        }

        processors
    }

    fn is_aborted(&self) -> bool {
        *self.aborted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, WorkerRegistry> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns one worker per processor and waits until each has reported readiness.
    fn construct_workers(&self, processors: &[ProcessorId]) -> Result<()> {
        let gate = Arc::new(StartGate::new());
        let (ready_tx, ready_rx) = mpsc::channel::<Readiness>();

        self.registry().gate = Some(Arc::clone(&gate));

        for &processor_id in processors {
            let context = WorkerContext {
                allocator: Arc::clone(&self.allocator),
                platform: self.platform.clone(),
                layout: self.layout,
                counter: self.config.counter,
                gate: Arc::clone(&gate),
                ready: ready_tx.clone(),
            };

            let worker = WorkerThread::spawn(processor_id, context)?;
            debug!(processor_id = worker.processor_id(), "worker thread spawned");

            self.registry().running.insert(processor_id, worker);
        }

        drop(ready_tx);

        let mut pending = processors.to_vec();
        let mut first_error = None;

        while !pending.is_empty() {
            let Ok((processor_id, readiness)) = ready_rx.recv() else {
                // Every remaining sender is gone, so the pending workers died before reporting.
                let processor_id = *pending.first().expect("loop guard ensures non-empty");
                first_error.get_or_insert_with(|| {
                    Error::construction(processor_id, "worker thread exited before it was ready")
                });
                break;
            };

            pending.retain(|&id| id != processor_id);

            if let Err(error) = readiness {
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Blocks for the duration unless the benchmark is stopped first.
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now().checked_add(duration);

        let mut aborted = self.aborted.lock().unwrap_or_else(PoisonError::into_inner);

        while !*aborted {
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());

                    if remaining.is_zero() {
                        break;
                    }

                    remaining
                }
                None => Duration::MAX,
            };

            (aborted, _) = self
                .abort_signal
                .wait_timeout(aborted, timeout)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops and joins every running worker, keeping their reports for the run to collect.
    ///
    /// The registry stays locked throughout, so a concurrent caller returns only once all
    /// workers have been joined.
    fn halt_workers(&self) {
        let mut registry = self.registry();

        let running = mem::take(&mut registry.running);

        for worker in running.values() {
            worker.signal_stop();
        }

        // Workers still waiting to start see the stop flag as soon as they are released.
        if let Some(gate) = registry.gate.take() {
            gate.open();
        }

        for (processor_id, worker) in running {
            let report = worker.join();
            debug!(processor_id, "worker joined");

            registry.completed.push(report);
        }
    }
}

impl<A: Allocator> Drop for Benchmark<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<A: Allocator> fmt::Debug for Benchmark<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Benchmark")
            .field("allocator", &self.allocator)
            .field("config", &self.config)
            .field("layout", &self.layout)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`Benchmark`].
#[derive(Debug)]
pub struct BenchmarkBuilder<A: Allocator> {
    allocator: A,
    config: BenchmarkConfig,

    // Resolved against the final page size when building.
    object_size: Option<NonZero<usize>>,
}

impl<A: Allocator> BenchmarkBuilder<A> {
    fn new(allocator: A) -> Self {
        Self {
            allocator,
            config: BenchmarkConfig::default(),
            object_size: None,
        }
    }

    /// Runs a single worker on the lowest-numbered processor instead of one per processor.
    ///
    /// Default is `false`.
    #[must_use]
    pub fn single_threaded(mut self, single_threaded: bool) -> Self {
        self.config.single_threaded = single_threaded;
        self
    }

    /// Sets how long the workers measure before they are stopped.
    ///
    /// Default is [`DEFAULT_DURATION`][crate::DEFAULT_DURATION].
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.config.duration = duration;
        self
    }

    /// Sets the size of every object in the handle set.
    ///
    /// Default is [`default_object_size()`][crate::default_object_size] of the page size the
    /// benchmark is built with.
    #[must_use]
    pub fn object_size(mut self, object_size: NonZero<usize>) -> Self {
        self.object_size = Some(object_size);
        self
    }

    /// Sets the page size the handle set is laid out for.
    ///
    /// Default is the page size of the host.
    #[must_use]
    pub fn page_size(mut self, page_size: NonZero<usize>) -> Self {
        self.config.page_size = page_size;
        self
    }

    /// Selects the cycle counter.
    ///
    /// Default is [`CounterKind::default()`].
    #[must_use]
    pub fn counter(mut self, counter: CounterKind) -> Self {
        self.config.counter = counter;
        self
    }

    /// Builds the benchmark.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the object size and page size do not produce a
    /// handle set with an object crossing the page boundary.
    pub fn build(self) -> Result<Benchmark<A>> {
        self.build_with_platform(PlatformFacade::real())
    }

    pub(crate) fn build_with_platform(mut self, platform: PlatformFacade) -> Result<Benchmark<A>> {
        self.config.object_size = self
            .object_size
            .unwrap_or_else(|| default_object_size(self.config.page_size));

        let layout = HandleSetLayout::new(self.config.object_size, self.config.page_size)?;

        if !self.config.counter.is_available() {
            warn!(
                counter = %self.config.counter,
                "the selected cycle counter does not exist on this platform, every worker will fail"
            );
        }

        Ok(Benchmark {
            allocator: Arc::new(self.allocator),
            config: self.config,
            layout,
            platform,
            run_lock: Mutex::new(()),
            workers: Mutex::new(WorkerRegistry::default()),
            aborted: Mutex::new(false),
            abort_signal: Condvar::new(),
        })
    }
}
