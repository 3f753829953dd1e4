#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Binary entry point: measures map/unmap of a page-spanning object on the reference allocator.
//!
//! Excluded from mutation testing because checking process exit behavior requires spawning
//! subprocesses.

use std::env;
use std::io;
use std::num::NonZero;
use std::process::ExitCode;
use std::time::Duration;

use argh::FromArgs;
use tracing::Level;
use tracing::error;
use zsmap_bench::{Benchmark, CounterKind, ReferenceAllocator, RunOutcome, host_page_size};

const EXIT_FAILED_RUN: u8 = 1;
// Also used for invalid arguments.
const EXIT_CANNOT_START: u8 = 2;

/// Measures how many CPU cycles it takes to map and unmap a slab allocator object that spans
/// two pages, on every processor at once.
#[derive(FromArgs)]
struct Args {
    /// run a single worker on the lowest-numbered processor
    #[argh(switch)]
    single_threaded: bool,

    /// how long to measure, in milliseconds (default 1000)
    #[argh(option)]
    duration_ms: Option<u64>,

    /// size of each allocated object in bytes (default: about 40% of the page size)
    #[argh(option)]
    object_size: Option<NonZero<usize>>,

    /// page size in bytes (default: the host page size)
    #[argh(option)]
    page_size: Option<NonZero<usize>>,

    /// cycle counter to use (tsc, perf)
    #[argh(option)]
    counter: Option<CounterKind>,

    /// log worker lifecycle details
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    let env_args = env::args().collect::<Vec<_>>();
    let str_args = env_args.iter().map(String::as_str).collect::<Vec<_>>();

    let program_name = str_args
        .first()
        .expect("std::env::args() always provides at least the program name");

    let args = match Args::from_args(&[program_name], str_args.get(1..).unwrap_or(&[])) {
        Ok(args) => args,
        Err(early_exit) => {
            return if early_exit.status.is_ok() {
                println!("{}", early_exit.output);
                ExitCode::SUCCESS
            } else {
                eprintln!("{}", early_exit.output);
                ExitCode::from(EXIT_CANNOT_START)
            };
        }
    };

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    let page_size = args.page_size.unwrap_or_else(host_page_size);

    let mut builder = Benchmark::builder(ReferenceAllocator::with_page_size(page_size))
        .single_threaded(args.single_threaded)
        .page_size(page_size);

    if let Some(duration_ms) = args.duration_ms {
        builder = builder.duration(Duration::from_millis(duration_ms));
    }

    if let Some(object_size) = args.object_size {
        builder = builder.object_size(object_size);
    }

    if let Some(counter) = args.counter {
        builder = builder.counter(counter);
    }

    let benchmark = match builder.build() {
        Ok(benchmark) => benchmark,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CANNOT_START);
        }
    };

    let report = match benchmark.run() {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CANNOT_START);
        }
    };

    println!("{report}");

    match report.outcome() {
        RunOutcome::Success => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_FAILED_RUN),
    }
}
