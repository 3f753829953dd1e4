use std::num::NonZero;
use std::str::FromStr;
use std::time::Duration;

use derive_more::Display;
use new_zealand::nz;

/// Object sizes are multiples of this, like the size classes of the allocators measured.
const OBJECT_SIZE_GRANULARITY: usize = 16;

/// Returns the default object size for pages of `page_size` bytes: roughly 40% of a page,
/// rounded down to a multiple of 16 bytes.
///
/// Five such objects fill a two-page zspage almost exactly, with the middle one crossing the
/// page boundary. For 4 KiB pages this is 1632 bytes.
#[must_use]
pub fn default_object_size(page_size: NonZero<usize>) -> NonZero<usize> {
    let forty_percent = page_size.get().saturating_mul(2).checked_div(5).unwrap_or(0);
    let rounded = forty_percent
        .checked_div(OBJECT_SIZE_GRANULARITY)
        .unwrap_or(0)
        .saturating_mul(OBJECT_SIZE_GRANULARITY);

    NonZero::new(rounded).unwrap_or(const { NonZero::new(OBJECT_SIZE_GRANULARITY).unwrap() })
}

/// Long enough to amortize thread start and stop against many thousands of operations,
/// short enough for iterative use.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(1);

const FALLBACK_PAGE_SIZE: NonZero<usize> = nz!(4096);

/// Returns the page size of the host.
#[must_use]
#[cfg_attr(test, mutants::skip)] // Depends on the host, nothing to assert beyond plausibility.
pub fn host_page_size() -> NonZero<usize> {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        usize::try_from(size)
            .ok()
            .and_then(NonZero::new)
            .unwrap_or(FALLBACK_PAGE_SIZE)
    }

    #[cfg(not(unix))]
    {
        FALLBACK_PAGE_SIZE
    }
}

/// Selects the source of cycle counts for the measurement window.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CounterKind {
    /// The free-running processor timestamp counter (`rdtsc` on x86, `cntvct_el0` on aarch64).
    #[display("tsc")]
    Timestamp,

    /// A hardware cycle counter from the Linux performance monitoring subsystem, reset and
    /// enabled when measurement starts and disabled when it ends.
    #[display("perf")]
    Perf,
}

impl CounterKind {
    /// Whether this kind of counter exists on the build target.
    #[must_use]
    pub fn is_available(self) -> bool {
        match self {
            Self::Timestamp => cfg!(any(
                target_arch = "x86",
                target_arch = "x86_64",
                target_arch = "aarch64"
            )),
            Self::Perf => cfg!(target_os = "linux"),
        }
    }
}

impl Default for CounterKind {
    fn default() -> Self {
        if Self::Timestamp.is_available() {
            Self::Timestamp
        } else {
            Self::Perf
        }
    }
}

impl FromStr for CounterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tsc" => Ok(Self::Timestamp),
            "perf" => Ok(Self::Perf),
            _ => Err(format!(
                "Invalid counter: '{s}'. Valid options are: tsc, perf"
            )),
        }
    }
}

/// Immutable settings of one benchmark run, produced by
/// [`BenchmarkBuilder`][crate::BenchmarkBuilder].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct BenchmarkConfig {
    /// Run a single worker on the lowest-numbered processor instead of one per processor.
    pub single_threaded: bool,

    /// How long the workers measure before they are told to stop.
    pub duration: Duration,

    /// The size of every object in a worker's handle set. Defaults to
    /// [`default_object_size()`] of the page size.
    pub object_size: NonZero<usize>,

    /// The page size the handle set is laid out for.
    pub page_size: NonZero<usize>,

    /// The source of cycle counts.
    pub counter: CounterKind,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        let page_size = host_page_size();

        Self {
            single_threaded: false,
            duration: DEFAULT_DURATION,
            object_size: default_object_size(page_size),
            page_size,
            counter: CounterKind::default(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn counter_kind_round_trips_through_display() {
        for kind in [CounterKind::Timestamp, CounterKind::Perf] {
            assert_eq!(kind.to_string().parse::<CounterKind>().unwrap(), kind);
        }
    }

    #[test]
    fn counter_kind_rejects_unknown() {
        let error = "hpet".parse::<CounterKind>().unwrap_err();

        assert!(error.contains("hpet"));
    }

    #[test]
    fn default_counter_is_available() {
        assert!(CounterKind::default().is_available());
    }

    #[test]
    fn default_object_size_is_forty_percent_of_page() {
        assert_eq!(default_object_size(nz!(4096)).get(), 1632);
        assert_eq!(default_object_size(nz!(16384)).get(), 6544);
        assert_eq!(default_object_size(nz!(65536)).get(), 26208);
    }

    #[test]
    fn default_object_size_never_zero() {
        assert_eq!(default_object_size(nz!(1)).get(), 16);
    }

    #[test]
    fn default_config_matches_host_page() {
        let config = BenchmarkConfig::default();

        assert_eq!(config.object_size, default_object_size(config.page_size));
    }

    #[test]
    fn host_page_size_is_plausible() {
        let size = host_page_size().get();

        assert!(size.is_power_of_two());
        assert!(size >= 4096);
    }
}
