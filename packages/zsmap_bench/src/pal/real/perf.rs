use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::pal::CycleCounter;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;

const ATTR_FLAG_DISABLED: u64 = 1 << 0;
const ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;

// _IO('$', n)
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;

/// The first published revision of `struct perf_event_attr`. The kernel accepts any revision
/// it knows and zero-fills the rest.
#[repr(C)]
#[derive(Debug, Default)]
struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
}

/// A hardware CPU cycle counter of the calling thread, read through the Linux performance
/// monitoring subsystem.
///
/// The counter is created disabled. [`start()`][CycleCounter::start] resets and enables it, so
/// the start value is zero by construction. [`finish()`][CycleCounter::finish] disables it and
/// returns the count accumulated in between.
#[derive(Debug)]
pub(crate) struct PerfCycleCounter {
    fd: OwnedFd,
}

impl PerfCycleCounter {
    /// Opens a cycle counter for the calling thread on whatever processor it runs on.
    ///
    /// Fails if the host does not expose hardware counters (common in virtual machines) or
    /// `perf_event_paranoid` forbids access.
    pub(crate) fn open() -> io::Result<Self> {
        let attr = PerfEventAttr {
            kind: PERF_TYPE_HARDWARE,
            size: u32::try_from(size_of::<PerfEventAttr>())
                .expect("attribute struct is a few dozen bytes"),
            config: PERF_COUNT_HW_CPU_CYCLES,
            flags: ATTR_FLAG_DISABLED | ATTR_FLAG_EXCLUDE_HV,
            ..PerfEventAttr::default()
        };

        // SAFETY: The attribute struct outlives the call and matches the kernel ABI layout of
        // the declared size. pid 0 with cpu -1 means "calling thread, any processor".
        let result = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &raw const attr,
                0 as libc::pid_t,
                -1 as libc::c_int,
                -1 as libc::c_int,
                0 as libc::c_ulong,
            )
        };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let raw_fd = libc::c_int::try_from(result).map_err(io::Error::other)?;

        // SAFETY: The kernel just handed us this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        Ok(Self { fd })
    }

    fn ioctl(&self, request: libc::c_ulong) -> io::Result<()> {
        // SAFETY: The descriptor is owned by us and the requests take no argument.
        let result = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, 0) };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn read_count(&self) -> io::Result<u64> {
        let mut value = 0_u64;

        loop {
            // SAFETY: We read at most 8 bytes into a local u64. Without read_format flags the
            // kernel returns exactly that.
            let bytes = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&raw mut value).cast::<libc::c_void>(),
                    size_of::<u64>(),
                )
            };

            if bytes < 0 {
                let error = io::Error::last_os_error();

                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                return Err(error);
            }

            if usize::try_from(bytes).ok() != Some(size_of::<u64>()) {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read {bytes} bytes of a {} byte cycle count", size_of::<u64>()),
                ));
            }

            return Ok(value);
        }
    }
}

impl CycleCounter for PerfCycleCounter {
    fn start(&mut self) -> io::Result<u64> {
        self.ioctl(PERF_EVENT_IOC_RESET)?;
        self.ioctl(PERF_EVENT_IOC_ENABLE)?;
        Ok(0)
    }

    fn finish(&mut self) -> io::Result<u64> {
        self.ioctl(PERF_EVENT_IOC_DISABLE)?;
        self.read_count()
    }
}

#[cfg(test)]
#[cfg(not(miri))] // Miri cannot talk to the kernel.
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fs::File;

    use super::*;

    #[test]
    fn attr_matches_first_abi_revision() {
        // PERF_ATTR_SIZE_VER0
        assert_eq!(size_of::<PerfEventAttr>(), 64);
    }

    #[test]
    fn counts_from_zero_when_available() {
        // Hardware counters are frequently unavailable in CI containers and virtual machines.
        let Ok(mut counter) = PerfCycleCounter::open() else {
            return;
        };

        assert_eq!(counter.start().unwrap(), 0);

        let mut sum = 0_u64;
        for i in 0..10_000_u64 {
            sum = std::hint::black_box(sum.wrapping_add(i));
        }

        // A counter may open but never schedule (e.g. all PMU slots taken), yielding zero.
        let _count = counter.finish().unwrap();
        assert!(sum > 0);
    }

    #[test]
    fn descriptor_failures_are_errors_not_zero() {
        // /dev/null rejects perf ioctls and reads nothing, like a broken counter would.
        let mut counter = PerfCycleCounter {
            fd: File::open("/dev/null").unwrap().into(),
        };

        assert!(counter.start().is_err());
        assert!(counter.finish().is_err());
        assert_eq!(
            counter.read_count().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
