use std::io;

use crate::pal::CycleCounter;

/// The free-running processor timestamp counter.
///
/// On x86 this is `rdtsc`, fenced so that neither earlier nor later instructions are
/// reordered across the read. On aarch64 this is the virtual counter `cntvct_el0`, which is
/// readable from user mode but ticks at a fixed frequency rather than the core clock.
#[derive(Debug, Default)]
pub(crate) struct TimestampCounter;

impl TimestampCounter {
    pub(crate) const fn new() -> Self {
        Self
    }

    #[inline(always)]
    #[cfg(target_arch = "x86_64")]
    pub(crate) fn read() -> u64 {
        use std::arch::x86_64::{_mm_lfence, _rdtsc};

        // SAFETY: The timestamp counter and lfence are baseline x86_64 instructions.
        unsafe {
            _mm_lfence();
            let value = _rdtsc();
            _mm_lfence();
            value
        }
    }

    #[inline(always)]
    #[cfg(target_arch = "x86")]
    pub(crate) fn read() -> u64 {
        use std::arch::x86::{_mm_lfence, _rdtsc};

        // SAFETY: Every x86 processor that can run Rust std has rdtsc and lfence (SSE2).
        unsafe {
            _mm_lfence();
            let value = _rdtsc();
            _mm_lfence();
            value
        }
    }

    #[inline(always)]
    #[cfg(target_arch = "aarch64")]
    pub(crate) fn read() -> u64 {
        let value: u64;

        // SAFETY: cntvct_el0 is readable from EL0 on every aarch64 operating system we target.
        // The isb keeps the read from being hoisted above preceding instructions.
        unsafe {
            std::arch::asm!(
                "isb",
                "mrs {value}, cntvct_el0",
                value = out(reg) value,
                options(nomem, nostack, preserves_flags)
            );
        }

        value
    }
}

impl CycleCounter for TimestampCounter {
    fn start(&mut self) -> io::Result<u64> {
        Ok(Self::read())
    }

    fn finish(&mut self) -> io::Result<u64> {
        Ok(Self::read())
    }
}
