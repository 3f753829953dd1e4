mod platform;

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
mod timestamp;

#[cfg(target_os = "linux")]
mod perf;

pub(crate) use platform::*;

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) use timestamp::*;

#[cfg(target_os = "linux")]
pub(crate) use perf::*;

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_os = "linux"
)))]
compile_error!("zsmap_bench needs a readable cycle counter: x86, x86_64, aarch64 or Linux");
