mod cycle_counter;
mod platform;

pub(crate) use cycle_counter::*;
pub(crate) use platform::*;
