mod abstractions;
mod facade;
mod real;

pub(crate) use abstractions::*;
pub(crate) use facade::*;
pub(crate) use real::*;

#[cfg(test)]
mod fake;
#[cfg(test)]
pub(crate) use fake::*;
