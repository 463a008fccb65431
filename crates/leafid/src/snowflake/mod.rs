//! Time-ordered ids generated locally from a coordinated worker id.

mod generator;
mod lock;

pub use generator::*;
pub(crate) use lock::*;

#[cfg(test)]
mod tests;
