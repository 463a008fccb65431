//! Range-based ids allocated from a shared backing store.
//!
//! Every key owns a [`SegmentBuffer`] holding two ranges: one serving ids, the
//! other refilled in the background once the first is mostly consumed.
//! Reservations grow when refills come faster than [`SEGMENT_DURATION`] and
//! shrink when they come slower than twice that.

mod buffer;
mod generator;
mod range;
mod snapshot;

pub use buffer::*;
pub use generator::*;
pub use snapshot::*;
