//! Worker-id assignment for Snowflake generators.
//!
//! Processes sharing nothing but a coordination service each claim a distinct
//! worker id in `[0, 1023]` and keep the claim fresh with a heartbeat. The
//! last id is cached on disk so a restart can proceed while the service is
//! down.

mod assign;
mod coordinator;
mod endpoint;
mod memory;

pub use assign::*;
pub use coordinator::*;
pub use endpoint::*;
pub use memory::*;
