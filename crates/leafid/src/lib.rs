#![doc = include_str!("../README.md")]

#[cfg(feature = "client")]
pub mod client;
mod error;
pub mod repo;
pub mod segment;
mod service;
pub mod snowflake;
mod time;
pub mod worker;

pub use crate::error::*;
pub use crate::repo::{Allocation, MemoryRepo, Repo};
pub use crate::segment::{SegmentConfig, SegmentIdGenerator};
pub use crate::service::*;
pub use crate::snowflake::SnowflakeGenerator;
pub use crate::time::*;
pub use crate::worker::{WorkerIdConfig, WorkerIdCoordinator, WorkerRegistration};
