//! Variable difficulty retargeting for Stratum mining pools.
//!
//! A pool wants each connected worker to submit shares at a steady rate.
//! [`vardiff::VardiffController`] watches the interval between a worker's
//! accepted shares and raises or lowers its share difficulty to keep that
//! interval near a configured target.

pub mod config;
pub mod error;
pub mod network;
pub mod persistence;
pub mod rate_buffer;
pub mod session;
pub mod tracing;
pub mod types;
pub mod vardiff;
