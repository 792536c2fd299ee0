//! # concord-test
//!
//! Integration tests for Concord.
//!
//! This crate contains:
//! - An in-memory test cluster with fault injection
//! - Polling helpers for asynchronous protocol progress
//! - Integration tests under `tests/` for atomicity, isolation,
//!   write-ahead logging, recovery and the failure scenarios

#![warn(missing_docs)]
#![warn(clippy::all)]

/// In-memory test clusters.
pub mod cluster;

/// Test utilities and helpers.
pub mod utils;

pub use cluster::{ClusterBuilder, TestCluster};
pub use utils::{fast_timeouts, wait_until};
