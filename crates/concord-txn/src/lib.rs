//! # concord-txn
//!
//! Node-local transaction machinery for Concord.
//!
//! This crate provides:
//!
//! - **Lock Management**: strict two-phase locking with shared (S) and
//!   exclusive (X) modes, FIFO wait queues and bounded waits.
//!
//! - **Deadlock Handling**: a pluggable [`DeadlockPolicy`] consulted before
//!   a request starts waiting. The default relies on lock timeouts alone;
//!   [`WaitForGraph`] adds cycle detection.
//!
//! - **Resource Management**: the [`ResourceManager`] trait that applies
//!   and undoes individual operations, with [`MemoryStore`] as the
//!   account-balance implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Participant                   │
//! │          │                     │              │
//! │          ▼                     ▼              │
//! │   ┌─────────────┐      ┌─────────────────┐    │
//! │   │ LockManager │      │ ResourceManager │    │
//! │   └─────────────┘      └─────────────────┘    │
//! │          │                                    │
//! │          ▼                                    │
//! │   ┌────────────────┐                          │
//! │   │ DeadlockPolicy │                          │
//! │   └────────────────┘                          │
//! └───────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;

/// Lock table implementation.
///
/// This module provides:
/// - [`lock::LockManager`]: grants and releases locks
/// - [`lock::LockMode`]: Shared and Exclusive
/// - [`lock::ResourceId`]: identifies lockable resources
pub mod lock;

/// Deadlock handling strategies.
pub mod deadlock;

/// Local resource state.
pub mod resource;

pub use error::{LockError, ResourceError};

pub use lock::{LockManager, LockManagerConfig, LockMode, LockResult, LockStats, ResourceId};

pub use deadlock::{DeadlockPolicy, DeadlockStats, TimeoutOnly, WaitForGraph};

pub use resource::{Applied, MemoryStore, OpPayload, Operation, ResourceManager};
