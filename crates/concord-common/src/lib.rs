//! # concord-common
//!
//! Common types, configuration and error codes for Concord.
//!
//! This crate provides the foundational types shared by every Concord
//! component:
//!
//! - **Types**: identifiers (`TxnId`, `NodeId`, `Lsn`) and the global
//!   commit/abort [`Decision`]
//! - **Config**: node and cluster configuration loaded from TOML
//! - **Errors**: stable error codes used on the wire and in status reports
//! - **Constants**: protocol and storage limits
//!
//! ## Example
//!
//! ```rust
//! use concord_common::types::{NodeId, TxnId};
//!
//! let coordinator = NodeId::new(1);
//! let txn = TxnId::compose(coordinator, 7);
//! assert_eq!(txn.coordinator(), coordinator);
//! assert_eq!(txn.sequence(), 7);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::{ConfigError, NodeConfig, PeerConfig, TimeoutConfig};
pub use constants::*;
pub use error::ErrorCode;
pub use types::{Access, Decision, Lsn, NodeId, TxnId, Vote};
