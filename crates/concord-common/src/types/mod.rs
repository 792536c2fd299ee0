//! Type definitions for Concord.
//!
//! This module contains the identifier types used across every crate,
//! together with the small protocol vocabulary (votes, decisions, access
//! modes) that is persisted in the log and sent on the wire.

mod access;
mod decision;
mod ids;

pub use access::Access;
pub use decision::{Decision, Vote};
pub use ids::{Lsn, NodeId, TxnId};
