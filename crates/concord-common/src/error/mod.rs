//! Error codes shared across Concord crates.
//!
//! Each crate defines its own `thiserror` enum; the codes here are the
//! stable, wire-safe classification of those errors.

mod codes;

pub use codes::ErrorCode;
