//! WAL record types and serialization.
//!
//! Records are serialized with a fixed-size header followed by a
//! variable-length payload.

pub mod header;
pub mod payload;
pub mod types;

pub use header::RecordHeader;
pub use payload::{LogPayload, OperationPayload};
pub use types::{LogRecord, RecordFlags, RecordKind, Role};
