//! WAL record payloads.
//!
//! Payloads are encoded with bincode. The record kind in the header is
//! derived from the payload variant and checked again when decoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use concord_common::types::{Access, Decision, NodeId, Vote};

use super::types::RecordKind;
use crate::error::{WalError, WalResult};

/// One operation applied by a participant, with its undo and redo images.
///
/// An image of `None` means the resource did not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPayload {
    /// Resource the operation touched.
    pub resource: String,
    /// Whether the operation read or wrote the resource.
    pub access: Access,
    /// Value before the operation (undo image).
    pub before: Option<i64>,
    /// Value after the operation (redo image).
    pub after: Option<i64>,
}

/// Typed payload of a log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    /// Coordinator enlisted the participants.
    Begin {
        /// Enlisted participants.
        participants: Vec<NodeId>,
    },
    /// Participant applied an operation.
    Operation(OperationPayload),
    /// Coordinator executed every operation and entered the voting phase.
    Prepare {
        /// Participants asked to vote.
        participants: Vec<NodeId>,
        /// Operations dispatched to each participant, parallel to
        /// `participants`.
        operation_counts: Vec<u32>,
    },
    /// Participant cast its vote.
    Vote {
        /// The vote.
        vote: Vote,
        /// Coordinator to ask for the outcome.
        coordinator: NodeId,
        /// Other participants, for cooperative termination.
        participants: Vec<NodeId>,
    },
    /// Global outcome, on the coordinator or once learned by a participant.
    Decision {
        /// The outcome.
        decision: Decision,
    },
    /// Nothing more will be logged for the transaction.
    End,
}

impl LogPayload {
    /// Returns the record kind matching this payload.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Begin { .. } => RecordKind::Begin,
            Self::Operation(_) => RecordKind::Operation,
            Self::Prepare { .. } => RecordKind::Prepare,
            Self::Vote { .. } => RecordKind::Vote,
            Self::Decision { .. } => RecordKind::Decision,
            Self::End => RecordKind::End,
        }
    }

    /// Serializes the payload to bytes.
    pub fn serialize(&self) -> WalResult<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| WalError::serialization_error(e.to_string()))
    }

    /// Deserializes a payload and checks it against the header's kind.
    pub fn deserialize(kind: RecordKind, bytes: &[u8]) -> WalResult<Self> {
        let payload: Self = bincode::deserialize(bytes)
            .map_err(|e| WalError::deserialization_error(e.to_string()))?;
        if payload.kind() != kind {
            return Err(WalError::deserialization_error(format!(
                "payload is {:?} but header says {:?}",
                payload.kind(),
                kind
            )));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_payload() {
        let payload = LogPayload::Operation(OperationPayload {
            resource: "alice".to_string(),
            access: Access::Write,
            before: Some(100),
            after: Some(70),
        });
        let bytes = payload.serialize().unwrap();
        let decoded = LogPayload::deserialize(RecordKind::Operation, &bytes).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let bytes = LogPayload::End.serialize().unwrap();
        assert!(LogPayload::deserialize(RecordKind::Begin, &bytes).is_err());
    }
}
