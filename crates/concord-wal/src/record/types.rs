//! WAL record kinds, flags and the complete record type.

use bytes::{BufMut, BytesMut};
use concord_common::types::{Lsn, TxnId};

use super::header::RecordHeader;
use super::payload::LogPayload;
use crate::error::{WalError, WalResult};

/// Record kind identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordKind {
    /// Transaction enlisted its participants.
    Begin = 1,
    /// Local operation applied.
    Operation = 2,
    /// Voting phase started.
    Prepare = 3,
    /// Vote cast.
    Vote = 4,
    /// Global decision.
    Decision = 5,
    /// Transaction finished.
    End = 6,
}

impl RecordKind {
    /// Converts the record kind to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a record kind from a u8.
    pub fn from_u8(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(Self::Begin),
            2 => Ok(Self::Operation),
            3 => Ok(Self::Prepare),
            4 => Ok(Self::Vote),
            5 => Ok(Self::Decision),
            6 => Ok(Self::End),
            _ => Err(WalError::deserialization_error(format!(
                "Unknown record kind: {}",
                value
            ))),
        }
    }

    /// Returns true for records after which nothing changes for the writer.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Decision | Self::End)
    }
}

bitflags::bitflags! {
    /// Flags for WAL records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordFlags: u8 {
        /// Written by the transaction's coordinator.
        const COORDINATOR = 0b0000_0001;
        /// Written by a participant.
        const PARTICIPANT = 0b0000_0010;
    }
}

/// The role a node plays for the transaction a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Drives the commit protocol.
    Coordinator,
    /// Executes operations and votes.
    Participant,
}

impl Role {
    /// Returns the header flag for this role.
    pub const fn flags(self) -> RecordFlags {
        match self {
            Role::Coordinator => RecordFlags::COORDINATOR,
            Role::Participant => RecordFlags::PARTICIPANT,
        }
    }

    /// Recovers the role from header flags.
    pub fn from_flags(flags: RecordFlags) -> Option<Self> {
        if flags.contains(RecordFlags::COORDINATOR) {
            Some(Role::Coordinator)
        } else if flags.contains(RecordFlags::PARTICIPANT) {
            Some(Role::Participant)
        } else {
            None
        }
    }
}

/// A complete WAL record with header and typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Record header.
    pub header: RecordHeader,
    /// Record payload.
    pub payload: LogPayload,
}

impl LogRecord {
    /// Builds a record, computing its header and checksum.
    pub fn new(lsn: Lsn, txn_id: TxnId, role: Role, payload: LogPayload) -> WalResult<Self> {
        let bytes = payload.serialize()?;
        let mut header = RecordHeader::new(
            lsn,
            txn_id,
            payload.kind(),
            role.flags(),
            bytes.len() as u32,
        );
        header.seal(&bytes);
        Ok(Self { header, payload })
    }

    /// Returns the record's LSN.
    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    /// Returns the record's transaction.
    pub fn txn_id(&self) -> TxnId {
        self.header.txn_id
    }

    /// Returns the record kind.
    pub fn kind(&self) -> RecordKind {
        self.header.kind
    }

    /// Returns the role that wrote the record.
    pub fn role(&self) -> Option<Role> {
        Role::from_flags(self.header.flags)
    }

    /// Encodes header and payload into one buffer.
    pub fn encode(&self) -> WalResult<BytesMut> {
        let payload = self.payload.serialize()?;
        let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + payload.len());
        self.header.serialize(&mut buf);
        buf.put_slice(&payload);
        Ok(buf)
    }

    /// Decodes a record from a header and its payload bytes.
    pub fn decode(header: RecordHeader, payload: &[u8], verify: bool) -> WalResult<Self> {
        if verify && !header.verify_checksum(payload) {
            return Err(WalError::checksum_mismatch(
                header.lsn,
                header.checksum,
                header.compute_checksum(payload),
            ));
        }
        let payload = LogPayload::deserialize(header.kind, payload)?;
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_common::types::{Decision, NodeId};

    #[test]
    fn test_record_kind_conversion() {
        for kind in [
            RecordKind::Begin,
            RecordKind::Operation,
            RecordKind::Prepare,
            RecordKind::Vote,
            RecordKind::Decision,
            RecordKind::End,
        ] {
            assert_eq!(RecordKind::from_u8(kind.as_u8()).unwrap(), kind);
        }
        assert!(RecordKind::from_u8(0).is_err());
        assert!(RecordKind::End.is_terminal());
        assert!(!RecordKind::Vote.is_terminal());
    }

    #[test]
    fn test_role_flags() {
        assert_eq!(
            Role::from_flags(Role::Coordinator.flags()),
            Some(Role::Coordinator)
        );
        assert_eq!(
            Role::from_flags(Role::Participant.flags()),
            Some(Role::Participant)
        );
        assert_eq!(Role::from_flags(RecordFlags::empty()), None);
    }

    #[test]
    fn test_record_encode_decode() {
        let record = LogRecord::new(
            Lsn::new(3),
            TxnId::compose(NodeId::new(1), 9),
            Role::Coordinator,
            LogPayload::Decision {
                decision: Decision::Commit,
            },
        )
        .unwrap();

        let bytes = record.encode().unwrap();
        let header = RecordHeader::from_bytes(&bytes[..RecordHeader::SIZE]).unwrap();
        let decoded = LogRecord::decode(header, &bytes[RecordHeader::SIZE..], true).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.role(), Some(Role::Coordinator));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let record = LogRecord::new(
            Lsn::new(1),
            TxnId::new(1),
            Role::Participant,
            LogPayload::End,
        )
        .unwrap();
        let mut bytes = record.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let header = RecordHeader::from_bytes(&bytes[..RecordHeader::SIZE]).unwrap();
        let err = LogRecord::decode(header, &bytes[RecordHeader::SIZE..], true).unwrap_err();
        assert!(err.is_corruption());
    }
}
