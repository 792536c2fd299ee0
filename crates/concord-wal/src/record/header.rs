//! Fixed-size prefix of every log record.
//!
//! ```text
//! 0       2      3       4          8          12         20         28
//! +-------+------+-------+----------+----------+----------+----------+
//! | magic | kind | flags | len      | crc32    | lsn      | txn      |
//! +-------+------+-------+----------+----------+----------+----------+
//! ```
//!
//! `crc32` covers every other header field followed by the payload, so a
//! record whose length or LSN was damaged is rejected like one whose
//! payload was. All integers are big-endian.

use bytes::{Buf, BufMut};
use concord_common::constants::{WAL_RECORD_HEADER_SIZE, WAL_RECORD_MAGIC};
use concord_common::types::{Lsn, TxnId};

use super::types::{RecordFlags, RecordKind};
use crate::error::{WalError, WalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub kind: RecordKind,
    /// Role of the writer.
    pub flags: RecordFlags,
    pub payload_length: u32,
    pub checksum: u32,
}

impl RecordHeader {
    pub const SIZE: usize = WAL_RECORD_HEADER_SIZE;

    /// A header for `payload_length` bytes; the checksum is filled in by
    /// [`seal`](Self::seal).
    pub fn new(
        lsn: Lsn,
        txn_id: TxnId,
        kind: RecordKind,
        flags: RecordFlags,
        payload_length: u32,
    ) -> Self {
        Self {
            lsn,
            txn_id,
            kind,
            flags,
            payload_length,
            checksum: 0,
        }
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u16(WAL_RECORD_MAGIC);
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.payload_length);
        buf.put_u32(self.checksum);
        buf.put_u64(self.lsn.as_u64());
        buf.put_u64(self.txn_id.as_u64());
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.serialize(&mut &mut buf[..]);
        buf
    }

    /// Reads a header, rejecting short input, a wrong magic and unknown
    /// record kinds. The checksum is not verified here.
    pub fn deserialize(buf: &mut impl Buf) -> WalResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(WalError::deserialization_error(format!(
                "record header needs {} bytes, {} left",
                Self::SIZE,
                buf.remaining()
            )));
        }

        let magic = buf.get_u16();
        if magic != WAL_RECORD_MAGIC {
            return Err(WalError::deserialization_error(format!(
                "bad record magic {:#06x}",
                magic
            )));
        }
        let kind = RecordKind::from_u8(buf.get_u8())?;
        let flags = RecordFlags::from_bits_truncate(buf.get_u8());
        let payload_length = buf.get_u32();
        let checksum = buf.get_u32();
        let lsn = Lsn::new(buf.get_u64());
        let txn_id = TxnId::new(buf.get_u64());

        Ok(Self {
            lsn,
            txn_id,
            kind,
            flags,
            payload_length,
            checksum,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> WalResult<Self> {
        Self::deserialize(&mut &bytes[..])
    }

    /// Header plus payload.
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.payload_length as usize
    }

    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut unsealed = *self;
        unsealed.checksum = 0;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&unsealed.to_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn seal(&mut self, payload: &[u8]) {
        self.checksum = self.compute_checksum(payload);
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(payload)
    }
}
