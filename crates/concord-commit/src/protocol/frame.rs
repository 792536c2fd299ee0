//! Message frame format for wire transmission.
//!
//! ```text
//! +----------+----------+--------------+---------+----------+------------------+
//! | Magic(4) | From(4)  | RequestId(8) | Kind(1) | Len(4)   | Payload(Len)     |
//! +----------+----------+--------------+---------+----------+------------------+
//! ```
//!
//! A response carries the id of the request it answers, so several calls
//! can share one connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use concord_common::constants::{FRAME_MAGIC, MAX_FRAME_SIZE};
use concord_common::types::NodeId;

use super::{Request, Response};
use crate::transport::{TransportError, TransportResult};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 4 + 4 + 8 + 1 + 4; // magic + from + id + kind + len

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

/// Body of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A request to be answered.
    Request(Request),
    /// The answer to the request with the same id.
    Response(Response),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender.
    pub from: NodeId,
    /// Correlates a response with its request.
    pub request_id: u64,
    /// The message.
    pub message: Message,
}

impl Frame {
    /// Creates a request frame.
    pub fn request(from: NodeId, request_id: u64, request: Request) -> Self {
        Self {
            from,
            request_id,
            message: Message::Request(request),
        }
    }

    /// Creates a response frame.
    pub fn response(from: NodeId, request_id: u64, response: Response) -> Self {
        Self {
            from,
            request_id,
            message: Message::Response(response),
        }
    }
}

/// Encodes a frame.
pub fn encode(frame: &Frame) -> TransportResult<Bytes> {
    let (kind, payload) = match &frame.message {
        Message::Request(r) => (KIND_REQUEST, bincode::serialize(r)),
        Message::Response(r) => (KIND_RESPONSE, bincode::serialize(r)),
    };
    let payload = payload.map_err(|e| TransportError::SerializationFailed(e.to_string()))?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationFailed(format!(
            "message too large: {} bytes",
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(FRAME_MAGIC);
    buf.put_u32(frame.from.as_u32());
    buf.put_u64(frame.request_id);
    buf.put_u8(kind);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Decodes a complete frame.
pub fn decode(mut data: Bytes) -> TransportResult<Frame> {
    if data.len() < HEADER_SIZE {
        return Err(TransportError::DeserializationFailed(
            "frame too short".to_string(),
        ));
    }

    let magic = data.get_u32();
    if magic != FRAME_MAGIC {
        return Err(TransportError::DeserializationFailed(format!(
            "invalid magic: {:08x}",
            magic
        )));
    }

    let from = NodeId::new(data.get_u32());
    let request_id = data.get_u64();
    let kind = data.get_u8();
    let len = data.get_u32() as usize;

    if len > MAX_FRAME_SIZE {
        return Err(TransportError::DeserializationFailed(format!(
            "message too large: {} bytes",
            len
        )));
    }
    if data.len() < len {
        return Err(TransportError::DeserializationFailed(
            "incomplete frame".to_string(),
        ));
    }

    let payload = data.slice(..len);
    let message = match kind {
        KIND_REQUEST => bincode::deserialize(&payload).map(Message::Request),
        KIND_RESPONSE => bincode::deserialize(&payload).map(Message::Response),
        other => {
            return Err(TransportError::DeserializationFailed(format!(
                "unknown frame kind {}",
                other
            )))
        }
    }
    .map_err(|e| TransportError::DeserializationFailed(e.to_string()))?;

    Ok(Frame {
        from,
        request_id,
        message,
    })
}

/// Checks if a buffer starts with a complete frame.
///
/// Returns the frame size if complete, `None` if more data is needed, and
/// an error if the announced length is over the limit.
pub fn frame_size(data: &[u8]) -> TransportResult<Option<usize>> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([data[17], data[18], data[19], data[20]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::DeserializationFailed(format!(
            "message too large: {} bytes",
            len
        )));
    }

    let total = HEADER_SIZE + len;
    Ok((data.len() >= total).then_some(total))
}
