//! Packet header layout and payload rules.
//!
//! A packet is a 16-byte header (`op`, `rq_id`, `tx_id`, `len`, all
//! little-endian `u32`) followed by `len` payload bytes.

use crate::error::{Result, XsError};
use crate::protocol::op::Operation;

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 16;

/// Largest payload a packet may carry.
pub const MAX_PAYLOAD: usize = 4096;

/// Field separator inside payloads.
pub const NUL: u8 = 0;

/// A single message to or from XenStore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub op: Operation,
    /// Echoed back by the server in the matching reply.
    pub rq_id: u32,
    /// `0` means no transaction.
    pub tx_id: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet, rejecting payloads over [`MAX_PAYLOAD`].
    pub fn new(op: Operation, rq_id: u32, tx_id: u32, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(XsError::InvalidPayload(format!(
                "payload of {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_PAYLOAD
            )));
        }
        Ok(Self {
            op,
            rq_id,
            tx_id,
            payload,
        })
    }

    /// Serialize header and payload into one buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.op.code().to_le_bytes());
        buf.extend_from_slice(&self.rq_id.to_le_bytes());
        buf.extend_from_slice(&self.tx_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Payload with a single trailing NUL removed.
    pub fn payload_str(&self) -> &[u8] {
        self.payload.strip_suffix(&[NUL]).unwrap_or(&self.payload)
    }
}

/// Decoded header fields, before the payload has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub op: Operation,
    pub rq_id: u32,
    pub tx_id: u32,
    pub len: u32,
}

impl Header {
    /// Parse a header, validating operation code and declared length.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(XsError::UnexpectedPacket(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let code = word(0);
        let op = Operation::from_code(code)
            .ok_or_else(|| XsError::UnexpectedPacket(format!("unknown operation code {}", code)))?;
        let len = word(12);
        if len as usize > MAX_PAYLOAD {
            return Err(XsError::UnexpectedPacket(format!(
                "declared payload of {} bytes exceeds {} byte limit",
                len, MAX_PAYLOAD
            )));
        }

        Ok(Self {
            op,
            rq_id: word(4),
            tx_id: word(8),
            len,
        })
    }
}

/// Encode a packet into wire bytes.
pub fn encode(op: Operation, rq_id: u32, tx_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    Ok(Packet::new(op, rq_id, tx_id, payload)?.to_bytes())
}

/// Decode a packet from its header and the payload bytes read after it.
pub fn decode(header: &[u8], payload: &[u8]) -> Result<Packet> {
    let header = Header::parse(header)?;
    if header.len as usize != payload.len() {
        return Err(XsError::UnexpectedPacket(format!(
            "header declares {} payload bytes, got {}",
            header.len,
            payload.len()
        )));
    }
    Ok(Packet {
        op: header.op,
        rq_id: header.rq_id,
        tx_id: header.tx_id,
        payload: payload.to_vec(),
    })
}

/// A watch notification: the path that changed and the watch token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    pub path: Vec<u8>,
    pub token: Vec<u8>,
}

impl Event {
    pub fn new(path: impl Into<Vec<u8>>, token: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            token: token.into(),
        }
    }

    /// Parse a `WATCH_EVENT` payload (`path NUL token NUL`).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut fields = payload.split(|&b| b == NUL);
        match (fields.next(), fields.next()) {
            (Some(path), Some(token)) if !path.is_empty() => Ok(Self::new(path, token)),
            _ => Err(XsError::UnexpectedPacket(format!(
                "malformed watch event payload: {:?}",
                String::from_utf8_lossy(payload)
            ))),
        }
    }

    /// Lossy UTF-8 view of the path, for display.
    pub fn path_lossy(&self) -> String {
        String::from_utf8_lossy(&self.path).into_owned()
    }

    /// Lossy UTF-8 view of the token, for display.
    pub fn token_lossy(&self) -> String {
        String::from_utf8_lossy(&self.token).into_owned()
    }
}
