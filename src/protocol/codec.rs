//! Packet codec for framing XenStore messages over a stream.
//!
//! Provides a tokio-util codec that turns a byte stream into [`Packet`]s and
//! back.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, XsError};
use crate::protocol::packet::{HEADER_SIZE, Header, MAX_PAYLOAD, Packet};

/// XenStore packet codec.
///
/// Frames are laid out as:
/// - 16 bytes: `op`, `rq_id`, `tx_id`, `len` (little-endian u32 each)
/// - `len` bytes: payload
#[derive(Debug, Clone, Default)]
pub struct PacketCodec {
    // header parsed while waiting for the rest of the payload
    pending: Option<Header>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = XsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                // Need the full header before anything can be validated
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let header = Header::parse(&src[..HEADER_SIZE])?;
                src.advance(HEADER_SIZE);
                self.pending = Some(header);
                header
            }
        };

        let length = header.len as usize;
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(length);
        Ok(Some(Packet {
            op: header.op,
            rq_id: header.rq_id,
            tx_id: header.tx_id,
            payload: payload.to_vec(),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(XsError::UnexpectedPacket(format!(
                "stream ended inside a frame ({} bytes buffered)",
                src.len()
            ))),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = XsError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let length = item.payload.len();

        if length > MAX_PAYLOAD {
            return Err(XsError::InvalidPayload(format!(
                "payload of {} bytes exceeds {} byte limit",
                length, MAX_PAYLOAD
            )));
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_u32_le(item.op.code());
        dst.put_u32_le(item.rq_id);
        dst.put_u32_le(item.tx_id);
        dst.put_u32_le(length as u32);
        dst.put_slice(&item.payload);

        Ok(())
    }
}
