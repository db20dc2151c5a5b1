//! XenStore wire protocol
//!
//! This module provides:
//! - Operation codes (`xsd_sockmsg_type`)
//! - The 16-byte little-endian packet header and payload limits
//! - A tokio-util codec for framing packets over a byte stream
//! - Watch event payload parsing

pub mod codec;
pub mod op;
pub mod packet;

pub use codec::PacketCodec;
pub use op::Operation;
pub use packet::{Event, HEADER_SIZE, MAX_PAYLOAD, NUL, Packet, decode, encode};
