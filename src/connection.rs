//! Packet-level connection: one packet in, one packet out.
//!
//! Wraps a transport stream in a [`Framed`] with [`PacketCodec`]. The router
//! splits it into a writer half (behind a lock) and a reader half (owned by
//! the reader task).

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use crate::error::{Result, XsError};
use crate::protocol::{Packet, PacketCodec};
use crate::transport::XsStream;

type Stream = Box<dyn XsStream>;

/// A framed XenStore connection.
pub struct PacketConnection {
    framed: Option<Framed<Stream, PacketCodec>>,
}

impl PacketConnection {
    pub fn new(stream: Stream) -> Self {
        Self {
            framed: Some(Framed::new(stream, PacketCodec::new())),
        }
    }

    /// Is the underlying stream still held?
    pub fn is_open(&self) -> bool {
        self.framed.is_some()
    }

    /// Write one packet (header then payload) and flush.
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        let framed = self.framed.as_mut().ok_or_else(not_connected)?;
        framed.send(packet).await
    }

    /// Read exactly one packet. End of stream is a connection error.
    pub async fn receive(&mut self) -> Result<Packet> {
        let framed = self.framed.as_mut().ok_or_else(not_connected)?;
        next_packet(framed.next().await)
    }

    /// Release the stream. Calling this twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            SinkExt::<Packet>::close(&mut framed).await?;
        }
        Ok(())
    }

    /// Split into independently owned writer and reader halves.
    pub fn into_split(self) -> Result<(PacketWriter, PacketReader)> {
        let framed = self.framed.ok_or_else(not_connected)?;
        let (sink, stream) = framed.split();
        Ok((PacketWriter { sink: Some(sink) }, PacketReader { stream }))
    }
}

impl std::fmt::Debug for PacketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketConnection")
            .field("open", &self.is_open())
            .finish()
    }
}

/// Write half of a split connection.
pub struct PacketWriter {
    sink: Option<SplitSink<Framed<Stream, PacketCodec>, Packet>>,
}

impl PacketWriter {
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        let sink = self.sink.as_mut().ok_or_else(not_connected)?;
        sink.send(packet).await
    }

    /// Flush and shut down the write direction. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.close().await?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }
}

/// Read half of a split connection.
pub struct PacketReader {
    stream: SplitStream<Framed<Stream, PacketCodec>>,
}

impl PacketReader {
    pub async fn receive(&mut self) -> Result<Packet> {
        next_packet(self.stream.next().await)
    }
}

fn next_packet(item: Option<Result<Packet>>) -> Result<Packet> {
    match item {
        Some(result) => result,
        None => Err(XsError::Connection("connection closed by peer".into())),
    }
}

fn not_connected() -> XsError {
    XsError::Connection("not connected".into())
}
