//! Marker-delimited packet codec for stdio streams
//!
//! A stdio stream shared with ordinary terminal output carries envelopes as
//! single lines of the form `##N{...json...}\n`. Every byte that is not part of
//! such a line is passthrough and is reproduced exactly, in order.

use crate::{Envelope, ProtocolError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Marker that starts every packet line
pub const PACKET_MARKER: &[u8] = b"##N";

/// Maximum packet line size (16MB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// One unit produced by [`PacketReader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Packet body (the JSON object, without marker or newline)
    Packet(Bytes),
    /// Passthrough bytes
    Raw(Bytes),
}

/// Streaming packet reader.
///
/// Chunks come out in stream order. The reader is tied to the stream: once it
/// returns `Ok(None)` it is exhausted.
pub struct PacketReader<R> {
    reader: R,
    buf: BytesMut,
    /// Inside a passthrough line; the marker is only recognised at line start
    mid_line: bool,
    eof: bool,
    max_packet_size: usize,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a reader with the default packet size limit
    pub fn new(reader: R) -> Self {
        Self::with_max_packet_size(reader, MAX_PACKET_SIZE)
    }

    /// Create a reader with a custom packet size limit
    pub fn with_max_packet_size(reader: R, max_packet_size: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8192),
            mid_line: false,
            eof: false,
            max_packet_size,
        }
    }

    /// Read the next chunk, or `None` at end of stream
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, ProtocolError> {
        loop {
            if let Some(chunk) = self.try_split() {
                return Ok(Some(chunk));
            }

            if self.eof {
                return Ok(self.finish());
            }

            let mut temp_buf = [0u8; 8192];
            let n = self.reader.read(&mut temp_buf).await?;
            if n == 0 {
                self.eof = true;
                continue;
            }

            self.buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    fn try_split(&mut self) -> Option<Chunk> {
        if self.buf.is_empty() {
            return None;
        }

        if self.mid_line {
            return Some(self.take_raw_line());
        }

        if self.buf.len() < PACKET_MARKER.len() {
            if PACKET_MARKER.starts_with(&self.buf[..]) {
                // Could still become a packet
                return None;
            }
            self.mid_line = true;
            return Some(self.take_raw_line());
        }

        if !self.buf.starts_with(PACKET_MARKER) {
            self.mid_line = true;
            return Some(self.take_raw_line());
        }

        match newline_position(&self.buf) {
            Some(pos) if pos < self.max_packet_size => {
                let line = self.buf.split_to(pos + 1).freeze();
                let body = line.slice(PACKET_MARKER.len()..pos);
                if body.first() == Some(&b'{') && body.last() == Some(&b'}') {
                    Some(Chunk::Packet(body))
                } else {
                    Some(Chunk::Raw(line))
                }
            }
            Some(_) => {
                warn!("Packet line exceeds {} bytes, passing it through", self.max_packet_size);
                self.mid_line = true;
                Some(self.take_raw_line())
            }
            None if self.buf.len() > self.max_packet_size => {
                warn!("Packet line exceeds {} bytes, passing it through", self.max_packet_size);
                self.mid_line = true;
                Some(Chunk::Raw(self.buf.split().freeze()))
            }
            None => None,
        }
    }

    fn take_raw_line(&mut self) -> Chunk {
        match newline_position(&self.buf) {
            Some(pos) => {
                self.mid_line = false;
                Chunk::Raw(self.buf.split_to(pos + 1).freeze())
            }
            None => Chunk::Raw(self.buf.split().freeze()),
        }
    }

    fn finish(&mut self) -> Option<Chunk> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.starts_with(PACKET_MARKER) {
            debug!("Discarding partial packet of {} bytes at end of stream", self.buf.len());
            self.buf.clear();
            return None;
        }
        Some(Chunk::Raw(self.buf.split().freeze()))
    }
}

fn newline_position(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n')
}

/// Drive a stream to its end, sending decoded envelopes and passthrough bytes
/// to separate queues.
///
/// Packets whose body is not a valid envelope are logged and skipped. Both
/// queues close when this returns.
pub async fn parse<R>(
    reader: R,
    packet_tx: mpsc::UnboundedSender<Envelope>,
    raw_tx: mpsc::UnboundedSender<Bytes>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = PacketReader::new(reader);

    while let Some(chunk) = reader.next_chunk().await? {
        match chunk {
            Chunk::Packet(body) => match Envelope::from_json(&body) {
                Ok(envelope) => {
                    if packet_tx.send(envelope).is_err() {
                        debug!("Packet receiver dropped, discarding packet");
                    }
                }
                Err(e) => {
                    warn!("Skipping malformed packet: {}", e);
                }
            },
            Chunk::Raw(bytes) => {
                let _ = raw_tx.send(bytes);
            }
        }
    }

    Ok(())
}

/// Encode an envelope as a packet line
pub fn encode_packet(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let body = envelope.to_json()?;
    if body.first() != Some(&b'{') || body.last() != Some(&b'}') {
        return Err(ProtocolError::InvalidPacket("packet must be a JSON object".to_string()));
    }
    if newline_position(&body).is_some() {
        return Err(ProtocolError::InvalidPacket("packet contains a newline".to_string()));
    }

    let mut buf = BytesMut::with_capacity(PACKET_MARKER.len() + body.len() + 1);
    buf.extend_from_slice(PACKET_MARKER);
    buf.extend_from_slice(&body);
    buf.extend_from_slice(b"\n");
    Ok(buf.freeze())
}

/// Write an envelope as a packet line and flush
pub async fn write_packet<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let packet = encode_packet(envelope)?;
    writer.write_all(&packet).await?;
    writer.flush().await?;
    Ok(())
}
