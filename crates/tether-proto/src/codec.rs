//! Length-prefixed frame codec for socket streams
//!
//! Each frame is a big-endian `u32` body length followed by the envelope
//! encoded as MessagePack with named fields.

use crate::{Envelope, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Envelope codec for byte streams without message boundaries.
///
/// One codec owns the read buffer of one stream; encoding needs no state and
/// may be shared.
pub struct FrameCodec {
    read_buf: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default frame limit
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Codec rejecting bodies larger than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_frame_size,
        }
    }

    /// Largest body this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Encode one envelope as a complete frame
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        let body = envelope.to_msgpack()?;
        self.check_size(body.len())?;

        let mut frame = BytesMut::with_capacity(LEN_PREFIX + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Encode `envelope` and write it out, flushing the writer
    pub async fn write_envelope<W>(&self, writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(envelope)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next envelope from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A stream that ends in the
    /// middle of a frame is reported as [`ProtocolError::InvalidFrame`].
    pub async fn read_envelope<R>(&mut self, reader: &mut R) -> Result<Option<Envelope>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        while !self.frame_ready()? {
            if reader.read_buf(&mut self.read_buf).await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::InvalidFrame);
            }
        }
        self.try_decode()
    }

    /// Decode a buffered frame, if a whole one is available
    pub fn try_decode(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        if !self.frame_ready()? {
            return Ok(None);
        }
        let body_len = self.read_buf.get_u32() as usize;
        let body = self.read_buf.split_to(body_len);
        Envelope::from_msgpack(&body).map(Some)
    }

    /// Whether the buffer holds a complete frame; rejects oversized prefixes early
    fn frame_ready(&self) -> Result<bool, ProtocolError> {
        let Some(prefix) = self.read_buf.get(..LEN_PREFIX) else {
            return Ok(false);
        };
        let body_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        self.check_size(body_len)?;
        Ok(self.read_buf.len() >= LEN_PREFIX + body_len)
    }

    /// Bytes buffered but not yet decoded
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
