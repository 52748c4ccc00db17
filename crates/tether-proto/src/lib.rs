//! # Tether Protocol
//!
//! Envelope types and the two wire codecs used by the Tether routing substrate:
//! a length-prefixed MessagePack codec for socket connections and a
//! marker-delimited packet codec for tunneling envelopes over a shared stdio stream.

#![warn(missing_docs)]

/// Envelope and command types
pub mod message;

/// Length-prefixed frame codec for socket streams
pub mod codec;

/// Marker-delimited packet codec for stdio streams
pub mod packet;

/// Error types for protocol operations
pub mod error;

pub use message::{Command, DisposeData, Envelope, AuthenticateResult};
pub use codec::FrameCodec;
pub use packet::{Chunk, PacketReader, parse, write_packet};
pub use error::ProtocolError;
