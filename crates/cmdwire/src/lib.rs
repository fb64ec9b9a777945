//! # Cmdwire
//!
//! The wire format of the commander protocol: typed commands in, length
//! delimited frames out, and back again.
//!
//! ## Architecture
//!
//! - **Command**: a serde value that names its handler with a stable string.
//! - **Frame**: the body of one message (command, request or reply).
//! - **FrameCodec**: a `tokio-util` codec that delimits frames on a byte stream.
//!
//! This crate does no I/O and knows nothing about handlers or connections.
//! Payload confidentiality is not its concern; any signing or encryption of a
//! payload happens before `encode` and after `decode`.

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;


pub use codec::DEFAULT_MAX_FRAME_LEN;
pub use codec::FrameCodec;
pub use command::Command;
pub use command::Request;
pub use command::decode_payload;
pub use command::encode_payload;
pub use error::Error;
pub use error::Result;
pub use frame::Failure;
pub use frame::FailureReason;
pub use frame::Frame;

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

/// Encodes a command into one complete, length-prefixed frame.
pub fn encode<C: Command>(command: &C) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(Frame::command(command)?, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decodes one complete, length-prefixed command frame.
///
/// Returns the declared handler identifier alongside the command. The bytes
/// must hold exactly one frame.
pub fn decode<C: Command>(bytes: &[u8]) -> Result<(String, C)> {
    let mut buf = BytesMut::from(bytes);
    let frame = FrameCodec::new()
        .decode_eof(&mut buf)?
        .ok_or(Error::Truncated)?;
    if !buf.is_empty() {
        return Err(Error::TrailingBytes(buf.len()));
    }

    match frame {
        Frame::Command { handler, payload } | Frame::Request { handler, payload, .. } => {
            let command = decode_payload(&payload)?;
            Ok((handler, command))
        }
        Frame::Reply { .. } => Err(Error::NotACommand),
    }
}
