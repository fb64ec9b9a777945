//! # Protocol Frames
//!
//! Defines the body of every message exchanged between two commander peers.
//! The outer length prefix is handled by [`crate::codec::FrameCodec`]; this
//! module only deals with a complete, already delimited body.
//!
//! ## Layout
//!
//! All integers are little-endian.
//!
//! - **Command** `[0x01][id_len: u16][id][payload_len: u32][payload]`
//! - **Request** `[0x02][seq: u64][id_len: u16][id][payload_len: u32][payload]`
//! - **ReplyOk** `[0x03][seq: u64][payload_len: u32][payload]`
//! - **ReplyErr** `[0x04][seq: u64][reason: u8][msg_len: u32][msg]`
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Strictness**: A body must be consumed exactly; trailing bytes are a violation.

use bytes::BufMut;
use bytes::BytesMut;
use serde::Serialize;

use crate::command::Command;
use crate::command::Request;
use crate::command::encode_payload;
use crate::error::Error;
use crate::error::Result;

const KIND_COMMAND: u8 = 0x01;
const KIND_REQUEST: u8 = 0x02;
const KIND_REPLY_OK: u8 = 0x03;
const KIND_REPLY_ERR: u8 = 0x04;

/// Why a request could not be answered with a response.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No handler is registered under the requested identifier.
    UnknownHandler = 0x01,
    /// The handler ran and returned an error (or panicked).
    HandlerFailed = 0x02,
    /// The payload did not deserialize into the handler's command type.
    BadPayload = 0x03,
}

impl FailureReason {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(Self::UnknownHandler),
            0x02 => Ok(Self::HandlerFailed),
            0x03 => Ok(Self::BadPayload),
            _ => Err(Error::UnknownReason(b)),
        }
    }
}

/// The error side of a reply, as reported by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.reason, self.message)
    }
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Fire-and-forget command.
    Command { handler: String, payload: Vec<u8> },
    /// Command expecting a reply carrying the same `seq`.
    Request { seq: u64, handler: String, payload: Vec<u8> },
    /// Answer to a request.
    Reply { seq: u64, status: std::result::Result<Vec<u8>, Failure> },
}

impl Frame {
    /// Builds a command frame from a typed command.
    pub fn command<C: Command>(command: &C) -> Result<Self> {
        Ok(Self::Command {
            handler: C::HANDLER.to_string(),
            payload: encode_payload(command)?,
        })
    }

    /// Builds a request frame from a typed request.
    pub fn request<R: Request>(seq: u64, request: &R) -> Result<Self> {
        Ok(Self::Request {
            seq,
            handler: R::HANDLER.to_string(),
            payload: encode_payload(request)?,
        })
    }

    /// Builds a successful reply.
    pub fn reply_ok<T: Serialize>(seq: u64, response: &T) -> Result<Self> {
        Ok(Self::Reply { seq, status: Ok(encode_payload(response)?) })
    }

    /// Builds a failed reply.
    pub fn reply_err(seq: u64, failure: Failure) -> Self {
        Self::Reply { seq, status: Err(failure) }
    }

    /// The handler identifier, for frames that carry one.
    pub fn handler(&self) -> Option<&str> {
        match self {
            Self::Command { handler, .. } | Self::Request { handler, .. } => Some(handler),
            Self::Reply { .. } => None,
        }
    }

    /// Appends the body of this frame (without length prefix) to `dst`.
    pub fn encode_body(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Command { handler, payload } => {
                dst.put_u8(KIND_COMMAND);
                put_identifier(dst, handler)?;
                put_blob(dst, payload)?;
            }
            Self::Request { seq, handler, payload } => {
                dst.put_u8(KIND_REQUEST);
                dst.put_u64_le(*seq);
                put_identifier(dst, handler)?;
                put_blob(dst, payload)?;
            }
            Self::Reply { seq, status: Ok(payload) } => {
                dst.put_u8(KIND_REPLY_OK);
                dst.put_u64_le(*seq);
                put_blob(dst, payload)?;
            }
            Self::Reply { seq, status: Err(failure) } => {
                dst.put_u8(KIND_REPLY_ERR);
                dst.put_u64_le(*seq);
                dst.put_u8(failure.reason as u8);
                put_blob(dst, failure.message.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Decodes a complete frame body.
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let frame = match r.u8()? {
            KIND_COMMAND => {
                let handler = r.identifier()?;
                let payload = r.blob()?.to_vec();
                Self::Command { handler, payload }
            }
            KIND_REQUEST => {
                let seq = r.u64()?;
                let handler = r.identifier()?;
                let payload = r.blob()?.to_vec();
                Self::Request { seq, handler, payload }
            }
            KIND_REPLY_OK => {
                let seq = r.u64()?;
                let payload = r.blob()?.to_vec();
                Self::Reply { seq, status: Ok(payload) }
            }
            KIND_REPLY_ERR => {
                let seq = r.u64()?;
                let reason = FailureReason::from_u8(r.u8()?)?;
                let message = std::str::from_utf8(r.blob()?)
                    .map_err(|_| Error::InvalidUtf8("failure message"))?
                    .to_string();
                Self::Reply { seq, status: Err(Failure { reason, message }) }
            }
            other => return Err(Error::UnknownKind(other)),
        };
        r.finish()?;
        Ok(frame)
    }
}

// Helper functions

fn put_identifier(dst: &mut BytesMut, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidIdentifier("empty".into()));
    }
    let len = u16::try_from(id.len())
        .map_err(|_| Error::InvalidIdentifier(format!("{} bytes long", id.len())))?;
    dst.put_u16_le(len);
    dst.put_slice(id.as_bytes());
    Ok(())
}

fn put_blob(dst: &mut BytesMut, blob: &[u8]) -> Result<()> {
    let len = u32::try_from(blob.len())
        .map_err(|_| Error::FrameTooLarge { len: blob.len(), max: u32::MAX as usize })?;
    dst.put_u32_le(len);
    dst.put_slice(blob);
    Ok(())
}

/// A bounds-checked cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn identifier(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        if len == 0 {
            return Err(Error::InvalidIdentifier("empty".into()));
        }
        let id = std::str::from_utf8(self.take(len)?)
            .map_err(|_| Error::InvalidUtf8("handler identifier"))?;
        Ok(id.to_string())
    }

    fn blob(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn finish(self) -> Result<()> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(Error::TrailingBytes(n)),
        }
    }
}
