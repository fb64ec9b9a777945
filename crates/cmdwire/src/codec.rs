//! # Stream Codec
//!
//! Delimits frames on a byte stream with a 4-byte little-endian body length.
//! TCP gives no message boundaries, so a read may hold half a frame or
//! several frames; the codec buffers until a whole body is available and
//! never assumes one read yields one frame.
//!
//! ## Invariants
//! - A declared length of zero or above `max_frame_len` is rejected before
//!   any body byte is buffered.
//! - A stream that ends inside a frame is `Truncated`, not a clean end.

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use crate::error::Error;
use crate::error::Result;
use crate::frame::Frame;

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Size of the length prefix in bytes.
pub const PREFIX_LEN: usize = 4;

/// Length-prefixed codec for [`Frame`]s.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < PREFIX_LEN {
            src.reserve(PREFIX_LEN - src.len());
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 {
            return Err(Error::EmptyFrame);
        }
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge { len, max: self.max_frame_len });
        }

        let total = PREFIX_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let body = src.split_to(len);
        Frame::decode_body(&body).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::Truncated),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        dst.put_u32_le(0); // Length placeholder

        if let Err(e) = frame.encode_body(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let len = dst.len() - start - PREFIX_LEN;
        if len > self.max_frame_len {
            dst.truncate(start);
            return Err(Error::FrameTooLarge { len, max: self.max_frame_len });
        }

        // Fits: max_frame_len is checked and put_blob bounds each field by u32.
        let len_bytes = (len as u32).to_le_bytes();
        dst[start..start + PREFIX_LEN].copy_from_slice(&len_bytes);
        Ok(())
    }
}
