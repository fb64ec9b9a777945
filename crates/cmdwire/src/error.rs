//! # Error Definitions
//!
//! Every way a byte stream can fail to be a valid sequence of frames.
//! All of these are fatal to the stream that produced them: once framing is
//! lost there is no safe way to find the next frame boundary.

/// Framing and decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The declared body length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    /// A length prefix declared an empty body.
    #[error("empty frame")]
    EmptyFrame,
    /// The body ended before all declared fields were read.
    #[error("truncated frame")]
    Truncated,
    /// A partial frame did not complete within the allowed time.
    #[error("partial frame stalled")]
    Stalled,
    /// The body carried bytes after its last field.
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),
    /// The first body byte is not a known frame kind.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    /// A ReplyErr frame carried an unknown failure reason.
    #[error("unknown failure reason {0:#04x}")]
    UnknownReason(u8),
    /// A reply frame appeared where a command was required.
    #[error("expected a command frame, found a reply")]
    NotACommand,
    /// The handler identifier was empty or longer than a u16 length prefix allows.
    #[error("invalid handler identifier: {0}")]
    InvalidIdentifier(String),
    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    /// The command payload could not be serialized or deserialized.
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// The underlying stream failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
