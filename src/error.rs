//! Error taxonomy for the proxy: framing, protocol, external and payload errors.
//!
//! Each variant implements `Display`/`std::error::Error` by hand, matching the
//! style the rest of the fd-passing and ancillary-data code uses rather than
//! pulling in a derive-macro crate for four small enums.

use std::{
    fmt::{self, Display, Formatter},
    io,
};

/// Failures in the framing layer: oversized packets, malformed JSON, and
/// recv/send failures on the underlying socket.
#[derive(Debug)]
pub enum FramingError {
    /// The socket returned an OS-level error on `recv`/`send`.
    Io(io::Error),
    /// An inbound datagram exceeded [`crate::protocol::MAX_PACKET_SIZE`].
    OversizedPacket {
        /// Size of the oversized datagram, in bytes.
        len: usize,
    },
    /// The datagram's bytes did not parse as a [`crate::protocol::Request`].
    MalformedJson(serde_json::Error),
    /// A `send` transmitted fewer bytes (or less ancillary data) than requested.
    ShortWrite,
}
impl Display for FramingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::OversizedPacket { len } => {
                write!(f, "packet too large: {len} bytes exceeds the 32 KiB limit")
            }
            Self::MalformedJson(e) => write!(f, "malformed request: {e}"),
            Self::ShortWrite => write!(f, "short write on control socket"),
        }
    }
}
impl std::error::Error for FramingError {}
impl From<io::Error> for FramingError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Protocol-level misuse: unknown verbs, wrong arity/types, handshake
/// ordering violations, and unknown resource ids.
#[derive(Debug)]
pub enum ProtocolError {
    /// `method` did not match any of the seven known verbs.
    UnknownMethod(String),
    /// `args` had a different length than the handler requires.
    WrongArity { expected: usize, got: usize },
    /// An element of `args` was not the type the handler requires.
    WrongArgType { index: usize, expected: &'static str },
    /// A numeric argument fell outside `[0, 2^53 - 1]`.
    NumberOutOfRange,
    /// A string argument did not parse the way its field requires (e.g. a
    /// malformed digest or image reference).
    Malformed { field: &'static str, reason: String },
    /// A verb other than `Initialize` arrived before the handshake.
    NotInitialized,
    /// `Initialize` was called a second time.
    AlreadyInitialized,
    /// `imageid` did not name a currently open image.
    UnknownImageHandle(u32),
    /// `pipeid` did not name a currently active pipe.
    UnknownPipe(u32),
    /// The manifest's media type is not one of the two accepted formats.
    UnsupportedMediaType(String),
}
impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMethod(m) => write!(f, "unknown method: {m}"),
            Self::WrongArity { expected, got } => {
                write!(f, "wrong number of arguments: expected {expected}, got {got}")
            }
            Self::WrongArgType { index, expected } => {
                write!(f, "argument {index}: expected {expected}")
            }
            Self::NumberOutOfRange => write!(f, "numeric argument exceeds the safe-integer range"),
            Self::Malformed { field, reason } => write!(f, "invalid {field}: {reason}"),
            Self::NotInitialized => write!(f, "must call Initialize first"),
            Self::AlreadyInitialized => write!(f, "already initialized"),
            Self::UnknownImageHandle(id) => write!(f, "unknown image handle: {id}"),
            Self::UnknownPipe(id) => write!(f, "unknown pipe: {id}"),
            Self::UnsupportedMediaType(mt) => write!(f, "unsupported manifest media type: {mt}"),
        }
    }
}
impl std::error::Error for ProtocolError {}

/// A failure reported by the image-library adapter (reference parsing,
/// source open, manifest/blob fetch, manifest conversion).
#[derive(Debug)]
pub struct ExternalError(pub String);
impl Display for ExternalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl std::error::Error for ExternalError {}
impl From<io::Error> for ExternalError {
    fn from(e: io::Error) -> Self {
        Self(e.to_string())
    }
}

/// A failure discovered while a streamer copied bytes into a pipe; surfaced
/// only via `FinishPipe`, never via the method call that allocated the pipe.
#[derive(Debug)]
pub enum PayloadError {
    /// The underlying reader or the pipe's write end returned an I/O error.
    Io(String),
    /// `GetBlob`'s requested size did not match the number of bytes streamed.
    SizeMismatch { expected: u64, actual: u64 },
    /// The streamed bytes did not hash to the requested digest.
    DigestMismatch { expected: String, actual: String },
}
impl Display for PayloadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "pipe transfer failed: {e}"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {expected} bytes, got {actual}")
            }
            Self::DigestMismatch { expected, actual } => {
                write!(f, "digest mismatch: expected {expected}, got {actual}")
            }
        }
    }
}
impl std::error::Error for PayloadError {}

/// Unifying error used where a single return type is convenient (mainly the
/// adapter and the main-loop glue). Method handlers otherwise return the
/// taxonomy-specific error directly so each reply's `error` string stays
/// precise.
#[derive(Debug)]
pub enum ProxyError {
    Framing(FramingError),
    Protocol(ProtocolError),
    External(ExternalError),
    Payload(PayloadError),
}
impl Display for ProxyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framing(e) => Display::fmt(e, f),
            Self::Protocol(e) => Display::fmt(e, f),
            Self::External(e) => Display::fmt(e, f),
            Self::Payload(e) => Display::fmt(e, f),
        }
    }
}
impl std::error::Error for ProxyError {}
impl From<FramingError> for ProxyError {
    fn from(e: FramingError) -> Self {
        Self::Framing(e)
    }
}
impl From<ProtocolError> for ProxyError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}
impl From<ExternalError> for ProxyError {
    fn from(e: ExternalError) -> Self {
        Self::External(e)
    }
}
impl From<PayloadError> for ProxyError {
    fn from(e: PayloadError) -> Self {
        Self::Payload(e)
    }
}
