//! The JSON control protocol: [`Request`]/[`Reply`] schemas, the version
//! string, and the packet-size and safe-integer bounds that the wire codec
//! enforces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FramingError, ProtocolError};

/// Current protocol version, reported by `Initialize`.
pub const PROTOCOL_VERSION: &str = "0.2.1";

/// Hard cap on an inbound datagram, enforced by the codec rather than the
/// transport's `recv` itself (see [`crate::transport`]).
pub const MAX_PACKET_SIZE: usize = 32 * 1024;

/// Largest integer a JSON number may carry and still round-trip exactly
/// through an IEEE-754 double: `2^53 - 1`.
pub const MAX_SAFE_INTEGER: u64 = (1u64 << 53) - 1;

/// `{ method, args }`, decoded from a single datagram.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// `{ success, value, pipeid, error }`, encoded into a single datagram.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub success: bool,
    pub value: Value,
    pub pipeid: u32,
    pub error: String,
}
impl Reply {
    /// A successful reply carrying no attached pipe.
    pub fn ok(value: Value) -> Self {
        Self { success: true, value, pipeid: 0, error: String::new() }
    }
    /// A successful reply whose fd is the read end of `pipeid`.
    pub fn ok_with_pipe(value: Value, pipeid: u32) -> Self {
        Self { success: true, value, pipeid, error: String::new() }
    }
    /// A failed reply; `value` is `null` and `pipeid` is zero per the schema.
    pub fn err(message: impl Into<String>) -> Self {
        Self { success: false, value: Value::Null, pipeid: 0, error: message.into() }
    }
}

/// Decodes one datagram's bytes as a [`Request`], first enforcing the
/// packet-size bound.
///
/// The size check happens here rather than in `recv` itself: a 33 KiB
/// request is a *decode*-stage framing error (produces an error reply, the
/// dispatcher continues), not a `recv`-stage one (which would terminate the
/// dispatcher). See the module docs on [`crate::dispatcher`].
pub fn decode_request(bytes: &[u8]) -> Result<Request, FramingError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(FramingError::OversizedPacket { len: bytes.len() });
    }
    serde_json::from_slice(bytes).map_err(FramingError::MalformedJson)
}

/// Encodes a [`Reply`] as the exact bytes of one outbound datagram.
pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    // A `Reply` serializes infallibly: every field is a plain value, never a
    // map with non-string keys or other serde_json::to_vec failure mode.
    serde_json::to_vec(reply).expect("Reply always serializes")
}

/// Validates that a JSON number is a non-negative integer within the safe
/// range and returns it as a `u64`.
pub fn require_safe_uint(value: &Value, index: usize) -> Result<u64, ProtocolError> {
    let n = value
        .as_u64()
        .ok_or(ProtocolError::WrongArgType { index, expected: "non-negative integer" })?;
    if n > MAX_SAFE_INTEGER {
        return Err(ProtocolError::NumberOutOfRange);
    }
    Ok(n)
}

/// Validates that a JSON number is a non-negative integer that additionally
/// fits in a `u32`, as required for handle and pipe ids. Narrowing a
/// safe-integer value with a plain `as u32` cast would silently wrap (e.g.
/// `4294967297` becoming `1`) and alias a live handle or pipe; this rejects
/// anything above `u32::MAX` instead.
pub fn require_u32(value: &Value, index: usize) -> Result<u32, ProtocolError> {
    let n = require_safe_uint(value, index)?;
    u32::try_from(n).map_err(|_| ProtocolError::NumberOutOfRange)
}

/// Validates that a JSON value is a string and returns a borrowed `&str`.
pub fn require_str<'a>(value: &'a Value, index: usize) -> Result<&'a str, ProtocolError> {
    value.as_str().ok_or(ProtocolError::WrongArgType { index, expected: "string" })
}

/// Checks an argument list has exactly `expected` elements.
pub fn require_arity(args: &[Value], expected: usize) -> Result<(), ProtocolError> {
    if args.len() != expected {
        return Err(ProtocolError::WrongArity { expected, got: args.len() });
    }
    Ok(())
}
