//! Digest parsing and verification: `<algorithm>:<hex>` identity strings,
//! and a streaming verifier used to tee blob bytes through a hasher while
//! they're copied into a pipe.

use std::io::{self, Read};

use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{PayloadError, ProtocolError};

/// The two digest algorithms this system recognizes. Non-goal: no others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha256,
    Sha512,
}
impl Algorithm {
    fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

/// A parsed `<algorithm>:<hex>` content identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}
impl Digest {
    /// Parses a digest string such as `"sha256:e3b0c4..."`.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (algo, hex) = s.split_once(':').ok_or_else(|| ProtocolError::Malformed {
            field: "digest",
            reason: format!("missing ':' separator in {s:?}"),
        })?;
        let algorithm = match algo {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            other => {
                return Err(ProtocolError::Malformed {
                    field: "digest",
                    reason: format!("unsupported algorithm {other:?}"),
                })
            }
        };
        let expected_len = match algorithm {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        };
        if hex.len() != expected_len || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::Malformed {
                field: "digest",
                reason: format!("malformed hex payload for {algo}"),
            });
        }
        Ok(Self { algorithm, hex: hex.to_ascii_lowercase() })
    }

    pub fn as_str(&self) -> String {
        format!("{}:{}", self.algorithm.name(), self.hex)
    }
}

/// Computes the digest of a manifest's raw bytes. The manifest digest
/// ecosystem is sha256-only by convention, so this is not parameterized over
/// [`Algorithm`].
pub fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

enum Hasher {
    Sha256(Box<Sha256>),
    Sha512(Box<Sha512>),
}
impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Self::Sha256(Box::default()),
            Algorithm::Sha512 => Self::Sha512(Box::default()),
        }
    }
    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Sha512(h) => h.update(bytes),
        }
    }
    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => format!("{:x}", h.finalize()),
            Self::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Streaming digest verifier: consumes bytes incrementally, reports a
/// match/mismatch once all bytes have been seen.
pub struct Verifier {
    expected: Digest,
    hasher: Hasher,
}
impl Verifier {
    pub fn new(expected: Digest) -> Self {
        let hasher = Hasher::new(expected.algorithm);
        Self { expected, hasher }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Consumes the verifier and checks the accumulated hash against the
    /// expected digest.
    pub fn verify(self) -> Result<(), PayloadError> {
        let expected = self.expected.as_str();
        let actual_hex = self.hasher.finalize_hex();
        let actual = format!("{}:{}", self.expected.algorithm.name(), actual_hex);
        if actual == expected {
            Ok(())
        } else {
            Err(PayloadError::DigestMismatch { expected, actual })
        }
    }
}

/// Wraps a reader, feeding every byte read through a [`Verifier`] and
/// counting the total bytes seen, so a blob transfer can be verified after
/// the fact without buffering the whole blob in memory.
pub struct TeeReader<R> {
    inner: R,
    verifier: Verifier,
    count: u64,
}
impl<R: Read> TeeReader<R> {
    pub fn new(inner: R, expected: Digest) -> Self {
        Self { inner, verifier: Verifier::new(expected), count: 0 }
    }

    /// Total bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.count
    }

    /// Consumes the tee, returning the digest verdict. Call only after the
    /// inner reader has been fully drained.
    pub fn finish(self) -> Result<(), PayloadError> {
        self.verifier.verify()
    }
}
impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.verifier.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}
