//! The image-library adapter boundary.
//!
//! This module defines the narrow interface the rest of the proxy consumes
//! from the underlying container-image client library (reference parsing,
//! source open, manifest/blob fetch, manifest media-type conversion). The
//! library's own internals — how it talks to a registry, how it parses a
//! `docker://` reference, how it decides a blob's size — are an external
//! collaborator and are deliberately not modeled here beyond this surface.
//!
//! [`adapter`] provides the real implementation over the `oci-client` crate;
//! tests substitute an in-memory fake behind the same trait.

pub mod adapter;

use std::io::Read;

use crate::error::ExternalError;

/// OCI's own normalized manifest media type — the on-the-wire form streamed
/// to the parent whenever the source manifest isn't already in this format.
pub const MEDIA_TYPE_OCI: &str = "application/vnd.oci.image.manifest.v1+json";
/// Docker distribution manifest, schema 2 — accepted as-is (no conversion).
pub const MEDIA_TYPE_DOCKER_V2S2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker distribution manifest, schema 1, signed — explicitly rejected as legacy.
pub const MEDIA_TYPE_DOCKER_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker distribution manifest, schema 1, unsigned — explicitly rejected as legacy.
pub const MEDIA_TYPE_DOCKER_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";

/// The raw bytes of a manifest as fetched, together with the media type the
/// registry declared for it.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

/// Classifies a manifest's media type against the two accepted formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTypePolicy {
    /// Already OCI; stream as-is.
    Oci,
    /// Docker v2 schema 2; accepted, converted to OCI before streaming.
    DockerV2Schema2,
    /// Docker schema 1 (signed or unsigned) — legacy, always rejected.
    LegacySchema1,
    /// Anything else — rejected as unsupported.
    Unsupported,
}
impl MediaTypePolicy {
    pub fn classify(media_type: &str) -> Self {
        match media_type {
            MEDIA_TYPE_OCI => Self::Oci,
            MEDIA_TYPE_DOCKER_V2S2 => Self::DockerV2Schema2,
            MEDIA_TYPE_DOCKER_V1 | MEDIA_TYPE_DOCKER_V1_SIGNED => Self::LegacySchema1,
            _ => Self::Unsupported,
        }
    }
}

/// A library capable of opening image references. One instance is built at
/// `Initialize` time and shared (immutably) by every subsequent `OpenImage`.
pub trait ImageLibrary {
    /// A single open image source plus its eagerly-loaded manifest view.
    type Source: ImageSourceHandle;

    /// Parses `reference`, opens the underlying source, and eagerly loads
    /// its manifest. Any failure must leak no state (no partially-open
    /// source left behind).
    fn open(&self, reference: &str) -> Result<Self::Source, ExternalError>;
}

/// One opened image: its manifest view, plus blob access and manifest
/// conversion.
pub trait ImageSourceHandle: Send {
    /// The manifest as originally fetched — raw bytes and declared media type.
    fn raw_manifest(&self) -> &RawManifest;

    /// Converts `raw_manifest()` to the OCI manifest media type. Called only
    /// when the original media type isn't already OCI.
    fn convert_to_oci(&self) -> Result<Vec<u8>, ExternalError>;

    /// Opens a reader for the blob named by `digest`, plus the library's own
    /// view of its size (`-1` if unknown). The reader is consumed by exactly
    /// one streamer; no handler touches it afterwards.
    fn open_blob(&self, digest: &str) -> Result<(Box<dyn Read + Send>, i64), ExternalError>;

    /// Closes the underlying source connection.
    fn close(self) -> Result<(), ExternalError>;
}
