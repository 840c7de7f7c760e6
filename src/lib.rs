//! An interactive image-fetch proxy: a long-running child process that
//! fronts a container-image registry client for a parent process speaking a
//! small JSON control protocol over a pre-established `SOCK_SEQPACKET` UNIX
//! socket, with bulk payloads (manifests, blobs) streamed out-of-band
//! through anonymous pipes passed via `SCM_RIGHTS`.

pub mod digest;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod image;
pub mod pipe;
pub mod protocol;
pub mod resources;
pub mod transport;
