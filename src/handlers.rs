//! Method handlers and the mutex-guarded state they share.
//!
//! All seven verbs are implemented as methods on [`ProxyState`], executed
//! while holding its single lock for the handler's entire duration — except
//! the part of `GetManifest`/`GetBlob` that spawns a streamer, which runs
//! unlocked (see [`crate::pipe`]).

use std::{
    io::{self, Write},
    os::fd::OwnedFd,
    sync::Mutex,
};

use log::{debug, warn};
use serde_json::{json, Value};

use crate::{
    digest::{digest_of, Digest, TeeReader},
    error::{ExternalError, PayloadError, ProtocolError},
    image::{ImageLibrary, ImageSourceHandle, MediaTypePolicy},
    pipe::PipeRecord,
    protocol::{require_arity, require_safe_uint, require_str, require_u32, Reply, PROTOCOL_VERSION},
    resources::Table,
};

/// What a dispatched request produced: a reply to send (with an optional
/// attached pipe fd), or a request to stop the dispatch loop (`Shutdown`,
/// which sends no reply at all).
pub enum Outcome {
    Reply(Reply, Option<OwnedFd>),
    Shutdown,
}
impl Outcome {
    fn ok(value: Value) -> Self {
        Self::Reply(Reply::ok(value), None)
    }
    fn ok_with_pipe(value: Value, pipeid: u32, fd: OwnedFd) -> Self {
        Self::Reply(Reply::ok_with_pipe(value, pipeid), Some(fd))
    }
    fn err(message: impl std::fmt::Display) -> Self {
        Self::Reply(Reply::err(message.to_string()), None)
    }
}

struct Inner<L: ImageLibrary> {
    initialized: bool,
    factory: Option<Box<dyn FnOnce() -> Result<L, ExternalError> + Send>>,
    library: Option<L>,
    images: Table<L::Source>,
    pipes: Table<PipeRecord>,
}

/// All state a running proxy needs: the handshake flag, the image library
/// once built, and the two resource tables. Guarded by a single mutex, per
/// the concurrency model — only `GetManifest`/`GetBlob`'s streamer spawn
/// escapes the lock.
pub struct ProxyState<L: ImageLibrary> {
    inner: Mutex<Inner<L>>,
}
impl<L: ImageLibrary> ProxyState<L> {
    /// Builds a fresh, uninitialized proxy. `build_library` runs exactly
    /// once, during the first successful `Initialize` call.
    pub fn new(build_library: impl FnOnce() -> Result<L, ExternalError> + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                initialized: false,
                factory: Some(Box::new(build_library)),
                library: None,
                images: Table::default(),
                pipes: Table::default(),
            }),
        }
    }

    /// Routes one decoded request to its handler, returning what the
    /// dispatcher should do with it.
    pub fn dispatch(&self, method: &str, args: &[Value]) -> Outcome {
        debug!("dispatch {method}");
        if method != "Initialize" {
            let initialized = self.inner.lock().unwrap().initialized;
            if !initialized {
                return Outcome::err(ProtocolError::NotInitialized);
            }
        }
        match method {
            "Initialize" => self.initialize(args),
            "OpenImage" => self.open_image(args),
            "CloseImage" => self.close_image(args),
            "GetManifest" => self.get_manifest(args),
            "GetBlob" => self.get_blob(args),
            "FinishPipe" => self.finish_pipe(args),
            "Shutdown" => Outcome::Shutdown,
            other => Outcome::err(ProtocolError::UnknownMethod(other.to_owned())),
        }
    }

    fn initialize(&self, args: &[Value]) -> Outcome {
        if let Err(e) = require_arity(args, 0) {
            return Outcome::err(e);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.initialized {
            return Outcome::err(ProtocolError::AlreadyInitialized);
        }
        let factory = inner.factory.take().expect("factory consumed exactly once");
        match factory() {
            Ok(library) => {
                inner.library = Some(library);
                inner.initialized = true;
                Outcome::ok(json!(PROTOCOL_VERSION))
            }
            Err(e) => {
                warn!("Initialize: failed to build image library: {e}");
                Outcome::err(e)
            }
        }
    }

    fn open_image(&self, args: &[Value]) -> Outcome {
        if let Err(e) = require_arity(args, 1) {
            return Outcome::err(e);
        }
        let reference = match require_str(&args[0], 0) {
            Ok(s) => s,
            Err(e) => return Outcome::err(e),
        };
        let mut inner = self.inner.lock().unwrap();
        let library = inner.library.as_ref().expect("initialized implies library is set");
        match library.open(reference) {
            Ok(source) => {
                let id = inner.images.insert(source);
                debug!("OpenImage {reference:?} -> handle {id}");
                Outcome::ok(json!(id))
            }
            Err(e) => {
                warn!("OpenImage {reference:?} failed: {e}");
                Outcome::err(e)
            }
        }
    }

    fn close_image(&self, args: &[Value]) -> Outcome {
        if let Err(e) = require_arity(args, 1) {
            return Outcome::err(e);
        }
        let id = match require_u32(&args[0], 0) {
            Ok(n) => n,
            Err(e) => return Outcome::err(e),
        };
        let mut inner = self.inner.lock().unwrap();
        match inner.images.remove(id) {
            Some(source) => {
                debug!("CloseImage handle {id}");
                match source.close() {
                    Ok(()) => Outcome::ok(Value::Null),
                    Err(e) => Outcome::err(e),
                }
            }
            None => Outcome::err(ProtocolError::UnknownImageHandle(id)),
        }
    }

    fn get_manifest(&self, args: &[Value]) -> Outcome {
        if let Err(e) = require_arity(args, 1) {
            return Outcome::err(e);
        }
        let id = match require_u32(&args[0], 0) {
            Ok(n) => n,
            Err(e) => return Outcome::err(e),
        };
        let inner = self.inner.lock().unwrap();
        let source = match inner.images.get(id) {
            Some(s) => s,
            None => return Outcome::err(ProtocolError::UnknownImageHandle(id)),
        };
        let raw = source.raw_manifest();
        let policy = MediaTypePolicy::classify(&raw.media_type);
        let to_stream = match policy {
            MediaTypePolicy::Oci => raw.bytes.clone(),
            MediaTypePolicy::DockerV2Schema2 => match source.convert_to_oci() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("GetManifest {id}: OCI conversion failed: {e}");
                    return Outcome::err(e);
                }
            },
            MediaTypePolicy::LegacySchema1 | MediaTypePolicy::Unsupported => {
                return Outcome::err(ProtocolError::UnsupportedMediaType(raw.media_type.clone()));
            }
        };
        // The returned digest is always of the *original* bytes, regardless
        // of what ends up streamed — it's what the parent uses for
        // pull-by-digest identity.
        let original_digest = digest_of(&raw.bytes);
        drop(inner);

        let transfer = Box::new(move |w: &mut dyn Write| -> Result<(), PayloadError> {
            w.write_all(&to_stream).map_err(|e| PayloadError::Io(e.to_string()))
        });
        self.spawn_pipe(transfer, json!(original_digest))
    }

    fn get_blob(&self, args: &[Value]) -> Outcome {
        if let Err(e) = require_arity(args, 3) {
            return Outcome::err(e);
        }
        let id = match require_u32(&args[0], 0) {
            Ok(n) => n,
            Err(e) => return Outcome::err(e),
        };
        let digest_str = match require_str(&args[1], 1) {
            Ok(s) => s,
            Err(e) => return Outcome::err(e),
        };
        let requested_size = match require_safe_uint(&args[2], 2) {
            Ok(n) => n,
            Err(e) => return Outcome::err(e),
        };
        let digest = match Digest::parse(digest_str) {
            Ok(d) => d,
            Err(e) => return Outcome::err(e),
        };

        let inner = self.inner.lock().unwrap();
        let source = match inner.images.get(id) {
            Some(s) => s,
            None => return Outcome::err(ProtocolError::UnknownImageHandle(id)),
        };
        let (reader, actual_size) = match source.open_blob(digest_str) {
            Ok(r) => r,
            Err(e) => {
                warn!("GetBlob {id} {digest_str}: open failed: {e}");
                return Outcome::err(e);
            }
        };
        drop(inner);

        let transfer = Box::new(move |w: &mut dyn Write| -> Result<(), PayloadError> {
            let mut tee = TeeReader::new(reader, digest);
            io::copy(&mut tee, w).map_err(|e| PayloadError::Io(e.to_string()))?;
            if tee.bytes_read() != requested_size {
                return Err(PayloadError::SizeMismatch {
                    expected: requested_size,
                    actual: tee.bytes_read(),
                });
            }
            tee.finish()
        });
        self.spawn_pipe(transfer, json!(actual_size))
    }

    fn finish_pipe(&self, args: &[Value]) -> Outcome {
        if let Err(e) = require_arity(args, 1) {
            return Outcome::err(e);
        }
        let id = match require_u32(&args[0], 0) {
            Ok(n) => n,
            Err(e) => return Outcome::err(e),
        };
        let record = {
            let mut inner = self.inner.lock().unwrap();
            // FinishPipe waits on the worker's completion signal while
            // holding the lock: acceptable because the worker only performs
            // kernel-pipe I/O and never re-enters the lock.
            inner.pipes.remove(id)
        };
        match record {
            Some(record) => match record.finish() {
                Ok(()) => Outcome::ok(Value::Null),
                Err(e) => {
                    warn!("FinishPipe {id}: transfer failed: {e}");
                    Outcome::err(e)
                }
            },
            None => Outcome::err(ProtocolError::UnknownPipe(id)),
        }
    }

    fn spawn_pipe(&self, transfer: crate::pipe::Transfer, value: Value) -> Outcome {
        match PipeRecord::spawn(transfer) {
            Ok((read_end, record)) => {
                let pipeid = self.inner.lock().unwrap().pipes.insert(record);
                debug!("allocated pipe {pipeid}");
                Outcome::ok_with_pipe(value, pipeid, read_end)
            }
            Err(e) => Outcome::err(ExternalError::from(e)),
        }
    }
}
