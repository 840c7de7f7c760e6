//! End-to-end dispatcher tests, driving a real `SOCK_SEQPACKET` pair the way
//! the teacher crate's own socket tests drive a real socket rather than
//! mocking the transport. The image library is swapped for an in-memory fake
//! so these tests exercise the protocol, resource tables, concurrency, and
//! fd-passing stack without touching a network.

use std::{
    collections::HashMap,
    io::Read,
    mem::{size_of, zeroed},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{Arc, Mutex},
    thread,
};

use image_fetch_proxy::{
    dispatcher::Dispatcher,
    error::ExternalError,
    handlers::ProxyState,
    image::{ImageLibrary, ImageSourceHandle, RawManifest, MEDIA_TYPE_DOCKER_V1, MEDIA_TYPE_OCI},
    protocol::MAX_PACKET_SIZE,
    transport::Transport,
};
use libc::{c_void, cmsghdr, iovec, msghdr};
use serde_json::{json, Value};
use sha2::{Digest as _, Sha256};

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A single fixture image: a manifest plus a table of blobs keyed by digest.
#[derive(Clone)]
struct Fixture {
    manifest: RawManifest,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Clone, Default)]
struct FakeLibrary {
    fixtures: Arc<Mutex<HashMap<String, Fixture>>>,
}
impl FakeLibrary {
    fn with_oci_image(reference: &str, layer: &[u8]) -> (Self, String, String) {
        let layer_digest = format!("sha256:{}", sha256_hex(layer));
        let manifest_json = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000000000000000",
                "size": 2
            },
            "layers": [ { "mediaType": "application/vnd.oci.image.layer.v1.tar", "digest": layer_digest, "size": layer.len() } ],
        });
        let manifest_bytes = serde_json::to_vec(&manifest_json).unwrap();
        let manifest_digest = format!("sha256:{}", sha256_hex(&manifest_bytes));
        let lib = Self::default();
        lib.fixtures.lock().unwrap().insert(
            reference.to_owned(),
            Fixture {
                manifest: RawManifest { bytes: manifest_bytes, media_type: MEDIA_TYPE_OCI.to_owned() },
                blobs: HashMap::from([(layer_digest.clone(), layer.to_vec())]),
            },
        );
        (lib, manifest_digest, layer_digest)
    }

    fn with_legacy_image(reference: &str) -> Self {
        let lib = Self::default();
        lib.fixtures.lock().unwrap().insert(
            reference.to_owned(),
            Fixture {
                manifest: RawManifest { bytes: b"{}".to_vec(), media_type: MEDIA_TYPE_DOCKER_V1.to_owned() },
                blobs: HashMap::new(),
            },
        );
        lib
    }
}
impl ImageLibrary for FakeLibrary {
    type Source = FakeSource;

    fn open(&self, reference: &str) -> Result<Self::Source, ExternalError> {
        self.fixtures
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .map(|fixture| FakeSource { fixture })
            .ok_or_else(|| ExternalError(format!("no such fixture: {reference}")))
    }
}

struct FakeSource {
    fixture: Fixture,
}
impl ImageSourceHandle for FakeSource {
    fn raw_manifest(&self) -> &RawManifest {
        &self.fixture.manifest
    }
    fn convert_to_oci(&self) -> Result<Vec<u8>, ExternalError> {
        Ok(self.fixture.manifest.bytes.clone())
    }
    fn open_blob(&self, digest: &str) -> Result<(Box<dyn Read + Send>, i64), ExternalError> {
        let bytes = self
            .fixture
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| ExternalError(format!("no such blob: {digest}")))?;
        let size = bytes.len() as i64;
        Ok((Box::new(std::io::Cursor::new(bytes)), size))
    }
    fn close(self) -> Result<(), ExternalError> {
        Ok(())
    }
}

/// Receives one datagram plus an optional `SCM_RIGHTS` fd, the way the real
/// parent process on the other end of this proxy would. `Transport::recv`
/// deliberately doesn't surface ancillary data (the child never receives
/// fds from its parent), so the test harness speaks raw `recvmsg` instead.
fn recv_with_fd(fd: RawFd) -> (Vec<u8>, Option<OwnedFd>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 4096];
    let mut iov = iovec { iov_base: buf.as_mut_ptr().cast::<c_void>(), iov_len: buf.len() };
    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as _) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];
    let mut hdr: msghdr = unsafe { zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr().cast::<c_void>();
    hdr.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
    assert!(n >= 0, "recvmsg failed: {}", std::io::Error::last_os_error());
    buf.truncate(n as usize);

    let mut out_fd = None;
    unsafe {
        let mut cmsg: *const cmsghdr = libc::CMSG_FIRSTHDR(&hdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw: RawFd = std::ptr::read(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                out_fd = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
        }
    }
    (buf, out_fd)
}

struct Harness {
    client: Transport,
    client_raw: RawFd,
    _server: thread::JoinHandle<()>,
}
impl Harness {
    fn new(library: FakeLibrary) -> Self {
        let mut fds = [0 as RawFd; 2];
        let ret =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        let client_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let server_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        let client_raw = client_fd.as_raw_fd();

        let server = thread::spawn(move || {
            let transport = Transport::from_fd(server_fd);
            let state = ProxyState::new(move || Ok(library.clone()));
            let dispatcher = Dispatcher::new(transport, state);
            dispatcher.run().unwrap();
        });

        Self { client: Transport::from_fd(client_fd), client_raw, _server: server }
    }

    fn call(&self, method: &str, args: Value) -> Value {
        let (reply, _fd) = self.call_with_fd(method, args);
        reply
    }

    fn call_raw(&self, bytes: &[u8]) -> Value {
        self.client.send(bytes, None).unwrap();
        let (bytes, _fd) = recv_with_fd(self.client_raw);
        serde_json::from_slice(&bytes).unwrap()
    }

    fn call_with_fd(&self, method: &str, args: Value) -> (Value, Option<OwnedFd>) {
        let request = json!({ "method": method, "args": args });
        self.client.send(&serde_json::to_vec(&request).unwrap(), None).unwrap();
        let (bytes, fd) = recv_with_fd(self.client_raw);
        (serde_json::from_slice(&bytes).unwrap(), fd)
    }

    fn initialize(&self) {
        let reply = self.call("Initialize", json!([]));
        assert_eq!(reply["success"], true);
        assert_eq!(reply["value"], "0.2.1");
    }

    /// Spawns a thread that reads `fd` to EOF. The tracked write end isn't
    /// closed until `FinishPipe` runs (see `PipeRecord::finish`), so a caller
    /// must start draining *before* calling `FinishPipe`, then join after —
    /// draining first and calling `FinishPipe` second would deadlock.
    fn spawn_drain(&self, fd: OwnedFd) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let mut file = std::fs::File::from(fd);
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).unwrap();
            buf
        })
    }
}

#[test]
fn handshake_reports_version_and_rejects_double_initialize() {
    let (lib, ..) = FakeLibrary::with_oci_image("docker://example/img", b"layer-bytes");
    let harness = Harness::new(lib);
    harness.initialize();
    let second = harness.call("Initialize", json!([]));
    assert_eq!(second["success"], false);
}

#[test]
fn verb_before_initialize_errors() {
    let lib = FakeLibrary::with_legacy_image("docker://example/legacy");
    let harness = Harness::new(lib);
    let reply = harness.call("OpenImage", json!(["docker://example/legacy"]));
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("Initialize"));
}

#[test]
fn unknown_method_errors_without_terminating() {
    let (lib, ..) = FakeLibrary::with_oci_image("docker://example/img", b"x");
    let harness = Harness::new(lib);
    harness.initialize();
    let reply = harness.call("Frobnicate", json!([]));
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().to_lowercase().contains("unknown"));
    // the dispatcher is still alive
    let reply = harness.call("CloseImage", json!([999]));
    assert_eq!(reply["success"], false);
}

#[test]
fn handle_hygiene_ids_increase_and_close_is_final() {
    let (lib, ..) = FakeLibrary::with_oci_image("docker://example/img", b"x");
    {
        let mut fixtures = lib.fixtures.lock().unwrap();
        let copy = fixtures.get("docker://example/img").unwrap().clone();
        fixtures.insert("docker://example/img2".to_owned(), copy);
    }
    let harness = Harness::new(lib);
    harness.initialize();
    let first = harness.call("OpenImage", json!(["docker://example/img"]));
    let second = harness.call("OpenImage", json!(["docker://example/img2"]));
    assert_eq!(first["value"], 1);
    assert_eq!(second["value"], 2);

    let close = harness.call("CloseImage", json!([1]));
    assert_eq!(close["success"], true);
    let close_again = harness.call("CloseImage", json!([1]));
    assert_eq!(close_again["success"], false);

    let manifest_after_close = harness.call("GetManifest", json!([1]));
    assert_eq!(manifest_after_close["success"], false);
}

#[test]
fn legacy_manifest_is_rejected() {
    let lib = FakeLibrary::with_legacy_image("docker://example/legacy");
    let harness = Harness::new(lib);
    harness.initialize();
    let open = harness.call("OpenImage", json!(["docker://example/legacy"]));
    let id = open["value"].as_u64().unwrap();
    let reply = harness.call("GetManifest", json!([id]));
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().to_lowercase().contains("unsupported"));
}

#[test]
fn get_manifest_streams_oci_bytes_and_returns_original_digest() {
    let (lib, manifest_digest, _layer_digest) = FakeLibrary::with_oci_image("docker://example/img", b"layer-bytes");
    let expected_bytes = lib.fixtures.lock().unwrap().get("docker://example/img").unwrap().manifest.bytes.clone();
    let harness = Harness::new(lib);
    harness.initialize();
    let open = harness.call("OpenImage", json!(["docker://example/img"]));
    let id = open["value"].as_u64().unwrap();

    let (reply, fd) = harness.call_with_fd("GetManifest", json!([id]));
    assert_eq!(reply["success"], true);
    assert_eq!(reply["value"], manifest_digest);
    let pipeid = reply["pipeid"].as_u64().unwrap();
    assert!(pipeid > 0);

    let reader = harness.spawn_drain(fd.expect("a pipe fd rides with GetManifest's reply"));
    let finish = harness.call("FinishPipe", json!([pipeid]));
    assert_eq!(finish["success"], true);
    let streamed = reader.join().unwrap();
    assert_eq!(streamed, expected_bytes);
}

#[test]
fn get_blob_streams_bytes_and_returns_actual_size() {
    let (lib, _manifest_digest, layer_digest) = FakeLibrary::with_oci_image("docker://example/img", b"layer-bytes");
    let harness = Harness::new(lib);
    harness.initialize();
    let open = harness.call("OpenImage", json!(["docker://example/img"]));
    let id = open["value"].as_u64().unwrap();

    let (reply, fd) = harness.call_with_fd("GetBlob", json!([id, layer_digest, b"layer-bytes".len()]));
    assert_eq!(reply["success"], true, "{reply}");
    assert_eq!(reply["value"], b"layer-bytes".len());

    let reader = harness.spawn_drain(fd.expect("a pipe fd rides with GetBlob's reply"));
    let pipeid = reply["pipeid"].as_u64().unwrap();
    let finish = harness.call("FinishPipe", json!([pipeid]));
    assert_eq!(finish["success"], true);
    let streamed = reader.join().unwrap();
    assert_eq!(streamed, b"layer-bytes");
}

#[test]
fn get_blob_size_mismatch_surfaces_as_finish_pipe_error() {
    let (lib, _manifest_digest, layer_digest) = FakeLibrary::with_oci_image("docker://example/img", b"layer-bytes");
    let harness = Harness::new(lib);
    harness.initialize();
    let open = harness.call("OpenImage", json!(["docker://example/img"]));
    let id = open["value"].as_u64().unwrap();

    // Deliberately request a size that doesn't match the actual blob length.
    let (reply, fd) = harness.call_with_fd("GetBlob", json!([id, layer_digest, 999]));
    assert_eq!(reply["success"], true);
    let pipeid = reply["pipeid"].as_u64().unwrap();
    let reader = harness.spawn_drain(fd.unwrap());

    let finish = harness.call("FinishPipe", json!([pipeid]));
    assert_eq!(finish["success"], false);
    let _ = reader.join().unwrap();
}

#[test]
fn unknown_pipe_and_unknown_image_are_protocol_errors() {
    let (lib, ..) = FakeLibrary::with_oci_image("docker://example/img", b"x");
    let harness = Harness::new(lib);
    harness.initialize();
    let reply = harness.call("FinishPipe", json!([12345]));
    assert_eq!(reply["success"], false);
    let reply = harness.call("GetManifest", json!([999]));
    assert_eq!(reply["success"], false);
}

#[test]
fn concurrent_pipes_can_be_interleaved() {
    let (lib, _manifest_digest, layer_digest) = FakeLibrary::with_oci_image("docker://example/img", b"layer-bytes");
    let harness = Harness::new(lib);
    harness.initialize();
    let open = harness.call("OpenImage", json!(["docker://example/img"]));
    let id = open["value"].as_u64().unwrap();

    let (manifest_reply, manifest_fd) = harness.call_with_fd("GetManifest", json!([id]));
    let (blob_reply, blob_fd) = harness.call_with_fd(
        "GetBlob",
        json!([id, layer_digest, b"layer-bytes".len()]),
    );

    // Drain the second-opened pipe first; both should still complete cleanly
    // since each transfer is independent.
    let blob_reader = harness.spawn_drain(blob_fd.unwrap());
    let manifest_reader = harness.spawn_drain(manifest_fd.unwrap());

    let finish_blob = harness.call("FinishPipe", json!([blob_reply["pipeid"]]));
    let finish_manifest = harness.call("FinishPipe", json!([manifest_reply["pipeid"]]));
    assert_eq!(finish_manifest["success"], true);
    assert_eq!(finish_blob["success"], true);

    let blob_bytes = blob_reader.join().unwrap();
    let manifest_bytes = manifest_reader.join().unwrap();
    assert_eq!(blob_bytes, b"layer-bytes");
    assert!(!manifest_bytes.is_empty());
}

#[test]
fn framing_oversized_and_malformed_do_not_kill_the_dispatcher() {
    let (lib, ..) = FakeLibrary::with_oci_image("docker://example/img", b"x");
    let harness = Harness::new(lib);
    harness.initialize();

    let too_big = vec![b' '; MAX_PACKET_SIZE + 100];
    let reply = harness.call_raw(&too_big);
    assert_eq!(reply["success"], false);

    let reply = harness.call_raw(b"not json at all");
    assert_eq!(reply["success"], false);

    // the dispatcher is still serving requests
    let reply = harness.call("Initialize", json!([]));
    assert_eq!(reply["success"], false); // already initialized, but a *reply*, not a hang
}

#[test]
fn shutdown_ends_the_session_with_no_reply() {
    let (lib, ..) = FakeLibrary::with_oci_image("docker://example/img", b"x");
    let harness = Harness::new(lib);
    harness.initialize();
    let request = json!({ "method": "Shutdown", "args": [] });
    harness.client.send(&serde_json::to_vec(&request).unwrap(), None).unwrap();
    // the peer now sees EOF rather than a reply
    assert!(harness.client.recv().unwrap().is_none());
}
