//! The fd-passing transport: one datagram in, one datagram (plus an
//! optional file descriptor) out, over a pre-connected `SOCK_SEQPACKET`
//! UNIX socket.
//!
//! This mirrors the `sendmsg`/`recvmsg`-over-`msghdr` plumbing the ancillary-
//! data code in the teacher crate uses, trimmed to the one shape this proxy
//! actually needs: a single optional fd riding along with one message, never
//! scatter-gather, never a socket address.

use std::{
    io,
    mem::{size_of, zeroed},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
};

use libc::{c_void, cmsghdr, iovec, msghdr};

use crate::error::FramingError;

/// Datagrams larger than this are never legitimate, but we still read them
/// in full (rather than letting the kernel discard the overflow) so that an
/// oversized packet can be reported as a *decode*-stage error instead of a
/// transport-stage one. See [`crate::protocol::decode_request`].
const RECV_BUF_SIZE: usize = 256 * 1024;

/// Big enough for one `SCM_RIGHTS` control message carrying one fd.
const CMSG_BUF_SIZE: usize = unsafe { cmsg_space(size_of::<RawFd>()) };

const fn cmsg_space(len: usize) -> usize {
    // CMSG_SPACE isn't const-evaluable through the libc binding on all
    // targets, so its arithmetic is reproduced here: header, aligned to
    // `size_t`, plus the aligned payload.
    let align = size_of::<usize>();
    let hdr = (size_of::<cmsghdr>() + align - 1) & !(align - 1);
    hdr + ((len + align - 1) & !(align - 1))
}

/// One end of the pre-established control channel. Owns the socket fd.
pub struct Transport {
    fd: OwnedFd,
}

impl Transport {
    /// Wraps an already-connected `SOCK_SEQPACKET` socket fd.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Reads exactly one datagram. Returns `Ok(None)` on a clean EOF (the
    /// peer closed its end), `Ok(Some(bytes))` otherwise. Bytes are never
    /// truncated below [`RECV_BUF_SIZE`] even if the logical packet exceeds
    /// the protocol's 32 KiB limit, so the codec can reject it gracefully.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, FramingError> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let mut iov = iovec { iov_base: buf.as_mut_ptr().cast::<c_void>(), iov_len: buf.len() };
        let mut hdr: msghdr = unsafe { zeroed() };
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;

        let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut hdr, 0) };
        if n < 0 {
            return Err(FramingError::Io(io::Error::last_os_error()));
        }
        if hdr.msg_flags & libc::MSG_TRUNC != 0 {
            return Err(FramingError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("datagram exceeded the {RECV_BUF_SIZE}-byte recv buffer"),
            )));
        }
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n as usize);
        Ok(Some(buf))
    }

    /// Writes one datagram, optionally attaching `fd` as `SCM_RIGHTS`
    /// ancillary data. On success, `fd` has been handed to the kernel (and,
    /// transitively, duplicated into the peer); the caller's copy is closed
    /// by dropping the `OwnedFd` this function consumes.
    pub fn send(&self, bytes: &[u8], fd: Option<OwnedFd>) -> Result<(), FramingError> {
        let mut iov = iovec { iov_base: bytes.as_ptr().cast_mut().cast::<c_void>(), iov_len: bytes.len() };
        let mut hdr: msghdr = unsafe { zeroed() };
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;

        let mut cmsg_buf = [0u8; CMSG_BUF_SIZE];
        // `fd` is consumed into a raw value up front: whatever happens next,
        // this function (not the caller) owns closing it.
        let raw_fd = fd.map(OwnedFd::into_raw_fd);
        if let Some(raw_fd) = raw_fd {
            hdr.msg_control = cmsg_buf.as_mut_ptr().cast::<c_void>();
            hdr.msg_controllen = cmsg_buf.len() as _;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&hdr);
                debug_assert!(!cmsg.is_null());
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as _) as _;
                std::ptr::write(libc::CMSG_DATA(cmsg).cast::<RawFd>(), raw_fd);
            }
            hdr.msg_controllen = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as _) } as _;
        }

        let result = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &hdr, 0) };

        // The kernel has either duplicated the fd into the peer's table (on
        // success) or we're erroring out and must not leak it either way:
        // reclaim it as an OwnedFd so it's closed when this scope ends.
        if let Some(raw_fd) = raw_fd {
            drop(unsafe { OwnedFd::from_raw_fd(raw_fd) });
        }

        if result < 0 {
            return Err(FramingError::Io(io::Error::last_os_error()));
        }
        if result as usize != bytes.len() {
            return Err(FramingError::ShortWrite);
        }
        Ok(())
    }
}
