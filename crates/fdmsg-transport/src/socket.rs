use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tracing::trace;

use crate::error::{Result, TransportError};

// Surface a dead peer as EPIPE rather than SIGPIPE where the platform
// allows it.
#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// One end of a connected `AF_UNIX`/`SOCK_STREAM` socket.
///
/// The endpoint is safe to share between one writing and one reading
/// thread: [`send_with_fd`](Self::send_with_fd) and
/// [`recv_with_fd`](Self::recv_with_fd) take `&self` and issue a single
/// syscall each. The descriptor is closed when the socket is dropped.
pub struct MsgSocket {
    fd: OwnedFd,
}

impl MsgSocket {
    /// Create a connected pair of endpoints.
    ///
    /// Callers that fork a child typically keep one end and map the other
    /// onto a well-known descriptor slot in the child; tests connect both
    /// ends within one process.
    pub fn pair() -> Result<(MsgSocket, MsgSocket)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` is a valid writable array of two ints.
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(TransportError::Socketpair(io::Error::last_os_error()));
        }
        // SAFETY: socketpair succeeded, so both descriptors are freshly
        // created and owned by us.
        let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((Self::from_owned_fd(a), Self::from_owned_fd(b)))
    }

    /// Wrap an already-connected endpoint.
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Wrap an endpoint inherited on a raw descriptor slot (commonly 3 in
    /// a fork+exec bootstrap).
    ///
    /// # Safety
    ///
    /// `fd` must be an open, connected `SOCK_STREAM` UNIX socket that is
    /// not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Send `buf` in a single `sendmsg` call, attaching `fd` as a
    /// one-descriptor `SCM_RIGHTS` control message when present.
    ///
    /// The descriptor is borrowed; the caller decides when to close it.
    pub fn send_with_fd(&self, buf: &[u8], fd: Option<BorrowedFd<'_>>) -> Result<usize> {
        let iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: CMSG_SPACE is a pure size computation.
        let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        // SAFETY: msghdr is valid in the all-zeroes state.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
        msg.msg_iovlen = 1;

        if let Some(fd) = fd {
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = cmsg_buf.len() as _;
            // SAFETY: the control buffer is large enough for one
            // descriptor, so CMSG_FIRSTHDR returns a valid header inside it.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
                std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd.as_raw_fd());
            }
        }

        loop {
            // SAFETY: msg points at live iovec/control buffers for the
            // duration of the call.
            let sent = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, SEND_FLAGS) };
            if sent >= 0 {
                trace!(bytes = sent, has_fd = fd.is_some(), "sendmsg");
                return Ok(sent as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TransportError::Send(err));
            }
        }
    }

    /// Receive into `buf` with a single `recvmsg` call, supplying an
    /// ancillary buffer sized for exactly one descriptor transfer.
    ///
    /// Returns `(0, None)` when the peer has closed its end. Ancillary
    /// data that is not exactly one `SCM_RIGHTS` message carrying exactly
    /// one descriptor is a protocol violation.
    pub fn recv_with_fd(&self, buf: &mut [u8]) -> Result<(usize, Option<OwnedFd>)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        // SAFETY: CMSG_SPACE is a pure size computation.
        let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        // SAFETY: msghdr is valid in the all-zeroes state.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_buf.len() as _;

        let received = loop {
            // SAFETY: msg points at live iovec/control buffers for the
            // duration of the call.
            let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TransportError::Recv(err));
            }
        };

        if received == 0 {
            trace!("recvmsg: peer closed");
            return Ok((0, None));
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(TransportError::ControlTruncated);
        }

        let mut passed: Option<OwnedFd> = None;
        let mut control_messages = 0usize;
        // SAFETY: CMSG_FIRSTHDR/CMSG_NXTHDR walk the control buffer the
        // kernel just filled; every non-null header is valid to read.
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            control_messages += 1;
            if control_messages > 1 {
                return Err(TransportError::UnexpectedControlMessages(control_messages));
            }
            // SAFETY: see above; cmsg is non-null and within the buffer.
            unsafe {
                if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS
                {
                    return Err(TransportError::UnexpectedControl {
                        level: (*cmsg).cmsg_level,
                        kind: (*cmsg).cmsg_type,
                    });
                }
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                if count != 1 {
                    return Err(TransportError::UnexpectedDescriptors(count));
                }
                let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                passed = Some(OwnedFd::from_raw_fd(raw));
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        trace!(bytes = received, has_fd = passed.is_some(), "recvmsg");
        Ok((received, passed))
    }

    /// Shut down both directions of the endpoint.
    ///
    /// Used to cascade a fatal failure: the blocked reader wakes up with
    /// EOF and the channel winds down. Tolerates an endpoint the peer has
    /// already torn down.
    pub fn shutdown(&self) -> Result<()> {
        // SAFETY: fd is an open socket descriptor owned by this endpoint.
        let rc = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Err(TransportError::Io(err));
            }
        }
        Ok(())
    }

    /// Get the process id of the connected peer (Linux only).
    ///
    /// Uses `SO_PEERCRED`; returns `None` if the kernel does not expose
    /// peer credentials. Convenient when constructing a channel around an
    /// inherited endpoint.
    #[cfg(target_os = "linux")]
    pub fn peer_pid(&self) -> Option<u32> {
        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
        // SAFETY: `cred` and `len` are valid writable pointers for the
        // provided sizes, and the descriptor is an open socket owned by
        // this process.
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if rc == 0 && len as usize == mem::size_of::<libc::ucred>() {
            Some(cred.pid as u32)
        } else {
            None
        }
    }

    /// Get the process id of the connected peer.
    ///
    /// Returns `None` on platforms without `SO_PEERCRED`.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_pid(&self) -> Option<u32> {
        None
    }

    /// Consume the endpoint and return the underlying descriptor.
    pub fn into_inner(self) -> OwnedFd {
        self.fd
    }
}

impl AsRawFd for MsgSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<OwnedFd> for MsgSocket {
    fn from(fd: OwnedFd) -> Self {
        Self::from_owned_fd(fd)
    }
}

impl std::fmt::Debug for MsgSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgSocket")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}
