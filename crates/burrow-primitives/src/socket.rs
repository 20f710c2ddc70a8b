//! Bootstrap and signal sockets.
//!
//! Connections ride on `SOCK_SEQPACKET` Unix sockets in the abstract
//! namespace: datagram boundaries (one message per send), connection
//! semantics (accept, EOF on peer close), and nothing left behind on the
//! filesystem. The endpoint for a service is derived deterministically from
//! its name (`rpc_<name>`), so starting two services with the same name
//! fails at bind time.
//!
//! The socket carries exactly three kinds of traffic:
//!
//! - one handshake datagram (small inline payload + one fd via `SCM_RIGHTS`)
//! - one-byte acks
//! - one-byte wake signals, sent non-blocking; a full socket buffer counts
//!   as delivered because the peer has signals it has not drained yet

use std::io::{self, ErrorKind};
use std::mem::{offset_of, size_of};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Outcome of a non-blocking wake signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    /// The byte was sent.
    Sent,
    /// The socket buffer is full: the peer already has pending wake bytes,
    /// so this signal coalesces with them.
    Coalesced,
    /// The peer is gone.
    PeerDead,
}

/// Build the abstract-namespace address for a service name.
fn abstract_addr(service: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let endpoint = format!("rpc_{service}");
    // SAFETY: zeroed sockaddr_un is a valid representation.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    // sun_path[0] stays NUL: abstract namespace, evaporates with the socket.
    if endpoint.len() + 1 > addr.sun_path.len() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "service name too long"));
    }
    for (dst, src) in addr.sun_path[1..].iter_mut().zip(endpoint.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    let len = (offset_of!(libc::sockaddr_un, sun_path) + 1 + endpoint.len()) as libc::socklen_t;
    Ok((addr, len))
}

fn new_seqpacket_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socket(2) succeeded and nothing else owns `raw`.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// A listening endpoint for a named service.
pub struct Listener {
    fd: OwnedFd,
}

impl Listener {
    /// Bind the endpoint derived from `service` and start listening.
    ///
    /// Fails with `AddrInUse` if another process already serves this name.
    pub fn bind(service: &str) -> io::Result<Self> {
        let fd = new_seqpacket_socket()?;
        let (addr, len) = abstract_addr(service)?;
        let addr_ptr = &addr as *const _ as *const libc::sockaddr;

        // SAFETY: addr/len describe a valid sockaddr_un.
        if unsafe { libc::bind(fd.as_raw_fd(), addr_ptr, len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a bound socket we own.
        if unsafe { libc::listen(fd.as_raw_fd(), 16) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd })
    }

    /// Dequeue one pending connection. Blocks until a client connects or
    /// [`shutdown`](Self::shutdown) is called from another thread.
    pub fn accept(&self) -> io::Result<Conn> {
        // SAFETY: fd is a listening socket; we pass null for the peer
        // address because Unix peers are anonymous here.
        let raw = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: accept4 succeeded and nothing else owns `raw`.
        Ok(Conn { fd: unsafe { OwnedFd::from_raw_fd(raw) } })
    }

    /// Unblock a concurrent [`accept`](Self::accept). Idempotent.
    pub fn shutdown(&self) {
        // SAFETY: shutdown on a socket fd; failure (e.g. already shut down)
        // is of no consequence.
        unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
    }

    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Connect to the endpoint derived from `service`.
pub fn connect(service: &str) -> io::Result<Conn> {
    let fd = new_seqpacket_socket()?;
    let (addr, len) = abstract_addr(service)?;
    let addr_ptr = &addr as *const _ as *const libc::sockaddr;

    // SAFETY: addr/len describe a valid sockaddr_un.
    if unsafe { libc::connect(fd.as_raw_fd(), addr_ptr, len) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Conn { fd })
}

/// Control-message buffer with space for one descriptor, aligned for
/// `cmsghdr`.
#[repr(C)]
union CmsgBuf {
    buf: [u8; 64],
    _align: libc::cmsghdr,
}

/// One end of an established connection.
pub struct Conn {
    fd: OwnedFd,
}

impl Conn {
    /// Send `payload` and one descriptor as a single datagram.
    ///
    /// The descriptor stays open on this side; the peer receives a fresh
    /// descriptor for the same kernel object.
    pub fn send_with_fd(&self, payload: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };

        let mut cmsg_buf = CmsgBuf { buf: [0; 64] };
        // SAFETY: zero-initialized msghdr is valid; all pointers below stay
        // alive across the sendmsg call.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        // SAFETY: accessing the byte view of the union.
        msg.msg_control = unsafe { cmsg_buf.buf.as_mut_ptr() } as *mut libc::c_void;
        // SAFETY: CMSG_SPACE is a pure size computation.
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as _;

        // SAFETY: msg_control points at a buffer large enough for one
        // fd-sized control message.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
        }

        // SAFETY: msg is fully initialized.
        let n = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive one datagram carrying an inline payload and, if the peer
    /// attached one, a descriptor. Returns the payload length.
    pub fn recv_with_fd(&self, payload: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };

        let mut cmsg_buf = CmsgBuf { buf: [0; 64] };
        // SAFETY: zero-initialized msghdr is valid.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        // SAFETY: accessing the byte view of the union.
        msg.msg_control = unsafe { cmsg_buf.buf.as_mut_ptr() } as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as _;

        // SAFETY: msg is fully initialized; MSG_CMSG_CLOEXEC keeps received
        // descriptors out of child processes.
        let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer closed"));
        }

        let mut received = None;
        // SAFETY: the kernel filled msg_control up to msg_controllen;
        // CMSG_* walk that buffer.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
                    received = Some(OwnedFd::from_raw_fd(raw));
                    break;
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok((n as usize, received))
    }

    /// Send one byte, blocking. Used for handshake acks.
    pub fn send_byte(&self, value: u8) -> io::Result<()> {
        let buf = [value];
        // SAFETY: buf is one valid byte.
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                1,
                libc::MSG_NOSIGNAL,
            )
        };
        if n <= 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive one byte, blocking. EOF (peer closed) surfaces as
    /// `UnexpectedEof`.
    pub fn recv_byte(&self) -> io::Result<u8> {
        let mut buf = [0u8];
        // SAFETY: buf is one writable byte.
        let n = unsafe {
            libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 1, 0)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer closed"));
        }
        Ok(buf[0])
    }

    /// Send a wake byte without blocking. The byte's value carries no
    /// meaning; a full buffer means the peer is already signaled.
    pub fn send_wake(&self) -> WakeResult {
        let buf = [1u8];
        // SAFETY: buf is one valid byte.
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                1,
                libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
            )
        };
        if n > 0 {
            return WakeResult::Sent;
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            ErrorKind::WouldBlock => WakeResult::Coalesced,
            _ => WakeResult::PeerDead,
        }
    }

    /// Shut both directions down, unblocking any thread parked in
    /// [`recv_byte`](Self::recv_byte). Idempotent.
    pub fn shutdown(&self) {
        // SAFETY: shutdown on a socket fd; failure is of no consequence.
        unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
    }

    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
