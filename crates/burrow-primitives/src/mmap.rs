//! Anonymous shared memory regions.
//!
//! A [`ShmRegion`] is a `memfd`-backed mapping shared between two processes:
//! one side creates it, sends the file descriptor across a Unix socket, and
//! the other side maps the received descriptor. The kernel object lives
//! until both sides have closed their descriptors and unmapped.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::Region;

/// An anonymous shared memory mapping plus the descriptor that backs it.
///
/// The descriptor is kept open for the lifetime of the region so it can be
/// passed to a peer at any point; dropping the region unmaps the memory and
/// closes the descriptor.
pub struct ShmRegion {
    ptr: *mut u8,
    len: usize,
    fd: OwnedFd,
}

impl ShmRegion {
    /// Create a new zero-filled region of exactly `len` bytes.
    pub fn create(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "region size must be > 0"));
        }

        // SAFETY: plain syscall; the name is a static NUL-terminated string
        // only used for /proc diagnostics.
        let raw = unsafe {
            libc::memfd_create(c"burrow-region".as_ptr(), libc::MFD_CLOEXEC)
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: memfd_create succeeded and nothing else owns `raw`.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: fd is a fresh memfd we own.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Self::map(fd, len)
    }

    /// Map a region received from a peer. The length is discovered from the
    /// descriptor itself, so the two sides need no size negotiation.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        // SAFETY: stat is written by the kernel before we read it.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let len = stat.st_size as usize;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "received region is empty"));
        }

        Self::map(fd, len)
    }

    fn map(fd: OwnedFd, len: usize) -> io::Result<Self> {
        // SAFETY: fd is a valid descriptor sized to at least `len` bytes.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { ptr: ptr as *mut u8, len, fd })
    }

    /// A [`Region`] view of the mapping.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping is page-aligned and valid for the lifetime of
        // this ShmRegion.
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the backing descriptor, e.g. to send it to a peer.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping we own; the OwnedFd closes
        // itself afterwards.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping is plain shared memory; synchronization is provided by
// the structures placed inside it.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}
