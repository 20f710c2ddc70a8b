//! Readiness primitive: a thin epoll wrapper and the wake pipe used to
//! interrupt a blocked wait from another thread.

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

bitflags::bitflags! {
    /// Readiness bits reported for a registered descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u32 {
        const READABLE = 0x1;
        const HANGUP = 0x2;
        const ERROR = 0x4;
    }
}

impl Readiness {
    fn from_epoll(events: u32) -> Self {
        let mut bits = Readiness::empty();
        if events & (libc::EPOLLIN as u32) != 0 {
            bits |= Readiness::READABLE;
        }
        if events & (libc::EPOLLHUP as u32) != 0 {
            bits |= Readiness::HANGUP;
        }
        if events & (libc::EPOLLERR as u32) != 0 {
            bits |= Readiness::ERROR;
        }
        bits
    }
}

/// A ready descriptor, as reported by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readiness: Readiness,
}

/// Block-until-readable multiplexer over registered descriptors.
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain epoll_create1 call.
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_create1 succeeded and nothing else owns `raw`.
        Ok(Self { epfd: unsafe { OwnedFd::from_raw_fd(raw) } })
    }

    /// Register `fd` for read readiness (hangup and error are always
    /// reported). Fails if `fd` is invalid or already registered.
    pub fn add(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32,
            u64: fd as u64,
        };
        let epfd = self.epfd.as_raw_fd();
        // SAFETY: ev is a valid epoll_event.
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Drop `fd` from the interest set.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: DEL ignores the event argument.
        if unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        } != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until at least one registered descriptor is ready, appending
    /// the ready set to `out`. Returns the number of events appended.
    /// Retries transparently on `EINTR`.
    pub fn wait(&self, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        const MAX_EVENTS: usize = 32;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            // SAFETY: epoll_event is plain data; the kernel overwrites the
            // entries it reports.
            unsafe { std::mem::zeroed() };

        loop {
            // SAFETY: events points at MAX_EVENTS writable entries.
            let n = unsafe {
                libc::epoll_wait(self.epfd.as_raw_fd(), events.as_mut_ptr(), MAX_EVENTS as i32, -1)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            for ev in &events[..n as usize] {
                out.push(PollEvent {
                    fd: ev.u64 as RawFd,
                    readiness: Readiness::from_epoll(ev.events),
                });
            }
            return Ok(n as usize);
        }
    }
}

/// Self-pipe used as the event loop's internal wake channel.
///
/// Any thread writes one byte to wake the loop; the loop drains the pipe
/// when it observes the read end readable. Both ends are non-blocking, so a
/// full pipe degrades into a coalesced wake just like the socket signals.
pub struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0i32; 2];
        // SAFETY: fds is a writable 2-element array.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded and nothing else owns the descriptors.
        Ok(Self {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }

    /// The read end, for registration with a [`Poller`].
    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Wake the loop. A full pipe counts as delivered.
    pub fn wake(&self) {
        let buf = [1u8];
        // SAFETY: buf is one valid byte; EAGAIN on a full pipe is fine, the
        // reader has wakes it has not drained yet.
        unsafe { libc::write(self.write.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 1) };
    }

    /// Drain every pending wake byte.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf is writable; the fd is non-blocking.
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_pipe_wakes_poller() {
        let poller = Poller::new().unwrap();
        let pipe = WakePipe::new().unwrap();
        poller.add(pipe.read_fd()).unwrap();

        pipe.wake();

        let mut events = Vec::new();
        let n = poller.wait(&mut events).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fd, pipe.read_fd());
        assert!(events[0].readiness.contains(Readiness::READABLE));

        pipe.drain();
    }

    #[test]
    fn add_invalid_fd_fails() {
        let poller = Poller::new().unwrap();
        assert!(poller.add(-1).is_err());
    }

    #[test]
    fn remove_unregistered_fd_fails() {
        let poller = Poller::new().unwrap();
        let pipe = WakePipe::new().unwrap();
        assert!(poller.remove(pipe.read_fd()).is_err());
    }

    #[test]
    fn repeated_wakes_coalesce() {
        let poller = Poller::new().unwrap();
        let pipe = WakePipe::new().unwrap();
        poller.add(pipe.read_fd()).unwrap();

        for _ in 0..10 {
            pipe.wake();
        }

        let mut events = Vec::new();
        poller.wait(&mut events).unwrap();
        pipe.drain();

        // After the drain the pipe is quiet; a fresh wake is still seen.
        pipe.wake();
        events.clear();
        let n = poller.wait(&mut events).unwrap();
        assert_eq!(n, 1);
    }
}
