//! Single-threaded dispatchers.
//!
//! [`EventLoop`] multiplexes readiness across registered descriptors and
//! executes work posted from other threads, all on the one thread that calls
//! [`run`](EventLoop::run). Handlers therefore never race each other and may
//! mutate whatever state they share with posted work without extra locking;
//! the short internal locks exist only so registration and posting are safe
//! from other threads.
//!
//! [`RunLoop`] is the restricted variant: no readiness sources, just a
//! serialization point for cross-thread work.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burrow_primitives::{Poller, Readiness, WakePipe};
use parking_lot::Mutex;

type Post = Box<dyn FnOnce() + Send>;
type SourceHandler = Box<dyn FnMut(RawFd, Readiness) + Send>;

/// A readiness-driven dispatcher owned by one thread at a time.
///
/// The cycle of [`run`](Self::run):
///
/// 1. drain the post queue and execute each callable in submission order;
/// 2. block until a registered descriptor (or the internal wake channel)
///    becomes readable;
/// 3. dispatch each ready descriptor to its handler;
/// 4. exit once [`stop`](Self::stop) has been observed, clearing the stop
///    flag so a later `run` is valid.
///
/// Draining posts *before* blocking, combined with the wake channel, is what
/// makes a callable posted mid-wait run promptly: the post wakes the
/// blocked wait, and the next iteration starts by draining the queue.
pub struct EventLoop {
    name: String,
    poller: Poller,
    wake: WakePipe,
    running: AtomicBool,
    stop_requested: AtomicBool,
    posts: Mutex<Vec<Post>>,
    sources: Mutex<HashMap<RawFd, Arc<Mutex<SourceHandler>>>>,
}

impl EventLoop {
    /// Set up the loop: allocate the poller and the internal wake channel.
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let poller = Poller::new()?;
        let wake = WakePipe::new()?;
        poller.add(wake.read_fd())?;

        Ok(Self {
            name: name.into(),
            poller,
            wake,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            posts: Mutex::new(Vec::new()),
            sources: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while some thread is inside [`run`](Self::run).
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Dispatch until [`stop`](Self::stop). Executes on the caller's
    /// thread; handlers and posted callables all run here.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        tracing::debug!(name = %self.name, "event loop running");

        let mut events = Vec::new();
        while !self.stop_requested.load(Ordering::Acquire) {
            let batch = mem::take(&mut *self.posts.lock());
            for callable in batch {
                callable();
            }

            events.clear();
            if let Err(err) = self.poller.wait(&mut events) {
                tracing::warn!(name = %self.name, error = %err, "poll failed, exiting loop");
                break;
            }

            for event in &events {
                if event.fd == self.wake.read_fd() {
                    self.wake.drain();
                    continue;
                }

                // Snapshot under a short lock so a handler can add or
                // remove sources (including itself) without deadlocking.
                let handler = self.sources.lock().get(&event.fd).cloned();
                if let Some(handler) = handler {
                    (handler.lock())(event.fd, event.readiness);
                }
            }
        }

        self.running.store(false, Ordering::Release);
        self.stop_requested.store(false, Ordering::Release);
        tracing::debug!(name = %self.name, "event loop stopped");
    }

    /// Ask [`run`](Self::run) to exit at its next iteration. Thread-safe
    /// and idempotent; valid before `run`, during `run`, or from within a
    /// posted callable or handler.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake.wake();
    }

    /// Enqueue work to run on the loop thread. Posts from one thread
    /// execute in submission order.
    pub fn post(&self, callable: impl FnOnce() + Send + 'static) {
        self.posts.lock().push(Box::new(callable));
        self.wake.wake();
    }

    /// Register a descriptor for read readiness. The handler runs on the
    /// loop thread with the descriptor and the observed readiness bits.
    pub fn add_source(
        &self,
        fd: RawFd,
        handler: impl FnMut(RawFd, Readiness) + Send + 'static,
    ) -> io::Result<()> {
        self.poller.add(fd)?;
        self.sources.lock().insert(fd, Arc::new(Mutex::new(Box::new(handler))));
        Ok(())
    }

    /// Drop a readiness source. Safe to call from within its own handler;
    /// once removed, further readability no longer invokes it.
    pub fn remove_source(&self, fd: RawFd) -> io::Result<()> {
        let removed = self.sources.lock().remove(&fd);
        // The descriptor may already be gone (closed by the owner); the
        // interest set entry dies with it, so a DEL failure is fine.
        let _ = self.poller.remove(fd);

        if removed.is_none() {
            return Err(io::Error::new(ErrorKind::NotFound, "fd was not registered"));
        }
        Ok(())
    }
}

/// The restricted dispatcher: a serialization point for cross-thread work,
/// with no readiness sources. Runs the same cycle as [`EventLoop`] with
/// only the wake channel registered.
pub struct RunLoop {
    inner: EventLoop,
}

impl RunLoop {
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        Ok(Self { inner: EventLoop::new(name)? })
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Block, executing posted work, until [`stop`](Self::stop).
    pub fn run(&self) {
        self.inner.run();
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Enqueue work to run on the loop thread.
    pub fn post(&self, callable: impl FnOnce() + Send + 'static) {
        self.inner.post(callable);
    }
}
