//! Shared-memory primitives for burrow.
//!
//! This crate is the layer that knows nothing about RPC: an offset-addressed
//! [`Region`] over raw memory, the lock-free SPSC byte ring that burrow
//! places in shared mappings, and (behind the `std` feature, Linux only) the
//! OS plumbing the transport is built on: anonymous shared memory, abstract
//! `SOCK_SEQPACKET` sockets with `SCM_RIGHTS` handle transfer, and an epoll
//! readiness wrapper.
//!
//! The core modules are `no_std` and loom-checkable; everything that touches
//! a file descriptor requires `std`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

pub mod region;
pub mod ring;
pub mod sync;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use ring::{ByteRing, ByteRingRaw, RingHeader, RING_HEADER_SIZE};

// OS plumbing. The transport targets Linux: memfd, the abstract socket
// namespace and epoll have no portable equivalents.
#[cfg(all(feature = "std", target_os = "linux", not(loom)))]
pub mod mmap;
#[cfg(all(feature = "std", target_os = "linux", not(loom)))]
pub mod poll;
#[cfg(all(feature = "std", target_os = "linux", not(loom)))]
pub mod socket;

#[cfg(all(feature = "std", target_os = "linux", not(loom)))]
pub use mmap::ShmRegion;
#[cfg(all(feature = "std", target_os = "linux", not(loom)))]
pub use poll::{Poller, Readiness, WakePipe};
#[cfg(all(feature = "std", target_os = "linux", not(loom)))]
pub use socket::{Conn, Listener, WakeResult};

#[cfg(all(test, loom))]
mod loom_tests;
