//! burrow: a single-host RPC fabric over shared memory.
//!
//! Clients issue typed requests to a named service, receive typed responses,
//! and receive asynchronous notifications the service broadcasts. After the
//! bootstrap handshake, every payload byte moves through a pair of lock-free
//! SPSC byte rings in one shared mapping; the Unix socket that established
//! the connection is kept only for one-byte wake signals.
//!
//! ```text
//!         ┌──────────┐   requests    ┌──────────┐
//!         │  Client  │ ────────────▶ │ Service  │
//!         │          │ ◀──────────── │          │
//!         └────┬─────┘  responses /  └────┬─────┘
//!              │        notifications     │
//!     shared mapping: client→server ring + server→client ring
//!     seqpacket socket: handshake (version + region fd), wake bytes
//! ```
//!
//! Payloads are opaque byte sequences; serialization belongs to the caller.
//! Everything is local to one machine; there is no networking, no
//! encryption, and no authentication beyond the kernel's credentials on the
//! local socket.
//!
//! # Quick tour
//!
//! ```no_run
//! use burrow::{Client, Service, Status};
//! use std::time::Duration;
//!
//! let service = Service::new("adder");
//! service.set_request_handler(|_method, request| {
//!     let x = u32::from_le_bytes(request.try_into().unwrap());
//!     (Status::OK, (x + 1).to_le_bytes().to_vec())
//! });
//! service.start()?;
//!
//! let client = Client::new("adder");
//! client.connect()?;
//! let reply = client
//!     .call(1, 7, &41u32.to_le_bytes(), Duration::from_secs(2))
//!     .expect("call failed");
//! assert_eq!(u32::from_le_bytes(reply.try_into().unwrap()), 42);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod layout;
pub mod service;
pub mod status;

pub use client::{Client, ClientConfig};
pub use error::{ConnectError, StartError};
pub use event_loop::{EventLoop, RunLoop};
pub use frame::{FrameFlags, FrameHeader, FrameKind, FRAME_HEADER_SIZE};
pub use layout::{SharedRegionView, DEFAULT_RING_CAPACITY};
pub use service::Service;
pub use status::Status;

/// Protocol version carried in every frame header and negotiated during the
/// handshake.
pub const PROTOCOL_VERSION: u16 = 1;
