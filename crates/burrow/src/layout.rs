//! Shared region layout: exactly two byte rings in one mapping.
//!
//! ```text
//! offset 0                        client→server control block (128 B)
//! offset 128                      client→server data (capacity bytes)
//! offset 128 + capacity           server→client control block (128 B)
//! offset 256 + capacity           server→client data (capacity bytes)
//! ```
//!
//! The client creates and initializes the region before the handshake; the
//! server attaches to the received descriptor and derives the ring capacity
//! from the mapped length, so no capacity negotiation happens on the wire.

use burrow_primitives::{ByteRing, Region, RING_HEADER_SIZE};

/// Default per-direction ring capacity: 256 KiB.
pub const DEFAULT_RING_CAPACITY: u32 = 256 * 1024;

/// Smallest supported per-direction ring. Keeps the second control block
/// cache-line aligned and leaves room for any sane frame.
pub const MIN_RING_CAPACITY: u32 = 4096;

/// Total mapping size for a given per-direction ring capacity.
pub fn region_size(ring_capacity: u32) -> usize {
    2 * (RING_HEADER_SIZE + ring_capacity as usize)
}

/// The mapped length does not describe two equal power-of-two rings.
#[derive(Debug, thiserror::Error)]
#[error("shared region has invalid size {len}: want 2 * (128 + power-of-two capacity)")]
pub struct BadRegion {
    pub len: usize,
}

/// Typed view over a shared region's two rings.
///
/// Directions are named from the client's perspective: the client produces
/// into `client_to_server` and consumes `server_to_client`; the service does
/// the opposite.
pub struct SharedRegionView {
    client_to_server: ByteRing,
    server_to_client: ByteRing,
    ring_capacity: u32,
}

impl SharedRegionView {
    /// Initialize both rings in a freshly created region (client side).
    ///
    /// # Safety
    ///
    /// `region` must be exactly [`region_size`]`(ring_capacity)` bytes,
    /// writable, and not yet shared with the peer.
    pub unsafe fn init(region: Region, ring_capacity: u32) -> Self {
        assert!(region.len() == region_size(ring_capacity), "region size mismatch");
        assert!(
            ring_capacity >= MIN_RING_CAPACITY && ring_capacity.is_power_of_two(),
            "ring capacity must be a power of two ≥ {MIN_RING_CAPACITY}"
        );

        let second = RING_HEADER_SIZE + ring_capacity as usize;
        // SAFETY: offsets are within the region and 64-byte aligned; the
        // caller guarantees exclusive access during initialization.
        let client_to_server = unsafe { ByteRing::init(region, 0, ring_capacity) };
        let server_to_client = unsafe { ByteRing::init(region, second, ring_capacity) };

        Self { client_to_server, server_to_client, ring_capacity }
    }

    /// Attach to a region initialized by the peer (service side), deriving
    /// and validating the ring capacity from the mapped length.
    ///
    /// # Safety
    ///
    /// `region` must be a mapping of a region the peer initialized with
    /// [`SharedRegionView::init`].
    pub unsafe fn attach(region: Region) -> Result<Self, BadRegion> {
        let len = region.len();
        let per_direction = len / 2;
        if len % 2 != 0 || per_direction <= RING_HEADER_SIZE {
            return Err(BadRegion { len });
        }

        let ring_capacity = (per_direction - RING_HEADER_SIZE) as u32;
        if ring_capacity < MIN_RING_CAPACITY || !ring_capacity.is_power_of_two() {
            return Err(BadRegion { len });
        }

        let second = RING_HEADER_SIZE + ring_capacity as usize;
        // SAFETY: the size checks above establish both rings fit; the peer
        // initialized the control blocks before sharing the region.
        let client_to_server = unsafe { ByteRing::attach(region, 0, ring_capacity) };
        let server_to_client = unsafe { ByteRing::attach(region, second, ring_capacity) };

        Ok(Self { client_to_server, server_to_client, ring_capacity })
    }

    #[inline]
    pub fn client_to_server(&self) -> &ByteRing {
        &self.client_to_server
    }

    #[inline]
    pub fn server_to_client(&self) -> &ByteRing {
        &self.server_to_client
    }

    #[inline]
    pub fn ring_capacity(&self) -> u32 {
        self.ring_capacity
    }
}
