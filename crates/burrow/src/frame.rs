//! The 24-byte frame header that precedes every payload in a ring.
//!
//! A frame is a header followed by `payload_len` payload bytes, contiguous
//! in the ring. All multi-byte fields are little-endian on the wire. The
//! codec is policy-free: it neither validates flag combinations nor bounds
//! `payload_len`; receivers decide what a tolerable frame looks like via
//! [`FrameHeader::kind`].

use crate::PROTOCOL_VERSION;

/// Size of an encoded [`FrameHeader`] in bytes.
pub const FRAME_HEADER_SIZE: usize = 24;

bitflags::bitflags! {
    /// Frame kind bitset. Exactly one of the three kind bits is set on a
    /// well-formed frame; unknown higher bits are ignored by this version.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u16 {
        const REQUEST = 0x0001;
        const RESPONSE = 0x0002;
        const NOTIFY = 0x0004;
        const _ = !0;
    }
}

/// What a frame is, once its flags pass the exactly-one-kind check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Notify,
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version; always [`PROTOCOL_VERSION`] for frames we emit.
    pub version: u16,
    /// Frame kind bitset.
    pub flags: FrameFlags,
    /// Logical service identifier. Opaque to the fabric.
    pub service_id: u32,
    /// Method (request/response) or notification kind (notify).
    pub message_id: u32,
    /// Correlation token chosen by the requester; a response copies it
    /// verbatim; meaningless on notifications.
    pub seq: u32,
    /// Length of the payload that follows this header in the ring.
    pub payload_len: u32,
    /// Response status ([`Status::as_wire`](crate::Status::as_wire));
    /// reserved otherwise.
    pub aux: u32,
}

impl FrameHeader {
    /// Header for a request frame.
    pub fn request(service_id: u32, method_id: u32, seq: u32, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: FrameFlags::REQUEST,
            service_id,
            message_id: method_id,
            seq,
            payload_len,
            aux: 0,
        }
    }

    /// Header for a notification frame.
    pub fn notify(service_id: u32, notify_id: u32, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: FrameFlags::NOTIFY,
            service_id,
            message_id: notify_id,
            seq: 0,
            payload_len,
            aux: 0,
        }
    }

    /// Header for the response to `request`, carrying `aux` as status.
    pub fn response_to(request: &FrameHeader, payload_len: u32, aux: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: FrameFlags::RESPONSE,
            service_id: request.service_id,
            message_id: request.message_id,
            seq: request.seq,
            payload_len,
            aux,
        }
    }

    /// Encode to the 24-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_le_bytes());
        buf[2..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[4..8].copy_from_slice(&self.service_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.message_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.aux.to_le_bytes());
        buf
    }

    /// Decode from wire form. Fails only when `buf` is shorter than 24
    /// bytes; flag validation is the receiver's business.
    pub fn decode(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        Some(FrameHeader {
            version: u16_at(0),
            flags: FrameFlags::from_bits_retain(u16_at(2)),
            service_id: u32_at(4),
            message_id: u32_at(8),
            seq: u32_at(12),
            payload_len: u32_at(16),
            aux: u32_at(20),
        })
    }

    /// Decode a full-size header buffer, as peeked from a ring.
    pub fn decode_array(buf: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        Self::decode(buf).expect("buffer is exactly one header")
    }

    /// Classify the frame. `None` means a protocol violation: zero or more
    /// than one of the kind bits is set. Unknown high bits are ignored.
    pub fn kind(&self) -> Option<FrameKind> {
        let kind_bits =
            self.flags & (FrameFlags::REQUEST | FrameFlags::RESPONSE | FrameFlags::NOTIFY);
        if kind_bits == FrameFlags::REQUEST {
            Some(FrameKind::Request)
        } else if kind_bits == FrameFlags::RESPONSE {
            Some(FrameKind::Response)
        } else if kind_bits == FrameFlags::NOTIFY {
            Some(FrameKind::Notify)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            flags: FrameFlags::REQUEST,
            service_id: 3,
            message_id: 8,
            seq: 11,
            payload_len: 17,
            aux: 55,
        };
        let encoded = header.encode();
        assert_eq!(FrameHeader::decode(&encoded), Some(header));
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let header = FrameHeader {
            version: 0x0102,
            flags: FrameFlags::from_bits_retain(0x0304),
            service_id: 0x05060708,
            message_id: 0x090A0B0C,
            seq: 0x0D0E0F10,
            payload_len: 0x11121314,
            aux: 0x15161718,
        };
        let encoded = header.encode();
        assert_eq!(
            encoded,
            [
                0x02, 0x01, // version
                0x04, 0x03, // flags
                0x08, 0x07, 0x06, 0x05, // service_id
                0x0C, 0x0B, 0x0A, 0x09, // message_id
                0x10, 0x0F, 0x0E, 0x0D, // seq
                0x14, 0x13, 0x12, 0x11, // payload_len
                0x18, 0x17, 0x16, 0x15, // aux
            ]
        );
    }

    #[test]
    fn decode_rejects_short_buffers() {
        let encoded = FrameHeader::request(1, 2, 3, 4).encode();
        for len in 0..FRAME_HEADER_SIZE {
            assert!(FrameHeader::decode(&encoded[..len]).is_none(), "accepted {len} bytes");
        }
    }

    #[test]
    fn kind_requires_exactly_one_bit() {
        let mut header = FrameHeader::request(1, 2, 3, 0);
        assert_eq!(header.kind(), Some(FrameKind::Request));

        header.flags = FrameFlags::REQUEST | FrameFlags::RESPONSE;
        assert_eq!(header.kind(), None);

        header.flags = FrameFlags::from_bits_retain(0);
        assert_eq!(header.kind(), None);

        // Unknown high bits are ignored for classification.
        header.flags = FrameFlags::NOTIFY | FrameFlags::from_bits_retain(0x8000);
        assert_eq!(header.kind(), Some(FrameKind::Notify));
    }

    #[test]
    fn response_copies_correlation_fields() {
        let request = FrameHeader::request(9, 42, 1234, 5);
        let response = FrameHeader::response_to(&request, 0, 7);
        assert_eq!(response.service_id, 9);
        assert_eq!(response.message_id, 42);
        assert_eq!(response.seq, 1234);
        assert_eq!(response.aux, 7);
        assert_eq!(response.kind(), Some(FrameKind::Response));
    }
}
