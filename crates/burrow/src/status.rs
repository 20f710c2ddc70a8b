//! Caller-visible status codes.

use core::fmt;

/// Status returned by calls and carried in a response frame's `aux` field.
///
/// Zero is success, negative values are fabric errors, and positive values
/// are reserved for applications: whatever a request handler returns is
/// delivered to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);
    /// The peer is gone (socket closed, signal failed, receiver exited).
    pub const DISCONNECTED: Status = Status(-1);
    /// No response arrived within the caller's deadline.
    pub const TIMEOUT: Status = Status(-2);
    /// The target service does not exist.
    pub const INVALID_SERVICE: Status = Status(-3);
    /// No handler accepted the method.
    pub const INVALID_METHOD: Status = Status(-4);
    /// Handshake version negotiation failed.
    pub const VERSION_MISMATCH: Status = Status(-5);
    /// The outgoing ring had no room for the frame.
    pub const RING_FULL: Status = Status(-6);
    /// The local endpoint was stopped while the call was in flight.
    pub const STOPPED: Status = Status(-7);

    #[inline]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// The raw value as stored in a frame's `aux` field.
    #[inline]
    pub fn as_wire(self) -> u32 {
        self.0 as u32
    }

    /// Reinterpret a frame's `aux` field as a status.
    #[inline]
    pub fn from_wire(aux: u32) -> Status {
        Status(aux as i32)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Status::OK => write!(f, "ok"),
            Status::DISCONNECTED => write!(f, "disconnected"),
            Status::TIMEOUT => write!(f, "timed out"),
            Status::INVALID_SERVICE => write!(f, "invalid service"),
            Status::INVALID_METHOD => write!(f, "invalid method"),
            Status::VERSION_MISMATCH => write!(f, "version mismatch"),
            Status::RING_FULL => write!(f, "ring full"),
            Status::STOPPED => write!(f, "stopped"),
            Status(code) => write!(f, "application status {code}"),
        }
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_preserves_sign() {
        for status in [Status::OK, Status::TIMEOUT, Status::STOPPED, Status(417), Status(-1000)] {
            assert_eq!(Status::from_wire(status.as_wire()), status);
        }
    }

    #[test]
    fn negative_codes_cross_the_wire_intact() {
        // aux is an unsigned field; -7 must come back as -7, not 4294967289.
        let aux = Status::STOPPED.as_wire();
        assert_eq!(aux, 0xFFFF_FFF9);
        assert_eq!(Status::from_wire(aux).0, -7);
    }
}
