//! Result codes exchanged with the peer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of result codes a peer (or local event subsystem) can return.
///
/// Encoded on the wire as a little-endian `i32`; success is `0`, every
/// failure is negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
#[non_exhaustive]
pub enum Status {
    /// The operation succeeded.
    Success = 0,
    /// Malformed request or invalid argument combination.
    InvalidArgs = -2,
    /// Out of memory.
    NoMem = -3,
    /// The datagram could not be delivered.
    DatagramFailed = -4,
    /// Caller is not allowed to perform the operation.
    NoAccess = -7,
    /// No free handle could be found.
    NoHandle = -8,
    /// No peer is reachable.
    DstUnreachable = -10,
    /// Datagram payload exceeds the transport limit.
    PayloadTooLarge = -11,
    /// Privilege flags not permitted for this caller.
    InvalidPriv = -12,
    /// Unclassified failure.
    Generic = -13,
    /// A resource limit was hit.
    NoResources = -16,
    /// The transport to the peer went away.
    ConnectionLost = -17,
    /// The resource exists but cannot be used right now.
    Unavailable = -18,
    /// No such queue pair.
    NotFound = -19,
    /// The queue pair already exists.
    AlreadyExists = -20,
    /// Attach parameters do not match the existing queue pair.
    QueuePairMismatch = -23,
    /// No space in the produce ring.
    QueuePairNoSpace = -26,
    /// No data in the consume ring.
    QueuePairNoData = -27,
}

impl Status {
    /// Every variant, for code lookup.
    const ALL: [Self; 18] = [
        Self::Success,
        Self::InvalidArgs,
        Self::NoMem,
        Self::DatagramFailed,
        Self::NoAccess,
        Self::NoHandle,
        Self::DstUnreachable,
        Self::PayloadTooLarge,
        Self::InvalidPriv,
        Self::Generic,
        Self::NoResources,
        Self::ConnectionLost,
        Self::Unavailable,
        Self::NotFound,
        Self::AlreadyExists,
        Self::QueuePairMismatch,
        Self::QueuePairNoSpace,
        Self::QueuePairNoData,
    ];

    /// Returns the raw wire code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Looks up a raw wire code; `None` for codes outside the enumeration.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Returns `true` for [`Status::Success`].
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}
