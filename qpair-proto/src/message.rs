//! Negotiation requests and local peer events.

use serde::{Deserialize, Serialize};

use crate::handle::{ChannelHandle, QpFlags};

/// A request sent to the peer to register or tear down a queue pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Negotiation {
    /// Register (or attach to) a queue pair backed by the listed pages.
    Alloc(AllocRequest),
    /// Drop this side's reference to a queue pair.
    Detach {
        /// Queue pair to detach from.
        handle: ChannelHandle,
    },
}

impl Negotiation {
    /// Handle the request refers to.
    pub const fn handle(&self) -> ChannelHandle {
        match self {
            Self::Alloc(req) => req.handle,
            Self::Detach { handle } => *handle,
        }
    }
}

/// Body of [`Negotiation::Alloc`].
///
/// Page numbers list the produce ring (header page first) followed by the
/// consume ring, so the peer can map the same memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRequest {
    /// Queue pair handle chosen by the guest.
    pub handle: ChannelHandle,
    /// Context id of the expected peer, or [`crate::INVALID_ID`] for any.
    pub peer: u32,
    /// Creation flags.
    pub flags: QpFlags,
    /// Capacity of the guest's produce ring in bytes.
    pub produce_size: u64,
    /// Capacity of the guest's consume ring in bytes.
    pub consume_size: u64,
    /// Backing page numbers, produce ring first.
    pub pages: Vec<u64>,
}

/// Kind of a same-context peer notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
#[non_exhaustive]
pub enum EventKind {
    /// The peer attached to the queue pair.
    PeerAttach = 3,
    /// The peer detached from the queue pair.
    PeerDetach = 4,
}

/// Notification delivered to the local event subsystem for same-context
/// queue pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEvent {
    /// What happened.
    pub kind: EventKind,
    /// Queue pair it happened to.
    pub handle: ChannelHandle,
    /// Context id of the endpoint that attached or detached.
    pub peer: u32,
}
