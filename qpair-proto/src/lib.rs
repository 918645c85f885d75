//! Wire types for qpair guest↔peer negotiation.
//!
//! A queue pair is registered with (and torn down at) the peer through a
//! single datagram exchange: the guest writes one [`Negotiation`] datagram
//! and reads back one 4-byte [`Status`]. Same-context channels never reach
//! the wire; their peers are told about attach/detach through a
//! [`LocalEvent`] instead.

mod codec;
mod handle;
mod message;
mod status;

pub use codec::{MAX_PAGES, decode, decode_status, encode, encode_status};
pub use handle::{
    ChannelHandle, HOST_CONTEXT_ID, HYPERVISOR_CONTEXT_ID, INVALID_ID, Privilege, QpFlags,
    WELL_KNOWN_CONTEXT_ID,
};
pub use message::{AllocRequest, EventKind, LocalEvent, Negotiation};
pub use status::Status;
