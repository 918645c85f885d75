//! Reference negotiation peer for `qpair`.
//!
//! Stands in for the hypervisor side of queue pair negotiation: a
//! [`PeerRegistry`] that accepts, attaches, and forgets queue pairs, and a
//! blocking Unix socket server that speaks the `qpair-proto` datagram
//! codec, one thread per connection.

mod registry;
#[cfg(unix)]
mod server;

pub use registry::{PeerEntry, PeerRegistry};
#[cfg(unix)]
pub use server::{connection, serve, session};
