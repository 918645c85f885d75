//! Guest-side shared-memory queue pairs.
//!
//! A queue pair is two single-producer/single-consumer byte rings that let
//! two endpoints exchange data without copies through a transport. `qpair`
//! keeps the per-context [`EndpointTable`], negotiates shared queue pairs
//! with a peer, attaches same-context ([`QpFlags::LOCAL`]) queue pairs to
//! each other, and converts shared queue pairs to local memory ahead of a
//! suspend.
//!
//! # Quick start: a local loopback
//!
//! ```
//! use qpair::{AllocParams, EndpointTable, QpFlags};
//!
//! let table = EndpointTable::builder().context_id(3).build()?;
//!
//! let a = table.alloc(&AllocParams::new(4096, 4096).flags(QpFlags::LOCAL))?;
//! let b = table.alloc(
//!     &AllocParams::new(4096, 4096)
//!         .flags(QpFlags::LOCAL)
//!         .handle(a.handle()),
//! )?;
//!
//! a.enqueue(b"ping")?;
//! let mut buf = [0u8; 4];
//! b.dequeue(&mut buf)?;
//! assert_eq!(&buf, b"ping");
//! # Ok::<(), qpair::Error>(())
//! ```

mod backend;
mod config;
mod endpoint;
mod error;
mod handle_set;
mod hibernate;
mod pages;
mod qpair;
mod ring;
mod transport;

pub use backend::{
    DEFAULT_PAGE_SIZE, EventNotifier, HeapMemory, MemoryProvider, Negotiator, NoEvents, NoPeer,
    PageSet, page_size,
};
pub use config::{DEFAULT_MAX_QUEUE_MEMORY, DEFAULT_RESERVED_RESOURCE_IDS, TableConfig};
pub use endpoint::{AllocParams, EndpointInfo, EndpointTable, TableBuilder};
pub use error::{CapacityError, DetachError, Error, Result};
pub use handle_set::HandleSet;
pub use hibernate::ConversionSummary;
pub use qpair::QPair;
pub use qpair_proto::{
    ChannelHandle, EventKind, INVALID_ID, LocalEvent, Negotiation, Privilege, QpFlags, Status,
};
pub use ring::{Ring, RingHeader, buf_ready, free_space};
pub use transport::StreamNegotiator;
