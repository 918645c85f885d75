//! Client handle to an allocated or attached queue pair.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use qpair_proto::{ChannelHandle, QpFlags};
use tracing::warn;

use crate::endpoint::EndpointTable;
use crate::error::{CapacityError, DetachError, Error, Result};
use crate::ring::{self, Ring};

/// Both rings of a queue pair, oriented as its creator sees them.
#[derive(Debug)]
pub(crate) struct Rings {
    /// Ring the creator writes.
    pub(crate) produce: Ring,
    /// Ring the creator reads.
    pub(crate) consume: Ring,
}

/// Ring storage shared by every endpoint of one queue pair.
///
/// The mutex is the channel lock: it covers header reads/writes and the
/// copies for one ring operation. `None` once the memory has been released.
#[derive(Debug)]
pub(crate) struct Channel {
    /// Both rings, or `None` after release.
    rings: Mutex<Option<Rings>>,
}

impl Channel {
    /// Wraps freshly allocated rings.
    pub(crate) fn new(rings: Rings) -> Arc<Self> {
        Arc::new(Self {
            rings: Mutex::new(Some(rings)),
        })
    }

    /// Takes the channel lock, recovering from poisoning.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<Rings>> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Which side of the queue pair a handle was obtained as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Allocated the queue pair; sees the rings as stored.
    Creator,
    /// Attached to a same-context queue pair; produce and consume swapped.
    Attacher,
}

impl Rings {
    /// `(produce, consume)` as `role` sees them, produce writable.
    fn split_mut(&mut self, role: Role) -> (&mut Ring, &Ring) {
        match role {
            Role::Creator => (&mut self.produce, &self.consume),
            Role::Attacher => (&mut self.consume, &self.produce),
        }
    }

    /// `(produce, consume)` as `role` sees them.
    fn split(&self, role: Role) -> (&Ring, &Ring) {
        match role {
            Role::Creator => (&self.produce, &self.consume),
            Role::Attacher => (&self.consume, &self.produce),
        }
    }
}

/// A queue pair endpoint: a produce ring this side writes and a consume
/// ring this side reads.
///
/// Obtained from [`EndpointTable::alloc`]. Ring operations only take the
/// channel lock; they never touch the endpoint table. Call
/// [`QPair::detach`] to release it; dropping it detaches on a best-effort
/// basis.
#[derive(Debug)]
pub struct QPair {
    /// Queue pair handle.
    handle: ChannelHandle,
    /// Peer context id.
    peer: u32,
    /// Flags at creation.
    flags: QpFlags,
    /// Capacity of the ring this side writes.
    produce_size: u64,
    /// Capacity of the ring this side reads.
    consume_size: u64,
    /// Which orientation of the shared rings this side uses.
    role: Role,
    /// Rings shared with the other endpoint.
    channel: Arc<Channel>,
    /// Table holding this endpoint's reference.
    table: EndpointTable,
    /// Set once the reference has been released.
    detached: bool,
}

impl QPair {
    /// Builds a handle for a reference the table has just counted.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: ChannelHandle,
        peer: u32,
        flags: QpFlags,
        produce_size: u64,
        consume_size: u64,
        role: Role,
        channel: Arc<Channel>,
        table: EndpointTable,
    ) -> Self {
        Self {
            handle,
            peer,
            flags,
            produce_size,
            consume_size,
            role,
            channel,
            table,
            detached: false,
        }
    }

    /// Queue pair handle.
    pub const fn handle(&self) -> ChannelHandle {
        self.handle
    }

    /// Context id of the peer, or [`qpair_proto::INVALID_ID`] if any peer
    /// may attach.
    pub const fn peer(&self) -> u32 {
        self.peer
    }

    /// Flags the queue pair was created with.
    pub const fn flags(&self) -> QpFlags {
        self.flags
    }

    /// Capacity of the ring this side writes.
    pub const fn produce_size(&self) -> u64 {
        self.produce_size
    }

    /// Capacity of the ring this side reads.
    pub const fn consume_size(&self) -> u64 {
        self.consume_size
    }

    /// Copies as much of `buf` as currently fits into the produce ring.
    ///
    /// Returns the number of bytes written, which may be short; fails with
    /// [`CapacityError::NoSpace`] when the ring is full.
    pub fn enqueue(&self, buf: &[u8]) -> Result<usize> {
        self.with_rings(|rings| {
            let (produce, consume) = rings.split_mut(self.role);
            ring::enqueue(produce, consume, buf)
        })
    }

    /// Moves up to `buf.len()` bytes out of the consume ring.
    ///
    /// Fails with [`CapacityError::NoData`] when the ring is empty.
    pub fn dequeue(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_rings(|rings| {
            let (produce, consume) = rings.split(self.role);
            ring::dequeue(produce, consume, buf, true)
        })
    }

    /// Copies up to `buf.len()` bytes out of the consume ring without
    /// consuming them.
    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_rings(|rings| {
            let (produce, consume) = rings.split(self.role);
            ring::dequeue(produce, consume, buf, false)
        })
    }

    /// Raw `(producer tail, consumer head)` offsets of the produce ring.
    pub fn produce_indexes(&self) -> Result<(u64, u64)> {
        let size = self.produce_size;
        self.with_rings(|rings| {
            let (produce, consume) = rings.split(self.role);
            indexes(
                produce.header().producer_tail(),
                consume.header().consumer_head(),
                size,
            )
        })
    }

    /// Raw `(producer tail, consumer head)` offsets of the consume ring.
    pub fn consume_indexes(&self) -> Result<(u64, u64)> {
        let size = self.consume_size;
        self.with_rings(|rings| {
            let (produce, consume) = rings.split(self.role);
            indexes(
                consume.header().producer_tail(),
                produce.header().consumer_head(),
                size,
            )
        })
    }

    /// Bytes that can be enqueued right now.
    pub fn produce_free_space(&self) -> Result<u64> {
        self.with_rings(|rings| {
            let (produce, consume) = rings.split(self.role);
            ring::free_space(produce.header(), consume.header(), produce.capacity())
        })
    }

    /// Bytes enqueued by this side that the peer has not consumed yet.
    pub fn produce_buf_ready(&self) -> Result<u64> {
        self.with_rings(|rings| {
            let (produce, consume) = rings.split(self.role);
            ring::buf_ready(produce.header(), consume.header(), produce.capacity())
        })
    }

    /// Space the peer has left in this side's consume ring.
    pub fn consume_free_space(&self) -> Result<u64> {
        self.with_rings(|rings| {
            let (produce, consume) = rings.split(self.role);
            ring::free_space(consume.header(), produce.header(), consume.capacity())
        })
    }

    /// Bytes ready to be dequeued.
    pub fn consume_buf_ready(&self) -> Result<u64> {
        self.with_rings(|rings| {
            let (produce, consume) = rings.split(self.role);
            ring::buf_ready(consume.header(), produce.header(), consume.capacity())
        })
    }

    /// Releases this endpoint's reference through the endpoint table.
    ///
    /// If the table refuses (the peer rejected a remote detach, say), the
    /// reference is kept and the queue pair comes back inside the
    /// [`DetachError`] for a retry.
    pub fn detach(mut self) -> std::result::Result<(), DetachError> {
        match self.table.detach(self.handle) {
            Ok(()) => {
                self.detached = true;
                Ok(())
            }
            Err(e) => Err(DetachError::new(self, e)),
        }
    }

    /// Runs `f` under the channel lock; `NotFound` once the rings are gone.
    fn with_rings<T>(&self, f: impl FnOnce(&mut Rings) -> Result<T>) -> Result<T> {
        let mut guard = self.channel.lock();
        match guard.as_mut() {
            Some(rings) => f(rings),
            None => Err(Error::NotFound(self.handle)),
        }
    }
}

/// Range-checks a raw offset pair.
fn indexes(tail: u64, head: u64, size: u64) -> Result<(u64, u64)> {
    if tail >= size || head >= size {
        return Err(Error::InvalidArgument("ring offset out of range"));
    }
    Ok((tail, head))
}

impl Drop for QPair {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        match self.table.detach(self.handle) {
            // The table was shut down underneath us.
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => warn!(handle = %self.handle, error = %e, "implicit detach on drop failed"),
        }
    }
}

impl io::Write for &QPair {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.enqueue(buf).map_err(into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for &QPair {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.dequeue(buf).map_err(into_io)
    }
}

/// Maps ring errors onto `io::ErrorKind`s.
fn into_io(e: Error) -> io::Error {
    let kind = match e {
        Error::Capacity(CapacityError::NoSpace | CapacityError::NoData) => {
            io::ErrorKind::WouldBlock
        }
        Error::NotFound(_) => io::ErrorKind::NotConnected,
        Error::InvalidArgument(_) => io::ErrorKind::InvalidData,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}
