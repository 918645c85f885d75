//! Collaborators the endpoint table is built on: peer negotiation, local
//! event dispatch, and backing memory.
//!
//! Each is a narrow trait so the table can be driven by a real transport, a
//! scripted test double, or the in-process defaults defined here.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;

use qpair_proto::{LocalEvent, MAX_PAGES, Negotiation, Status};

use crate::error::{Error, Result};
use crate::ring::Ring;

/// Page size assumed when the platform cannot report one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Sends negotiation requests to the peer and returns its verdict.
///
/// Implementations must not retry internally; transport failures are
/// reported as a non-success [`Status`].
pub trait Negotiator: Send + Sync {
    /// Delivers `request` and waits for the peer's reply.
    fn negotiate(&self, request: &Negotiation) -> Status;
}

/// Delivers attach/detach notifications for same-context queue pairs.
pub trait EventNotifier: Send + Sync {
    /// Dispatches `event` synchronously.
    fn notify(&self, event: LocalEvent) -> Status;
}

/// Allocates ring memory and the page-number lists handed to the peer.
pub trait MemoryProvider: Send + Sync {
    /// Allocates a zeroed ring of `capacity` bytes in `page_size` pages.
    ///
    /// The table always passes its configured page size.
    fn alloc_ring(&self, capacity: u64, page_size: usize) -> Result<Ring>;

    /// Releases a ring obtained from [`MemoryProvider::alloc_ring`].
    fn free_ring(&self, ring: Ring);

    /// Builds the page-number list for a produce/consume ring pair.
    fn alloc_page_set(&self, produce: &Ring, consume: &Ring) -> Result<PageSet>;

    /// Releases a page-number list.
    fn free_page_set(&self, set: PageSet);
}

impl<T: Negotiator + ?Sized> Negotiator for Arc<T> {
    fn negotiate(&self, request: &Negotiation) -> Status {
        (**self).negotiate(request)
    }
}

impl<T: EventNotifier + ?Sized> EventNotifier for Arc<T> {
    fn notify(&self, event: LocalEvent) -> Status {
        (**self).notify(event)
    }
}

impl<T: MemoryProvider + ?Sized> MemoryProvider for Arc<T> {
    fn alloc_ring(&self, capacity: u64, page_size: usize) -> Result<Ring> {
        (**self).alloc_ring(capacity, page_size)
    }

    fn free_ring(&self, ring: Ring) {
        (**self).free_ring(ring);
    }

    fn alloc_page_set(&self, produce: &Ring, consume: &Ring) -> Result<PageSet> {
        (**self).alloc_page_set(produce, consume)
    }

    fn free_page_set(&self, set: PageSet) {
        (**self).free_page_set(set);
    }
}

/// Page numbers backing a queue pair, produce ring first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSet {
    /// Produce ring pages, then consume ring pages.
    pages: Vec<u64>,
    /// How many leading entries belong to the produce ring.
    produce_pages: usize,
}

impl PageSet {
    /// Builds a set from the produce pages followed by the consume pages.
    pub fn new(produce: impl IntoIterator<Item = u64>, consume: impl IntoIterator<Item = u64>) -> Self {
        let mut pages: Vec<u64> = produce.into_iter().collect();
        let produce_pages = pages.len();
        pages.extend(consume);
        Self {
            pages,
            produce_pages,
        }
    }

    /// All page numbers, produce ring first.
    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    /// Number of pages backing the produce ring (header included).
    pub const fn produce_pages(&self) -> usize {
        self.produce_pages
    }

    /// Number of pages backing the consume ring (header included).
    pub fn consume_pages(&self) -> usize {
        self.pages.len() - self.produce_pages
    }
}

/// Heap-backed [`MemoryProvider`] that counts live allocations.
///
/// Rings are page-aligned heap memory, so the page numbers it reports are
/// the heap addresses divided by the page size.
#[derive(Debug, Default)]
pub struct HeapMemory {
    /// Rings allocated and not yet freed.
    live_rings: AtomicUsize,
    /// Page sets allocated and not yet freed.
    live_page_sets: AtomicUsize,
}

impl HeapMemory {
    /// Creates a provider with no live allocations.
    pub const fn new() -> Self {
        Self {
            live_rings: AtomicUsize::new(0),
            live_page_sets: AtomicUsize::new(0),
        }
    }

    /// Rings allocated and not yet freed.
    pub fn live_rings(&self) -> usize {
        self.live_rings.load(Ordering::Relaxed)
    }

    /// Page sets allocated and not yet freed.
    pub fn live_page_sets(&self) -> usize {
        self.live_page_sets.load(Ordering::Relaxed)
    }
}

impl MemoryProvider for HeapMemory {
    fn alloc_ring(&self, capacity: u64, page_size: usize) -> Result<Ring> {
        let ring = Ring::new(capacity, page_size)?;
        self.live_rings.fetch_add(1, Ordering::Relaxed);
        Ok(ring)
    }

    fn free_ring(&self, ring: Ring) {
        self.live_rings.fetch_sub(1, Ordering::Relaxed);
        drop(ring);
    }

    fn alloc_page_set(&self, produce: &Ring, consume: &Ring) -> Result<PageSet> {
        if produce.page_count() + consume.page_count() > MAX_PAGES {
            return Err(Error::ResourceExhausted("page list exceeds datagram limit"));
        }
        let set = PageSet::new(produce.page_numbers(), consume.page_numbers());
        self.live_page_sets.fetch_add(1, Ordering::Relaxed);
        Ok(set)
    }

    fn free_page_set(&self, set: PageSet) {
        self.live_page_sets.fetch_sub(1, Ordering::Relaxed);
        drop(set);
    }
}

/// [`Negotiator`] for tables that never talk to a peer: every request
/// fails with [`Status::DstUnreachable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPeer;

impl Negotiator for NoPeer {
    fn negotiate(&self, _request: &Negotiation) -> Status {
        Status::DstUnreachable
    }
}

/// [`EventNotifier`] that accepts and discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl EventNotifier for NoEvents {
    fn notify(&self, _event: LocalEvent) -> Status {
        Status::Success
    }
}

impl EventNotifier for Sender<LocalEvent> {
    fn notify(&self, event: LocalEvent) -> Status {
        match self.send(event) {
            Ok(()) => Status::Success,
            Err(_) => Status::DstUnreachable,
        }
    }
}

/// Returns the system page size.
#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions and only reads system state.
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(ret)
        .ok()
        .filter(|n| n.is_power_of_two())
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

/// Returns the system page size.
#[cfg(not(unix))]
pub fn page_size() -> usize {
    DEFAULT_PAGE_SIZE
}
