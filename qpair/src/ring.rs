//! Ring buffers and the wraparound accessor shared by every queue pair.
//!
//! Each direction of a queue pair is a [`Ring`]: a header page holding the
//! producer-tail and consumer-head offsets, followed by a fixed byte area.
//! Offsets for one direction are split across the two headers: the producer
//! advances the tail in *its own* produce header, while the consumer records
//! its head in *its own* produce header, which is the producer's consume
//! header. The accessor therefore always takes both headers.
//!
//! One byte of every ring is kept free so that a full ring (`tail + 1 ==
//! head`) can be told apart from an empty one (`tail == head`) without a
//! separate flag.

// Offsets are bounded by the ring capacity, which is backed by an in-memory
// slice; narrowing to usize cannot truncate.
#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use qpair_proto::ChannelHandle;

use crate::error::{CapacityError, Error, Result};
use crate::pages::Pages;

/// Peer-visible ring header.
#[derive(Debug, Default)]
#[repr(C)]
pub struct RingHeader {
    /// Context half of the owning handle.
    context: AtomicU32,
    /// Resource half of the owning handle.
    resource: AtomicU32,
    /// Next offset the producer writes.
    producer_tail: AtomicU64,
    /// Next offset the consumer reads.
    consumer_head: AtomicU64,
}

impl RingHeader {
    /// Stamps the owning handle and resets both offsets.
    pub fn init(&self, handle: ChannelHandle) {
        self.context.store(handle.context, Ordering::Relaxed);
        self.resource.store(handle.resource, Ordering::Relaxed);
        self.producer_tail.store(0, Ordering::Release);
        self.consumer_head.store(0, Ordering::Release);
    }

    /// Handle stamped by [`RingHeader::init`].
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle::new(
            self.context.load(Ordering::Relaxed),
            self.resource.load(Ordering::Relaxed),
        )
    }

    /// Current producer-tail offset.
    pub fn producer_tail(&self) -> u64 {
        self.producer_tail.load(Ordering::Acquire)
    }

    /// Current consumer-head offset.
    pub fn consumer_head(&self) -> u64 {
        self.consumer_head.load(Ordering::Acquire)
    }

    /// Publishes `n` written bytes.
    fn advance_producer_tail(&self, n: u64, capacity: u64) {
        let tail = (self.producer_tail() + n) % capacity;
        self.producer_tail.store(tail, Ordering::Release);
    }

    /// Releases `n` read bytes.
    fn advance_consumer_head(&self, n: u64, capacity: u64) {
        let head = (self.consumer_head() + n) % capacity;
        self.consumer_head.store(head, Ordering::Release);
    }

    /// Copies handle and offsets from `other`.
    fn copy_from(&self, other: &Self) {
        self.init(other.handle());
        self.producer_tail
            .store(other.producer_tail(), Ordering::Release);
        self.consumer_head
            .store(other.consumer_head(), Ordering::Release);
    }
}

/// One direction of a queue pair: a header page followed by a
/// fixed-capacity byte area, both page-aligned.
pub struct Ring {
    /// Single page holding the [`RingHeader`].
    header: Pages,
    /// Byte area, rounded up to whole pages.
    data: Pages,
    /// Usable bytes of `data`.
    capacity: u64,
    /// Page size both runs were allocated with.
    page_size: usize,
}

impl Ring {
    /// Allocates a zeroed ring of `capacity` bytes, with the byte area
    /// rounded up to a whole number of `page_size` pages.
    ///
    /// `page_size` must be a power of two large enough to hold a
    /// [`RingHeader`].
    pub fn new(capacity: u64, page_size: usize) -> Result<Self> {
        let data_pages = usize::try_from(capacity)
            .map(|c| c.div_ceil(page_size.max(1)))
            .map_err(|_| Error::ResourceExhausted("ring capacity too large"))?;
        Ok(Self {
            header: Pages::zeroed(1, page_size)?,
            data: Pages::zeroed(data_pages, page_size)?,
            capacity,
            page_size,
        })
    }

    /// Capacity in bytes (not page-rounded).
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Page size the ring was allocated with.
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// The peer-visible header.
    pub fn header(&self) -> &RingHeader {
        self.header.header()
    }

    /// Number of pages backing this ring: one header page plus the data
    /// pages.
    pub const fn page_count(&self) -> usize {
        1 + self.data.len() / self.page_size
    }

    /// Physical-style page numbers (address divided by the page size) of
    /// the header page followed by each data page.
    pub fn page_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        let first_data = self.data.addr() / self.page_size;
        std::iter::once(self.header.addr() / self.page_size)
            .chain((0..self.data.len() / self.page_size).map(move |i| first_data + i))
            .map(|pn| pn as u64)
    }

    /// Byte area, `capacity` long.
    fn bytes(&self) -> &[u8] {
        &self.data.as_slice()[..self.capacity as usize]
    }

    /// Mutable byte area, `capacity` long.
    fn bytes_mut(&mut self) -> &mut [u8] {
        let used = self.capacity as usize;
        &mut self.data.as_mut_slice()[..used]
    }

    /// Copies header offsets and ring contents from `other`, which must have
    /// the same capacity.
    pub fn copy_from(&mut self, other: &Self) -> Result<()> {
        if self.capacity != other.capacity {
            return Err(Error::InvalidArgument("ring capacity mismatch"));
        }
        self.header().copy_from(other.header());
        self.bytes_mut().copy_from_slice(other.bytes());
        Ok(())
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity)
            .field("tail", &self.header().producer_tail())
            .field("head", &self.header().consumer_head())
            .finish_non_exhaustive()
    }
}

/// Bytes that can be enqueued into a ring of `capacity` without overtaking
/// the consumer.
///
/// `produce` is the producer's own header (tail), `consume` the header in
/// which the consumer records its head.
pub fn free_space(produce: &RingHeader, consume: &RingHeader, capacity: u64) -> Result<u64> {
    let tail = produce.producer_tail();
    let head = consume.consumer_head();
    check_offsets(tail, head, capacity)?;
    Ok(capacity - 1 - (tail + capacity - head) % capacity)
}

/// Bytes ready to be dequeued from a ring of `capacity`.
///
/// `consume` is the header the producer advances (tail), `produce` the
/// consumer's own header (head).
pub fn buf_ready(consume: &RingHeader, produce: &RingHeader, capacity: u64) -> Result<u64> {
    let tail = consume.producer_tail();
    let head = produce.consumer_head();
    check_offsets(tail, head, capacity)?;
    Ok((tail + capacity - head) % capacity)
}

/// Offsets come from memory the peer can write; never trust them.
fn check_offsets(tail: u64, head: u64, capacity: u64) -> Result<()> {
    if capacity == 0 {
        return Err(Error::InvalidArgument("zero-capacity ring"));
    }
    if tail >= capacity || head >= capacity {
        return Err(Error::InvalidArgument("ring offset out of range"));
    }
    Ok(())
}

/// Copies as much of `buf` as fits into `produce` and publishes it.
///
/// Returns the number of bytes written, which may be less than `buf.len()`.
pub(crate) fn enqueue(produce: &mut Ring, consume: &Ring, buf: &[u8]) -> Result<usize> {
    let capacity = produce.capacity;
    let free = free_space(produce.header(), consume.header(), capacity)?;
    if free == 0 {
        return Err(CapacityError::NoSpace.into());
    }
    let written = buf.len().min(free as usize);
    let tail = produce.header().producer_tail() as usize;
    copy_in(produce.bytes_mut(), tail, &buf[..written]);
    produce.header().advance_producer_tail(written as u64, capacity);
    Ok(written)
}

/// Copies up to `buf.len()` ready bytes out of `consume`; advances the
/// consumer head only when `advance` is set (dequeue vs. peek).
pub(crate) fn dequeue(
    produce: &Ring,
    consume: &Ring,
    buf: &mut [u8],
    advance: bool,
) -> Result<usize> {
    let capacity = consume.capacity;
    let ready = buf_ready(consume.header(), produce.header(), capacity)?;
    if ready == 0 {
        return Err(CapacityError::NoData.into());
    }
    let read = buf.len().min(ready as usize);
    let head = produce.header().consumer_head() as usize;
    copy_out(consume.bytes(), head, &mut buf[..read]);
    if advance {
        produce.header().advance_consumer_head(read as u64, capacity);
    }
    Ok(read)
}

/// Writes `src` into `ring` starting at `offset`, wrapping at the end.
fn copy_in(ring: &mut [u8], offset: usize, src: &[u8]) {
    let first = src.len().min(ring.len() - offset);
    ring[offset..offset + first].copy_from_slice(&src[..first]);
    ring[..src.len() - first].copy_from_slice(&src[first..]);
}

/// Reads `dst.len()` bytes from `ring` starting at `offset`, wrapping at the
/// end.
fn copy_out(ring: &[u8], offset: usize, dst: &mut [u8]) {
    let first = dst.len().min(ring.len() - offset);
    dst[..first].copy_from_slice(&ring[offset..offset + first]);
    let rest = dst.len() - first;
    dst[first..].copy_from_slice(&ring[..rest]);
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    /// Two rings wired back to back, as a creator sees them.
    fn pair(produce: u64, consume: u64) -> (Ring, Ring) {
        let p = Ring::new(produce, PAGE).unwrap();
        let c = Ring::new(consume, PAGE).unwrap();
        let h = ChannelHandle::new(1, 2000);
        p.header().init(h);
        c.header().init(h);
        (p, c)
    }

    #[test]
    fn empty_ring_reserves_one_byte() {
        let (p, c) = pair(16, 16);
        assert_eq!(free_space(p.header(), c.header(), 16).unwrap(), 15);
        assert_eq!(buf_ready(c.header(), p.header(), 16).unwrap(), 0);
    }

    #[test]
    fn data_area_is_page_rounded() {
        let r = Ring::new(5000, PAGE).unwrap();
        assert_eq!(r.capacity(), 5000);
        assert_eq!(r.page_count(), 3);
        assert_eq!(r.page_numbers().count(), 3);
    }

    #[test]
    fn header_and_data_occupy_their_own_pages() {
        let r = Ring::new(3 * PAGE as u64, PAGE).unwrap();
        let pages: Vec<u64> = r.page_numbers().collect();
        assert_eq!(pages.len(), 4);
        assert_eq!(pages[2], pages[1] + 1);
        assert_eq!(pages[3], pages[1] + 2);
        assert!(!pages[1..].contains(&pages[0]));
    }

    #[test]
    fn free_space_formula_both_orders() {
        let (p, c) = pair(10, 10);
        // tail ahead of head
        p.header().producer_tail.store(7, Ordering::Relaxed);
        c.header().consumer_head.store(2, Ordering::Relaxed);
        assert_eq!(free_space(p.header(), c.header(), 10).unwrap(), 4);
        // tail wrapped behind head
        p.header().producer_tail.store(1, Ordering::Relaxed);
        c.header().consumer_head.store(6, Ordering::Relaxed);
        assert_eq!(free_space(p.header(), c.header(), 10).unwrap(), 4);
    }

    #[test]
    fn corrupted_offsets_are_rejected() {
        let (p, c) = pair(10, 10);
        p.header().producer_tail.store(10, Ordering::Relaxed);
        assert!(matches!(
            free_space(p.header(), c.header(), 10),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn enqueue_stops_at_free_space() {
        let (mut p, c) = pair(8, 8);
        assert_eq!(enqueue(&mut p, &c, &[1; 20]).unwrap(), 7);
        assert!(matches!(
            enqueue(&mut p, &c, &[1]),
            Err(Error::Capacity(CapacityError::NoSpace))
        ));
    }

    #[test]
    fn straddling_write_wraps() {
        // Loop the produce ring back onto itself: one ring, both roles.
        let (mut p, c) = pair(8, 8);
        assert_eq!(enqueue(&mut p, &c, b"abcde").unwrap(), 5);
        // Consume 5 by moving the head stored in the consumer's header.
        c.header().advance_consumer_head(5, 8);
        assert_eq!(enqueue(&mut p, &c, b"123456").unwrap(), 6);
        assert_eq!(p.header().producer_tail(), 3);
        assert_eq!(&p.bytes()[5..8], b"123");
        assert_eq!(&p.bytes()[0..3], b"456");
    }

    #[test]
    fn peek_does_not_advance() {
        // From the consumer's side: its consume ring is `p` above.
        let (mut theirs, mine) = pair(8, 8);
        enqueue(&mut theirs, &mine, b"xyz").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(dequeue(&mine, &theirs, &mut buf, false).unwrap(), 3);
        assert_eq!(&buf[..3], b"xyz");
        assert_eq!(buf_ready(theirs.header(), mine.header(), 8).unwrap(), 3);
        assert_eq!(dequeue(&mine, &theirs, &mut buf[..2], true).unwrap(), 2);
        assert_eq!(buf_ready(theirs.header(), mine.header(), 8).unwrap(), 1);
    }

    #[test]
    fn dequeue_empty_is_no_data() {
        let (p, c) = pair(8, 8);
        let mut buf = [0u8; 4];
        assert!(matches!(
            dequeue(&p, &c, &mut buf, true),
            Err(Error::Capacity(CapacityError::NoData))
        ));
    }

    #[test]
    fn copy_from_preserves_contents() {
        let (mut p, c) = pair(8, 8);
        enqueue(&mut p, &c, b"keep").unwrap();
        let mut snap = Ring::new(8, PAGE).unwrap();
        snap.copy_from(&p).unwrap();
        assert_eq!(snap.header().producer_tail(), 4);
        assert_eq!(snap.header().handle(), ChannelHandle::new(1, 2000));
        assert_eq!(&snap.bytes()[..4], b"keep");
        let mut other = Ring::new(9, PAGE).unwrap();
        assert!(other.copy_from(&p).is_err());
    }
}
