//! Fixed-layout datagram codec over any `Read`/`Write` stream.
//!
//! Every request is one datagram: a [`DatagramHeader`] followed by its
//! payload. The `Alloc` payload is an [`AllocFixed`] followed by the page
//! numbers; the `Detach` payload is a [`WireHandle`] alone. The reply is a
//! single `i32` status. All integers are little-endian and every wire
//! struct is unaligned, so none carries padding.

use std::io::{self, Read, Write};

use zerocopy::byteorder::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::handle::{ChannelHandle, HYPERVISOR_CONTEXT_ID, QpFlags};
use crate::message::{AllocRequest, Negotiation};
use crate::status::Status;

/// Resource id of the peer's queue pair allocation entry point.
const RESOURCE_ALLOC: u32 = 10;
/// Resource id of the peer's queue pair detach entry point.
const RESOURCE_DETACH: u32 = 11;

/// Maximum number of page numbers accepted in one `Alloc` datagram.
pub const MAX_PAGES: usize = 1 << 16;

/// Largest payload a datagram may announce.
const MAX_PAYLOAD: usize = size_of::<AllocFixed>() + size_of::<U64>() * MAX_PAGES;

/// A [`ChannelHandle`] as laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct WireHandle {
    /// Context id.
    context: U32,
    /// Resource id.
    resource: U32,
}

impl From<ChannelHandle> for WireHandle {
    fn from(h: ChannelHandle) -> Self {
        Self {
            context: U32::new(h.context),
            resource: U32::new(h.resource),
        }
    }
}

impl From<WireHandle> for ChannelHandle {
    fn from(w: WireHandle) -> Self {
        Self::new(w.context.get(), w.resource.get())
    }
}

/// Leading 24 bytes of every datagram.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct DatagramHeader {
    /// Peer entry point: hypervisor context plus an operation resource id.
    dst: WireHandle,
    /// Always the invalid handle; guests send anonymously.
    src: WireHandle,
    /// Length of the payload that follows.
    payload_size: U64,
}

impl DatagramHeader {
    /// Header addressed to the peer's `resource` entry point.
    fn to_peer(resource: u32, payload: usize) -> Self {
        Self {
            dst: ChannelHandle::new(HYPERVISOR_CONTEXT_ID, resource).into(),
            src: ChannelHandle::INVALID.into(),
            payload_size: U64::new(payload as u64),
        }
    }
}

/// Fixed part of the `Alloc` payload, before the page array.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct AllocFixed {
    /// Queue pair handle.
    handle: WireHandle,
    /// Expected peer context.
    peer: U32,
    /// Raw [`QpFlags`] bits.
    flags: U32,
    /// Guest produce capacity.
    produce_size: U64,
    /// Guest consume capacity.
    consume_size: U64,
    /// Number of page numbers that follow.
    page_count: U64,
}

/// Encodes `msg` as one datagram and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &Negotiation) -> io::Result<()> {
    let mut buf = Vec::new();
    match msg {
        Negotiation::Alloc(req) => {
            if req.pages.len() > MAX_PAGES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "page list exceeds datagram limit",
                ));
            }
            let pages: Vec<U64> = req.pages.iter().copied().map(U64::new).collect();
            let fixed = AllocFixed {
                handle: req.handle.into(),
                peer: U32::new(req.peer),
                flags: U32::new(req.flags.bits()),
                produce_size: U64::new(req.produce_size),
                consume_size: U64::new(req.consume_size),
                page_count: U64::new(pages.len() as u64),
            };
            let payload = size_of::<AllocFixed>() + pages.as_bytes().len();
            buf.extend_from_slice(DatagramHeader::to_peer(RESOURCE_ALLOC, payload).as_bytes());
            buf.extend_from_slice(fixed.as_bytes());
            buf.extend_from_slice(pages.as_bytes());
        }
        Negotiation::Detach { handle } => {
            let body = WireHandle::from(*handle);
            buf.extend_from_slice(
                DatagramHeader::to_peer(RESOURCE_DETACH, size_of::<WireHandle>()).as_bytes(),
            );
            buf.extend_from_slice(body.as_bytes());
        }
    }
    w.write_all(&buf)?;
    w.flush()
}

/// Reads one datagram from `r` and decodes it.
pub fn decode(r: &mut impl Read) -> io::Result<Negotiation> {
    let mut hdr = DatagramHeader::new_zeroed();
    r.read_exact(hdr.as_mut_bytes())?;

    if hdr.dst.context.get() != HYPERVISOR_CONTEXT_ID {
        return Err(invalid("datagram not addressed to the peer"));
    }
    let payload_len = usize::try_from(hdr.payload_size.get())
        .ok()
        .filter(|&len| len <= MAX_PAYLOAD)
        .ok_or_else(|| invalid("datagram exceeds payload limit"))?;

    let mut body = vec![0u8; payload_len];
    r.read_exact(&mut body)?;

    match hdr.dst.resource.get() {
        RESOURCE_ALLOC => decode_alloc(&body).map(Negotiation::Alloc),
        RESOURCE_DETACH => {
            let handle = WireHandle::read_from_bytes(&body)
                .map_err(|_| invalid("detach payload has wrong length"))?;
            Ok(Negotiation::Detach {
                handle: handle.into(),
            })
        }
        other => Err(invalid(format!("unknown peer resource {other}"))),
    }
}

/// Writes a reply status.
pub fn encode_status<W: Write>(w: &mut W, status: Status) -> io::Result<()> {
    w.write_all(I32::new(status.code()).as_bytes())?;
    w.flush()
}

/// Reads a reply status. Codes outside [`Status`] are rejected.
pub fn decode_status(r: &mut impl Read) -> io::Result<Status> {
    let mut raw = I32::new_zeroed();
    r.read_exact(raw.as_mut_bytes())?;
    let code = raw.get();
    Status::from_code(code).ok_or_else(|| invalid(format!("unknown status code {code}")))
}

/// Decodes an `Alloc` payload, checking the page count against its length.
fn decode_alloc(body: &[u8]) -> io::Result<AllocRequest> {
    let (fixed, rest) =
        AllocFixed::read_from_prefix(body).map_err(|_| invalid("alloc payload truncated"))?;
    let flags = QpFlags::from_bits(fixed.flags.get())
        .ok_or_else(|| invalid("unknown queue pair flags"))?;
    let pages = <[U64]>::ref_from_bytes(rest)
        .map_err(|_| invalid("page array is not a whole number of entries"))?;
    if fixed.page_count.get() != pages.len() as u64 {
        return Err(invalid("page count does not match payload size"));
    }
    Ok(AllocRequest {
        handle: fixed.handle.into(),
        peer: fixed.peer.get(),
        flags,
        produce_size: fixed.produce_size.get(),
        consume_size: fixed.consume_size.get(),
        pages: pages.iter().map(|p| p.get()).collect(),
    })
}

/// Builds an [`io::ErrorKind::InvalidData`] error.
fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_ID;

    const HEADER_LEN: usize = size_of::<DatagramHeader>();
    const FIXED_LEN: usize = size_of::<AllocFixed>();

    fn alloc_req(pages: Vec<u64>) -> Negotiation {
        Negotiation::Alloc(AllocRequest {
            handle: ChannelHandle::new(5, 1024),
            peer: INVALID_ID,
            flags: QpFlags::NONBLOCK,
            produce_size: 4096,
            consume_size: 8192,
            pages,
        })
    }

    fn encoded(msg: &Negotiation) -> Vec<u8> {
        let mut buf = Vec::new();
        encode(&mut buf, msg).unwrap();
        buf
    }

    #[test]
    fn wire_structs_have_fixed_sizes() {
        assert_eq!(size_of::<WireHandle>(), 8);
        assert_eq!(HEADER_LEN, 24);
        assert_eq!(FIXED_LEN, 40);
    }

    #[test]
    fn alloc_layout() {
        let buf = encoded(&alloc_req(vec![0x11, 0x22, 0x33]));
        assert_eq!(buf.len(), HEADER_LEN + FIXED_LEN + 3 * 8);

        let (hdr, body) = DatagramHeader::read_from_prefix(&buf).unwrap();
        // Destination: hypervisor, alloc entry point.
        assert_eq!(
            ChannelHandle::from(hdr.dst),
            ChannelHandle::new(HYPERVISOR_CONTEXT_ID, RESOURCE_ALLOC)
        );
        // Anonymous source.
        assert!(ChannelHandle::from(hdr.src).is_invalid());
        assert_eq!(hdr.payload_size.get(), (FIXED_LEN + 24) as u64);

        let (fixed, pages) = AllocFixed::read_from_prefix(body).unwrap();
        assert_eq!(ChannelHandle::from(fixed.handle), ChannelHandle::new(5, 1024));
        assert_eq!(fixed.flags.get(), QpFlags::NONBLOCK.bits());
        assert_eq!(fixed.consume_size.get(), 8192);
        assert_eq!(fixed.page_count.get(), 3);
        assert_eq!(&pages[16..24], &0x33u64.to_le_bytes());
    }

    #[test]
    fn alloc_decodes_to_same_request() {
        let req = alloc_req(vec![7; 6]);
        let buf = encoded(&req);
        assert_eq!(decode(&mut io::Cursor::new(&buf)).unwrap(), req);
    }

    #[test]
    fn detach_carries_only_the_handle() {
        let msg = Negotiation::Detach {
            handle: ChannelHandle::new(9, 2000),
        };
        let buf = encoded(&msg);
        assert_eq!(buf.len(), HEADER_LEN + 8);
        let (hdr, _) = DatagramHeader::read_from_prefix(&buf).unwrap();
        assert_eq!(hdr.dst.resource.get(), RESOURCE_DETACH);
        assert_eq!(decode(&mut io::Cursor::new(&buf)).unwrap(), msg);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut hdr = DatagramHeader::to_peer(RESOURCE_ALLOC, 0);
        hdr.payload_size = U64::new(u64::MAX);
        let result = decode(&mut io::Cursor::new(hdr.as_bytes()));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_page_count_mismatch() {
        let mut buf = encoded(&alloc_req(vec![1, 2]));
        let at = HEADER_LEN + FIXED_LEN - 8;
        buf[at..at + 8].copy_from_slice(&5u64.to_le_bytes());
        assert!(decode(&mut io::Cursor::new(&buf)).is_err());
    }

    #[test]
    fn rejects_ragged_page_array() {
        let mut hdr = DatagramHeader::to_peer(RESOURCE_ALLOC, FIXED_LEN + 3);
        let mut buf = hdr.as_bytes().to_vec();
        buf.extend_from_slice(&[0u8; FIXED_LEN + 3]);
        assert!(decode(&mut io::Cursor::new(&buf)).is_err());
        hdr.payload_size = U64::new(4);
        let mut short = hdr.as_bytes().to_vec();
        short.extend_from_slice(&[0u8; 4]);
        assert!(decode(&mut io::Cursor::new(&short)).is_err());
    }

    #[test]
    fn rejects_unknown_flags() {
        let mut buf = encoded(&alloc_req(vec![]));
        let at = HEADER_LEN + 12;
        buf[at..at + 4].copy_from_slice(&0x80u32.to_le_bytes());
        assert!(decode(&mut io::Cursor::new(&buf)).is_err());
    }

    #[test]
    fn rejects_unknown_resource() {
        let hdr = DatagramHeader::to_peer(42, 0);
        assert!(decode(&mut io::Cursor::new(hdr.as_bytes())).is_err());
    }

    #[test]
    fn status_reply() {
        let mut buf = Vec::new();
        encode_status(&mut buf, Status::NotFound).unwrap();
        assert_eq!(buf, (-19i32).to_le_bytes());
        assert_eq!(
            decode_status(&mut io::Cursor::new(&buf)).unwrap(),
            Status::NotFound
        );
        let bogus = 12345i32.to_le_bytes();
        assert!(decode_status(&mut io::Cursor::new(&bogus[..])).is_err());
    }

    #[test]
    fn truncated_stream_is_eof() {
        let mut buf = encoded(&alloc_req(vec![1, 2, 3]));
        buf.truncate(buf.len() - 4);
        let err = decode(&mut io::Cursor::new(&buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
