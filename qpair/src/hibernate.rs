//! Suspend support: moving remote-backed queue pairs into local memory.
//!
//! Before the host snapshots this context, every queue pair whose rings are
//! shared with the peer is copied into private memory and detached from the
//! peer, so the client keeps a working (if one-sided) queue pair across the
//! suspend. Entries that cannot be converted are remembered and, if the
//! device was reset on wake, reported to local listeners as detached.

use std::mem;

use qpair_proto::{EventKind, LocalEvent, Negotiation, QpFlags};
use serde::Serialize;
use tracing::{info, warn};

use crate::endpoint::{Backing, Endpoint, EndpointTable};
use crate::error::{Error, Result, check};
use crate::ring::Ring;

/// Outcome of [`EndpointTable::convert_to_local`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct ConversionSummary {
    /// Entries now backed by local memory.
    pub converted: usize,
    /// Entries left remote-backed and added to the failed set.
    pub failed: usize,
}

impl EndpointTable {
    /// Converts every remote-backed queue pair to local memory.
    ///
    /// Never fails as a whole: an entry that cannot be converted keeps its
    /// shared memory, is marked, and is recorded in the failed set. A later
    /// detach of a marked entry tolerates the peer no longer knowing it.
    pub fn convert_to_local(&self) -> ConversionSummary {
        let mut guard = self.lock();
        let reg = &mut *guard;
        let mut summary = ConversionSummary::default();

        for entry in reg.endpoints.values_mut() {
            if !matches!(entry.backing, Backing::Remote { .. }) {
                continue;
            }
            match self.convert_entry(entry) {
                Ok(()) => summary.converted += 1,
                Err(e) => {
                    warn!(handle = %entry.handle, error = %e, "queue pair conversion failed");
                    entry.conversion_failed = true;
                    reg.failed.append(entry.handle);
                    summary.failed += 1;
                }
            }
        }

        info!(
            converted = summary.converted,
            failed = summary.failed,
            "queue pairs prepared for hibernation"
        );
        summary
    }

    /// Handles wake from hibernation.
    ///
    /// Drains the failed set; when the device was reset, each drained entry
    /// is announced to local listeners as detached by its peer.
    pub fn wake(&self, device_reset: bool) {
        let mut reg = self.lock();
        let context = self.context_id();
        let mut drained = 0usize;
        while let Some(handle) = reg.failed.pop() {
            drained += 1;
            if !device_reset {
                continue;
            }
            let status = self.shared.notifier.notify(LocalEvent {
                kind: EventKind::PeerDetach,
                handle,
                peer: context,
            });
            if !status.is_success() {
                warn!(handle = %handle, %status, "peer detach notification failed");
            }
        }
        info!(drained, device_reset, "woke from hibernation");
    }

    /// Snapshots one entry, detaches it from the peer and swaps in the copy.
    fn convert_entry(&self, entry: &mut Endpoint) -> Result<()> {
        let memory = &self.shared.memory;
        let mut guard = entry.channel.lock();
        let rings = guard.as_mut().ok_or(Error::NotFound(entry.handle))?;

        let consume = self.snapshot(&rings.consume)?;
        let produce = match self.snapshot(&rings.produce) {
            Ok(ring) => ring,
            Err(e) => {
                memory.free_ring(consume);
                return Err(e);
            }
        };

        let status = self
            .shared
            .negotiator
            .negotiate(&Negotiation::Detach {
                handle: entry.handle,
            });
        if let Err(e) = check("hibernation detach", status) {
            memory.free_ring(consume);
            memory.free_ring(produce);
            return Err(e);
        }

        let old_consume = mem::replace(&mut rings.consume, consume);
        let old_produce = mem::replace(&mut rings.produce, produce);
        drop(guard);
        memory.free_ring(old_produce);
        memory.free_ring(old_consume);
        if let Backing::Remote { pages } = mem::replace(&mut entry.backing, Backing::Local) {
            memory.free_page_set(pages);
        }
        entry.flags |= QpFlags::LOCAL;

        let status = self.shared.notifier.notify(LocalEvent {
            kind: EventKind::PeerDetach,
            handle: entry.handle,
            peer: self.context_id(),
        });
        if !status.is_success() {
            warn!(handle = %entry.handle, %status, "peer detach notification failed");
        }
        Ok(())
    }

    /// Copies `ring` into freshly allocated local memory.
    fn snapshot(&self, ring: &Ring) -> Result<Ring> {
        let mut copy = self
            .shared
            .memory
            .alloc_ring(ring.capacity(), self.config().page_size)?;
        if let Err(e) = copy.copy_from(ring) {
            self.shared.memory.free_ring(copy);
            return Err(e);
        }
        Ok(copy)
    }
}
