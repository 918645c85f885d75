//! In-memory bookkeeping of the queue pairs a peer has agreed to.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use qpair_proto::{AllocRequest, ChannelHandle, Negotiation, QpFlags, Status};
use serde::Serialize;
use tracing::{debug, info};

/// What the peer remembers about one queue pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct PeerEntry {
    /// Queue pair handle.
    pub handle: ChannelHandle,
    /// Flags from the creating request.
    pub flags: QpFlags,
    /// Creator's produce capacity.
    pub produce_size: u64,
    /// Creator's consume capacity.
    pub consume_size: u64,
    /// Number of pages the creator shared.
    pub pages: usize,
    /// Endpoints attached (1 or 2).
    pub attached: u32,
}

/// Answers queue pair negotiations the way a hypervisor would.
///
/// The first `Alloc` for a handle creates the entry; a second `Alloc` with
/// swapped capacities attaches to it. `Detach` drops one attachment and
/// forgets the entry when none remain.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Known queue pairs by handle.
    entries: Mutex<HashMap<ChannelHandle, PeerEntry>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one request and returns the reply status.
    pub fn handle(&self, request: &Negotiation) -> Status {
        match request {
            Negotiation::Alloc(req) => self.alloc(req),
            Negotiation::Detach { handle } => self.detach(*handle),
            _ => Status::InvalidArgs,
        }
    }

    /// Creates or attaches to the entry for `req.handle`.
    fn alloc(&self, req: &AllocRequest) -> Status {
        if req.handle.is_invalid() {
            return Status::InvalidArgs;
        }
        if req.produce_size == 0 && req.consume_size == 0 {
            return Status::InvalidArgs;
        }
        if req.flags.contains(QpFlags::LOCAL) {
            // Local queue pairs never leave their context.
            return Status::InvalidArgs;
        }

        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&req.handle) {
            if entry.attached > 1 {
                return Status::AlreadyExists;
            }
            if entry.produce_size != req.consume_size || entry.consume_size != req.produce_size {
                debug!(handle = %req.handle, "attach rejected: capacities differ");
                return Status::QueuePairMismatch;
            }
            entry.attached += 1;
            info!(handle = %req.handle, "peer attached");
            return Status::Success;
        }

        if req.flags.contains(QpFlags::ATTACH_ONLY) {
            return Status::NotFound;
        }
        entries.insert(
            req.handle,
            PeerEntry {
                handle: req.handle,
                flags: req.flags,
                produce_size: req.produce_size,
                consume_size: req.consume_size,
                pages: req.pages.len(),
                attached: 1,
            },
        );
        info!(
            handle = %req.handle,
            produce = req.produce_size,
            consume = req.consume_size,
            pages = req.pages.len(),
            "queue pair registered"
        );
        Status::Success
    }

    /// Drops one attachment, forgetting the entry at zero.
    fn detach(&self, handle: ChannelHandle) -> Status {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&handle) else {
            return Status::NotFound;
        };
        entry.attached -= 1;
        if entry.attached == 0 {
            entries.remove(&handle);
            info!(handle = %handle, "queue pair forgotten");
        } else {
            debug!(handle = %handle, "peer detached");
        }
        Status::Success
    }

    /// Forgets every queue pair, as a device reset would.
    pub fn reset(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        info!(count, "peer registry reset");
        count
    }

    /// Snapshot of one entry.
    pub fn entry(&self, handle: ChannelHandle) -> Option<PeerEntry> {
        self.lock().get(&handle).cloned()
    }

    /// Snapshots of every entry, ordered by handle.
    pub fn entries(&self) -> Vec<PeerEntry> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by_key(|e| e.handle);
        all
    }

    /// Number of known queue pairs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no queue pairs are known.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Locks the entries, recovering from poisoning.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelHandle, PeerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
