//! Per-context endpoint table: queue pair allocation, local attach, detach.
//!
//! The table lock is held for the whole of every lifecycle operation,
//! including the synchronous negotiation with the peer, so allocations and
//! detaches are fully serialized. Ring I/O never takes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use qpair_proto::{
    AllocRequest, ChannelHandle, EventKind, INVALID_ID, LocalEvent, Negotiation, Privilege,
    QpFlags, Status,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{
    EventNotifier, HeapMemory, MemoryProvider, Negotiator, NoEvents, NoPeer, PageSet,
};
use crate::config::TableConfig;
use crate::error::{Error, Result, check};
use crate::handle_set::HandleSet;
use crate::qpair::{Channel, QPair, Role, Rings};

/// Where a queue pair's ring memory currently lives.
#[derive(Debug)]
pub(crate) enum Backing {
    /// Same-context queue pair, or one converted for hibernation.
    Local,
    /// Shared with the peer through the listed pages.
    Remote { pages: PageSet },
}

/// One table entry.
#[derive(Debug)]
pub(crate) struct Endpoint {
    /// Queue pair handle.
    pub(crate) handle: ChannelHandle,
    /// Peer context id, or `INVALID_ID`.
    pub(crate) peer: u32,
    /// Creation flags, plus `LOCAL` once converted.
    pub(crate) flags: QpFlags,
    /// Creator's produce capacity.
    pub(crate) produce_size: u64,
    /// Creator's consume capacity.
    pub(crate) consume_size: u64,
    /// Live `QPair`s for this entry.
    pub(crate) ref_count: u32,
    /// Ring storage shared with those `QPair`s.
    pub(crate) channel: Arc<Channel>,
    /// Where the ring memory lives.
    pub(crate) backing: Backing,
    /// Set when a hibernation conversion failed; cleared on detach.
    pub(crate) conversion_failed: bool,
}

impl Endpoint {
    /// Bytes charged against the memory budget.
    const fn footprint(&self) -> u64 {
        self.produce_size + self.consume_size
    }

    /// Public snapshot of the entry.
    fn info(&self) -> EndpointInfo {
        EndpointInfo {
            handle: self.handle,
            peer: self.peer,
            flags: self.flags,
            produce_size: self.produce_size,
            consume_size: self.consume_size,
            ref_count: self.ref_count,
            local: matches!(self.backing, Backing::Local),
            conversion_failed: self.conversion_failed,
        }
    }
}

/// Snapshot of a table entry, as seen by its creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct EndpointInfo {
    /// Queue pair handle.
    pub handle: ChannelHandle,
    /// Peer context id, or [`INVALID_ID`] for any peer.
    pub peer: u32,
    /// Current flags; [`QpFlags::LOCAL`] is added by hibernation.
    pub flags: QpFlags,
    /// Creator's produce capacity.
    pub produce_size: u64,
    /// Creator's consume capacity.
    pub consume_size: u64,
    /// Number of live attachments (1 or 2).
    pub ref_count: u32,
    /// Whether the rings are held in local memory.
    pub local: bool,
    /// Whether the last hibernation conversion of this entry failed.
    pub conversion_failed: bool,
}

/// Mutable table state, guarded by the table lock.
#[derive(Debug)]
pub(crate) struct Registry {
    /// Live entries by handle.
    pub(crate) endpoints: HashMap<ChannelHandle, Endpoint>,
    /// Entries whose last conversion failed, not yet reported.
    pub(crate) failed: HandleSet,
    /// Next resource id to try when minting.
    next_resource: u32,
    /// Sum of live entries' footprints.
    memory_in_use: u64,
}

impl Registry {
    /// Picks the next free resource id for `context`, skipping the reserved
    /// range on wrap.
    fn mint_resource_id(&mut self, context: u32, reserved: u32) -> Result<u32> {
        let start = self.next_resource;
        loop {
            let candidate = self.next_resource;
            self.next_resource = candidate
                .checked_add(1)
                .filter(|&next| next != INVALID_ID)
                .unwrap_or(reserved);
            if !self
                .endpoints
                .contains_key(&ChannelHandle::new(context, candidate))
            {
                return Ok(candidate);
            }
            if self.next_resource == start {
                return Err(Error::ResourceExhausted("no free resource ids"));
            }
        }
    }
}

/// Parameters of an [`EndpointTable::alloc`] call.
///
/// Capacities are from the caller's point of view. Defaults: minted handle,
/// any peer, no flags, no privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct AllocParams {
    /// Requested handle, or [`ChannelHandle::INVALID`] to mint one.
    pub handle: ChannelHandle,
    /// Peer context id, or [`INVALID_ID`] for any peer.
    pub peer: u32,
    /// Requested flags.
    pub flags: QpFlags,
    /// Capacity of the ring the caller writes.
    pub produce_size: u64,
    /// Capacity of the ring the caller reads.
    pub consume_size: u64,
    /// Requested privilege; guests may only ask for [`Privilege::NONE`].
    pub privilege: Privilege,
}

impl AllocParams {
    /// Parameters for a queue pair with the given capacities.
    pub const fn new(produce_size: u64, consume_size: u64) -> Self {
        Self {
            handle: ChannelHandle::INVALID,
            peer: INVALID_ID,
            flags: QpFlags::empty(),
            produce_size,
            consume_size,
            privilege: Privilege::NONE,
        }
    }

    /// Uses an explicit handle instead of minting one.
    pub const fn handle(mut self, handle: ChannelHandle) -> Self {
        self.handle = handle;
        self
    }

    /// Restricts the queue pair to one peer context.
    pub const fn peer(mut self, peer: u32) -> Self {
        self.peer = peer;
        self
    }

    /// Sets the request flags.
    pub const fn flags(mut self, flags: QpFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the requested privilege.
    pub const fn privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }
}

/// Builder for an [`EndpointTable`].
///
/// Without explicit collaborators the table talks to no peer ([`NoPeer`]),
/// discards local events ([`NoEvents`]), and allocates rings on the heap
/// ([`HeapMemory`]). Every ring is allocated in the configured page size,
/// whichever provider is used.
#[must_use = "a TableBuilder does nothing until .build() is called"]
pub struct TableBuilder {
    /// Configuration being built.
    config: TableConfig,
    /// Peer transport; `NoPeer` when unset.
    negotiator: Option<Box<dyn Negotiator>>,
    /// Local event sink; `NoEvents` when unset.
    notifier: Option<Box<dyn EventNotifier>>,
    /// Ring memory; `HeapMemory` when unset.
    memory: Option<Box<dyn MemoryProvider>>,
}

impl TableBuilder {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: TableConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the context id of this endpoint (required).
    pub const fn context_id(mut self, id: u32) -> Self {
        self.config.context_id = id;
        self
    }

    /// Sets the page size used to round ring allocations.
    pub const fn page_size(mut self, bytes: usize) -> Self {
        self.config.page_size = bytes;
        self
    }

    /// Sets the first mintable resource id.
    pub const fn reserved_resource_ids(mut self, n: u32) -> Self {
        self.config.reserved_resource_ids = n;
        self
    }

    /// Caps the ring memory held by live queue pairs.
    pub const fn max_queue_memory(mut self, bytes: u64) -> Self {
        self.config.max_queue_memory = bytes;
        self
    }

    /// Sets the transport used to negotiate with the peer.
    pub fn negotiator(mut self, negotiator: impl Negotiator + 'static) -> Self {
        self.negotiator = Some(Box::new(negotiator));
        self
    }

    /// Sets the sink for same-context attach/detach events.
    pub fn notifier(mut self, notifier: impl EventNotifier + 'static) -> Self {
        self.notifier = Some(Box::new(notifier));
        self
    }

    /// Sets the ring memory provider.
    pub fn memory(mut self, memory: impl MemoryProvider + 'static) -> Self {
        self.memory = Some(Box::new(memory));
        self
    }

    /// Validates the configuration and builds the table.
    pub fn build(self) -> Result<EndpointTable> {
        if self.config.context_id == INVALID_ID {
            return Err(Error::InvalidArgument("context id not set"));
        }
        self.config
            .validate()
            .map_err(|_| Error::InvalidArgument("invalid table configuration"))?;

        let config = self.config;
        let memory = self
            .memory
            .unwrap_or_else(|| Box::new(HeapMemory::new()));
        let registry = Registry {
            endpoints: HashMap::new(),
            failed: HandleSet::with_capacity(config.failed_set_capacity),
            next_resource: config.reserved_resource_ids,
            memory_in_use: 0,
        };
        info!(context = config.context_id, "endpoint table ready");
        Ok(EndpointTable {
            shared: Arc::new(Shared {
                negotiator: self.negotiator.unwrap_or_else(|| Box::new(NoPeer)),
                notifier: self.notifier.unwrap_or_else(|| Box::new(NoEvents)),
                memory,
                state: Mutex::new(registry),
                config,
            }),
        })
    }
}

impl fmt::Debug for TableBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableBuilder")
            .field("config", &self.config)
            .field("negotiator", &self.negotiator.is_some())
            .field("notifier", &self.notifier.is_some())
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

/// State shared by every clone of a table.
pub(crate) struct Shared {
    /// Validated configuration.
    pub(crate) config: TableConfig,
    /// Peer transport.
    pub(crate) negotiator: Box<dyn Negotiator>,
    /// Same-context event sink.
    pub(crate) notifier: Box<dyn EventNotifier>,
    /// Ring and page-set allocator.
    pub(crate) memory: Box<dyn MemoryProvider>,
    /// The table lock and what it guards.
    state: Mutex<Registry>,
}

/// The queue pair endpoints of one context.
///
/// Cheap to clone; clones share the same table. Every [`QPair`] keeps a
/// clone so it can detach itself.
#[derive(Clone)]
pub struct EndpointTable {
    /// Shared state.
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for EndpointTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointTable")
            .field("context_id", &self.shared.config.context_id)
            .finish_non_exhaustive()
    }
}

impl EndpointTable {
    /// Returns a [`TableBuilder`] with default configuration.
    pub fn builder() -> TableBuilder {
        TableBuilder {
            config: TableConfig::default(),
            negotiator: None,
            notifier: None,
            memory: None,
        }
    }

    /// Context id of this endpoint.
    pub fn context_id(&self) -> u32 {
        self.shared.config.context_id
    }

    /// Configuration the table was built with.
    pub fn config(&self) -> &TableConfig {
        &self.shared.config
    }

    /// Takes the table lock, recovering from poisoning.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a queue pair, or attaches to an existing same-context one.
    ///
    /// A local queue pair ([`QpFlags::LOCAL`]) is created in this context's
    /// memory; the second local caller with swapped capacities attaches to
    /// it. Any other queue pair is negotiated with the peer, which must
    /// accept before this returns.
    pub fn alloc(&self, params: &AllocParams) -> Result<QPair> {
        if !params.privilege.is_empty() {
            return Err(Error::AccessDenied("guests may only request no privilege"));
        }
        if params.produce_size == 0 && params.consume_size == 0 {
            return Err(Error::InvalidArgument("both capacities are zero"));
        }
        if QpFlags::from_bits(params.flags.bits()).is_none() {
            return Err(Error::InvalidArgument("unknown flag bits"));
        }
        let footprint = params
            .produce_size
            .checked_add(params.consume_size)
            .ok_or(Error::ResourceExhausted("queue pair too large"))?;

        let mut reg = self.lock();
        if !params.handle.is_invalid() {
            if let Some(entry) = reg.endpoints.get_mut(&params.handle) {
                return self.attach_local(entry, params);
            }
        }
        self.create(&mut reg, params, footprint)
    }

    /// Second reference to a same-context entry, with the rings swapped.
    fn attach_local(&self, entry: &mut Endpoint, params: &AllocParams) -> Result<QPair> {
        if !entry.flags.contains(QpFlags::LOCAL) || entry.ref_count > 1 {
            return Err(Error::AlreadyExists(entry.handle));
        }
        if entry.produce_size != params.consume_size
            || entry.consume_size != params.produce_size
            || entry.flags != params.flags.difference(QpFlags::ATTACH_ONLY)
        {
            debug!(handle = %entry.handle, "local attach rejected: parameters differ");
            return Err(Error::Mismatch(entry.handle));
        }

        let context = self.context_id();
        let status = self.shared.notifier.notify(LocalEvent {
            kind: EventKind::PeerAttach,
            handle: entry.handle,
            peer: context,
        });
        check("peer attach notification", status)?;

        entry.ref_count += 1;
        debug!(handle = %entry.handle, "attached to local queue pair");
        Ok(QPair::new(
            entry.handle,
            context,
            entry.flags,
            params.produce_size,
            params.consume_size,
            Role::Attacher,
            Arc::clone(&entry.channel),
            self.clone(),
        ))
    }

    /// Allocates rings for a new entry and, unless local, registers it with the peer.
    fn create(&self, reg: &mut Registry, params: &AllocParams, footprint: u64) -> Result<QPair> {
        let config = &self.shared.config;
        let local = params.flags.contains(QpFlags::LOCAL);

        if local && params.flags.contains(QpFlags::ATTACH_ONLY) {
            return Err(Error::NotFound(params.handle));
        }
        if reg.memory_in_use.saturating_add(footprint) > config.max_queue_memory {
            return Err(Error::ResourceExhausted("queue pair memory budget"));
        }

        let handle = if params.handle.is_invalid() {
            let resource =
                reg.mint_resource_id(config.context_id, config.reserved_resource_ids)?;
            ChannelHandle::new(config.context_id, resource)
        } else {
            params.handle
        };

        if local
            && (handle.context != config.context_id
                || (params.peer != INVALID_ID && params.peer != config.context_id))
        {
            return Err(Error::AccessDenied(
                "local queue pairs must stay within this context",
            ));
        }

        let memory = &self.shared.memory;
        let produce = memory.alloc_ring(params.produce_size, config.page_size)?;
        let consume = match memory.alloc_ring(params.consume_size, config.page_size) {
            Ok(ring) => ring,
            Err(e) => {
                memory.free_ring(produce);
                return Err(e);
            }
        };

        let backing = if local {
            produce.header().init(handle);
            consume.header().init(handle);
            Backing::Local
        } else {
            let pages = match memory.alloc_page_set(&produce, &consume) {
                Ok(pages) => pages,
                Err(e) => {
                    memory.free_ring(produce);
                    memory.free_ring(consume);
                    return Err(e);
                }
            };
            let request = Negotiation::Alloc(AllocRequest {
                handle,
                peer: params.peer,
                flags: params.flags,
                produce_size: params.produce_size,
                consume_size: params.consume_size,
                pages: pages.pages().to_vec(),
            });
            let status = self.shared.negotiator.negotiate(&request);
            if let Err(e) = check("queue pair alloc", status) {
                warn!(handle = %handle, %status, "peer rejected queue pair");
                memory.free_page_set(pages);
                memory.free_ring(produce);
                memory.free_ring(consume);
                return Err(e);
            }
            Backing::Remote { pages }
        };

        let channel = Channel::new(Rings { produce, consume });
        reg.endpoints.insert(
            handle,
            Endpoint {
                handle,
                peer: params.peer,
                flags: params.flags,
                produce_size: params.produce_size,
                consume_size: params.consume_size,
                ref_count: 1,
                channel: Arc::clone(&channel),
                backing,
                conversion_failed: false,
            },
        );
        reg.memory_in_use += footprint;
        info!(
            handle = %handle,
            local,
            produce = params.produce_size,
            consume = params.consume_size,
            "queue pair created"
        );

        Ok(QPair::new(
            handle,
            params.peer,
            params.flags,
            params.produce_size,
            params.consume_size,
            Role::Creator,
            channel,
            self.clone(),
        ))
    }

    /// Drops one reference to `handle`, freeing the queue pair when the
    /// last reference goes. Only a [`QPair`] giving up its own reference
    /// may call this.
    pub(crate) fn detach(&self, handle: ChannelHandle) -> Result<()> {
        let mut guard = self.lock();
        let reg = &mut *guard;
        let entry = reg
            .endpoints
            .get_mut(&handle)
            .ok_or(Error::NotFound(handle))?;

        match entry.backing {
            Backing::Local => {
                if entry.ref_count > 1 {
                    let status = self.shared.notifier.notify(LocalEvent {
                        kind: EventKind::PeerDetach,
                        handle,
                        peer: self.context_id(),
                    });
                    if !status.is_success() {
                        warn!(handle = %handle, %status, "peer detach notification failed");
                    }
                }
            }
            Backing::Remote { .. } => {
                let status = self.shared.negotiator.negotiate(&Negotiation::Detach { handle });
                if entry.conversion_failed {
                    if !status.is_success() && status != Status::NotFound {
                        return check("queue pair detach", status);
                    }
                    entry.conversion_failed = false;
                    reg.failed.remove(handle);
                } else {
                    check("queue pair detach", status)?;
                }
            }
        }

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            debug!(handle = %handle, "detached one reference");
            return Ok(());
        }
        if let Some(entry) = reg.endpoints.remove(&handle) {
            reg.memory_in_use = reg.memory_in_use.saturating_sub(entry.footprint());
            self.release(entry);
        }
        info!(handle = %handle, "queue pair destroyed");
        Ok(())
    }

    /// Frees an entry's rings and page list.
    fn release(&self, entry: Endpoint) {
        let memory = &self.shared.memory;
        if let Some(rings) = entry.channel.lock().take() {
            memory.free_ring(rings.produce);
            memory.free_ring(rings.consume);
        }
        if let Backing::Remote { pages } = entry.backing {
            memory.free_page_set(pages);
        }
    }

    /// Destroys every entry regardless of reference count.
    ///
    /// Remote entries are detached from the peer first; failures are
    /// logged and ignored. Outstanding [`QPair`]s fail with
    /// [`Error::NotFound`] afterwards. Returns the number of entries
    /// destroyed.
    pub fn shutdown(&self) -> usize {
        let mut reg = self.lock();
        let entries: Vec<Endpoint> = reg.endpoints.drain().map(|(_, e)| e).collect();
        reg.failed = HandleSet::default();
        reg.memory_in_use = 0;
        drop(reg);

        let count = entries.len();
        for entry in entries {
            if matches!(entry.backing, Backing::Remote { .. }) {
                let status = self
                    .shared
                    .negotiator
                    .negotiate(&Negotiation::Detach { handle: entry.handle });
                if !status.is_success() {
                    warn!(handle = %entry.handle, %status, "detach during shutdown failed");
                }
            }
            self.release(entry);
        }
        if count > 0 {
            info!(count, "endpoint table shut down");
        }
        count
    }

    /// Number of live queue pairs.
    pub fn len(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Returns `true` if no queue pairs are live.
    pub fn is_empty(&self) -> bool {
        self.lock().endpoints.is_empty()
    }

    /// Returns `true` if `handle` names a live queue pair.
    pub fn contains(&self, handle: ChannelHandle) -> bool {
        self.lock().endpoints.contains_key(&handle)
    }

    /// Snapshot of one entry.
    pub fn endpoint(&self, handle: ChannelHandle) -> Option<EndpointInfo> {
        self.lock().endpoints.get(&handle).map(Endpoint::info)
    }

    /// Snapshots of every entry, ordered by handle.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let mut all: Vec<_> = self.lock().endpoints.values().map(Endpoint::info).collect();
        all.sort_by_key(|info| info.handle);
        all
    }

    /// Handles whose last hibernation conversion failed and have not been
    /// reported by [`EndpointTable::wake`] yet.
    pub fn failed_conversions(&self) -> Vec<ChannelHandle> {
        self.lock().failed.snapshot()
    }

    /// Sum of ring capacities held by live queue pairs.
    pub fn memory_in_use(&self) -> u64 {
        self.lock().memory_in_use
    }
}
