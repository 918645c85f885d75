//! Allocation, local attach, and detach through the public API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use qpair::{
    AllocParams, ChannelHandle, EndpointTable, Error, EventKind, HeapMemory, INVALID_ID,
    Negotiation, Negotiator, QPair, QpFlags, Status,
};

fn local(produce: u64, consume: u64) -> AllocParams {
    AllocParams::new(produce, consume).flags(QpFlags::LOCAL)
}

/// Accepts everything and records each request.
#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<Negotiation>>,
}

impl Negotiator for Recorder {
    fn negotiate(&self, request: &Negotiation) -> Status {
        self.requests.lock().unwrap().push(request.clone());
        Status::Success
    }
}

/// Answers every request with a fixed status.
struct Fixed(Status);

impl Negotiator for Fixed {
    fn negotiate(&self, _request: &Negotiation) -> Status {
        self.0
    }
}

#[test]
fn alloc_detach_releases_everything() {
    let memory = Arc::new(HeapMemory::new());
    let table = EndpointTable::builder()
        .context_id(3)
        .memory(Arc::clone(&memory))
        .build()
        .unwrap();

    for (produce, consume) in [(1, 1), (4096, 4096), (0, 100), (100, 0), (10_000, 3)] {
        let qp = table.alloc(&local(produce, consume)).unwrap();
        assert_eq!(memory.live_rings(), 2);
        assert_eq!(table.len(), 1);
        qp.detach().unwrap();
        assert!(table.is_empty());
        assert_eq!(memory.live_rings(), 0);
        assert_eq!(table.memory_in_use(), 0);
    }
}

#[test]
fn remote_alloc_sends_pages_and_detach() {
    let peer = Arc::new(Recorder::default());
    let memory = Arc::new(HeapMemory::new());
    let table = EndpointTable::builder()
        .context_id(3)
        .page_size(4096)
        .negotiator(Arc::clone(&peer))
        .memory(Arc::clone(&memory))
        .build()
        .unwrap();

    let qp = table
        .alloc(&AllocParams::new(8192, 4096).peer(2))
        .unwrap();
    assert_eq!(memory.live_page_sets(), 1);
    qp.detach().unwrap();
    assert_eq!(memory.live_page_sets(), 0);
    assert_eq!(memory.live_rings(), 0);

    let requests = peer.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    match &requests[0] {
        Negotiation::Alloc(req) => {
            assert_eq!(req.peer, 2);
            assert_eq!(req.produce_size, 8192);
            assert_eq!(req.consume_size, 4096);
            // Header page plus data pages for each ring.
            assert_eq!(req.pages.len(), 3 + 2);
        }
        other => panic!("expected alloc, got {other:?}"),
    }
    assert!(matches!(requests[1], Negotiation::Detach { .. }));
}

#[test]
fn page_list_follows_table_page_size() {
    let peer = Arc::new(Recorder::default());
    let table = EndpointTable::builder()
        .context_id(3)
        .page_size(16 * 1024)
        .negotiator(Arc::clone(&peer))
        .memory(HeapMemory::new())
        .build()
        .unwrap();

    let _qp = table.alloc(&AllocParams::new(20_000, 100)).unwrap();
    let requests = peer.requests.lock().unwrap();
    let Negotiation::Alloc(req) = &requests[0] else {
        panic!("expected alloc, got {:?}", requests[0]);
    };
    // 20000 bytes round to two 16 KiB pages, 100 bytes to one.
    assert_eq!(req.pages.len(), (1 + 2) + (1 + 1));
    let mut distinct = req.pages.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), req.pages.len());
}

#[test]
fn remote_alloc_failure_unwinds() {
    let memory = Arc::new(HeapMemory::new());
    let table = EndpointTable::builder()
        .context_id(3)
        .negotiator(Fixed(Status::NoResources))
        .memory(Arc::clone(&memory))
        .build()
        .unwrap();

    let err = table.alloc(&AllocParams::new(64, 64)).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol {
            status: Status::NoResources,
            ..
        }
    ));
    assert_eq!(err.status(), Status::NoResources);
    assert!(table.is_empty());
    assert_eq!(memory.live_rings(), 0);
    assert_eq!(memory.live_page_sets(), 0);
    assert_eq!(table.memory_in_use(), 0);
}

#[test]
fn refused_detach_hands_the_queue_pair_back() {
    /// Accepts allocations; refuses detaches while `refuse` is set.
    struct Sticky {
        refuse: AtomicBool,
    }

    impl Negotiator for Sticky {
        fn negotiate(&self, request: &Negotiation) -> Status {
            match request {
                Negotiation::Detach { .. } if self.refuse.load(Ordering::SeqCst) => {
                    Status::NoAccess
                }
                _ => Status::Success,
            }
        }
    }

    let peer = Arc::new(Sticky {
        refuse: AtomicBool::new(true),
    });
    let table = EndpointTable::builder()
        .context_id(3)
        .negotiator(Arc::clone(&peer))
        .build()
        .unwrap();
    let qp = table.alloc(&AllocParams::new(64, 64)).unwrap();
    let handle = qp.handle();

    let err = qp.detach().unwrap_err();
    assert!(matches!(
        err.error(),
        Error::Protocol {
            status: Status::NoAccess,
            ..
        }
    ));
    assert_eq!(table.endpoint(handle).unwrap().ref_count, 1);

    // The reference survived with the handle; it still works and can retry.
    let qp = err.into_qpair();
    assert_eq!(qp.enqueue(b"still here").unwrap(), 10);
    peer.refuse.store(false, Ordering::SeqCst);
    qp.detach().unwrap();
    assert!(table.is_empty());
}

#[test]
fn each_handle_releases_only_its_own_reference() {
    let table = EndpointTable::builder().context_id(3).build().unwrap();
    let creator = table.alloc(&local(32, 32)).unwrap();
    let attacher = table.alloc(&local(32, 32).handle(creator.handle())).unwrap();
    let handle = creator.handle();

    attacher.detach().unwrap();
    assert_eq!(table.endpoint(handle).unwrap().ref_count, 1);
    assert_eq!(creator.enqueue(b"alone").unwrap(), 5);

    creator.detach().unwrap();
    assert!(table.is_empty());
}

#[test]
fn existing_remote_handle_is_already_exists() {
    let table = EndpointTable::builder()
        .context_id(3)
        .negotiator(Fixed(Status::Success))
        .build()
        .unwrap();
    let qp = table.alloc(&AllocParams::new(64, 64)).unwrap();
    let err = table
        .alloc(&AllocParams::new(64, 64).handle(qp.handle()))
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(h) if h == qp.handle()));
}

#[test]
fn local_attach_swaps_rings() {
    let (tx, rx) = mpsc::channel();
    let table = EndpointTable::builder()
        .context_id(3)
        .notifier(tx)
        .build()
        .unwrap();

    let creator = table.alloc(&local(100, 200)).unwrap();
    let attacher = table
        .alloc(
            &AllocParams::new(200, 100)
                .flags(QpFlags::LOCAL | QpFlags::ATTACH_ONLY)
                .handle(creator.handle()),
        )
        .unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.endpoint(creator.handle()).unwrap().ref_count, 2);

    let attach = rx.try_recv().unwrap();
    assert_eq!(attach.kind, EventKind::PeerAttach);
    assert_eq!(attach.handle, creator.handle());
    assert_eq!(attach.peer, 3);

    assert_eq!(creator.enqueue(b"to attacher").unwrap(), 11);
    assert_eq!(attacher.enqueue(b"to creator").unwrap(), 10);

    let mut buf = [0u8; 32];
    let n = attacher.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"to attacher");
    let n = creator.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"to creator");

    assert_eq!(creator.produce_free_space().unwrap(), 99);
    assert_eq!(attacher.produce_free_space().unwrap(), 199);
}

#[test]
fn local_attach_mismatch() {
    let table = EndpointTable::builder().context_id(3).build().unwrap();
    let creator = table.alloc(&local(100, 200)).unwrap();

    // Same sizes instead of swapped.
    let err = table
        .alloc(&local(100, 200).handle(creator.handle()))
        .unwrap_err();
    assert!(matches!(err, Error::Mismatch(_)));
    assert_eq!(table.endpoint(creator.handle()).unwrap().ref_count, 1);

    // Different flags.
    let err = table
        .alloc(
            &AllocParams::new(200, 100)
                .flags(QpFlags::LOCAL | QpFlags::NONBLOCK)
                .handle(creator.handle()),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Mismatch(_)));
}

#[test]
fn third_local_attach_is_already_exists() {
    let table = EndpointTable::builder().context_id(3).build().unwrap();
    let creator = table.alloc(&local(64, 64)).unwrap();
    let _attacher = table
        .alloc(&local(64, 64).handle(creator.handle()))
        .unwrap();
    let err = table
        .alloc(&local(64, 64).handle(creator.handle()))
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[test]
fn local_detach_notifies_surviving_side() {
    let (tx, rx) = mpsc::channel();
    let memory = Arc::new(HeapMemory::new());
    let table = EndpointTable::builder()
        .context_id(3)
        .notifier(tx)
        .memory(Arc::clone(&memory))
        .build()
        .unwrap();

    let creator = table.alloc(&local(64, 64)).unwrap();
    let handle = creator.handle();
    let attacher = table.alloc(&local(64, 64).handle(handle)).unwrap();
    assert_eq!(rx.recv().unwrap().kind, EventKind::PeerAttach);

    attacher.enqueue(b"left behind").unwrap();
    creator.detach().unwrap();
    let event = rx.recv().unwrap();
    assert_eq!(event.kind, EventKind::PeerDetach);
    assert_eq!(event.handle, handle);

    // The survivor keeps working against the shared memory.
    assert_eq!(table.endpoint(handle).unwrap().ref_count, 1);
    assert_eq!(memory.live_rings(), 2);
    assert_eq!(attacher.produce_buf_ready().unwrap(), 11);

    attacher.detach().unwrap();
    assert!(rx.try_recv().is_err());
    assert!(table.is_empty());
    assert_eq!(memory.live_rings(), 0);
}

#[test]
fn access_denied_cases() {
    let table = EndpointTable::builder().context_id(3).build().unwrap();
    let foreign = local(64, 64).handle(ChannelHandle::new(4, 2000));
    assert!(matches!(table.alloc(&foreign), Err(Error::AccessDenied(_))));
    assert!(matches!(
        table.alloc(&local(64, 64).peer(4)),
        Err(Error::AccessDenied(_))
    ));
    assert!(table.alloc(&local(64, 64).peer(INVALID_ID)).is_ok());
}

#[test]
fn resource_ids_exhaust() {
    let table = EndpointTable::builder()
        .context_id(3)
        .reserved_resource_ids(INVALID_ID - 2)
        .build()
        .unwrap();
    let a = table.alloc(&local(8, 8)).unwrap();
    let b = table.alloc(&local(8, 8)).unwrap();
    assert_eq!(a.handle().resource, INVALID_ID - 2);
    assert_eq!(b.handle().resource, INVALID_ID - 1);
    assert!(matches!(
        table.alloc(&local(8, 8)),
        Err(Error::ResourceExhausted(_))
    ));

    // Freed ids are handed out again.
    let freed = a.handle();
    a.detach().unwrap();
    assert_eq!(table.alloc(&local(8, 8)).unwrap().handle(), freed);
}

#[test]
fn concurrent_allocations_get_distinct_handles() {
    let table = EndpointTable::builder().context_id(3).build().unwrap();
    let pairs: Vec<QPair> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                s.spawn(move || table.alloc(&local(64, 64)).unwrap())
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    let mut handles: Vec<ChannelHandle> = pairs.iter().map(QPair::handle).collect();
    handles.sort();
    handles.dedup();
    assert_eq!(handles.len(), 8);
    assert_eq!(table.len(), 8);

    drop(pairs);
    assert!(table.is_empty());
}
