//! Ring behavior observed through a local loopback pair.

use std::io::{self, Read, Write};

use qpair::{AllocParams, CapacityError, EndpointTable, Error, QPair, QpFlags};

fn loopback(table: &EndpointTable, a_to_b: u64, b_to_a: u64) -> (QPair, QPair) {
    let a = table
        .alloc(&AllocParams::new(a_to_b, b_to_a).flags(QpFlags::LOCAL))
        .unwrap();
    let b = table
        .alloc(
            &AllocParams::new(b_to_a, a_to_b)
                .flags(QpFlags::LOCAL)
                .handle(a.handle()),
        )
        .unwrap();
    (a, b)
}

fn table() -> EndpointTable {
    EndpointTable::builder().context_id(11).build().unwrap()
}

#[test]
fn full_ring_until_consumer_progresses() {
    let table = table();
    let (a, b) = loopback(&table, 4096, 4096);

    let data = vec![0x5a; 4100];
    assert_eq!(a.enqueue(&data).unwrap(), 4095);
    assert_eq!(a.produce_free_space().unwrap(), 0);
    assert!(matches!(
        a.enqueue(&data[..5]),
        Err(Error::Capacity(CapacityError::NoSpace))
    ));

    let mut sink = [0u8; 3];
    assert_eq!(b.dequeue(&mut sink).unwrap(), 3);
    assert_eq!(a.enqueue(&data[..5]).unwrap(), 3);

    let mut rest = vec![0u8; 4096];
    assert_eq!(b.dequeue(&mut rest).unwrap(), 4095);
    assert_eq!(a.enqueue(&data[..5]).unwrap(), 5);
}

#[test]
fn empty_ring_reports_no_data() {
    let table = table();
    let (_a, b) = loopback(&table, 64, 64);
    let mut buf = [0u8; 8];
    let err = b.dequeue(&mut buf).unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err, Error::Capacity(CapacityError::NoData)));
    assert!(matches!(
        b.peek(&mut buf),
        Err(Error::Capacity(CapacityError::NoData))
    ));
}

#[test]
fn data_straddling_the_end_round_trips() {
    let table = table();
    let (a, b) = loopback(&table, 16, 16);
    let mut buf = [0u8; 16];

    assert_eq!(a.enqueue(b"0123456789").unwrap(), 10);
    assert_eq!(b.dequeue(&mut buf[..10]).unwrap(), 10);
    assert_eq!(a.produce_indexes().unwrap(), (10, 10));

    // Wraps: 6 bytes at the end, 6 at the start.
    assert_eq!(a.enqueue(b"abcdefghijkl").unwrap(), 12);
    assert_eq!(a.produce_indexes().unwrap(), (6, 10));
    assert_eq!(b.consume_buf_ready().unwrap(), 12);
    assert_eq!(b.dequeue(&mut buf).unwrap(), 12);
    assert_eq!(&buf[..12], b"abcdefghijkl");
    assert_eq!(b.consume_indexes().unwrap(), (6, 6));
}

#[test]
fn peek_does_not_consume() {
    let table = table();
    let (a, b) = loopback(&table, 32, 32);
    a.enqueue(b"hello").unwrap();

    let mut first = [0u8; 5];
    let mut second = [0u8; 5];
    assert_eq!(b.peek(&mut first).unwrap(), 5);
    assert_eq!(b.peek(&mut second).unwrap(), 5);
    assert_eq!(first, second);
    assert_eq!(b.consume_buf_ready().unwrap(), 5);

    let mut got = [0u8; 5];
    assert_eq!(b.dequeue(&mut got).unwrap(), 5);
    assert_eq!(&got, b"hello");
    assert_eq!(b.consume_buf_ready().unwrap(), 0);
}

#[test]
fn io_traits_map_capacity_to_would_block() {
    let table = table();
    let (a, b) = loopback(&table, 8, 8);

    let mut writer = &a;
    assert_eq!(writer.write(b"0123456789").unwrap(), 7);
    let err = writer.write(b"x").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

    let mut reader = &b;
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"0123456");
    let err = reader.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    assert_eq!(reader.read(&mut []).unwrap(), 0);
}

#[test]
fn producer_and_consumer_threads() {
    let table = table();
    let (a, b) = loopback(&table, 256, 256);
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

    let received = std::thread::scope(|s| {
        s.spawn(|| {
            let mut sent = 0;
            while sent < payload.len() {
                match a.enqueue(&payload[sent..]) {
                    Ok(n) => sent += n,
                    Err(e) if e.is_transient() => std::thread::yield_now(),
                    Err(e) => panic!("enqueue: {e}"),
                }
            }
        });
        let reader = s.spawn(|| {
            let mut out = Vec::with_capacity(payload.len());
            let mut buf = [0u8; 100];
            while out.len() < payload.len() {
                match b.dequeue(&mut buf) {
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                    Err(e) if e.is_transient() => std::thread::yield_now(),
                    Err(e) => panic!("dequeue: {e}"),
                }
            }
            out
        });
        reader.join().unwrap()
    });
    assert_eq!(received, payload);
}
