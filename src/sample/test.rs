use std::sync::Arc;
use std::thread;

use super::record::{self, LocalRecord};
use super::{Accounting, Flavor, SampleBuffer};
use crate::Error;

fn rec(size: usize, tag: u8) -> Vec<u8> {
    vec![tag; size]
}

#[test]
fn test_push_pop() {
    let acct = Accounting::default();
    let buf = SampleBuffer::new(8, 8 * 4, &acct).unwrap();
    assert_eq!(buf.capacity(), 4);
    assert!(buf.try_push(&rec(8, 1)));
    assert!(buf.try_push(&rec(8, 2)));
    assert_eq!(buf.readiness_level(), 2);

    let mut out = vec![];
    assert_eq!(buf.pop(10, &mut out), 2);
    assert_eq!(out, [rec(8, 1), rec(8, 2)].concat());
    assert_eq!(buf.readiness_level(), 0);
    assert_eq!(buf.pop(10, &mut out), 0);
}

#[test]
fn test_full_drops_without_corruption() {
    let acct = Accounting::default();
    let buf = SampleBuffer::new(4, 4 * 3, &acct).unwrap();
    for tag in 0..3 {
        assert!(buf.try_push(&rec(4, tag)));
    }
    assert!(!buf.try_push(&rec(4, 9)));
    assert!(!buf.try_push(&rec(4, 9)));
    assert_eq!(buf.dropped(), 2);
    assert_eq!(buf.readiness_level(), 3);

    let mut out = vec![];
    buf.pop(3, &mut out);
    assert_eq!(out, [rec(4, 0), rec(4, 1), rec(4, 2)].concat());
}

#[test]
fn test_wrap_around() {
    let acct = Accounting::default();
    let buf = SampleBuffer::new(2, 2 * 3, &acct).unwrap();
    let mut out = vec![];
    for tag in 0..2 {
        buf.try_push(&rec(2, tag));
    }
    buf.pop(1, &mut out);
    for tag in 2..4 {
        assert!(buf.try_push(&rec(2, tag)));
    }
    out.clear();
    // Slots 1, 2 then 0.
    assert_eq!(buf.pop(3, &mut out), 3);
    assert_eq!(out, [rec(2, 1), rec(2, 2), rec(2, 3)].concat());
}

#[test]
fn test_wrong_size_is_dropped() {
    let acct = Accounting::default();
    let buf = SampleBuffer::new(8, 64, &acct).unwrap();
    assert!(!buf.try_push(&rec(4, 0)));
    assert_eq!(buf.stats().dropped, 1);
    assert_eq!(buf.stats().buffered, 0);
}

#[test]
fn test_accounting_invariant() {
    let acct = Accounting::default();
    let buf = SampleBuffer::new(3, 3 * 5, &acct).unwrap();
    let mut out = vec![];
    // xorshift so the push/pop mix is irregular but reproducible.
    let mut seed = 0x2545_f491_u32;
    for _ in 0..2000 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        if seed % 3 == 0 {
            buf.pop((seed % 4) as usize, &mut out);
        } else {
            buf.try_push(&rec(3, seed as u8));
        }
        let s = buf.stats();
        assert_eq!(s.produced - s.dropped - s.consumed, s.buffered);
        assert!(s.buffered <= buf.capacity() as u64);
        assert_eq!(s.buffered as usize, buf.readiness_level());
    }
}

#[test]
fn test_reset() {
    let acct = Accounting::default();
    let buf = SampleBuffer::new(1, 8, &acct).unwrap();
    for tag in 0..5 {
        buf.try_push(&[tag]);
    }
    buf.reset();
    assert_eq!(buf.readiness_level(), 0);
    let s = buf.stats();
    assert_eq!(s.consumed, 5);
    assert_eq!(s.buffered, 0);
}

#[test]
fn test_allocation_accounting() {
    let acct = Accounting::default();
    let a = SampleBuffer::new(8, 100, &acct).unwrap();
    let b = SampleBuffer::new(8, 16, &acct).unwrap();
    assert_eq!(acct.live_bytes(), 96 + 16);
    drop(a);
    assert_eq!(acct.live_bytes(), 16);
    drop(b);
    assert_eq!(acct.live_bytes(), 0);
}

#[test]
fn test_invalid_size() {
    let acct = Accounting::default();
    assert!(matches!(
        SampleBuffer::new(8, 7, &acct),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        SampleBuffer::new(0, 7, &acct),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(acct.live_bytes(), 0);
}

#[test]
fn test_concurrent_producer_consumer() {
    const N: u64 = 20_000;
    let acct = Accounting::default();
    let buf = Arc::new(SampleBuffer::new(8, 8 * 64, &acct).unwrap());

    let producer = {
        let buf = buf.clone();
        thread::spawn(move || {
            let mut i = 0;
            while i < N {
                if buf.try_push(&i.to_ne_bytes()) {
                    i += 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    let mut expected = 0;
    let mut out = vec![];
    while expected < N {
        out.clear();
        buf.pop(16, &mut out);
        for it in record::words(&out) {
            assert_eq!(it, expected);
            expected += 1;
        }
    }
    producer.join().unwrap();
    assert_eq!(buf.stats().consumed, N);
}

#[test]
fn test_local_record() {
    let mut rec = LocalRecord::new(Flavor::Fetch);
    rec.set(record::fetch::LIN_AD, 0xdead);
    rec.set(record::fetch::CPU, 3);
    let bytes = rec.bytes();
    assert_eq!(bytes.len(), Flavor::Fetch.record_size());
    let words: Vec<_> = record::words(&bytes).collect();
    assert_eq!(words, [0, 0, 0xdead, 0, 0, 3]);
    assert_eq!(LocalRecord::new(Flavor::Op).bytes().len(), Flavor::Op.record_size());
}
