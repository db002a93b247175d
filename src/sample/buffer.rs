use std::ptr::{copy_nonoverlapping, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as MemOrd};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{Error, Result};

/// Live sample buffer bytes of one driver instance.
#[derive(Clone, Debug, Default)]
pub struct Accounting(Arc<AtomicUsize>);

impl Accounting {
    pub fn live_bytes(&self) -> usize {
        self.0.load(MemOrd::Acquire)
    }
}

/// Counters of a [`SampleBuffer`].
///
/// `produced - dropped - consumed == buffered` always holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub produced: u64,
    pub dropped: u64,
    pub consumed: u64,
    pub buffered: u64,
}

/// Fixed-capacity ring of fixed-size records.
///
/// One producer (the capture handler) pushes without blocking; readers are
/// serialized by the read lock. The storage is allocated once and never
/// resized.
pub struct SampleBuffer {
    ptr: NonNull<u8>,
    record_size: usize,
    capacity: usize,
    // Total records accepted, only written by the producer.
    head: AtomicU64,
    // Total records consumed, only written under `read_lock`.
    tail: AtomicU64,
    dropped: AtomicU64,
    read_lock: Mutex<()>,
    accounting: Accounting,
}

impl SampleBuffer {
    /// Allocates room for as many whole records as fit in `bytes`.
    pub fn new(record_size: usize, bytes: usize, accounting: &Accounting) -> Result<Self> {
        if record_size == 0 {
            return Err(Error::InvalidArgument("record size must not be zero"));
        }
        let capacity = bytes / record_size;
        if capacity == 0 {
            return Err(Error::InvalidArgument("buffer smaller than one record"));
        }
        let len = capacity * record_size;

        let mut alloc = Vec::<u8>::new();
        alloc
            .try_reserve_exact(len)
            .map_err(|_| Error::Alloc { bytes: len })?;
        alloc.resize(len, 0);
        let alloc = Box::into_raw(alloc.into_boxed_slice());
        // `Box::into_raw` never returns null.
        let ptr = unsafe { NonNull::new_unchecked(alloc as *mut u8) };
        accounting.0.fetch_add(len, MemOrd::AcqRel);

        Ok(Self {
            ptr,
            record_size,
            capacity,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            read_lock: Mutex::new(()),
            accounting: accounting.clone(),
        })
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Capacity in records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn len_bytes(&self) -> usize {
        self.capacity * self.record_size
    }

    /// Appends one record, or counts it as dropped if the ring is full.
    ///
    /// Never blocks and never allocates. Must only be called by the single
    /// producer.
    pub fn try_push(&self, record: &[u8]) -> bool {
        if record.len() != self.record_size {
            self.dropped.fetch_add(1, MemOrd::Relaxed);
            return false;
        }

        // Only this producer sets the head.
        let head = self.head.load(MemOrd::Relaxed);
        // Pairs with the release store in `pop`, the slot is no longer read.
        let tail = self.tail.load(MemOrd::Acquire);
        if head - tail >= self.capacity as u64 {
            self.dropped.fetch_add(1, MemOrd::Relaxed);
            return false;
        }

        let slot = (head % self.capacity as u64) as usize;
        unsafe {
            let dst = self.ptr.as_ptr().add(slot * self.record_size);
            copy_nonoverlapping(record.as_ptr(), dst, self.record_size);
        }
        self.head.store(head + 1, MemOrd::Release);
        true
    }

    /// Moves up to `max` records into `out`, returning how many were moved.
    pub fn pop(&self, max: usize, out: &mut Vec<u8>) -> usize {
        let _guard = self.read_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Thread safe since only the read lock holder sets the tail.
        let tail = self.tail.load(MemOrd::Relaxed);
        let head = self.head.load(MemOrd::Acquire);
        let n = ((head - tail) as usize).min(max);
        if n == 0 {
            return 0;
        }

        let start = (tail % self.capacity as u64) as usize;
        let first = n.min(self.capacity - start);
        out.reserve(n * self.record_size);
        unsafe {
            let base = self.ptr.as_ptr();
            let hi = slice::from_raw_parts(base.add(start * self.record_size), first * self.record_size);
            out.extend_from_slice(hi);
            let lo = slice::from_raw_parts(base, (n - first) * self.record_size);
            out.extend_from_slice(lo);
        }

        self.tail.store(tail + n as u64, MemOrd::Release);
        n
    }

    /// Discards every buffered record.
    pub fn reset(&self) {
        let _guard = self.read_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let head = self.head.load(MemOrd::Acquire);
        self.tail.store(head, MemOrd::Release);
    }

    /// Number of records ready to be popped.
    pub fn readiness_level(&self) -> usize {
        // Tail first: the head only grows, so it can never be behind the tail read before it.
        let tail = self.tail.load(MemOrd::Acquire);
        let head = self.head.load(MemOrd::Acquire);
        head.saturating_sub(tail) as _
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(MemOrd::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        let _guard = self.read_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = self.dropped.load(MemOrd::Acquire);
        let consumed = self.tail.load(MemOrd::Acquire);
        let pushed = self.head.load(MemOrd::Acquire);
        BufferStats {
            produced: pushed + dropped,
            dropped,
            consumed,
            buffered: pushed - consumed,
        }
    }
}

impl Drop for SampleBuffer {
    fn drop(&mut self) {
        let len = self.len_bytes();
        let alloc = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), len);
        drop(unsafe { Box::from_raw(alloc) });
        self.accounting.0.fetch_sub(len, MemOrd::AcqRel);
    }
}

// The producer and the read lock holder touch disjoint slots, ordered by `head` and `tail`.
unsafe impl Send for SampleBuffer {}
unsafe impl Sync for SampleBuffer {}
