//! Bounded ring of fixed-size packet chunks between the reading and the
//! decoding worker.
//!
//! Exactly one producer and one consumer touch the ring. Two monotonically
//! increasing counters express ownership: the producer owns slot
//! `filled % capacity` until it publishes, the consumer owns slot
//! `processed % capacity` until it releases. Backpressure on both sides is
//! a fixed one-millisecond sleep, so a stalled peer costs no cpu.
//!
//! The slots are guarded by mutexes even though the protocol already makes
//! them exclusive; this keeps the crate free of unsafe code, and the locks
//! are never contended.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::progress::Progress;

/// How long a starved worker sleeps before polling again.
pub const POLL_SLEEP: Duration = Duration::from_millis(1);


/// A fixed set of reusable byte chunks, single producer, single consumer.
/// The final chunk of a stream may be shorter than the slot; its payload
/// length travels with the slot.
#[derive(Debug)]
pub struct PacketRing {
    slots: Vec<Mutex<Box<[u8]>>>,
    payload_lengths: Vec<AtomicUsize>,

    /// Number of chunks ever published by the producer.
    filled: AtomicU64,

    /// Number of chunks ever released by the consumer.
    processed: AtomicU64,
}

impl PacketRing {

    /// Allocate `capacity` slots of `chunk_bytes` each.
    pub fn new(capacity: usize, chunk_bytes: usize) -> Self {
        assert!(capacity > 0 && chunk_bytes > 0);

        Self {
            slots: (0..capacity)
                .map(|_| Mutex::new(vec![0_u8; chunk_bytes].into_boxed_slice()))
                .collect(),

            payload_lengths: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            filled: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize { self.slots.len() }

    /// Chunks published but not yet released. Never exceeds the capacity.
    pub fn pending(&self) -> u64 {
        self.filled.load(Ordering::Acquire) - self.processed.load(Ordering::Acquire)
    }

    /// Let the producer fill the next slot. Blocks while the ring is full.
    /// The closure returns the number of payload bytes it wrote; zero means
    /// the source is drained and nothing is published. Returns `false` when
    /// nothing was published, because of cancellation or a drained source.
    pub fn produce(
        &self, progress: &Progress,
        fill: impl FnOnce(&mut [u8]) -> usize,
    ) -> bool {
        loop {
            if progress.is_cancelled() { return false }
            if self.pending() < self.capacity() as u64 { break }
            std::thread::sleep(POLL_SLEEP);
        }

        let filled = self.filled.load(Ordering::Relaxed);
        let index = (filled % self.capacity() as u64) as usize;

        let payload = {
            let mut slot = self.slots[index].lock().expect("ring slot poisoned");
            fill(&mut slot)
        };

        if payload == 0 { return false }

        self.payload_lengths[index].store(payload, Ordering::Relaxed);
        self.filled.store(filled + 1, Ordering::Release);
        true
    }

    /// Let the consumer read the next published slot. Blocks while the ring
    /// is empty; returns `false` without calling `process` when the run is
    /// cancelled, or when `drained` reports that no more chunks will arrive.
    pub fn consume(
        &self, progress: &Progress,
        drained: impl Fn() -> bool,
        process: impl FnOnce(&[u8]),
    ) -> bool {
        let available = || {
            self.filled.load(Ordering::Acquire) > self.processed.load(Ordering::Relaxed)
        };

        loop {
            if available() { break }
            if progress.is_cancelled() || drained() { return false }
            std::thread::sleep(POLL_SLEEP);
        }

        let processed = self.processed.load(Ordering::Relaxed);
        let index = (processed % self.capacity() as u64) as usize;

        {
            let slot = self.slots[index].lock().expect("ring slot poisoned");
            let payload = self.payload_lengths[index].load(Ordering::Relaxed);
            process(&slot[..payload]);
        }

        self.processed.store(processed + 1, Ordering::Release);
        true
    }
}
