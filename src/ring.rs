//! # Shared Event Ring
//!
//! A fixed number of fixed-size slots in a memory segment mapped by both
//! the driver (producer) and the owning process (consumer). Two
//! singly-linked lists thread the slots by byte offset: a **busy** list of
//! events ready for the application and a **free** list of available
//! slots. Each slot header holds `next_busy` and `next_free` offsets with
//! −1 as the terminator.
//!
//! The producer tracks three offsets: `last_busy` (most recently published
//! slot, its `next_busy` always −1), `first_free` (next slot to allocate,
//! −1 when the ring is full), and `last_free` (most recently released
//! slot, its `next_free` always −1).
//!
//! Producing: take `first_free`, write the payload, set the slot's
//! `next_busy` to −1, then publish by linking it behind `last_busy`.
//! Consuming: remember the last observed slot and poll its `next_busy`.
//! Returning: thread the slot back onto the free list.
//!
//! Initialization seeds the busy list with one synthetic OK event in slot
//! 0 (so a consumer starting at offset 0 has a valid position) and threads
//! every other slot into the free list.
//!
//! There is one producer (driver context) and one consumer (the owning
//! process); the consumer's hot path takes no lock, relying only on the
//! single-word atomicity of the offsets. Publication uses release order so
//! the payload write is visible before the link. Slots are never
//! reordered, only re-linked, which is what preserves producer order.
//!
//! One constraint falls out of the cursor design: the slot the consumer
//! currently sits on must not be returned until the cursor has advanced
//! past it, since its `next_busy` is the only path to the successor. The
//! consuming transport parks that one slot and releases it on the next
//! advance.

use shared_memory::{Shmem, ShmemConf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use tracing::debug;

use crate::error::Status;
use parking_lot::Mutex;

/// Slot header preceding each payload, shared across the mapping.
#[repr(C)]
struct SlotHeader {
    next_busy: AtomicI32,
    next_free: AtomicI32,
    payload_len: AtomicU32,
    _reserved: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

/// Producer-side cursor state.
struct Producer {
    last_busy: i32,
    first_free: i32,
    last_free: i32,
}

/// The mapped ring. Producer operations serialize on an internal lock
/// (the kernel's softirq context is single at a time); the consumer side
/// is lock-free.
pub struct EventRing {
    shmem: Shmem,
    nslots: usize,
    slot_size: usize,
    producer: Mutex<Producer>,
}

impl std::fmt::Debug for EventRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRing")
            .field("nslots", &self.nslots)
            .field("slot_size", &self.slot_size)
            .finish()
    }
}

// SAFETY: all cross-thread access goes through the atomic slot headers and
// the producer lock; payload ranges obey the busy/free ownership protocol.
unsafe impl Send for EventRing {}
unsafe impl Sync for EventRing {}

impl EventRing {
    /// Allocate and initialize a ring of `nslots` (a power of two) slots of
    /// `slot_size` bytes each, seeding slot 0 with `seed` as the synthetic
    /// first event.
    pub fn allocate(
        os_id: &str,
        nslots: usize,
        slot_size: usize,
        seed: &[u8],
    ) -> Result<EventRing, Status> {
        if nslots < 2 || !nslots.is_power_of_two() {
            return Err(Status::InvalidArgument);
        }
        if slot_size <= HEADER_SIZE || seed.len() > slot_size - HEADER_SIZE {
            return Err(Status::InvalidArgument);
        }
        let total = nslots * slot_size;
        let shmem = ShmemConf::new().size(total).os_id(os_id).create().map_err(|err| {
            debug!("unable to create ring segment {}: {}", os_id, err);
            Status::NoMemory
        })?;

        let ring = EventRing {
            shmem,
            nslots,
            slot_size,
            producer: Mutex::new(Producer { last_busy: 0, first_free: -1, last_free: -1 }),
        };

        // Slot 0 starts the busy list with the seed event; every other
        // slot is threaded onto the free list in offset order.
        {
            let mut producer = ring.producer.lock();
            ring.write_payload(0, seed);
            ring.slot(0).next_busy.store(-1, Ordering::Relaxed);
            ring.slot(0).next_free.store(-1, Ordering::Relaxed);
            producer.last_busy = 0;

            for index in 1..nslots {
                let offset = (index * slot_size) as i32;
                let next = if index + 1 < nslots {
                    ((index + 1) * slot_size) as i32
                } else {
                    -1
                };
                ring.slot(offset as u32).next_busy.store(-1, Ordering::Relaxed);
                ring.slot(offset as u32).next_free.store(next, Ordering::Relaxed);
            }
            producer.first_free = slot_size as i32;
            producer.last_free = ((nslots - 1) * slot_size) as i32;
        }
        Ok(ring)
    }

    pub fn nslots(&self) -> usize {
        self.nslots
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Largest payload a slot can carry.
    pub fn max_payload(&self) -> usize {
        self.slot_size - HEADER_SIZE
    }

    fn base(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    fn check_offset(&self, offset: u32) -> Result<(), Status> {
        let offset = offset as usize;
        if offset % self.slot_size != 0 || offset >= self.nslots * self.slot_size {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    fn slot(&self, offset: u32) -> &SlotHeader {
        debug_assert!(self.check_offset(offset).is_ok());
        // SAFETY: offset is validated against the mapping; the header is
        // always initialized before use.
        unsafe { &*(self.base().add(offset as usize) as *const SlotHeader) }
    }

    fn write_payload(&self, offset: u32, payload: &[u8]) {
        let slot = self.slot(offset);
        slot.payload_len.store(payload.len() as u32, Ordering::Relaxed);
        if !payload.is_empty() {
            // SAFETY: the slot is off both lists while the producer fills
            // it, so nothing else touches the range.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    self.base().add(offset as usize + HEADER_SIZE),
                    payload.len(),
                );
            }
        }
    }

    /// Publish one event. Fails with `NoSpace` mapped to [`Status::NoBuffer`]
    /// when every slot is busy.
    pub fn produce(&self, payload: &[u8]) -> Result<u32, Status> {
        if payload.len() > self.max_payload() {
            return Err(Status::MessageTooLarge);
        }
        let mut producer = self.producer.lock();
        if producer.first_free < 0 {
            return Err(Status::NoBuffer);
        }
        let offset = producer.first_free as u32;
        producer.first_free = self.slot(offset).next_free.load(Ordering::Relaxed);

        self.write_payload(offset, payload);
        self.slot(offset).next_busy.store(-1, Ordering::Relaxed);

        // Publish: the consumer polls the previous tail's next_busy.
        self.slot(producer.last_busy as u32).next_busy.store(offset as i32, Ordering::Release);
        producer.last_busy = offset as i32;
        Ok(offset)
    }

    /// Return a consumed slot to the free list.
    pub fn release(&self, offset: u32) -> Result<(), Status> {
        self.check_offset(offset)?;
        let mut producer = self.producer.lock();
        self.slot(offset).next_free.store(-1, Ordering::Relaxed);
        if producer.first_free < 0 {
            producer.first_free = offset as i32;
        } else {
            self.slot(producer.last_free as u32).next_free.store(offset as i32, Ordering::Relaxed);
        }
        producer.last_free = offset as i32;
        Ok(())
    }

    /// Payload bytes of a busy slot the consumer currently owns.
    ///
    /// # Safety
    /// The slot must have been observed through the busy chain and not yet
    /// released.
    pub unsafe fn payload(&self, offset: u32) -> &[u8] {
        let len = self.slot(offset).payload_len.load(Ordering::Acquire) as usize;
        std::slice::from_raw_parts(
            self.base().add(offset as usize + HEADER_SIZE),
            len.min(self.max_payload()),
        )
    }

    /// Raw payload pointer for event records that outlive the borrow.
    pub(crate) fn payload_raw(&self, offset: u32) -> (*const u8, usize) {
        let len = self.slot(offset).payload_len.load(Ordering::Acquire) as usize;
        // Pointer arithmetic only; dereferencing is the caller's contract.
        let ptr = unsafe { self.base().add(offset as usize + HEADER_SIZE) as *const u8 };
        (ptr, len.min(self.max_payload()))
    }
}

/// The consuming side's cursor: remembers the last observed slot and polls
/// its `next_busy`.
pub struct RingConsumer {
    last_observed: u32,
}

impl RingConsumer {
    /// A consumer positioned on the seeded slot 0.
    pub fn new() -> RingConsumer {
        RingConsumer { last_observed: 0 }
    }

    /// Advance to the next published slot, if any.
    pub fn poll(&mut self, ring: &EventRing) -> Option<u32> {
        let next = ring.slot(self.last_observed).next_busy.load(Ordering::Acquire);
        if next < 0 {
            return None;
        }
        self.last_observed = next as u32;
        Some(next as u32)
    }

    /// The consumer's current position (initially the synthetic slot 0).
    pub fn position(&self) -> u32 {
        self.last_observed
    }
}

impl Default for RingConsumer {
    fn default() -> RingConsumer {
        RingConsumer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static RING_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_ring(nslots: usize) -> EventRing {
        let id = format!(
            "uf_ring_test_{}_{}",
            std::process::id(),
            RING_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        EventRing::allocate(&id, nslots, 128, b"ok").unwrap()
    }

    /// Scenario: a four-slot ring holds exactly four unreturned events;
    /// the fifth produce sees no space, and returning one consumed slot
    /// makes the next produce succeed. The consumer observes everything in
    /// produce order.
    #[test]
    fn fills_to_capacity_and_recovers() {
        let ring = test_ring(4);
        let mut consumer = RingConsumer::new();
        assert_eq!(consumer.position(), 0);
        assert_eq!(unsafe { ring.payload(0) }, b"ok");

        let mut seen = Vec::new();
        ring.produce(b"e0").unwrap();
        let first = consumer.poll(&ring).unwrap();
        seen.push(unsafe { ring.payload(first) }.to_vec());
        // The cursor moved off the seed slot, so it may go back now.
        ring.release(0).unwrap();

        for value in [b"e1", b"e2", b"e3"] {
            ring.produce(value).unwrap();
        }
        // Four events outstanding on four slots.
        assert_eq!(ring.produce(b"e4").unwrap_err(), Status::NoBuffer);

        let second = consumer.poll(&ring).unwrap();
        seen.push(unsafe { ring.payload(second) }.to_vec());
        ring.release(first).unwrap();
        ring.produce(b"e4").unwrap();

        let mut held = second;
        while let Some(offset) = consumer.poll(&ring) {
            seen.push(unsafe { ring.payload(offset) }.to_vec());
            ring.release(held).unwrap();
            held = offset;
        }
        assert_eq!(
            seen,
            vec![
                b"e0".to_vec(),
                b"e1".to_vec(),
                b"e2".to_vec(),
                b"e3".to_vec(),
                b"e4".to_vec()
            ]
        );
    }

    /// Free-chain accounting: slots not on the free chain are exactly the
    /// busy or consumer-held ones, and no slot appears twice.
    #[test]
    fn free_chain_accounts_for_every_unused_slot() {
        let ring = test_ring(8);
        // Seed still held by the consumer position; 7 slots free.
        for _ in 0..3 {
            ring.produce(b"x").unwrap();
        }

        let producer = ring.producer.lock();
        let mut visited = std::collections::HashSet::new();
        let mut cursor = producer.first_free;
        let mut free_count = 0;
        while cursor >= 0 {
            assert!(visited.insert(cursor), "slot on the free chain twice");
            free_count += 1;
            cursor = ring.slot(cursor as u32).next_free.load(Ordering::Relaxed);
        }
        // 8 slots - 1 seed (held) - 3 produced = 4 free.
        assert_eq!(free_count, 4);
    }

    #[test]
    fn rejects_bad_geometry() {
        let id = format!("uf_ring_geom_{}", std::process::id());
        assert!(EventRing::allocate(&id, 3, 128, b"").is_err());
        assert!(EventRing::allocate(&id, 4, HEADER_SIZE, b"").is_err());
        let ring = test_ring(4);
        assert!(ring.release(5).is_err());
        assert!(ring.produce(&[0u8; 4096]).is_err());
    }

    /// Producer publishes from one thread while the consumer drains from
    /// another; order and payload integrity hold without consumer locks.
    #[test]
    fn cross_thread_produce_consume() {
        let ring = std::sync::Arc::new(test_ring(16));

        let producer_ring = ring.clone();
        let producer = std::thread::spawn(move || {
            let mut published = 0u32;
            while published < 100 {
                let payload = published.to_le_bytes();
                match producer_ring.produce(&payload) {
                    Ok(_) => published += 1,
                    Err(_) => std::thread::yield_now(),
                }
            }
        });

        let mut consumer = RingConsumer::new();
        let mut held = 0u32;
        let mut expected = 0u32;
        while expected < 100 {
            match consumer.poll(&ring) {
                Some(offset) => {
                    let payload = unsafe { ring.payload(offset) };
                    assert_eq!(payload, expected.to_le_bytes());
                    // Release the slot we just moved off, keep the cursor's.
                    ring.release(held).unwrap();
                    held = offset;
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
