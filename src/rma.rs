//! # RMA Bookkeeping
//!
//! One-sided operations need three pieces of state:
//!
//! - **Local regions**: memory ranges registered with the fabric. Handles
//!   are opaque 64-bit tokens (generation-tagged arena slots) that resolve
//!   locally in O(1) and carry no meaning for the peer; only the
//!   remote-lookup exchange ever puts real addresses and keys on the wire.
//! - **Remote references**: cached `(address, rkey)` pairs for peer
//!   handles, held per connection in most-recently-used order (see
//!   [`crate::conn::ConnCore`]).
//! - **In-flight operations**: direction, offsets, length, caller context,
//!   the optional completion message, and the embedded event delivered when
//!   the fabric acknowledges the transfer.

use crate::error::Status;
use crate::Flags;

/// Cached knowledge of a peer's registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaRemote {
    /// The peer's opaque handle, as the application exchanged it.
    pub handle: u64,
    /// Base address of the region in the peer's address space.
    pub remote_addr: u64,
    /// Fabric key granting access to the region.
    pub rkey: u32,
}

/// A locally registered memory range.
#[derive(Debug)]
pub struct RmaRegion {
    /// Base virtual address of the registered range.
    pub start: u64,
    pub len: u64,
    /// Local fabric key for the registration.
    pub lkey: u32,
    /// Remote fabric key handed out in remote-handle replies.
    pub rkey: u32,
    /// In-flight operations referencing this region.
    pub refs: u32,
    generation: u32,
}

/// Arena of registered regions with generation-tagged opaque handles.
///
/// A handle encodes `(generation << 32) | (slot + 1)`, so stale handles
/// from deregistered regions fail to resolve instead of aliasing a reused
/// slot, and no valid handle is ever zero.
#[derive(Debug, Default)]
pub struct RegionArena {
    slots: Vec<Option<RmaRegion>>,
    generations: Vec<u32>,
}

impl RegionArena {
    pub fn new() -> RegionArena {
        RegionArena::default()
    }

    /// Register a region and mint its handle.
    pub fn insert(&mut self, start: u64, len: u64, lkey: u32, rkey: u32) -> u64 {
        let slot = self.slots.iter().position(|s| s.is_none()).unwrap_or_else(|| {
            self.slots.push(None);
            self.generations.push(0);
            self.slots.len() - 1
        });
        self.generations[slot] = self.generations[slot].wrapping_add(1).max(1);
        let generation = self.generations[slot];
        self.slots[slot] = Some(RmaRegion { start, len, lkey, rkey, refs: 0, generation });
        Self::encode(slot, generation)
    }

    fn encode(slot: usize, generation: u32) -> u64 {
        (u64::from(generation) << 32) | (slot as u64 + 1)
    }

    fn decode(&self, handle: u64) -> Option<usize> {
        let slot = (handle & 0xFFFF_FFFF).checked_sub(1)? as usize;
        let generation = (handle >> 32) as u32;
        match self.slots.get(slot)? {
            Some(region) if region.generation == generation => Some(slot),
            _ => None,
        }
    }

    pub fn resolve(&self, handle: u64) -> Option<&RmaRegion> {
        let slot = self.decode(handle)?;
        self.slots[slot].as_ref()
    }

    /// Take a reference for an operation about to use the region.
    pub fn add_ref(&mut self, handle: u64) -> Result<(), Status> {
        let slot = self.decode(handle).ok_or(Status::InvalidArgument)?;
        self.slots[slot].as_mut().expect("decoded slot").refs += 1;
        Ok(())
    }

    /// Drop an operation's reference.
    pub fn release_ref(&mut self, handle: u64) {
        if let Some(slot) = self.decode(handle) {
            let region = self.slots[slot].as_mut().expect("decoded slot");
            debug_assert!(region.refs > 0, "unbalanced region release");
            region.refs = region.refs.saturating_sub(1);
        }
    }

    /// Deregister a region.
    ///
    /// Fails with `InvalidArgument` while outstanding operations still
    /// reference it, or when the handle is unknown.
    pub fn remove(&mut self, handle: u64) -> Result<RmaRegion, Status> {
        let slot = self.decode(handle).ok_or(Status::InvalidArgument)?;
        if self.slots[slot].as_ref().expect("decoded slot").refs > 0 {
            return Err(Status::InvalidArgument);
        }
        Ok(self.slots[slot].take().expect("decoded slot"))
    }

    /// Iterate live regions (teardown path).
    pub fn drain(&mut self) -> Vec<RmaRegion> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One in-flight one-sided operation.
#[derive(Debug)]
pub struct RmaOp {
    /// True for write, false for read.
    pub write: bool,
    pub local_handle: u64,
    pub local_offset: u64,
    pub remote_handle: u64,
    pub remote_offset: u64,
    pub len: u64,
    pub context: u64,
    pub flags: Flags,
    /// Completion message for the peer, sent after the transfer finishes.
    pub msg: Option<Vec<u8>>,
    /// Resolved remote reference once known.
    pub remote: Option<RmaRemote>,
    /// Waiting for a remote-handle reply before posting.
    pub pending: bool,
    /// Owning connection slot in the endpoint's table.
    pub conn: usize,
}

/// Arena of in-flight operations; indices are the fabric work ids.
#[derive(Debug, Default)]
pub struct OpArena {
    slots: Vec<Option<RmaOp>>,
    free: Vec<u32>,
}

impl OpArena {
    pub fn new() -> OpArena {
        OpArena::default()
    }

    pub fn insert(&mut self, op: RmaOp) -> u32 {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(op);
                index
            }
            None => {
                self.slots.push(Some(op));
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<&RmaOp> {
        self.slots.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut RmaOp> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    pub fn remove(&mut self, index: u32) -> Option<RmaOp> {
        let op = self.slots.get_mut(index as usize)?.take()?;
        self.free.push(index);
        Some(op)
    }

    /// Indices of operations deferred on a remote-handle lookup.
    pub fn pending_for(&self, remote_handle: u64, conn: usize) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Some(op) if op.pending && op.remote_handle == remote_handle && op.conn == conn => {
                    Some(index as u32)
                }
                _ => None,
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_resolve_in_o1_and_never_alias() {
        let mut arena = RegionArena::new();
        let first = arena.insert(0x1000, 4096, 1, 2);
        assert_eq!(arena.resolve(first).unwrap().start, 0x1000);

        arena.remove(first).unwrap();
        assert!(arena.resolve(first).is_none());

        // The slot is reused, but the stale handle still fails to resolve.
        let second = arena.insert(0x2000, 4096, 3, 4);
        assert_ne!(first, second);
        assert!(arena.resolve(first).is_none());
        assert_eq!(arena.resolve(second).unwrap().start, 0x2000);
    }

    #[test]
    fn busy_regions_refuse_deregistration() {
        let mut arena = RegionArena::new();
        let handle = arena.insert(0x1000, 4096, 1, 2);
        arena.add_ref(handle).unwrap();
        assert_eq!(arena.remove(handle).unwrap_err(), Status::InvalidArgument);
        arena.release_ref(handle);
        assert!(arena.remove(handle).is_ok());
    }

    #[test]
    fn zero_is_never_a_valid_handle() {
        let arena = RegionArena::new();
        assert!(arena.resolve(0).is_none());
    }

    #[test]
    fn pending_ops_are_found_per_connection() {
        let mut arena = OpArena::new();
        let template = |conn: usize, pending: bool| RmaOp {
            write: true,
            local_handle: 1,
            local_offset: 0,
            remote_handle: 77,
            remote_offset: 0,
            len: 16,
            context: 0,
            flags: Flags::WRITE,
            msg: None,
            remote: None,
            pending,
            conn,
        };
        let a = arena.insert(template(0, true));
        let _b = arena.insert(template(1, true));
        let _c = arena.insert(template(0, false));

        assert_eq!(arena.pending_for(77, 0), vec![a]);
        arena.remove(a).unwrap();
        assert!(arena.pending_for(77, 0).is_empty());
        assert_eq!(arena.in_flight(), 2);
    }
}
