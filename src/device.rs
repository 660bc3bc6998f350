//! # Device Registry and Id Management
//!
//! A `Device` represents one fabric adapter: its stable name, the transport
//! tag that owns it, link parameters, and the endpoints bound to it. The
//! `Registry` exclusively owns all devices for a library instance; endpoints
//! hold a non-owning back reference.
//!
//! Endpoint ids within a device come from a bitmap partitioned into fixed
//! 64-slot blocks that grow on demand. Allocation scans for the first
//! non-saturated word and takes its lowest clear bit, so ids are dense and
//! the smallest released id is always the next one handed out.
//!
//! Locking: the registry lock guards the device list, each device's lock
//! guards its endpoint list and id bitmap. Lock order is registry before
//! device before endpoint.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::endpoint::EndpointInner;
use crate::plugin::Transport;

/// Number of ids covered by one bitmap block.
pub const ID_BLOCK_SIZE: u32 = 64;

/// PCI bus identifiers; −1 where the transport cannot determine them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: i32,
    pub bus: i32,
    pub dev: i32,
    pub func: i32,
}

impl PciAddress {
    /// The "unknown" address every device starts with.
    pub fn unknown() -> PciAddress {
        PciAddress { domain: -1, bus: -1, dev: -1, func: -1 }
    }
}

/// One fabric adapter known to the library.
pub struct Device {
    /// Stable name from configuration or discovery.
    pub name: String,
    /// Tag of the transport bound to this device.
    pub transport_tag: String,
    /// Largest short-message payload the device can carry.
    pub max_send_size: u32,
    /// Link rate in bits per second, 0 when unknown.
    pub rate: u64,
    pub pci: PciAddress,
    /// Whether the underlying link is up.
    pub up: bool,
    /// Preferred when the application does not name a device.
    pub is_default: bool,

    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Guards the endpoint list and the id bitmap.
    state: Mutex<DeviceState>,
    /// Transport-private state established at init.
    priv_state: Box<dyn Any + Send + Sync>,
}

struct DeviceState {
    endpoints: Vec<Weak<EndpointInner>>,
    ids: IdAllocator,
}

impl Device {
    pub fn new(
        name: String,
        transport_tag: String,
        max_send_size: u32,
        rate: u64,
        priv_state: Box<dyn Any + Send + Sync>,
    ) -> Device {
        Device {
            name,
            transport_tag,
            max_send_size,
            rate,
            pci: PciAddress::unknown(),
            up: true,
            is_default: false,
            transport: RwLock::new(None),
            state: Mutex::new(DeviceState { endpoints: Vec::new(), ids: IdAllocator::new(0) }),
            priv_state,
        }
    }

    /// Set the id base for endpoints on this device (the `id=` directive).
    pub fn set_id_base(&self, base: u32) {
        self.state.lock().ids = IdAllocator::new(base);
    }

    pub(crate) fn bind_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    /// The transport bound to this device.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    /// Transport-private state, downcast by the owning transport.
    pub fn priv_state<T: 'static>(&self) -> Option<&T> {
        self.priv_state.downcast_ref::<T>()
    }

    /// Draw the next endpoint id from the device's bitmap.
    pub fn acquire_endpoint_id(&self) -> u32 {
        self.state.lock().ids.acquire()
    }

    /// Return an endpoint id to the bitmap.
    pub fn release_endpoint_id(&self, id: u32) {
        self.state.lock().ids.release(id);
    }

    pub(crate) fn track_endpoint(&self, ep: &Arc<EndpointInner>) {
        let mut state = self.state.lock();
        state.endpoints.retain(|weak| weak.strong_count() > 0);
        state.endpoints.push(Arc::downgrade(ep));
    }

    pub(crate) fn untrack_endpoint(&self, ep: &Arc<EndpointInner>) {
        let target = Arc::as_ptr(ep);
        self.state
            .lock()
            .endpoints
            .retain(|weak| weak.as_ptr() != target && weak.strong_count() > 0);
    }

    /// Number of live endpoints bound to this device.
    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.iter().filter(|w| w.strong_count() > 0).count()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("transport", &self.transport_tag)
            .field("max_send_size", &self.max_send_size)
            .field("rate", &self.rate)
            .field("up", &self.up)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// Endpoint-id allocator: 64-bit blocks, lowest clear bit first, grown on
/// demand, with a configurable base offset.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    base: u32,
    blocks: Vec<u64>,
}

impl IdAllocator {
    pub fn new(base: u32) -> IdAllocator {
        IdAllocator { base, blocks: vec![0] }
    }

    /// Allocate the smallest available id.
    pub fn acquire(&mut self) -> u32 {
        for (index, block) in self.blocks.iter_mut().enumerate() {
            if *block != u64::MAX {
                // No find-first-zero, so invert and take the first set bit.
                let shift = (!*block).trailing_zeros();
                debug_assert!(*block & (1u64 << shift) == 0);
                *block |= 1u64 << shift;
                return self.base + index as u32 * ID_BLOCK_SIZE + shift;
            }
        }
        // Every block is saturated; grow by one.
        let index = self.blocks.len() as u32;
        self.blocks.push(1);
        self.base + index * ID_BLOCK_SIZE
    }

    /// Release a previously acquired id.
    pub fn release(&mut self, id: u32) {
        let offset = id - self.base;
        let index = (offset / ID_BLOCK_SIZE) as usize;
        let shift = offset % ID_BLOCK_SIZE;
        debug_assert!(self.blocks[index] & (1u64 << shift) != 0, "releasing free id {}", id);
        self.blocks[index] &= !(1u64 << shift);
    }

    /// Number of ids currently held.
    pub fn in_use(&self) -> u32 {
        self.blocks.iter().map(|b| b.count_ones()).sum()
    }
}

/// Exclusive owner of every device in a library instance.
pub struct Registry {
    devices: RwLock<Vec<Arc<Device>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { devices: RwLock::new(Vec::new()) }
    }

    pub fn add(&self, device: Arc<Device>) {
        debug!(
            "registering device {} (transport {}, mss {})",
            device.name, device.transport_tag, device.max_send_size
        );
        self.devices.write().push(device);
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.read().iter().find(|d| d.name == name).cloned()
    }

    /// The device used when the application names none: the first marked
    /// default, otherwise the first device.
    pub fn default_device(&self) -> Option<Arc<Device>> {
        let devices = self.devices.read();
        devices.iter().find(|d| d.is_default).or_else(|| devices.first()).cloned()
    }

    /// Drop every device owned by the named transport; used when a
    /// transport's init fails so the others stay usable.
    pub fn remove_transport(&self, tag: &str) {
        self.devices.write().retain(|d| d.transport_tag != tag);
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sixty-five allocations: the first sixty-four fill block 0 in
    /// lowest-bit order, the sixty-fifth forces block growth.
    #[test]
    fn allocation_order_and_growth() {
        let mut ids = IdAllocator::new(0);
        for expected in 0..64 {
            assert_eq!(ids.acquire(), expected);
        }
        assert_eq!(ids.acquire(), 64);
        assert_eq!(ids.blocks.len(), 2);
    }

    /// Releasing an id makes it the next one handed out.
    #[test]
    fn released_id_is_reused_first() {
        let mut ids = IdAllocator::new(0);
        for _ in 0..16 {
            ids.acquire();
        }
        ids.release(7);
        assert_eq!(ids.acquire(), 7);
    }

    /// put(get(x)) leaves the bitmap exactly as it was.
    #[test]
    fn release_restores_prior_state() {
        let mut ids = IdAllocator::new(0);
        ids.acquire();
        ids.acquire();
        let before = ids.blocks.clone();
        let id = ids.acquire();
        ids.release(id);
        assert_eq!(ids.blocks, before);
    }

    #[test]
    fn base_offsets_apply() {
        let mut ids = IdAllocator::new(1000);
        assert_eq!(ids.acquire(), 1000);
        assert_eq!(ids.acquire(), 1001);
        ids.release(1000);
        assert_eq!(ids.acquire(), 1000);
    }

    /// Ids handed to concurrent callers are unique.
    #[test]
    fn concurrent_ids_are_unique() {
        let ids = Arc::new(Mutex::new(IdAllocator::new(0)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = ids.clone();
            handles.push(std::thread::spawn(move || {
                (0..50).map(|_| ids.lock().acquire()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count);
    }

    #[test]
    fn default_device_selection() {
        let registry = Registry::new();
        assert!(registry.default_device().is_none());

        let a = Arc::new(Device::new("a".into(), "t".into(), 1024, 0, Box::new(())));
        registry.add(a.clone());
        let mut b = Device::new("b".into(), "t".into(), 1024, 0, Box::new(()));
        b.is_default = true;
        let b = Arc::new(b);
        registry.add(b.clone());

        // The first device marked default wins over list order.
        assert_eq!(registry.default_device().unwrap().name, "b");
        registry.remove_transport("t");
        assert!(registry.default_device().is_none());
    }
}
