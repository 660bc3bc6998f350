//! # Kernel-Assisted Control Surface
//!
//! The Ethernet transport talks to its driver through a character device
//! with three control operations: `GET_INFO` looks an interface up by
//! hardware address and reports link parameters, `CREATE_ENDPOINT` binds
//! the handle to one driver endpoint, and mapping the receive queue at a
//! fixed offset allocates the shared event ring. This module emulates that
//! driver in process, preserving the contract a kernel back-end would
//! enforce:
//!
//! - unknown hardware addresses fail with `NoSuchDevice` (loopback
//!   addresses are accepted to ease development);
//! - `CREATE_ENDPOINT` requires a handle opened for writing and fails with
//!   `Busy` the second time on the same handle;
//! - the receive-queue mapping must land at `RECVQ_OFFSET`, must be
//!   read-only, must cover a power-of-two number of slots, and is allowed
//!   at most once per endpoint.
//!
//! Delivery is the producer side of [`crate::ring::EventRing`]: the driver
//! serializes an event into the destination endpoint's ring, exactly as the
//! kernel would from interrupt context.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::device::PciAddress;
use crate::error::Status;
use crate::ring::EventRing;

/// Fixed mapping offset of the receive ring.
pub const RECVQ_OFFSET: u64 = 0x1000;

/// An Ethernet-style hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwAddr(pub [u8; 6]);

impl HwAddr {
    /// The all-zero loopback address the emulated driver always knows.
    pub fn loopback() -> HwAddr {
        HwAddr([0; 6])
    }

    /// Parse `aa-bb-cc-dd-ee-ff`.
    pub fn parse(text: &str) -> Result<HwAddr, Status> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in text.split('-') {
            if count == 6 {
                return Err(Status::InvalidArgument);
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| Status::InvalidArgument)?;
            count += 1;
        }
        if count != 6 {
            return Err(Status::InvalidArgument);
        }
        Ok(HwAddr(bytes))
    }
}

impl std::fmt::Display for HwAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// One emulated network interface.
#[derive(Debug, Clone)]
pub struct EthInterface {
    pub name: String,
    pub hwaddr: HwAddr,
    pub mtu: u32,
    /// Link rate in bits per second.
    pub rate: u64,
    pub pci: PciAddress,
}

impl EthInterface {
    /// The development loopback interface: jumbo MTU, no PCI placement.
    pub fn loopback() -> EthInterface {
        EthInterface {
            name: "lo".to_string(),
            hwaddr: HwAddr::loopback(),
            mtu: 9000,
            rate: 10_000_000_000,
            pci: PciAddress::unknown(),
        }
    }
}

/// What `GET_INFO` reports for an interface.
#[derive(Debug, Clone, Copy)]
pub struct EthInfo {
    pub max_send_size: u32,
    pub pci: PciAddress,
    pub rate: u64,
}

/// Driver-side endpoint record.
pub struct DriverEndpoint {
    pub id: u32,
    pub hwaddr: HwAddr,
    ring: OnceLock<Arc<EventRing>>,
}

impl DriverEndpoint {
    pub fn ring(&self) -> Option<&Arc<EventRing>> {
        self.ring.get()
    }
}

struct DriverState {
    /// Endpoint table; slots are the driver-assigned ids.
    endpoints: Vec<Option<Arc<DriverEndpoint>>>,
}

/// The in-process driver instance.
#[derive(Clone)]
pub struct EthDriver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    interfaces: Vec<EthInterface>,
    state: Mutex<DriverState>,
}

impl EthDriver {
    /// A driver knowing only the loopback interface.
    pub fn new() -> EthDriver {
        EthDriver::with_interfaces(vec![EthInterface::loopback()])
    }

    pub fn with_interfaces(interfaces: Vec<EthInterface>) -> EthDriver {
        EthDriver {
            inner: Arc::new(DriverInner {
                interfaces,
                state: Mutex::new(DriverState { endpoints: Vec::new() }),
            }),
        }
    }

    pub fn interfaces(&self) -> &[EthInterface] {
        &self.inner.interfaces
    }

    pub fn find_interface(&self, hwaddr: HwAddr) -> Option<&EthInterface> {
        self.inner.interfaces.iter().find(|iface| iface.hwaddr == hwaddr)
    }

    pub fn find_interface_by_name(&self, name: &str) -> Option<&EthInterface> {
        self.inner.interfaces.iter().find(|iface| iface.name == name)
    }

    /// Open the control device, like opening the character node.
    pub fn open(&self, writable: bool) -> EthHandle {
        EthHandle { driver: self.clone(), writable, endpoint: Mutex::new(None) }
    }

    /// Route a frame-level delivery to `(hwaddr, endpoint id)`.
    pub(crate) fn route(&self, hwaddr: HwAddr, endpoint_id: u32) -> Option<Arc<DriverEndpoint>> {
        let state = self.inner.state.lock();
        state
            .endpoints
            .get(endpoint_id as usize)
            .and_then(|slot| slot.clone())
            .filter(|ep| ep.hwaddr == hwaddr)
    }

    /// Produce an event into a destination endpoint's ring.
    ///
    /// `NoBuffer` reports a full ring; the caller decides whether that is a
    /// drop or surfaces as receiver-not-ready.
    pub(crate) fn deliver(
        &self,
        hwaddr: HwAddr,
        endpoint_id: u32,
        payload: &[u8],
    ) -> Result<(), Status> {
        let endpoint = self.route(hwaddr, endpoint_id).ok_or(Status::NoSuchDevice)?;
        let ring = endpoint.ring().ok_or(Status::NoSuchDevice)?;
        ring.produce(payload).map(|_| ())
    }

    /// Endpoints bound to an interface, for failure fan-out.
    pub(crate) fn endpoints_on(&self, hwaddr: HwAddr) -> Vec<Arc<DriverEndpoint>> {
        let state = self.inner.state.lock();
        state
            .endpoints
            .iter()
            .flatten()
            .filter(|ep| ep.hwaddr == hwaddr)
            .cloned()
            .collect()
    }

    fn create_endpoint(&self, hwaddr: HwAddr) -> Result<Arc<DriverEndpoint>, Status> {
        if self.find_interface(hwaddr).is_none() {
            return Err(Status::NoSuchDevice);
        }
        let mut state = self.inner.state.lock();
        let id = state
            .endpoints
            .iter()
            .position(|slot| slot.is_none())
            .unwrap_or(state.endpoints.len());
        let endpoint = Arc::new(DriverEndpoint { id: id as u32, hwaddr, ring: OnceLock::new() });
        if id == state.endpoints.len() {
            state.endpoints.push(Some(endpoint.clone()));
        } else {
            state.endpoints[id] = Some(endpoint.clone());
        }
        debug!("driver endpoint {} on {}", id, hwaddr);
        Ok(endpoint)
    }

    fn destroy_endpoint(&self, id: u32) {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.endpoints.get_mut(id as usize) {
            *slot = None;
        }
    }

    /// Report a link failure: every endpoint bound to the interface gets a
    /// device-failed event in its ring.
    pub fn set_link_down(&self, name: &str) -> Result<(), Status> {
        let hwaddr =
            self.find_interface_by_name(name).ok_or(Status::NoSuchDevice)?.hwaddr;
        let payload = crate::transport::eth::device_failed_event();
        for endpoint in self.endpoints_on(hwaddr) {
            if let Some(ring) = endpoint.ring() {
                if ring.produce(&payload).is_err() {
                    warn!("endpoint {} ring full, device-failure event dropped", endpoint.id);
                }
            }
        }
        Ok(())
    }
}

impl Default for EthDriver {
    fn default() -> EthDriver {
        EthDriver::new()
    }
}

/// An open handle on the control device.
pub struct EthHandle {
    driver: EthDriver,
    writable: bool,
    endpoint: Mutex<Option<Arc<DriverEndpoint>>>,
}

impl EthHandle {
    /// `GET_INFO`: look an interface up by hardware address.
    pub fn get_info(&self, hwaddr: HwAddr) -> Result<EthInfo, Status> {
        let iface = self.driver.find_interface(hwaddr).ok_or(Status::NoSuchDevice)?;
        // Jumbo frames carry 8 KiB messages, standard frames 1 KiB.
        let max_send_size = match iface.mtu {
            9000 => 8192,
            1500 => 1024,
            other => {
                debug!("interface {} has unusual mtu {}", iface.name, other);
                1024
            }
        };
        Ok(EthInfo { max_send_size, pci: iface.pci, rate: iface.rate })
    }

    /// `CREATE_ENDPOINT`: bind this handle to a new driver endpoint.
    pub fn create_endpoint(&self, hwaddr: HwAddr) -> Result<u32, Status> {
        if !self.writable {
            return Err(Status::InvalidArgument);
        }
        let mut held = self.endpoint.lock();
        if held.is_some() {
            return Err(Status::Busy);
        }
        let endpoint = self.driver.create_endpoint(hwaddr)?;
        let id = endpoint.id;
        *held = Some(endpoint);
        Ok(id)
    }

    /// Map the receive ring at the fixed offset.
    ///
    /// Mirrors the driver's mmap checks: wrong offset or a writable
    /// mapping is refused, the slot count must be a power of two, and only
    /// one mapping per endpoint is allowed.
    pub fn map_recvq(
        &self,
        offset: u64,
        nslots: usize,
        slot_size: usize,
        writable: bool,
    ) -> Result<Arc<EventRing>, Status> {
        if offset != RECVQ_OFFSET {
            return Err(Status::InvalidArgument);
        }
        if writable {
            return Err(Status::InvalidArgument);
        }
        let held = self.endpoint.lock();
        let endpoint = held.as_ref().ok_or(Status::InvalidArgument)?;

        // Segment names must be unique across driver instances even when
        // endpoint ids repeat.
        static SEGMENT_SEQ: AtomicU64 = AtomicU64::new(0);
        let os_id = format!(
            "uf_eth_{}_{}_{}",
            std::process::id(),
            endpoint.id,
            SEGMENT_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let seed = crate::transport::eth::seed_event();
        let ring = Arc::new(EventRing::allocate(&os_id, nslots, slot_size, &seed)?);
        endpoint.ring.set(ring.clone()).map_err(|_| Status::Busy)?;
        Ok(ring)
    }

    /// Return a consumed ring slot to the driver (the ioctl return path).
    pub fn release_event(&self, slot_offset: u32) -> Result<(), Status> {
        let held = self.endpoint.lock();
        let endpoint = held.as_ref().ok_or(Status::InvalidArgument)?;
        let ring = endpoint.ring().ok_or(Status::InvalidArgument)?;
        ring.release(slot_offset)
    }

    pub fn endpoint_id(&self) -> Option<u32> {
        self.endpoint.lock().as_ref().map(|ep| ep.id)
    }
}

impl Drop for EthHandle {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.lock().take() {
            self.driver.destroy_endpoint(endpoint.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwaddr_text_round_trip() {
        let addr = HwAddr([0xde, 0xad, 0xbe, 0xef, 0x00, 0x42]);
        assert_eq!(HwAddr::parse(&addr.to_string()).unwrap(), addr);
        assert!(HwAddr::parse("de-ad-be-ef-00").is_err());
        assert!(HwAddr::parse("de-ad-be-ef-00-42-17").is_err());
        assert!(HwAddr::parse("zz-ad-be-ef-00-42").is_err());
    }

    #[test]
    fn get_info_maps_mtu_and_rejects_unknown_addresses() {
        let driver = EthDriver::new();
        let handle = driver.open(false);
        let info = handle.get_info(HwAddr::loopback()).unwrap();
        assert_eq!(info.max_send_size, 8192);
        assert_eq!(
            handle.get_info(HwAddr([1; 6])).unwrap_err(),
            Status::NoSuchDevice
        );
    }

    #[test]
    fn create_endpoint_enforces_mode_and_single_binding() {
        let driver = EthDriver::new();
        let readonly = driver.open(false);
        assert_eq!(
            readonly.create_endpoint(HwAddr::loopback()).unwrap_err(),
            Status::InvalidArgument
        );

        let handle = driver.open(true);
        let id = handle.create_endpoint(HwAddr::loopback()).unwrap();
        assert_eq!(handle.endpoint_id(), Some(id));
        // Creating twice on the same handle is refused.
        assert_eq!(handle.create_endpoint(HwAddr::loopback()).unwrap_err(), Status::Busy);
    }

    #[test]
    fn recvq_mapping_rules() {
        let driver = EthDriver::new();
        let handle = driver.open(true);
        handle.create_endpoint(HwAddr::loopback()).unwrap();

        // Wrong offset, writable mapping, and bad slot counts are refused.
        assert!(handle.map_recvq(0, 16, 256, false).is_err());
        assert!(handle.map_recvq(RECVQ_OFFSET, 16, 256, true).is_err());
        assert!(handle.map_recvq(RECVQ_OFFSET, 10, 256, false).is_err());

        let ring = handle.map_recvq(RECVQ_OFFSET, 16, 256, false).unwrap();
        assert_eq!(ring.nslots(), 16);
        // At most one mapping per endpoint.
        assert_eq!(
            handle.map_recvq(RECVQ_OFFSET, 16, 256, false).unwrap_err(),
            Status::Busy
        );
    }

    #[test]
    fn endpoint_ids_are_reused_after_release() {
        let driver = EthDriver::new();
        let first = driver.open(true);
        let id0 = first.create_endpoint(HwAddr::loopback()).unwrap();
        let second = driver.open(true);
        let id1 = second.create_endpoint(HwAddr::loopback()).unwrap();
        assert_ne!(id0, id1);
        drop(first);
        let third = driver.open(true);
        assert_eq!(third.create_endpoint(HwAddr::loopback()).unwrap(), id0);
    }
}
