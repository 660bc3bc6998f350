//! # Kernel-Assisted Ethernet Transport
//!
//! The `eth` transport receives every event — connection requests, message
//! arrivals, its own send completions — through the shared event ring its
//! driver maps into the process (§[`crate::ring`]). The control surface
//! (`GET_INFO`, `CREATE_ENDPOINT`, the receive-queue mapping) lives in
//! [`crate::ethdev`]; this module is the user-space side: it opens the
//! device, maps the ring, translates ring events into endpoint events, and
//! pushes outgoing traffic through the driver toward the destination ring.
//!
//! Ring-slot payloads are bincode-encoded [`RingEvent`] values, the same
//! way the shared-memory transport serializes its messages. A slot backs
//! its endpoint event until the application returns it; the slot under the
//! consumer's cursor is parked and released on the next advance (see the
//! ring module's cursor constraint).

use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{DeviceProfile, DeviceSpec};
use crate::conn::{ConnAttribute, ConnCore, ConnInner, ConnState, Connection};
use crate::device::Device;
use crate::endpoint::{self, EndpointInner, EpState};
use crate::error::Status;
use crate::ethdev::{EthDriver, EthHandle, HwAddr, RECVQ_OFFSET};
use crate::event::{DescRef, EventData, EventKind, EventRecord};
use crate::fabric::WC_BATCH;
use crate::plugin::{Transport, TransportDescriptor, ABI_VERSION};
use crate::ring::{EventRing, RingConsumer};
use crate::wire;
use crate::{defaults, Flags};
use parking_lot::Mutex;

/// Tag the `transport=` directive names.
pub const ETH_TAG: &str = "eth";

/// Events carried in ring slots, driver to process.
#[derive(Debug, Serialize, Deserialize)]
enum RingEvent {
    /// Synthetic first event seeded at ring initialization.
    Ok,
    ConnectRequest {
        src_hwaddr: [u8; 6],
        src_endpoint: u32,
        src_conn: u32,
        attr: u8,
        max_send_size: u32,
        data: Vec<u8>,
    },
    ConnectAccepted {
        /// Initiator-side connection the verdict answers.
        dst_conn: u32,
        /// Acceptor-side connection id for the return route.
        src_conn: u32,
        max_send_size: u32,
    },
    ConnectRejected {
        dst_conn: u32,
    },
    Recv {
        dst_conn: u32,
        data: Vec<u8>,
    },
    SendComplete {
        dst_conn: u32,
        context: u64,
        status: Status,
        blocking: bool,
    },
    Disconnect {
        dst_conn: u32,
    },
    DeviceFailed,
}

/// Seed payload for slot 0 of a fresh ring.
pub(crate) fn seed_event() -> Vec<u8> {
    bincode::serialize(&RingEvent::Ok).expect("seed event serializes")
}

/// Payload the driver produces when an interface goes down.
pub(crate) fn device_failed_event() -> Vec<u8> {
    bincode::serialize(&RingEvent::DeviceFailed).expect("failure event serializes")
}

/// Transport-private device state.
struct EthDev {
    hwaddr: HwAddr,
}

/// Cursor plus the parked slot the cursor still sits on.
struct EthConsumer {
    cursor: RingConsumer,
    parked: Option<u32>,
}

/// Transport-private endpoint state.
struct EthEp {
    handle: EthHandle,
    ring: Arc<EventRing>,
    hwaddr: HwAddr,
    eth_id: u32,
    consumer: Mutex<EthConsumer>,
}

impl EthEp {
    /// Release a consumed slot, parking it while the cursor is on it.
    fn release_slot(&self, offset: u32) {
        let mut consumer = self.consumer.lock();
        if consumer.cursor.position() == offset {
            consumer.parked = Some(offset);
        } else if let Err(status) = self.handle.release_event(offset) {
            warn!("releasing ring slot {} failed: {}", offset, status);
        }
    }
}

/// Peer route held per connection.
struct EthConn {
    peer_hwaddr: HwAddr,
    peer_endpoint: u32,
    /// The peer's connection id, learned at establishment (the initiator
    /// knows it only after the accept comes back).
    peer_conn: Option<u32>,
}

pub struct EthTransport {
    descriptor: TransportDescriptor,
    driver: EthDriver,
}

impl EthTransport {
    pub fn new() -> EthTransport {
        EthTransport::with_driver(EthDriver::new())
    }

    pub fn with_driver(driver: EthDriver) -> EthTransport {
        EthTransport {
            descriptor: TransportDescriptor {
                abi_version: ABI_VERSION,
                api_version: (1, 0, 0),
                name: ETH_TAG,
                priority: 30,
            },
            driver,
        }
    }

    pub fn driver(&self) -> &EthDriver {
        &self.driver
    }

    fn eep<'a>(&self, ep: &'a Arc<EndpointInner>) -> Result<&'a EthEp, Status> {
        ep.priv_state::<EthEp>().ok_or(Status::InvalidArgument)
    }

    fn conn_route(conn: &Arc<ConnInner>) -> Option<(HwAddr, u32, Option<u32>)> {
        let core = conn.core.lock();
        core.priv_state
            .as_ref()
            .and_then(|p| p.downcast_ref::<EthConn>())
            .map(|e| (e.peer_hwaddr, e.peer_endpoint, e.peer_conn))
    }

    fn deliver(&self, hwaddr: HwAddr, endpoint_id: u32, event: &RingEvent) -> Result<(), Status> {
        let payload = bincode::serialize(event).map_err(|err| {
            warn!("unable to encode ring event: {}", err);
            Status::Error
        })?;
        self.driver.deliver(hwaddr, endpoint_id, &payload)
    }

    // ---- incoming ring events ----------------------------------------------

    fn handle_connect_request(
        &self,
        ep: &Arc<EndpointInner>,
        offset: u32,
        src_hwaddr: [u8; 6],
        src_endpoint: u32,
        src_conn: u32,
        attr_bits: u8,
        peer_mss: u32,
        data: Vec<u8>,
    ) {
        let attr = match ConnAttribute::from_bits(attr_bits) {
            Some(attr) => attr,
            None => {
                warn!("connect request with unknown attribute {}", attr_bits);
                ConnAttribute::ReliableOrdered
            }
        };
        let mut state = ep.state.lock();
        let id = state.conns.len();
        let mut core = ConnCore::new(attr);
        core.state = ConnState::Passive;
        // Both sides agree on the lower of the two maximum send sizes.
        core.mss = ep.max_send_size.min(peer_mss);
        core.priv_state = Some(Box::new(EthConn {
            peer_hwaddr: HwAddr(src_hwaddr),
            peer_endpoint: src_endpoint,
            peer_conn: Some(src_conn),
        }));
        let conn = Arc::new(ConnInner::new(Arc::downgrade(ep), id, core));
        state.add_conn(conn.clone());
        state.passive.push(id);

        endpoint::enqueue_event(
            &mut state,
            &ep.wakeup,
            EventRecord {
                kind: EventKind::ConnectRequest { attr, data: EventData::Owned(data) },
                conn: Some(conn),
                desc: DescRef::RingSlot(offset),
                blocking: false,
            },
        );
    }

    fn handle_verdict(&self, ep: &Arc<EndpointInner>, offset: u32, event: RingEvent) {
        let (dst_conn, accepted, src_conn, peer_mss) = match event {
            RingEvent::ConnectAccepted { dst_conn, src_conn, max_send_size } => {
                (dst_conn, true, Some(src_conn), max_send_size)
            }
            RingEvent::ConnectRejected { dst_conn } => (dst_conn, false, None, 0),
            _ => unreachable!("verdict handler fed a non-verdict event"),
        };

        let mut state = ep.state.lock();
        let conn = match state.conn(dst_conn as usize) {
            Some(conn) if state.active.contains(&conn.id) => conn,
            _ => {
                warn!("connect verdict for unknown conn {}", dst_conn);
                drop(state);
                if let Ok(eep) = self.eep(ep) {
                    eep.release_slot(offset);
                }
                return;
            }
        };
        EpState::remove_from(&mut state.active, conn.id);

        let kind = {
            let mut core = conn.core.lock();
            let context = core.conn_req.as_ref().map(|r| r.context).unwrap_or(0);
            core.deadline = None;
            if accepted {
                core.state = ConnState::Established;
                core.mss = ep.max_send_size.min(peer_mss);
                if let Some(eth) =
                    core.priv_state.as_mut().and_then(|p| p.downcast_mut::<EthConn>())
                {
                    eth.peer_conn = src_conn;
                }
                drop(core);
                state.established.push(conn.id);
                EventKind::ConnectAccepted { context }
            } else {
                core.state = ConnState::Closing;
                EventKind::ConnectRejected { context, status: Status::PeerRejectedConnect }
            }
        };
        endpoint::enqueue_event(
            &mut state,
            &ep.wakeup,
            EventRecord { kind, conn: Some(conn), desc: DescRef::RingSlot(offset), blocking: false },
        );
    }

    fn handle_ring_event(&self, ep: &Arc<EndpointInner>, eep: &EthEp, offset: u32) {
        let event: RingEvent = {
            // SAFETY: the slot was just observed through the busy chain and
            // stays ours until released.
            let payload = unsafe { eep.ring.payload(offset) };
            match bincode::deserialize(payload) {
                Ok(event) => event,
                Err(err) => {
                    warn!("undecodable ring event in slot {}: {}", offset, err);
                    eep.release_slot(offset);
                    return;
                }
            }
        };

        match event {
            RingEvent::Ok => {
                // Startup marker, not an application event.
                eep.release_slot(offset);
            }
            RingEvent::ConnectRequest {
                src_hwaddr,
                src_endpoint,
                src_conn,
                attr,
                max_send_size,
                data,
            } => self.handle_connect_request(
                ep,
                offset,
                src_hwaddr,
                src_endpoint,
                src_conn,
                attr,
                max_send_size,
                data,
            ),
            verdict @ (RingEvent::ConnectAccepted { .. } | RingEvent::ConnectRejected { .. }) => {
                self.handle_verdict(ep, offset, verdict)
            }
            RingEvent::Recv { dst_conn, data } => {
                let mut state = ep.state.lock();
                let conn = match state.conn(dst_conn as usize) {
                    Some(conn) if state.established.contains(&conn.id) => conn,
                    _ => {
                        warn!("message for unknown conn {}", dst_conn);
                        drop(state);
                        eep.release_slot(offset);
                        return;
                    }
                };
                conn.core.lock().last_recv = Instant::now();
                endpoint::enqueue_event(
                    &mut state,
                    &ep.wakeup,
                    EventRecord {
                        kind: EventKind::Recv { data: EventData::Owned(data) },
                        conn: Some(conn),
                        desc: DescRef::RingSlot(offset),
                        blocking: false,
                    },
                );
            }
            RingEvent::SendComplete { dst_conn, context, status, blocking } => {
                let mut state = ep.state.lock();
                let conn = state.conn(dst_conn as usize);
                endpoint::enqueue_event(
                    &mut state,
                    &ep.wakeup,
                    EventRecord {
                        kind: EventKind::Send { context, status },
                        conn,
                        desc: DescRef::RingSlot(offset),
                        blocking,
                    },
                );
            }
            RingEvent::Disconnect { dst_conn } => {
                let mut state = ep.state.lock();
                if let Some(conn) = state.conn(dst_conn as usize) {
                    debug!("peer disconnected conn {}", dst_conn);
                    EpState::remove_from(&mut state.established, conn.id);
                    conn.core.lock().state = ConnState::Closed;
                }
                drop(state);
                eep.release_slot(offset);
            }
            RingEvent::DeviceFailed => {
                let mut state = ep.state.lock();
                endpoint::enqueue_event(
                    &mut state,
                    &ep.wakeup,
                    EventRecord {
                        kind: EventKind::EndpointDeviceFailed,
                        conn: None,
                        desc: DescRef::RingSlot(offset),
                        blocking: false,
                    },
                );
            }
        }
    }

    /// Remove the completion a blocking send is waiting for.
    fn take_blocking_send(
        &self,
        ep: &Arc<EndpointInner>,
        conn_id: usize,
        context: u64,
    ) -> Option<(Status, DescRef)> {
        let mut state = ep.state.lock();
        let index = state.evts.iter().position(|record| {
            record.blocking
                && record.conn.as_ref().map(|c| c.id) == Some(conn_id)
                && matches!(record.kind, EventKind::Send { context: c, .. } if c == context)
        })?;
        let record = state.evts.remove(index).expect("indexed event");
        match record.kind {
            EventKind::Send { status, .. } => Some((status, record.desc)),
            _ => None,
        }
    }
}

impl Default for EthTransport {
    fn default() -> EthTransport {
        EthTransport::new()
    }
}

impl Transport for EthTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    fn init(&self, specs: &[DeviceSpec], auto_discover: bool) -> Result<Vec<Arc<Device>>, Status> {
        let mut devices = Vec::new();
        let probe = self.driver.open(false);

        if auto_discover {
            // No configuration: contribute one default device on the
            // first interface, named after the process.
            let iface = match self.driver.interfaces().first() {
                Some(iface) => iface.clone(),
                None => return Ok(devices),
            };
            let info = probe.get_info(iface.hwaddr)?;
            let mut device = Device::new(
                format!("eth{}", std::process::id()),
                ETH_TAG.to_string(),
                info.max_send_size,
                info.rate,
                Box::new(EthDev { hwaddr: iface.hwaddr }),
            );
            device.pci = info.pci;
            debug!("default device {} on interface {}", device.name, iface.name);
            devices.push(Arc::new(device));
            return Ok(devices);
        }

        for spec in specs {
            let profile = DeviceProfile::parse(&spec.name, &spec.args);
            let iface = match &profile.interface {
                Some(name) => self.driver.find_interface_by_name(name),
                None => self.driver.interfaces().first(),
            };
            let iface = match iface {
                Some(iface) => iface.clone(),
                None => {
                    warn!(
                        "device {}: interface {:?} not present",
                        spec.name, profile.interface
                    );
                    continue;
                }
            };
            let info = probe.get_info(iface.hwaddr)?;
            let max_send_size = match profile.mss {
                Some(mss) => mss.min(info.max_send_size),
                None => info.max_send_size,
            };
            let mut device = Device::new(
                spec.name.clone(),
                ETH_TAG.to_string(),
                max_send_size,
                info.rate,
                Box::new(EthDev { hwaddr: iface.hwaddr }),
            );
            device.pci = info.pci;
            device.is_default = spec.is_default;
            let device = Arc::new(device);
            if let Some(base) = profile.id_base {
                device.set_id_base(base);
            }
            devices.push(device);
        }
        Ok(devices)
    }

    fn create_endpoint(&self, device: &Arc<Device>) -> Result<Arc<EndpointInner>, Status> {
        let edev = device.priv_state::<EthDev>().ok_or(Status::NoSuchDevice)?;
        let handle = self.driver.open(true);
        let eth_id = handle.create_endpoint(edev.hwaddr)?;

        // Slots carry a bincode-encoded event plus the message payload.
        let slot_size = device.max_send_size as usize + defaults::ETH_SLOT_OVERHEAD;
        let ring = handle.map_recvq(RECVQ_OFFSET, defaults::ETH_RING_SLOTS, slot_size, false)?;

        let name = format!("{}://{}:{}", ETH_TAG, edev.hwaddr, eth_id);
        let eep = EthEp {
            handle,
            ring,
            hwaddr: edev.hwaddr,
            eth_id,
            consumer: Mutex::new(EthConsumer {
                cursor: RingConsumer::new(),
                // The synthetic first event is consumed here; its slot
                // frees up once the cursor first advances.
                parked: Some(0),
            }),
        };
        let ep = EndpointInner::new(
            device.clone(),
            eth_id,
            name,
            device.max_send_size,
            0,
            0,
            None,
            None,
            Box::new(eep),
        )?;
        debug!("created endpoint {}", ep.name);
        Ok(ep)
    }

    fn destroy_endpoint(&self, ep: &Arc<EndpointInner>) -> Result<(), Status> {
        if ep.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = ep.state.lock();
        for conn in state.conns.iter().flatten() {
            conn.core.lock().state = ConnState::Closed;
        }
        state.active.clear();
        state.passive.clear();
        state.established.clear();
        drop(state);
        ep.device.untrack_endpoint(ep);
        // The driver endpoint itself is released when the handle drops
        // with the last event reference.
        debug!("destroyed endpoint {}", ep.name);
        Ok(())
    }

    fn progress(&self, ep: &Arc<EndpointInner>) {
        if ep.closing.load(Ordering::Acquire) {
            return;
        }
        let eep = match ep.priv_state::<EthEp>() {
            Some(eep) => eep,
            None => return,
        };

        for _ in 0..WC_BATCH {
            let offset = {
                let mut consumer = eep.consumer.lock();
                let previous = consumer.cursor.position();
                match consumer.cursor.poll(&eep.ring) {
                    Some(offset) => {
                        // The cursor moved off the parked slot; it can go
                        // back to the free list now.
                        if consumer.parked == Some(previous) {
                            consumer.parked = None;
                            drop(consumer);
                            if let Err(status) = eep.handle.release_event(previous) {
                                warn!("releasing parked slot failed: {}", status);
                            }
                        }
                        offset
                    }
                    None => break,
                }
            };
            self.handle_ring_event(ep, eep, offset);
        }
        endpoint::sweep_connect_timeouts(ep);
    }

    fn connect(
        &self,
        ep: &Arc<EndpointInner>,
        uri: &str,
        payload: &[u8],
        attr: ConnAttribute,
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<(), Status> {
        let (host, port) = wire::parse_uri(uri, ETH_TAG)?;
        let peer_hwaddr = HwAddr::parse(host)?;
        let peer_endpoint = u32::from(port);
        if payload.len() > wire::MAX_CONN_PAYLOAD {
            return Err(Status::InvalidArgument);
        }
        let eep = self.eep(ep)?;

        let conn = {
            let mut state = ep.state.lock();
            let id = state.conns.len();
            let mut core = ConnCore::new(attr);
            core.state = ConnState::Active;
            core.conn_req =
                Some(crate::conn::ConnRequestData { data: payload.to_vec(), context, attr });
            core.deadline = Some(Instant::now() + timeout.unwrap_or(defaults::CONNECT_TIMEOUT));
            core.priv_state =
                Some(Box::new(EthConn { peer_hwaddr, peer_endpoint, peer_conn: None }));
            let conn = Arc::new(ConnInner::new(Arc::downgrade(ep), id, core));
            state.add_conn(conn.clone());
            state.active.push(id);
            conn
        };

        let request = RingEvent::ConnectRequest {
            src_hwaddr: eep.hwaddr.0,
            src_endpoint: eep.eth_id,
            src_conn: conn.id as u32,
            attr: attr.to_bits(),
            max_send_size: ep.max_send_size,
            data: payload.to_vec(),
        };
        if let Err(status) = self.deliver(peer_hwaddr, peer_endpoint, &request) {
            let mut state = ep.state.lock();
            EpState::remove_from(&mut state.active, conn.id);
            state.conns[conn.id] = None;
            return Err(status);
        }
        debug!("connecting to {}:{}", peer_hwaddr, peer_endpoint);
        Ok(())
    }

    fn accept(
        &self,
        ep: &Arc<EndpointInner>,
        conn: &Arc<ConnInner>,
    ) -> Result<Connection, Status> {
        let (route, mss) = {
            let mut core = conn.core.lock();
            if core.state != ConnState::Passive {
                return Err(Status::InvalidArgument);
            }
            core.state = ConnState::Established;
            let eth = core
                .priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<EthConn>())
                .ok_or(Status::InvalidArgument)?;
            ((eth.peer_hwaddr, eth.peer_endpoint, eth.peer_conn), core.mss)
        };
        let peer_conn = route.2.ok_or(Status::InvalidArgument)?;
        {
            let mut state = ep.state.lock();
            EpState::remove_from(&mut state.passive, conn.id);
            state.established.push(conn.id);
        }

        let verdict = RingEvent::ConnectAccepted {
            dst_conn: peer_conn,
            src_conn: conn.id as u32,
            max_send_size: mss,
        };
        if let Err(status) = self.deliver(route.0, route.1, &verdict) {
            let mut state = ep.state.lock();
            EpState::remove_from(&mut state.established, conn.id);
            conn.core.lock().state = ConnState::Passive;
            return Err(status);
        }
        Ok(Connection::from_inner(conn.clone()))
    }

    fn reject(&self, ep: &Arc<EndpointInner>, conn: &Arc<ConnInner>) -> Result<(), Status> {
        let route = {
            let mut core = conn.core.lock();
            if core.state != ConnState::Passive {
                return Err(Status::InvalidArgument);
            }
            core.state = ConnState::Closing;
            core.priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<EthConn>())
                .map(|e| (e.peer_hwaddr, e.peer_endpoint, e.peer_conn))
                .ok_or(Status::InvalidArgument)?
        };
        let peer_conn = route.2.ok_or(Status::InvalidArgument)?;
        EpState::remove_from(&mut ep.state.lock().passive, conn.id);
        self.deliver(route.0, route.1, &RingEvent::ConnectRejected { dst_conn: peer_conn })
    }

    fn disconnect(&self, ep: &Arc<EndpointInner>, conn: &Arc<ConnInner>) -> Result<(), Status> {
        let route = Self::conn_route(conn);
        {
            let mut core = conn.core.lock();
            if matches!(core.state, ConnState::Closing | ConnState::Closed) {
                return Ok(());
            }
            core.state = ConnState::Closed;
        }
        let mut state = ep.state.lock();
        EpState::remove_from(&mut state.established, conn.id);
        EpState::remove_from(&mut state.active, conn.id);
        EpState::remove_from(&mut state.passive, conn.id);
        drop(state);
        if let Some((hwaddr, endpoint_id, Some(peer_conn))) = route {
            // Best effort notice; the peer may already be gone.
            let _ = self.deliver(hwaddr, endpoint_id, &RingEvent::Disconnect { dst_conn: peer_conn });
        }
        Ok(())
    }

    fn return_event(&self, ep: &Arc<EndpointInner>, record: EventRecord) -> Result<(), Status> {
        match record.desc {
            DescRef::RingSlot(offset) => {
                if matches!(
                    record.kind,
                    EventKind::ConnectRequest { .. }
                        | EventKind::ConnectAccepted { .. }
                        | EventKind::ConnectRejected { .. }
                ) {
                    if let Some(conn) = &record.conn {
                        conn.core.lock().conn_req = None;
                    }
                }
                if !ep.closing.load(Ordering::Acquire) {
                    self.eep(ep)?.release_slot(offset);
                }
                Ok(())
            }
            DescRef::Conn => {
                if let Some(conn) = &record.conn {
                    conn.core.lock().conn_req = None;
                }
                Ok(())
            }
            _ => Err(Status::InvalidArgument),
        }
    }

    fn send(
        &self,
        ep: &Arc<EndpointInner>,
        conn: &Arc<ConnInner>,
        segments: &[&[u8]],
        context: u64,
        flags: Flags,
    ) -> Result<(), Status> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        let (route, reliable) = {
            let core = conn.core.lock();
            if core.state != ConnState::Established {
                return Err(Status::Disconnected);
            }
            if total > core.mss as usize {
                debug!("length {} > connection max send size {}", total, core.mss);
                return Err(Status::MessageTooLarge);
            }
            let eth = core
                .priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<EthConn>())
                .ok_or(Status::Disconnected)?;
            (
                (eth.peer_hwaddr, eth.peer_endpoint, eth.peer_conn),
                core.attr.is_reliable(),
            )
        };
        let peer_conn = route.2.ok_or(Status::Disconnected)?;
        let eep = self.eep(ep)?;
        let blocking = flags.contains(Flags::BLOCKING) && reliable;

        let mut data = Vec::with_capacity(total);
        for segment in segments {
            data.extend_from_slice(segment);
        }
        conn.core.lock().last_send = Instant::now();

        // A full destination ring is the receiver-not-ready condition.
        let status = match self.deliver(
            route.0,
            route.1,
            &RingEvent::Recv { dst_conn: peer_conn, data },
        ) {
            Ok(()) => Status::Success,
            Err(Status::NoBuffer) => Status::RnrTimeout,
            Err(other) => other,
        };

        // The driver echoes the completion through our own ring.
        let completion = RingEvent::SendComplete {
            dst_conn: conn.id as u32,
            context,
            status,
            blocking,
        };
        if let Err(err) = self.deliver(eep.hwaddr, eep.eth_id, &completion) {
            warn!("send completion lost, own ring unavailable: {}", err);
            return Err(err);
        }

        if blocking {
            loop {
                self.progress(ep);
                if let Some((status, desc)) = self.take_blocking_send(ep, conn.id, context) {
                    if let DescRef::RingSlot(offset) = desc {
                        eep.release_slot(offset);
                    }
                    return match status {
                        Status::Success => Ok(()),
                        failure => Err(failure),
                    };
                }
                std::thread::yield_now();
            }
        }
        Ok(())
    }
}
