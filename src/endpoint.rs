//! # Endpoint Core
//!
//! An endpoint is the per-application handle on a device: it owns the
//! transmit and receive descriptor pools (backed by two contiguous,
//! page-aligned slabs), the event list, every connection anchored here, and
//! the RMA bookkeeping. One lock guards all of that mutable state; the
//! transport keeps its fabric objects in `priv_state`.
//!
//! Descriptor identity is the arena index, stable for the descriptor's
//! lifetime. At any instant a transmit descriptor is in exactly one of
//! three places: the idle list, posted to the fabric, or embedded in a
//! pending event. Receive descriptors cycle between "posted" and "carried
//! by an event"; returning the event re-posts them.
//!
//! `get_event` runs one progress tick and pops the first event that is not
//! being drained inline by a blocking sender. `return_event` routes by the
//! backing descriptor. `arm_os_handle` arms a one-shot wakeup on the
//! endpoint's eventfd so callers can sleep in `poll`/`epoll` between
//! progress calls.

use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::conn::{ConnInner, ConnState, Connection};
use crate::device::Device;
use crate::error::Status;
use crate::event::{DescRef, Event, EventKind, EventRecord};
use crate::plugin::Transport;
use crate::rma::{OpArena, RegionArena};
use crate::slab::Slab;
use crate::wire::MsgKind;
use crate::Flags;

/// A transmit descriptor: one slab range, reused for one operation at a
/// time.
pub struct Tx {
    /// Fixed offset of this descriptor's buffer inside the tx slab.
    pub offset: usize,
    /// What the buffer currently carries; protocol kinds recycle silently.
    pub kind: MsgKind,
    pub flags: Flags,
    pub len: u32,
    pub context: u64,
    /// Owning connection slot for the in-flight operation.
    pub conn: Option<usize>,
    /// Completion must not surface as an application event.
    pub silent: bool,
}

/// A receive descriptor: a fixed range of the receive slab, posted to the
/// shared receive queue and carried by one event per completion.
pub struct Rx {
    pub offset: usize,
}

/// Everything guarded by the endpoint lock.
pub struct EpState {
    /// Pending events in arrival order.
    pub evts: VecDeque<EventRecord>,
    pub txs: Vec<Tx>,
    /// Indices of idle transmit descriptors.
    pub idle_txs: Vec<u32>,
    pub rxs: Vec<Rx>,
    /// All connections; slots are never reused while a handle is live.
    pub conns: Vec<Option<Arc<ConnInner>>>,
    /// Connections initiating a handshake.
    pub active: Vec<usize>,
    /// Connections awaiting their initiator's payload or our verdict.
    pub passive: Vec<usize>,
    /// Fully established connections.
    pub established: Vec<usize>,
    /// Completion-path lookup: fabric queue-pair number to connection slot.
    pub qp_index: HashMap<u32, usize>,
    pub regions: RegionArena,
    pub rma_ops: OpArena,
    pub keepalive_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

impl EpState {
    /// Insert a connection and return its slot.
    pub fn add_conn(&mut self, conn: Arc<ConnInner>) -> usize {
        let id = conn.id;
        debug_assert_eq!(id, self.conns.len());
        self.conns.push(Some(conn));
        id
    }

    pub fn conn(&self, id: usize) -> Option<Arc<ConnInner>> {
        self.conns.get(id)?.clone()
    }

    /// Find the connection a completion belongs to by its queue-pair
    /// number.
    pub fn conn_by_qp(&self, qp_num: u32) -> Option<(usize, Arc<ConnInner>)> {
        let id = *self.qp_index.get(&qp_num)?;
        Some((id, self.conns.get(id)?.clone()?))
    }

    pub fn remove_from(list: &mut Vec<usize>, id: usize) -> bool {
        match list.iter().position(|&c| c == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// One-shot OS wakeup for blocking-mode integration.
pub struct Wakeup {
    fd: Option<EventFd>,
    armed: AtomicBool,
}

impl Wakeup {
    fn new() -> Wakeup {
        let fd = match EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK) {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!("eventfd unavailable, blocking-mode wakeups disabled: {}", err);
                None
            }
        };
        Wakeup { fd, armed: AtomicBool::new(false) }
    }

    /// Request that the next delivered event signals the OS handle.
    pub fn arm(&self) -> Result<(), Status> {
        if self.fd.is_none() {
            return Err(Status::NotImplemented);
        }
        self.armed.store(true, Ordering::Release);
        Ok(())
    }

    /// Fire the wakeup if armed; called with every event enqueued.
    pub fn signal(&self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            if let Some(fd) = &self.fd {
                let _ = fd.arm();
            }
        }
    }

    pub fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

/// The shared endpoint record every transport populates.
pub struct EndpointInner {
    pub device: Arc<Device>,
    /// Dense endpoint id within the device.
    pub id: u32,
    /// Endpoint URI, e.g. `verbs://10.0.0.1:5000`.
    pub name: String,
    /// Buffer length per descriptor; the device's maximum send size.
    pub max_send_size: u32,
    pub tx_slab: Option<Slab>,
    pub rx_slab: Option<Slab>,
    pub state: Mutex<EpState>,
    pub closing: AtomicBool,
    pub wakeup: Wakeup,
    /// Fabric objects owned by the transport.
    pub priv_state: Box<dyn Any + Send + Sync>,
}

impl EndpointInner {
    /// Build the shared record around slabs sized `count × max_send_size`:
    /// all transmit descriptors idle, receive descriptors laid out for the
    /// transport to post. The transport allocates (and, where the fabric
    /// requires it, registers) the slabs before handing them over.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<Device>,
        id: u32,
        name: String,
        max_send_size: u32,
        tx_count: u32,
        rx_count: u32,
        tx_slab: Option<Slab>,
        rx_slab: Option<Slab>,
        priv_state: Box<dyn Any + Send + Sync>,
    ) -> Result<Arc<EndpointInner>, Status> {
        let buffer_len = max_send_size as usize;
        if tx_count > 0
            && tx_slab.as_ref().map(|s| s.len() < tx_count as usize * buffer_len).unwrap_or(true)
        {
            return Err(Status::InvalidArgument);
        }
        if rx_count > 0
            && rx_slab.as_ref().map(|s| s.len() < rx_count as usize * buffer_len).unwrap_or(true)
        {
            return Err(Status::InvalidArgument);
        }

        let txs: Vec<Tx> = (0..tx_count)
            .map(|i| Tx {
                offset: i as usize * buffer_len,
                kind: MsgKind::Send,
                flags: Flags::empty(),
                len: 0,
                context: 0,
                conn: None,
                silent: false,
            })
            .collect();
        let idle_txs: Vec<u32> = (0..tx_count).rev().collect();
        let rxs: Vec<Rx> = (0..rx_count).map(|i| Rx { offset: i as usize * buffer_len }).collect();

        Ok(Arc::new(EndpointInner {
            device,
            id,
            name,
            max_send_size,
            tx_slab,
            rx_slab,
            state: Mutex::new(EpState {
                evts: VecDeque::new(),
                txs,
                idle_txs,
                rxs,
                conns: Vec::new(),
                active: Vec::new(),
                passive: Vec::new(),
                established: Vec::new(),
                qp_index: HashMap::new(),
                regions: RegionArena::new(),
                rma_ops: OpArena::new(),
                keepalive_timeout: None,
                send_timeout: None,
            }),
            closing: AtomicBool::new(false),
            wakeup: Wakeup::new(),
            priv_state,
        }))
    }

    /// The transport bound to this endpoint's device.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.device.transport().expect("endpoint on unbound device")
    }

    pub fn priv_state<T: 'static>(&self) -> Option<&T> {
        self.priv_state.downcast_ref::<T>()
    }

    /// Pointer into the transmit slab at a descriptor offset.
    pub fn tx_ptr(&self, offset: usize) -> *mut u8 {
        self.tx_slab.as_ref().expect("endpoint has no tx slab").at(offset)
    }

    /// Pointer into the receive slab at a descriptor offset.
    pub fn rx_ptr(&self, offset: usize) -> *mut u8 {
        self.rx_slab.as_ref().expect("endpoint has no rx slab").at(offset)
    }
}

/// Enqueue one event and fire the armed wakeup, if any.
pub(crate) fn enqueue_event(state: &mut EpState, wakeup: &Wakeup, record: EventRecord) {
    state.evts.push_back(record);
    wakeup.signal();
}

/// Pop the first deliverable event, skipping completions that a blocking
/// caller is draining inline.
pub(crate) fn pop_event(ep: &Arc<EndpointInner>) -> Result<Event, Status> {
    let mut state = ep.state.lock();
    let position = state.evts.iter().position(|record| !record.blocking);
    match position {
        Some(index) => {
            let record = state.evts.remove(index).expect("indexed event");
            drop(state);
            Ok(Event::new(ep.clone(), record))
        }
        None => Err(Status::Again),
    }
}

/// Remove and report the completion event a blocking operation is waiting
/// on, identified by its backing descriptor.
pub(crate) fn take_blocking_event(ep: &Arc<EndpointInner>, desc: DescRef) -> Option<Status> {
    let mut state = ep.state.lock();
    let index = state.evts.iter().position(|record| record.desc == desc)?;
    let record = state.evts.remove(index).expect("indexed event");
    match record.kind {
        EventKind::Send { status, .. } => Some(status),
        other => {
            warn!("unexpected {} event on blocking drain", other.name());
            Some(Status::Error)
        }
    }
}

/// Expire active-side handshakes whose connect timeout has passed; the
/// outcome surfaces as a `ConnectRejected` event with `Timeout` status.
pub(crate) fn sweep_connect_timeouts(ep: &Arc<EndpointInner>) {
    let now = Instant::now();
    let mut state = ep.state.lock();
    let expired: Vec<usize> = state
        .active
        .iter()
        .copied()
        .filter(|&id| {
            state.conns[id]
                .as_ref()
                .map(|conn| {
                    let core = conn.core.lock();
                    matches!(core.deadline, Some(deadline) if now >= deadline)
                })
                .unwrap_or(false)
        })
        .collect();

    for id in expired {
        EpState::remove_from(&mut state.active, id);
        let conn = match state.conn(id) {
            Some(conn) => conn,
            None => continue,
        };
        let context = {
            let mut core = conn.core.lock();
            core.state = ConnState::Closing;
            core.deadline = None;
            core.conn_req.as_ref().map(|req| req.context).unwrap_or(0)
        };
        debug!("connect timed out on conn {}", id);
        enqueue_event(
            &mut state,
            &ep.wakeup,
            EventRecord {
                kind: EventKind::ConnectRejected { context, status: Status::Timeout },
                conn: Some(conn),
                desc: DescRef::Conn,
                blocking: false,
            },
        );
    }
}

/// Endpoint options reachable through `set_opt`/`get_opt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOpt {
    /// Deliver `KeepaliveTimedOut` when a peer stays silent this long.
    KeepaliveTimeout(Option<Duration>),
    /// Advisory bound for reliable-send retries.
    SendTimeout(Option<Duration>),
}

/// Option selectors for `get_opt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptName {
    KeepaliveTimeout,
    SendTimeout,
}

/// Application handle on an endpoint.
///
/// Dropping the handle destroys the endpoint: outstanding work is drained,
/// connections are torn down, and the endpoint id returns to the device.
pub struct Endpoint {
    pub(crate) inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn new(inner: Arc<EndpointInner>) -> Endpoint {
        Endpoint { inner }
    }

    /// Endpoint URI peers can connect to.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    /// Largest payload a single short message can carry before per
    /// connection negotiation.
    pub fn max_send_size(&self) -> u32 {
        self.inner.max_send_size
    }

    /// OS handle for `arm_os_handle` integration, when available.
    pub fn os_handle(&self) -> Option<std::os::fd::RawFd> {
        self.inner.wakeup.raw_fd()
    }

    /// Initiate a connection to a peer endpoint URI.
    ///
    /// The connect payload (at most 4095 bytes) and attribute travel to the
    /// peer's `ConnectRequest` event; the outcome comes back as exactly one
    /// `ConnectAccepted` or `ConnectRejected` event carrying `context`.
    pub fn connect(
        &self,
        uri: &str,
        payload: &[u8],
        attr: crate::ConnAttribute,
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<(), Status> {
        let transport = self.inner.transport();
        transport.connect(&self.inner, uri, payload, attr, context, timeout)
    }

    /// Accept a pending `ConnectRequest` event, establishing the
    /// connection.
    pub fn accept(&self, event: &Event) -> Result<Connection, Status> {
        let record = event.record.as_ref().ok_or(Status::InvalidArgument)?;
        if !matches!(record.kind, EventKind::ConnectRequest { .. }) {
            return Err(Status::InvalidArgument);
        }
        let conn = record.conn.clone().ok_or(Status::InvalidArgument)?;
        let transport = self.inner.transport();
        transport.accept(&self.inner, &conn)
    }

    /// Reject a pending `ConnectRequest` event.
    pub fn reject(&self, event: &Event) -> Result<(), Status> {
        let record = event.record.as_ref().ok_or(Status::InvalidArgument)?;
        if !matches!(record.kind, EventKind::ConnectRequest { .. }) {
            return Err(Status::InvalidArgument);
        }
        let conn = record.conn.clone().ok_or(Status::InvalidArgument)?;
        let transport = self.inner.transport();
        transport.reject(&self.inner, &conn)
    }

    /// Run one progress tick and dequeue the next event, or `Again`.
    pub fn get_event(&self) -> Result<Event, Status> {
        let transport = self.inner.transport();
        transport.get_event(&self.inner)
    }

    /// Hand an event back so its descriptor can be recycled (receive
    /// buffers are re-posted, transmit buffers return to the idle pool).
    pub fn return_event(&self, mut event: Event) -> Result<(), Status> {
        match event.take_record() {
            Some(record) => {
                let transport = self.inner.transport();
                transport.return_event(&self.inner, record)
            }
            None => Err(Status::InvalidArgument),
        }
    }

    /// Arm a one-shot wakeup on [`Endpoint::os_handle`] for the next
    /// delivered event.
    pub fn arm_os_handle(&self) -> Result<(), Status> {
        let transport = self.inner.transport();
        transport.arm_os_handle(&self.inner)
    }

    pub fn set_opt(&self, opt: EndpointOpt) -> Result<(), Status> {
        let transport = self.inner.transport();
        transport.set_opt(&self.inner, opt)
    }

    pub fn get_opt(&self, name: OptName) -> Result<EndpointOpt, Status> {
        let transport = self.inner.transport();
        transport.get_opt(&self.inner, name)
    }

    /// Register `[start, start + length)` for RMA and return its opaque
    /// 64-bit handle.
    ///
    /// # Safety
    /// The range must stay valid and unmoved until deregistration, and the
    /// caller must not create references over parts of it while one-sided
    /// transfers may be touching them.
    pub unsafe fn rma_register(&self, start: *mut u8, length: u64) -> Result<u64, Status> {
        let transport = self.inner.transport();
        transport.rma_register(&self.inner, start as u64, length)
    }

    /// Tear down an RMA registration; fails with `InvalidArgument` while
    /// operations still reference it.
    pub fn rma_deregister(&self, handle: u64) -> Result<(), Status> {
        let transport = self.inner.transport();
        transport.rma_deregister(&self.inner, handle)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let transport = self.inner.transport();
        if let Err(status) = transport.destroy_endpoint(&self.inner) {
            warn!("destroying endpoint {} failed: {}", self.inner.name, status);
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("device", &self.inner.device.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_descriptors_start_idle_with_disjoint_ranges() {
        let device =
            Arc::new(Device::new("d".into(), "test".into(), 1024, 0, Box::new(())));
        let ep = EndpointInner::new(
            device,
            0,
            "test://x:1".into(),
            1024,
            8,
            4,
            Some(Slab::page_aligned(8 * 1024).unwrap()),
            Some(Slab::page_aligned(4 * 1024).unwrap()),
            Box::new(()),
        )
        .unwrap();
        let state = ep.state.lock();
        assert_eq!(state.txs.len(), 8);
        assert_eq!(state.idle_txs.len(), 8);
        assert_eq!(state.rxs.len(), 4);
        // Lowest index on top of the idle stack.
        assert_eq!(*state.idle_txs.last().unwrap(), 0);
        let mut offsets: Vec<usize> = state.txs.iter().map(|t| t.offset).collect();
        offsets.dedup();
        assert_eq!(offsets.len(), 8);
        assert!(ep.tx_slab.as_ref().unwrap().len() >= 8 * 1024);
    }

    #[test]
    fn descriptorless_endpoint_needs_no_slabs() {
        let device =
            Arc::new(Device::new("d".into(), "test".into(), 1024, 0, Box::new(())));
        let ep =
            EndpointInner::new(device, 0, "test://x:1".into(), 1024, 0, 0, None, None, Box::new(()))
                .unwrap();
        assert!(ep.tx_slab.is_none());
        assert!(ep.rx_slab.is_none());
    }

    #[test]
    fn undersized_slabs_are_rejected() {
        let device =
            Arc::new(Device::new("d".into(), "test".into(), 1024, 0, Box::new(())));
        let result = EndpointInner::new(
            device,
            0,
            "test://x:1".into(),
            1024,
            8,
            0,
            Some(Slab::page_aligned(1024).unwrap()),
            None,
            Box::new(()),
        );
        assert!(result.is_err());
    }
}
