//! # Loopback Fabric
//!
//! An in-process fabric with the shape of an RDMA stack: queue pairs with
//! dense numbers, one completion queue per endpoint, a shared receive queue
//! feeding every connection on the endpoint, a connection-management
//! channel for rendezvous, and a registered-region table keyed by rkey for
//! one-sided transfers.
//!
//! Transfers complete synchronously (a post copies into the peer's posted
//! receive buffer and pushes completions on both sides), which trivially
//! provides the per-queue-pair ordering the reliable-ordered attribute
//! inherits. Hardware back-ends are out of scope; this implementation
//! defines the behavior any of them must reproduce.

use crossbeam::queue::{ArrayQueue, SegQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::{Completion, CqOpcode, CqStatus};
use crate::error::Status;

/// A synthetic fabric adapter.
#[derive(Debug, Clone)]
pub struct Adapter {
    pub name: String,
    pub ip: Ipv4Addr,
    /// Largest MTU the port supports; bounds the device max send size.
    pub max_mtu: u32,
    /// Link rate in bits per second.
    pub rate: u64,
}

/// A registered memory range, as the fabric sees it.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub len: u64,
    pub lkey: u32,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy)]
struct RegionEntry {
    base: u64,
    len: u64,
}

/// Per-endpoint completion queue.
pub struct CompletionQueue {
    queue: ArrayQueue<Completion>,
}

impl CompletionQueue {
    fn new(capacity: usize) -> Arc<CompletionQueue> {
        Arc::new(CompletionQueue { queue: ArrayQueue::new(capacity) })
    }

    pub(crate) fn push(&self, completion: Completion) {
        if self.queue.push(completion).is_err() {
            // A full CQ means the consumer stopped progressing; dropping the
            // entry mirrors a hardware CQ overrun.
            warn!("completion queue overrun, dropping completion");
        }
    }

    /// Drain up to `max` completions into `out`; returns how many.
    pub fn poll(&self, out: &mut Vec<Completion>, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            match self.queue.pop() {
                Some(completion) => {
                    out.push(completion);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// One posted receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct PostedRecv {
    pub wr_id: u64,
    /// Destination address of the receive buffer.
    pub addr: u64,
    pub len: u32,
}

/// Receive pool shared by all queue pairs of an endpoint.
pub struct SharedReceiveQueue {
    queue: SegQueue<PostedRecv>,
}

impl SharedReceiveQueue {
    fn new() -> Arc<SharedReceiveQueue> {
        Arc::new(SharedReceiveQueue { queue: SegQueue::new() })
    }

    pub fn post(&self, recv: PostedRecv) {
        self.queue.push(recv);
    }

    fn pop(&self) -> Option<PostedRecv> {
        self.queue.pop()
    }

    pub fn outstanding(&self) -> usize {
        self.queue.len()
    }
}

/// A connection request parked on the passive side's channel until the
/// transport accepts it at fabric level.
pub struct PendingConnect {
    /// Out-of-band private data from the initiator (the request header).
    pub private_data: u32,
    active_qp: Arc<QueuePair>,
    /// The initiator's CM channel, so establishment notifies both sides.
    active_cm: Arc<CmChannel>,
}

/// Connection-management events, one channel per endpoint.
pub enum CmEvent {
    ConnectRequest(Arc<PendingConnect>),
    Established { qp_num: u32 },
}

pub struct CmChannel {
    queue: SegQueue<CmEvent>,
}

impl CmChannel {
    fn new() -> Arc<CmChannel> {
        Arc::new(CmChannel { queue: SegQueue::new() })
    }

    pub fn poll(&self) -> Option<CmEvent> {
        self.queue.pop()
    }

    fn push(&self, event: CmEvent) {
        self.queue.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The peer half of an established queue pair.
#[derive(Clone)]
struct PeerLink {
    qp_num: u32,
    cq: Arc<CompletionQueue>,
    srq: Arc<SharedReceiveQueue>,
    alive: Arc<AtomicBool>,
}

/// A reliable, ordered queue pair.
pub struct QueuePair {
    qp_num: u32,
    path_mtu: u32,
    cq: Arc<CompletionQueue>,
    srq: Arc<SharedReceiveQueue>,
    peer: Mutex<Option<PeerLink>>,
    alive: Arc<AtomicBool>,
    /// Connection parameters recorded at establishment; retries are
    /// meaningless in process but back-ends honor them.
    pub rnr_retry_count: u8,
    pub initiator_depth: u8,
}

impl QueuePair {
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Active path MTU, the input to segment-size negotiation.
    pub fn path_mtu(&self) -> u32 {
        self.path_mtu
    }

    /// Post a short message toward the peer.
    ///
    /// `src`/`len` name the registered staging buffer; `imm` is the
    /// network-order immediate header. Both sides observe a completion:
    /// the peer a `Recv` into one of its shared receive buffers, we a
    /// signaled `Send`. An exhausted peer receive pool completes locally
    /// as receiver-not-ready.
    pub fn post_send(&self, wr_id: u64, src: *const u8, len: u32, imm: Option<u32>) -> Result<(), Status> {
        let peer = match &*self.peer.lock() {
            Some(link) if link.alive.load(Ordering::Acquire) => link.clone(),
            _ => return Err(Status::Disconnected),
        };

        match peer.srq.pop() {
            Some(recv) => {
                let copied = len.min(recv.len);
                if copied > 0 {
                    // SAFETY: src is a posted descriptor buffer of at least
                    // `len` bytes; recv.addr is a posted receive buffer of at
                    // least `recv.len` bytes. Both stay valid while posted.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            src,
                            recv.addr as *mut u8,
                            copied as usize,
                        );
                    }
                }
                peer.cq.push(Completion {
                    wr_id: recv.wr_id,
                    opcode: CqOpcode::Recv,
                    status: CqStatus::Success,
                    byte_len: copied,
                    imm,
                    qp_num: peer.qp_num,
                });
                self.cq.push(Completion {
                    wr_id,
                    opcode: CqOpcode::Send,
                    status: CqStatus::Success,
                    byte_len: len,
                    imm: None,
                    qp_num: self.qp_num,
                });
            }
            None => {
                self.cq.push(Completion {
                    wr_id,
                    opcode: CqOpcode::Send,
                    status: CqStatus::RnrRetryExceeded,
                    byte_len: len,
                    imm: None,
                    qp_num: self.qp_num,
                });
            }
        }
        Ok(())
    }

    /// Tear down this side of the pair. The peer sees `Disconnected` on
    /// subsequent posts.
    pub fn unlink(&self) {
        self.alive.store(false, Ordering::Release);
        *self.peer.lock() = None;
    }

    pub fn is_linked(&self) -> bool {
        self.peer.lock().is_some()
    }
}

struct FabricState {
    listeners: HashMap<SocketAddr, Weak<CmChannel>>,
    regions: HashMap<u32, RegionEntry>,
}

/// The in-process fabric instance shared by all devices of a transport.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    adapters: Vec<Adapter>,
    state: Mutex<FabricState>,
    path_mtu: u32,
    next_qp: AtomicU32,
    next_key: AtomicU32,
    next_port: AtomicU16,
}

impl LoopbackFabric {
    /// A fabric with one default adapter and a 4096-byte path MTU.
    pub fn new() -> LoopbackFabric {
        LoopbackFabric::with_path_mtu(4096)
    }

    /// A fabric whose established connections report the given path MTU;
    /// used to exercise segment-size negotiation.
    pub fn with_path_mtu(path_mtu: u32) -> LoopbackFabric {
        let adapters = vec![Adapter {
            name: "roce0".to_string(),
            ip: Ipv4Addr::LOCALHOST,
            max_mtu: 4096,
            rate: 100_000_000_000,
        }];
        LoopbackFabric::with_adapters(adapters, path_mtu)
    }

    pub fn with_adapters(adapters: Vec<Adapter>, path_mtu: u32) -> LoopbackFabric {
        LoopbackFabric {
            inner: Arc::new(FabricInner {
                adapters,
                state: Mutex::new(FabricState {
                    listeners: HashMap::new(),
                    regions: HashMap::new(),
                }),
                path_mtu,
                next_qp: AtomicU32::new(1),
                next_key: AtomicU32::new(1),
                next_port: AtomicU16::new(49152),
            }),
        }
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.inner.adapters
    }

    pub fn create_cq(&self, capacity: usize) -> Arc<CompletionQueue> {
        CompletionQueue::new(capacity)
    }

    pub fn create_srq(&self) -> Arc<SharedReceiveQueue> {
        SharedReceiveQueue::new()
    }

    pub fn create_cm_channel(&self) -> Arc<CmChannel> {
        CmChannel::new()
    }

    /// Bind a rendezvous listener; port 0 draws an ephemeral port.
    pub fn bind(
        &self,
        ip: Ipv4Addr,
        port: u16,
        cm: &Arc<CmChannel>,
    ) -> Result<SocketAddr, Status> {
        let mut state = self.inner.state.lock();
        let addr = if port == 0 {
            loop {
                let candidate = SocketAddr::new(
                    ip.into(),
                    self.inner.next_port.fetch_add(1, Ordering::Relaxed),
                );
                match state.listeners.get(&candidate) {
                    Some(existing) if existing.strong_count() > 0 => continue,
                    _ => break candidate,
                }
            }
        } else {
            let addr = SocketAddr::new(ip.into(), port);
            if matches!(state.listeners.get(&addr), Some(existing) if existing.strong_count() > 0)
            {
                return Err(Status::Busy);
            }
            addr
        };
        state.listeners.insert(addr, Arc::downgrade(cm));
        Ok(addr)
    }

    pub fn unbind(&self, addr: SocketAddr) {
        self.inner.state.lock().listeners.remove(&addr);
    }

    /// Create a queue pair bound to the endpoint's CQ and SRQ.
    pub fn create_qp(
        &self,
        cq: &Arc<CompletionQueue>,
        srq: &Arc<SharedReceiveQueue>,
    ) -> Arc<QueuePair> {
        Arc::new(QueuePair {
            qp_num: self.inner.next_qp.fetch_add(1, Ordering::Relaxed),
            path_mtu: self.inner.path_mtu,
            cq: cq.clone(),
            srq: srq.clone(),
            peer: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(true)),
            rnr_retry_count: 7,
            initiator_depth: 16,
        })
    }

    /// Rendezvous with a listener, carrying the request header as private
    /// data. A missing listener delivers nothing; the initiator's connect
    /// timeout is the backstop, as on a real CM.
    pub fn connect(
        &self,
        qp: &Arc<QueuePair>,
        cm: &Arc<CmChannel>,
        addr: SocketAddr,
        private_data: u32,
    ) -> Result<(), Status> {
        let listener = {
            let state = self.inner.state.lock();
            state.listeners.get(&addr).and_then(|weak| weak.upgrade())
        };
        match listener {
            Some(peer_cm) => {
                peer_cm.push(CmEvent::ConnectRequest(Arc::new(PendingConnect {
                    private_data,
                    active_qp: qp.clone(),
                    active_cm: cm.clone(),
                })));
                Ok(())
            }
            None => {
                debug!("no listener at {}, connect will time out", addr);
                Ok(())
            }
        }
    }

    /// Fabric-level accept: link the passive queue pair to the initiator's
    /// and notify both connection-management channels.
    pub fn accept(
        &self,
        pending: &PendingConnect,
        passive_qp: &Arc<QueuePair>,
        passive_cm: &Arc<CmChannel>,
    ) -> Result<(), Status> {
        let active = &pending.active_qp;
        if !active.alive.load(Ordering::Acquire) {
            return Err(Status::Disconnected);
        }
        *active.peer.lock() = Some(PeerLink {
            qp_num: passive_qp.qp_num,
            cq: passive_qp.cq.clone(),
            srq: passive_qp.srq.clone(),
            alive: passive_qp.alive.clone(),
        });
        *passive_qp.peer.lock() = Some(PeerLink {
            qp_num: active.qp_num,
            cq: active.cq.clone(),
            srq: active.srq.clone(),
            alive: active.alive.clone(),
        });
        passive_cm.push(CmEvent::Established { qp_num: passive_qp.qp_num });
        pending.active_cm.push(CmEvent::Established { qp_num: active.qp_num });
        Ok(())
    }

    /// Register a memory range and mint its keys.
    pub fn register(&self, base: u64, len: u64) -> MemoryRegion {
        let lkey = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let rkey = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().regions.insert(rkey, RegionEntry { base, len });
        MemoryRegion { base, len, lkey, rkey }
    }

    pub fn deregister(&self, rkey: u32) {
        self.inner.state.lock().regions.remove(&rkey);
    }

    /// Post a one-sided transfer.
    ///
    /// The outcome always arrives as a completion on the initiator's CQ,
    /// never synchronously, matching the fabric-acknowledgement contract.
    #[allow(clippy::too_many_arguments)]
    pub fn rdma(
        &self,
        qp: &Arc<QueuePair>,
        wr_id: u64,
        local_addr: u64,
        len: u64,
        remote_addr: u64,
        rkey: u32,
        write: bool,
        _fence: bool,
    ) {
        let opcode = if write { CqOpcode::RdmaWrite } else { CqOpcode::RdmaRead };
        let alive = qp.peer.lock().as_ref().map(|p| p.alive.load(Ordering::Acquire));
        if alive != Some(true) {
            qp.cq.push(Completion {
                wr_id,
                opcode,
                status: CqStatus::Flushed,
                byte_len: 0,
                imm: None,
                qp_num: qp.qp_num,
            });
            return;
        }

        let entry = self.inner.state.lock().regions.get(&rkey).copied();
        let valid = entry
            .map(|region| {
                remote_addr >= region.base
                    && remote_addr.saturating_add(len) <= region.base.saturating_add(region.len)
            })
            .unwrap_or(false);
        if !valid {
            debug!("rdma access fault: rkey {} addr {:#x} len {}", rkey, remote_addr, len);
            qp.cq.push(Completion {
                wr_id,
                opcode,
                status: CqStatus::RemoteAccessError,
                byte_len: 0,
                imm: None,
                qp_num: qp.qp_num,
            });
            return;
        }

        // SAFETY: both ranges are inside registered regions whose owners
        // guarantee validity for the life of the registration.
        unsafe {
            if write {
                std::ptr::copy_nonoverlapping(
                    local_addr as *const u8,
                    remote_addr as *mut u8,
                    len as usize,
                );
            } else {
                std::ptr::copy_nonoverlapping(
                    remote_addr as *const u8,
                    local_addr as *mut u8,
                    len as usize,
                );
            }
        }
        qp.cq.push(Completion {
            wr_id,
            opcode,
            status: CqStatus::Success,
            byte_len: len as u32,
            imm: None,
            qp_num: qp.qp_num,
        });
    }
}

impl Default for LoopbackFabric {
    fn default() -> LoopbackFabric {
        LoopbackFabric::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::work_id;

    fn linked_pair(
        fabric: &LoopbackFabric,
    ) -> (Arc<QueuePair>, Arc<QueuePair>, Arc<CompletionQueue>, Arc<CompletionQueue>, Arc<SharedReceiveQueue>)
    {
        let cq_a = fabric.create_cq(32);
        let cq_b = fabric.create_cq(32);
        let srq_a = fabric.create_srq();
        let srq_b = fabric.create_srq();
        let cm_a = fabric.create_cm_channel();
        let cm_b = fabric.create_cm_channel();
        let qp_a = fabric.create_qp(&cq_a, &srq_a);
        let qp_b = fabric.create_qp(&cq_b, &srq_b);
        let pending =
            PendingConnect { private_data: 0, active_qp: qp_a.clone(), active_cm: cm_a };
        fabric.accept(&pending, &qp_b, &cm_b).unwrap();
        (qp_a, qp_b, cq_a, cq_b, srq_b)
    }

    #[test]
    fn send_completes_on_both_sides_in_order() {
        let fabric = LoopbackFabric::new();
        let (qp_a, qp_b, cq_a, cq_b, srq_b) = linked_pair(&fabric);

        let mut dst = [[0u8; 16]; 2];
        for (i, buf) in dst.iter_mut().enumerate() {
            srq_b.post(PostedRecv { wr_id: work_id::rx(i as u32), addr: buf.as_mut_ptr() as u64, len: 16 });
        }
        qp_a.post_send(work_id::tx(0), b"first".as_ptr(), 5, Some(7)).unwrap();
        qp_a.post_send(work_id::tx(1), b"second".as_ptr(), 6, Some(8)).unwrap();

        let mut recv = Vec::new();
        assert_eq!(cq_b.poll(&mut recv, 8), 2);
        assert_eq!(recv[0].imm, Some(7));
        assert_eq!(recv[0].qp_num, qp_b.qp_num());
        assert_eq!(&dst[0][..5], b"first");
        assert_eq!(&dst[1][..6], b"second");

        let mut sent = Vec::new();
        assert_eq!(cq_a.poll(&mut sent, 8), 2);
        assert_eq!(sent[0].wr_id, work_id::tx(0));
        assert_eq!(sent[1].wr_id, work_id::tx(1));
        assert_eq!(sent[0].qp_num, qp_a.qp_num());
    }

    #[test]
    fn exhausted_receive_pool_reports_rnr() {
        let fabric = LoopbackFabric::new();
        let (qp_a, _qp_b, cq_a, _cq_b, _srq_b) = linked_pair(&fabric);
        qp_a.post_send(work_id::tx(0), b"x".as_ptr(), 1, None).unwrap();
        let mut out = Vec::new();
        cq_a.poll(&mut out, 8);
        assert_eq!(out[0].status, CqStatus::RnrRetryExceeded);
    }

    #[test]
    fn unlinked_pair_refuses_posts() {
        let fabric = LoopbackFabric::new();
        let (qp_a, qp_b, _cq_a, _cq_b, _srq) = linked_pair(&fabric);
        qp_b.unlink();
        assert_eq!(qp_a.post_send(0, b"x".as_ptr(), 1, None).unwrap_err(), Status::Disconnected);
    }

    #[test]
    fn rdma_write_faults_outside_the_region() {
        let fabric = LoopbackFabric::new();
        let (qp_a, _qp_b, cq_a, _cq_b, _srq) = linked_pair(&fabric);

        let mut target = vec![0u8; 64];
        let region = fabric.register(target.as_mut_ptr() as u64, 64);
        let src = vec![9u8; 64];

        fabric.rdma(&qp_a, work_id::rma(0), src.as_ptr() as u64, 64, region.base, region.rkey, true, false);
        let mut out = Vec::new();
        cq_a.poll(&mut out, 8);
        assert_eq!(out[0].status, CqStatus::Success);
        assert_eq!(target, src);

        // One byte past the end faults.
        out.clear();
        fabric.rdma(&qp_a, work_id::rma(1), src.as_ptr() as u64, 64, region.base + 1, region.rkey, true, false);
        cq_a.poll(&mut out, 8);
        assert_eq!(out[0].status, CqStatus::RemoteAccessError);

        // Deregistered keys fault too.
        out.clear();
        fabric.deregister(region.rkey);
        fabric.rdma(&qp_a, work_id::rma(2), src.as_ptr() as u64, 64, region.base, region.rkey, true, false);
        cq_a.poll(&mut out, 8);
        assert_eq!(out[0].status, CqStatus::RemoteAccessError);
    }

    #[test]
    fn explicit_port_conflicts_report_busy() {
        let fabric = LoopbackFabric::new();
        let cm_a = fabric.create_cm_channel();
        let cm_b = fabric.create_cm_channel();
        let ip = Ipv4Addr::LOCALHOST;
        fabric.bind(ip, 6000, &cm_a).unwrap();
        assert_eq!(fabric.bind(ip, 6000, &cm_b).unwrap_err(), Status::Busy);
        let ephemeral = fabric.bind(ip, 0, &cm_b).unwrap();
        assert_ne!(ephemeral.port(), 6000);
    }
}
