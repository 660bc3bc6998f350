//! # Fabric-Backed Transport
//!
//! The `verbs` transport drives the loopback fabric the way an RDMA
//! back-end drives hardware: one completion queue and one shared receive
//! queue per endpoint, a queue pair per connection, and a 32-bit immediate
//! header on every short message.
//!
//! ## Connection Handshake (four-way)
//!
//! 1. The initiator sends a **ConnRequest** — only the header, as
//!    out-of-band private data on the rendezvous path.
//! 2. The passive side accepts at fabric level (creating the remote queue
//!    pair) and waits.
//! 3. On its establishment notice the initiator sends **ConnPayload**,
//!    carrying the requested attribute and the user payload.
//! 4. The application accepts or rejects; **ConnReply** carries the
//!    verdict, and the initiator delivers exactly one ConnectAccepted or
//!    ConnectRejected event.
//!
//! ## Completion Path
//!
//! A progress tick alternates one bounded completion-queue batch with one
//! CM poll. Receives classify by header kind and find their connection
//! through the endpoint's queue-pair-number map; send completions classify
//! by the transmit descriptor's stored kind, so protocol messages recycle
//! silently while user sends surface as events.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{DeviceProfile, DeviceSpec};
use crate::conn::{ConnAttribute, ConnCore, ConnInner, ConnState, Connection};
use crate::device::Device;
use crate::endpoint::{self, EndpointInner, EpState};
use crate::error::Status;
use crate::event::{DescRef, EventData, EventKind, EventRecord, RawSlice};
use crate::fabric::loopback::{
    CmChannel, CmEvent, CompletionQueue, LoopbackFabric, MemoryRegion, PendingConnect,
    PostedRecv, QueuePair, SharedReceiveQueue,
};
use crate::fabric::{work_id, Completion, CqOpcode, CqStatus, WorkRef, WC_BATCH};
use crate::plugin::{Transport, TransportDescriptor, ABI_VERSION};
use crate::rma::{RmaOp, RmaRemote};
use crate::slab::Slab;
use crate::wire::{self, Header, MsgKind, ReplyOutcome, RmaRemoteInfo};
use crate::{defaults, Flags};

/// Tag the `transport=` directive names.
pub const VERBS_TAG: &str = "verbs";

/// Transport-private device state.
struct VerbsDev {
    ip: Ipv4Addr,
    port: u16,
}

/// Transport-private endpoint state: the fabric objects.
struct VerbsEp {
    cq: Arc<CompletionQueue>,
    srq: Arc<SharedReceiveQueue>,
    cm: Arc<CmChannel>,
    addr: SocketAddr,
    tx_mr: MemoryRegion,
    rx_mr: MemoryRegion,
    /// Alternates the progress tick between CM and CQ polls.
    poll_cq_next: AtomicBool,
}

/// Transport-private connection state.
struct VerbsConn {
    qp: Arc<QueuePair>,
}

fn conn_qp(conn: &Arc<ConnInner>) -> Option<Arc<QueuePair>> {
    let core = conn.core.lock();
    core.priv_state
        .as_ref()
        .and_then(|p| p.downcast_ref::<VerbsConn>())
        .map(|v| v.qp.clone())
}

pub struct VerbsTransport {
    descriptor: TransportDescriptor,
    fabric: LoopbackFabric,
}

impl VerbsTransport {
    pub fn new() -> VerbsTransport {
        VerbsTransport::with_fabric(LoopbackFabric::new())
    }

    /// Build against a specific fabric instance (tests use this to shape
    /// path MTU and adapters).
    pub fn with_fabric(fabric: LoopbackFabric) -> VerbsTransport {
        VerbsTransport {
            descriptor: TransportDescriptor {
                abi_version: ABI_VERSION,
                api_version: (1, 0, 0),
                name: VERBS_TAG,
                priority: 50,
            },
            fabric,
        }
    }

    pub fn fabric(&self) -> &LoopbackFabric {
        &self.fabric
    }

    fn vep<'a>(&self, ep: &'a Arc<EndpointInner>) -> Result<&'a VerbsEp, Status> {
        ep.priv_state::<VerbsEp>().ok_or(Status::InvalidArgument)
    }

    /// Post (or re-post) a receive descriptor to the shared receive queue.
    fn post_rx(&self, ep: &Arc<EndpointInner>, vep: &VerbsEp, rx_index: u32) {
        let offset = rx_index as usize * ep.max_send_size as usize;
        vep.srq.post(PostedRecv {
            wr_id: work_id::rx(rx_index),
            addr: ep.rx_ptr(offset) as u64,
            len: ep.max_send_size,
        });
    }

    /// Pull an idle transmit descriptor and stamp it for a protocol or
    /// user message. Returns the descriptor index and its buffer offset.
    #[allow(clippy::too_many_arguments)]
    fn take_tx(
        &self,
        state: &mut EpState,
        kind: MsgKind,
        flags: Flags,
        context: u64,
        conn: Option<usize>,
        len: u32,
        silent: bool,
    ) -> Result<(u32, usize), Status> {
        let index = match state.idle_txs.pop() {
            Some(index) => index,
            None => {
                debug!("no idle transmit descriptors");
                return Err(Status::NoBuffer);
            }
        };
        let tx = &mut state.txs[index as usize];
        tx.kind = kind;
        tx.flags = flags;
        tx.context = context;
        tx.conn = conn;
        tx.len = len;
        tx.silent = silent;
        Ok((index, tx.offset))
    }

    // ---- CM event handling -------------------------------------------------

    /// A peer is trying to connect. Always accept at fabric level and let
    /// it send the full request as a regular message.
    fn handle_conn_request(
        &self,
        ep: &Arc<EndpointInner>,
        vep: &VerbsEp,
        pending: &Arc<PendingConnect>,
    ) {
        let header = Header::from_wire(pending.private_data);
        if header.kind() != Some(MsgKind::ConnRequest) {
            warn!("connect request with bad private data {:#x}, dropping", pending.private_data);
            return;
        }

        let qp = self.fabric.create_qp(&vep.cq, &vep.srq);
        let conn = {
            let mut state = ep.state.lock();
            let id = state.conns.len();
            let mut core = ConnCore::new(ConnAttribute::ReliableOrdered);
            core.state = ConnState::Passive;
            core.priv_state = Some(Box::new(VerbsConn { qp: qp.clone() }));
            let conn = Arc::new(ConnInner::new(Arc::downgrade(ep), id, core));
            state.add_conn(conn.clone());
            state.passive.push(id);
            state.qp_index.insert(qp.qp_num(), id);
            conn
        };

        if let Err(status) = self.fabric.accept(pending, &qp, &vep.cm) {
            warn!("fabric accept failed: {}", status);
            let mut state = ep.state.lock();
            EpState::remove_from(&mut state.passive, conn.id);
            state.qp_index.remove(&qp.qp_num());
            state.conns[conn.id] = None;
        }
    }

    /// Establishment notice. The active side answers with its ConnPayload;
    /// the passive side has nothing to do; a duplicate notice is ignored.
    fn handle_established(&self, ep: &Arc<EndpointInner>, qp_num: u32) {
        let (payload, post): (Vec<u8>, Option<(Arc<QueuePair>, u32, usize, Header)>) = {
            let mut state = ep.state.lock();
            let (_, conn) = match state.conn_by_qp(qp_num) {
                Some(found) => found,
                None => {
                    debug!("establishment notice for unknown qp {}", qp_num);
                    return;
                }
            };
            let mut core = conn.core.lock();
            match core.state {
                ConnState::Active => {}
                ConnState::Passive | ConnState::Established => return,
                other => {
                    debug!("establishment notice in state {}", other.as_str());
                    return;
                }
            }
            let qp = match core
                .priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<VerbsConn>())
                .map(|v| v.qp.clone())
            {
                Some(qp) => qp,
                None => return,
            };
            core.mss = ep.max_send_size.min(qp.path_mtu());

            let request = match core.conn_req.as_ref() {
                Some(request) => request,
                None => return,
            };
            let payload = request.data.clone();
            let header = match Header::conn_payload(request.attr.to_bits(), payload.len()) {
                Ok(header) => header,
                Err(_) => return,
            };
            let conn_id = conn.id;
            drop(core);

            let (tx_index, offset) = match self.take_tx(
                &mut state,
                MsgKind::ConnPayload,
                Flags::empty(),
                0,
                Some(conn_id),
                payload.len() as u32,
                true,
            ) {
                Ok(tx) => tx,
                Err(status) => {
                    warn!("no tx for conn payload: {}", status);
                    return;
                }
            };
            (payload, Some((qp, tx_index, offset, header)))
        };

        if let Some((qp, tx_index, offset, header)) = post {
            if !payload.is_empty() {
                // SAFETY: the descriptor was just drawn from the idle list,
                // so its range is exclusively ours.
                unsafe {
                    ep.tx_slab.as_ref().expect("verbs endpoint has tx slab").write(offset, &payload)
                };
            }
            let result = qp.post_send(
                work_id::tx(tx_index),
                ep.tx_ptr(offset),
                payload.len() as u32,
                Some(header.to_wire()),
            );
            if let Err(status) = result {
                warn!("posting conn payload failed: {}", status);
                ep.state.lock().idle_txs.push(tx_index);
            }
        }
    }

    fn poll_cm(&self, ep: &Arc<EndpointInner>, vep: &VerbsEp) -> bool {
        match vep.cm.poll() {
            Some(CmEvent::ConnectRequest(pending)) => {
                self.handle_conn_request(ep, vep, &pending);
                true
            }
            Some(CmEvent::Established { qp_num }) => {
                self.handle_established(ep, qp_num);
                true
            }
            None => false,
        }
    }

    // ---- receive-side completion handling ----------------------------------

    fn handle_conn_payload(
        &self,
        ep: &Arc<EndpointInner>,
        vep: &VerbsEp,
        completion: &Completion,
        header: Header,
        rx_index: u32,
    ) {
        let mut state = ep.state.lock();
        let found = state.conn_by_qp(completion.qp_num).filter(|(id, _)| {
            state.passive.contains(id)
        });
        let (conn_id, conn) = match found {
            Some(found) => found,
            None => {
                warn!("no passive conn for payload from qp {}", completion.qp_num);
                drop(state);
                self.post_rx(ep, vep, rx_index);
                return;
            }
        };
        EpState::remove_from(&mut state.passive, conn_id);

        let (attr_bits, len) = header.conn_payload_fields();
        if len as u32 != completion.byte_len {
            warn!("conn payload length {} != wire length {}", len, completion.byte_len);
        }
        let attr = match ConnAttribute::from_bits(attr_bits) {
            Some(attr) => attr,
            None => {
                warn!("unknown connection attribute {}, assuming reliable ordered", attr_bits);
                ConnAttribute::ReliableOrdered
            }
        };
        conn.core.lock().attr = attr;

        let offset = state.rxs[rx_index as usize].offset;
        let data = EventData::Raw(RawSlice::new(ep.rx_ptr(offset), len));
        endpoint::enqueue_event(
            &mut state,
            &ep.wakeup,
            EventRecord {
                kind: EventKind::ConnectRequest { attr, data },
                conn: Some(conn),
                desc: DescRef::Rx(rx_index),
                blocking: false,
            },
        );
    }

    fn handle_conn_reply(
        &self,
        ep: &Arc<EndpointInner>,
        vep: &VerbsEp,
        completion: &Completion,
        header: Header,
        rx_index: u32,
    ) {
        let mut state = ep.state.lock();
        // The reply answers our own request, so the connection waits on the
        // active list.
        let found = state
            .conn_by_qp(completion.qp_num)
            .filter(|(id, _)| state.active.contains(id));
        let (conn_id, conn) = match found {
            Some(found) => found,
            None => {
                warn!("no active conn for reply from qp {}", completion.qp_num);
                drop(state);
                self.post_rx(ep, vep, rx_index);
                return;
            }
        };
        EpState::remove_from(&mut state.active, conn_id);

        let kind = match header.reply_outcome() {
            Some(ReplyOutcome::Accepted) => {
                let mut core = conn.core.lock();
                let context = core.conn_req.as_ref().map(|r| r.context).unwrap_or(0);
                if let Some(qp) = core
                    .priv_state
                    .as_ref()
                    .and_then(|p| p.downcast_ref::<VerbsConn>())
                    .map(|v| v.qp.clone())
                {
                    // The initiator learns the negotiated segment size from
                    // its own queue pair's path MTU.
                    core.mss = ep.max_send_size.min(qp.path_mtu());
                }
                core.state = ConnState::Established;
                core.deadline = None;
                drop(core);
                state.established.push(conn_id);
                EventKind::ConnectAccepted { context }
            }
            Some(ReplyOutcome::Rejected) => {
                let mut core = conn.core.lock();
                let context = core.conn_req.as_ref().map(|r| r.context).unwrap_or(0);
                core.state = ConnState::Closing;
                core.deadline = None;
                drop(core);
                state.qp_index.remove(&completion.qp_num);
                EventKind::ConnectRejected { context, status: Status::PeerRejectedConnect }
            }
            None => {
                warn!("invalid conn reply outcome in header");
                drop(state);
                self.post_rx(ep, vep, rx_index);
                return;
            }
        };

        endpoint::enqueue_event(
            &mut state,
            &ep.wakeup,
            EventRecord { kind, conn: Some(conn), desc: DescRef::Rx(rx_index), blocking: false },
        );
    }

    fn handle_msg(
        &self,
        ep: &Arc<EndpointInner>,
        vep: &VerbsEp,
        completion: &Completion,
        rx_index: u32,
    ) {
        let mut state = ep.state.lock();
        let found = state
            .conn_by_qp(completion.qp_num)
            .filter(|(id, _)| state.established.contains(id));
        let (_, conn) = match found {
            Some(found) => found,
            None => {
                warn!("no conn for message from qp {}", completion.qp_num);
                drop(state);
                self.post_rx(ep, vep, rx_index);
                return;
            }
        };
        {
            let mut core = conn.core.lock();
            core.last_recv = Instant::now();
            core.keepalive_fired = false;
        }

        let offset = state.rxs[rx_index as usize].offset;
        let data =
            EventData::Raw(RawSlice::new(ep.rx_ptr(offset), completion.byte_len as usize));
        endpoint::enqueue_event(
            &mut state,
            &ep.wakeup,
            EventRecord {
                kind: EventKind::Recv { data },
                conn: Some(conn),
                desc: DescRef::Rx(rx_index),
                blocking: false,
            },
        );
    }

    /// The peer wants the address and rkey behind one of our region
    /// handles.
    fn handle_remote_request(
        &self,
        ep: &Arc<EndpointInner>,
        vep: &VerbsEp,
        completion: &Completion,
        rx_index: u32,
    ) {
        let post = {
            let mut state = ep.state.lock();
            let offset = state.rxs[rx_index as usize].offset;
            // SAFETY: the rx descriptor is ours until re-posted below.
            let body = unsafe {
                ep.rx_slab
                    .as_ref()
                    .expect("verbs endpoint has rx slab")
                    .slice(offset, completion.byte_len as usize)
            };
            let handle = match wire::decode_rma_request(body) {
                Ok(handle) => handle,
                Err(_) => {
                    warn!("malformed rma remote request ({} bytes)", completion.byte_len);
                    return self.finish_rx(ep, vep, rx_index);
                }
            };

            let found = state
                .conn_by_qp(completion.qp_num)
                .filter(|(id, _)| state.established.contains(id));
            let conn = match found {
                Some((_, conn)) => conn,
                None => {
                    warn!("no conn for remote request from qp {}", completion.qp_num);
                    return self.finish_rx(ep, vep, rx_index);
                }
            };

            let info = match state.regions.resolve(handle) {
                Some(region) => RmaRemoteInfo {
                    remote_addr: region.start,
                    rkey: region.rkey,
                    handle,
                },
                None => {
                    // Answer anyway with a null key; the initiator surfaces
                    // the failure as a remote error on its own operation.
                    warn!("remote request for unknown handle {:#x}", handle);
                    RmaRemoteInfo { remote_addr: 0, rkey: 0, handle }
                }
            };

            let body = wire::encode_rma_reply(&info);
            match self.take_tx(
                &mut state,
                MsgKind::RmaRemoteReply,
                Flags::empty(),
                0,
                Some(conn.id),
                body.len() as u32,
                true,
            ) {
                Ok((tx_index, tx_offset)) => {
                    // SAFETY: freshly drawn descriptor range.
                    unsafe {
                        ep.tx_slab
                            .as_ref()
                            .expect("verbs endpoint has tx slab")
                            .write(tx_offset, &body)
                    };
                    conn_qp(&conn).map(|qp| (qp, tx_index, tx_offset, body.len() as u32))
                }
                Err(status) => {
                    warn!("no tx for rma remote reply: {}", status);
                    None
                }
            }
        };

        if let Some((qp, tx_index, tx_offset, len)) = post {
            let header = Header::new(MsgKind::RmaRemoteReply);
            let result =
                qp.post_send(work_id::tx(tx_index), ep.tx_ptr(tx_offset), len, Some(header.to_wire()));
            if let Err(status) = result {
                warn!("posting rma remote reply failed: {}", status);
                ep.state.lock().idle_txs.push(tx_index);
            }
        }
        self.finish_rx(ep, vep, rx_index);
    }

    /// The peer answered a remote-handle request: cache the entry at the
    /// head of the MRU list and post every operation deferred on it.
    fn handle_remote_reply(
        &self,
        ep: &Arc<EndpointInner>,
        vep: &VerbsEp,
        completion: &Completion,
        rx_index: u32,
    ) {
        let ready: Vec<(u32, Arc<QueuePair>, u64, u64, u64, u32, bool, bool)> = {
            let mut state = ep.state.lock();
            let offset = state.rxs[rx_index as usize].offset;
            // SAFETY: rx descriptor owned until re-posted.
            let body = unsafe {
                ep.rx_slab
                    .as_ref()
                    .expect("verbs endpoint has rx slab")
                    .slice(offset, completion.byte_len as usize)
            };
            let info = match wire::decode_rma_reply(body) {
                Ok(info) => info,
                Err(_) => {
                    warn!("malformed rma remote reply ({} bytes)", completion.byte_len);
                    return self.finish_rx(ep, vep, rx_index);
                }
            };

            let found = state.conn_by_qp(completion.qp_num);
            let (conn_id, conn) = match found {
                Some(found) => found,
                None => {
                    warn!("no conn for remote reply from qp {}", completion.qp_num);
                    return self.finish_rx(ep, vep, rx_index);
                }
            };
            let remote =
                RmaRemote { handle: info.handle, remote_addr: info.remote_addr, rkey: info.rkey };
            conn.core.lock().insert_remote(remote);

            let qp = match conn_qp(&conn) {
                Some(qp) => qp,
                None => return self.finish_rx(ep, vep, rx_index),
            };

            let deferred = state.rma_ops.pending_for(info.handle, conn_id);
            let mut ready = Vec::with_capacity(deferred.len());
            for op_index in deferred {
                let local_addr = {
                    let op = state.rma_ops.get(op_index).expect("pending op");
                    match state.regions.resolve(op.local_handle) {
                        Some(region) => region.start + op.local_offset,
                        None => continue,
                    }
                };
                let op = state.rma_ops.get_mut(op_index).expect("pending op");
                op.pending = false;
                op.remote = Some(remote);
                ready.push((
                    op_index,
                    qp.clone(),
                    local_addr,
                    op.len,
                    remote.remote_addr + op.remote_offset,
                    remote.rkey,
                    op.write,
                    op.flags.contains(Flags::FENCE),
                ));
            }
            ready
        };

        for (op_index, qp, local_addr, len, remote_addr, rkey, write, fence) in ready {
            self.fabric.rdma(&qp, work_id::rma(op_index), local_addr, len, remote_addr, rkey, write, fence);
        }
        self.finish_rx(ep, vep, rx_index);
    }

    fn handle_peer_disconnect(&self, ep: &Arc<EndpointInner>, completion: &Completion) {
        let mut state = ep.state.lock();
        if let Some((conn_id, conn)) = state.conn_by_qp(completion.qp_num) {
            debug!("peer disconnected conn {}", conn_id);
            EpState::remove_from(&mut state.established, conn_id);
            state.qp_index.remove(&completion.qp_num);
            let mut core = conn.core.lock();
            core.state = ConnState::Closed;
            if let Some(qp) = core
                .priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<VerbsConn>())
                .map(|v| v.qp.clone())
            {
                qp.unlink();
            }
        }
    }

    /// Repost a receive descriptor consumed by a protocol-internal message.
    fn finish_rx(&self, ep: &Arc<EndpointInner>, vep: &VerbsEp, rx_index: u32) {
        if !ep.closing.load(Ordering::Acquire) {
            self.post_rx(ep, vep, rx_index);
        }
    }

    fn handle_recv(
        &self,
        ep: &Arc<EndpointInner>,
        vep: &VerbsEp,
        completion: &Completion,
        rx_index: u32,
    ) {
        if completion.status != CqStatus::Success {
            // A single bad receive does not tear the connection down.
            warn!("recv completed with {}, re-posting buffer", completion.status.as_str());
            self.finish_rx(ep, vep, rx_index);
            return;
        }
        let header = Header::from_wire(completion.imm.unwrap_or(0));
        match header.kind() {
            Some(MsgKind::ConnPayload) => {
                self.handle_conn_payload(ep, vep, completion, header, rx_index)
            }
            Some(MsgKind::ConnReply) => {
                self.handle_conn_reply(ep, vep, completion, header, rx_index)
            }
            Some(MsgKind::Send) => self.handle_msg(ep, vep, completion, rx_index),
            Some(MsgKind::RmaRemoteRequest) => {
                self.handle_remote_request(ep, vep, completion, rx_index)
            }
            Some(MsgKind::RmaRemoteReply) => {
                self.handle_remote_reply(ep, vep, completion, rx_index)
            }
            Some(MsgKind::Disconnect) => {
                self.handle_peer_disconnect(ep, completion);
                self.finish_rx(ep, vep, rx_index);
            }
            Some(MsgKind::Keepalive) => {
                let state = ep.state.lock();
                if let Some((_, conn)) = state.conn_by_qp(completion.qp_num) {
                    let mut core = conn.core.lock();
                    core.last_recv = Instant::now();
                    core.keepalive_fired = false;
                }
                drop(state);
                self.finish_rx(ep, vep, rx_index);
            }
            kind => {
                debug!("ignoring {} receive", kind.map(|k| k.as_str()).unwrap_or("unknown"));
                self.finish_rx(ep, vep, rx_index);
            }
        }
    }

    // ---- send-side completion handling -------------------------------------

    fn handle_send_completion(&self, ep: &Arc<EndpointInner>, completion: &Completion) {
        match work_id::decode(completion.wr_id) {
            WorkRef::None => {
                // Zero-length protocol post (conn reply, keepalive).
                if completion.status != CqStatus::Success {
                    debug!("control send completed with {}", completion.status.as_str());
                }
            }
            WorkRef::Tx(tx_index) => self.complete_tx(ep, completion, tx_index),
            WorkRef::RmaOp(op_index) => self.complete_rma(ep, completion, op_index),
            WorkRef::Rx(_) => {
                warn!("receive work id on the send path, wr_id {:#x}", completion.wr_id);
            }
        }
    }

    fn complete_tx(&self, ep: &Arc<EndpointInner>, completion: &Completion, tx_index: u32) {
        let mut state = ep.state.lock();
        let tx = &state.txs[tx_index as usize];
        let surfaced = tx.kind == MsgKind::Send && !tx.silent;
        if surfaced {
            let status = completion.status.to_status();
            let record = EventRecord {
                kind: EventKind::Send { context: tx.context, status },
                conn: tx.conn.and_then(|id| state.conn(id)),
                desc: DescRef::Tx(tx_index),
                blocking: tx.flags.contains(Flags::BLOCKING),
            };
            endpoint::enqueue_event(&mut state, &ep.wakeup, record);
        } else {
            // Protocol messages recycle silently.
            if completion.status != CqStatus::Success {
                warn!(
                    "{} send completed with {}",
                    tx.kind.as_str(),
                    completion.status.as_str()
                );
            }
            state.idle_txs.push(tx_index);
        }
    }

    fn complete_rma(&self, ep: &Arc<EndpointInner>, completion: &Completion, op_index: u32) {
        let status = completion.status.to_status();
        let notify = {
            let mut state = ep.state.lock();
            let (context, blocking, conn_id, msg) = match state.rma_ops.get_mut(op_index) {
                Some(op) => (
                    op.context,
                    op.flags.contains(Flags::BLOCKING),
                    op.conn,
                    if status == Status::Success { op.msg.take() } else { None },
                ),
                None => {
                    warn!("rma completion for unknown op {}", op_index);
                    return;
                }
            };
            let conn = state.conn(conn_id);
            endpoint::enqueue_event(
                &mut state,
                &ep.wakeup,
                EventRecord {
                    kind: EventKind::Send { context, status },
                    conn: conn.clone(),
                    desc: DescRef::RmaOp(op_index),
                    blocking,
                },
            );
            msg.zip(conn)
        };

        // The optional completion message goes out as an ordinary short
        // message once the transfer has finished locally; the peer observes
        // a plain Recv event.
        if let Some((msg, conn)) = notify {
            if let Err(status) = self.send_common(ep, &conn, &[&msg], 0, Flags::empty(), true) {
                warn!("rma completion message failed: {}", status);
            }
        }
    }

    // ---- progress ----------------------------------------------------------

    fn poll_cq(&self, ep: &Arc<EndpointInner>, vep: &VerbsEp) -> bool {
        let mut completions = Vec::with_capacity(WC_BATCH);
        if vep.cq.poll(&mut completions, WC_BATCH) == 0 {
            return false;
        }
        for completion in &completions {
            match completion.opcode {
                CqOpcode::Recv => {
                    let rx_index = match work_id::decode(completion.wr_id) {
                        WorkRef::Rx(index) => index,
                        other => {
                            warn!("recv completion with non-rx work id {:?}", other);
                            continue;
                        }
                    };
                    self.handle_recv(ep, vep, completion, rx_index);
                }
                CqOpcode::Send | CqOpcode::RdmaWrite | CqOpcode::RdmaRead => {
                    self.handle_send_completion(ep, completion);
                }
            }
        }
        true
    }

    /// Probe established connections and surface keepalive expiry.
    fn sweep_keepalive(&self, ep: &Arc<EndpointInner>) {
        let timeout = match ep.state.lock().keepalive_timeout {
            Some(timeout) => timeout,
            None => return,
        };
        let now = Instant::now();
        // Probes are posted after the endpoint lock is released.
        let mut probes: Vec<Arc<QueuePair>> = Vec::new();
        {
            let mut state = ep.state.lock();
            let established = state.established.clone();
            for conn_id in established {
                let conn = match state.conn(conn_id) {
                    Some(conn) => conn,
                    None => continue,
                };
                let mut core = conn.core.lock();
                if now.duration_since(core.last_recv) >= timeout {
                    if !core.keepalive_fired {
                        core.keepalive_fired = true;
                        drop(core);
                        endpoint::enqueue_event(
                            &mut state,
                            &ep.wakeup,
                            EventRecord {
                                kind: EventKind::KeepaliveTimedOut,
                                conn: Some(conn),
                                desc: DescRef::Conn,
                                blocking: false,
                            },
                        );
                    }
                } else if now.duration_since(core.last_send) >= timeout / 2 {
                    // Probe an idle connection so a healthy peer refreshes us.
                    core.last_send = now;
                    if let Some(qp) = core
                        .priv_state
                        .as_ref()
                        .and_then(|p| p.downcast_ref::<VerbsConn>())
                        .map(|v| v.qp.clone())
                    {
                        probes.push(qp);
                    }
                }
            }
        }
        for qp in probes {
            let header = Header::new(MsgKind::Keepalive);
            let _ = qp.post_send(work_id::NONE, std::ptr::null(), 0, Some(header.to_wire()));
        }
    }

    // ---- send --------------------------------------------------------------

    fn send_common(
        &self,
        ep: &Arc<EndpointInner>,
        conn: &Arc<ConnInner>,
        segments: &[&[u8]],
        context: u64,
        flags: Flags,
        silent: bool,
    ) -> Result<(), Status> {
        let total: usize = segments.iter().map(|s| s.len()).sum();

        let (qp, reliable) = {
            let core = conn.core.lock();
            match core.state {
                ConnState::Established => {}
                _ => return Err(Status::Disconnected),
            }
            if total > core.mss as usize {
                debug!("length {} > connection max send size {}", total, core.mss);
                return Err(Status::MessageTooLarge);
            }
            let qp = core
                .priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<VerbsConn>())
                .map(|v| v.qp.clone())
                .ok_or(Status::Disconnected)?;
            (qp, core.attr.is_reliable())
        };

        let (tx_index, offset) = {
            let mut state = ep.state.lock();
            self.take_tx(
                &mut state,
                MsgKind::Send,
                flags,
                context,
                Some(conn.id),
                total as u32,
                silent,
            )?
        };

        // Always copy into the descriptor's staging buffer; the caller's
        // memory is free the moment we return.
        let mut write_at = offset;
        for segment in segments {
            if !segment.is_empty() {
                // SAFETY: descriptor drawn from the idle list above.
                unsafe {
                    ep.tx_slab
                        .as_ref()
                        .expect("verbs endpoint has tx slab")
                        .write(write_at, segment)
                };
                write_at += segment.len();
            }
        }
        conn.core.lock().last_send = Instant::now();

        let header = Header::new(MsgKind::Send);
        let posted = qp.post_send(
            work_id::tx(tx_index),
            ep.tx_ptr(offset),
            total as u32,
            Some(header.to_wire()),
        );
        if let Err(status) = posted {
            // Sole failure-path release of the descriptor.
            ep.state.lock().idle_txs.push(tx_index);
            return Err(status);
        }

        if flags.contains(Flags::BLOCKING) && reliable && !silent {
            // Drain progress until our own completion shows up; it never
            // reaches get_event because the record is marked blocking.
            loop {
                self.progress(ep);
                if let Some(status) =
                    endpoint::take_blocking_event(ep, DescRef::Tx(tx_index))
                {
                    ep.state.lock().idle_txs.push(tx_index);
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

impl Default for VerbsTransport {
    fn default() -> VerbsTransport {
        VerbsTransport::new()
    }
}

impl Transport for VerbsTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    fn init(&self, specs: &[DeviceSpec], _auto_discover: bool) -> Result<Vec<Arc<Device>>, Status> {
        let adapters = self.fabric.adapters();
        let mut used = vec![false; adapters.len()];
        let mut devices = Vec::new();

        for spec in specs {
            let profile = DeviceProfile::parse(&spec.name, &spec.args);
            let selected = adapters.iter().enumerate().find(|(_, adapter)| {
                if let Some(ip) = profile.ip {
                    adapter.ip == ip
                } else if let Some(interface) = &profile.interface {
                    &adapter.name == interface
                } else if let Some(hca_id) = &profile.hca_id {
                    &adapter.name == hca_id
                } else {
                    true
                }
            });
            let (index, adapter) = match selected {
                Some(found) => found,
                None => {
                    warn!("device {}: no matching fabric adapter", spec.name);
                    continue;
                }
            };
            if used[index] {
                warn!("device {}: adapter {} already assigned", spec.name, adapter.name);
                continue;
            }
            used[index] = true;

            let max_send_size = profile.mss.unwrap_or(adapter.max_mtu);
            let mut device = Device::new(
                spec.name.clone(),
                VERBS_TAG.to_string(),
                max_send_size,
                adapter.rate,
                Box::new(VerbsDev {
                    ip: profile.ip.unwrap_or(adapter.ip),
                    port: profile.port.unwrap_or(0),
                }),
            );
            device.is_default = spec.is_default;
            devices.push(Arc::new(device));
        }
        Ok(devices)
    }

    fn create_endpoint(&self, device: &Arc<Device>) -> Result<Arc<EndpointInner>, Status> {
        let vdev = device.priv_state::<VerbsDev>().ok_or(Status::NoSuchDevice)?;
        let max_send_size = device.max_send_size;
        let tx_count = defaults::EP_TX_COUNT;
        let rx_count = defaults::EP_RX_COUNT;

        let cm = self.fabric.create_cm_channel();
        let cq = self.fabric.create_cq((tx_count + rx_count) as usize * 2);
        let srq = self.fabric.create_srq();
        let addr = self.fabric.bind(vdev.ip, vdev.port, &cm)?;
        let name = format!("{}://{}:{}", VERBS_TAG, addr.ip(), addr.port());

        let id = device.acquire_endpoint_id();
        let build = (|| {
            // Two page-aligned slabs back all descriptors; both are
            // registered with the fabric before any work is posted.
            let tx_slab =
                Slab::page_aligned(tx_count as usize * max_send_size as usize)?;
            let rx_slab =
                Slab::page_aligned(rx_count as usize * max_send_size as usize)?;
            let tx_mr = self.fabric.register(tx_slab.base() as u64, tx_slab.len() as u64);
            let rx_mr = self.fabric.register(rx_slab.base() as u64, rx_slab.len() as u64);

            let vep = VerbsEp {
                cq: cq.clone(),
                srq: srq.clone(),
                cm: cm.clone(),
                addr,
                tx_mr,
                rx_mr,
                poll_cq_next: AtomicBool::new(false),
            };
            EndpointInner::new(
                device.clone(),
                id,
                name.clone(),
                max_send_size,
                tx_count,
                rx_count,
                Some(tx_slab),
                Some(rx_slab),
                Box::new(vep),
            )
        })();

        let ep = match build {
            Ok(ep) => ep,
            Err(status) => {
                self.fabric.unbind(addr);
                device.release_endpoint_id(id);
                return Err(status);
            }
        };

        let vep = self.vep(&ep)?;
        for rx_index in 0..rx_count {
            self.post_rx(&ep, vep, rx_index);
        }
        debug!("created endpoint {} (id {})", ep.name, ep.id);
        Ok(ep)
    }

    fn destroy_endpoint(&self, ep: &Arc<EndpointInner>) -> Result<(), Status> {
        if ep.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let vep = self.vep(ep)?;

        // Drain whatever the fabric still holds; outstanding sends are
        // cancelled by the teardown, surfacing nowhere.
        let mut discard = Vec::new();
        while vep.cq.poll(&mut discard, WC_BATCH) > 0 {
            discard.clear();
        }
        while vep.cm.poll().is_some() {}

        let mut state = ep.state.lock();
        for conn in state.conns.iter().flatten() {
            let mut core = conn.core.lock();
            core.state = ConnState::Closed;
            if let Some(qp) = core
                .priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<VerbsConn>())
                .map(|v| v.qp.clone())
            {
                qp.unlink();
            }
        }
        state.active.clear();
        state.passive.clear();
        state.established.clear();
        state.qp_index.clear();
        for region in state.regions.drain() {
            self.fabric.deregister(region.rkey);
        }
        drop(state);

        self.fabric.unbind(vep.addr);
        self.fabric.deregister(vep.tx_mr.rkey);
        self.fabric.deregister(vep.rx_mr.rkey);
        ep.device.release_endpoint_id(ep.id);
        ep.device.untrack_endpoint(ep);
        debug!("destroyed endpoint {}", ep.name);
        Ok(())
    }

    fn progress(&self, ep: &Arc<EndpointInner>) {
        if ep.closing.load(Ordering::Acquire) {
            return;
        }
        let vep = match ep.priv_state::<VerbsEp>() {
            Some(vep) => vep,
            None => return,
        };
        // Alternate between the completion queue and the CM channel,
        // retrying the other side once when the first comes up empty.
        for _ in 0..2 {
            let poll_cq = vep.poll_cq_next.fetch_xor(true, Ordering::Relaxed);
            let found = if poll_cq { self.poll_cq(ep, vep) } else { self.poll_cm(ep, vep) };
            if found {
                break;
            }
        }
        endpoint::sweep_connect_timeouts(ep);
        self.sweep_keepalive(ep);
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
        let (host, port) = wire::parse_uri(uri, VERBS_TAG)?;
        let ip: Ipv4Addr = host.parse().map_err(|_| Status::InvalidArgument)?;
        if payload.len() > wire::MAX_CONN_PAYLOAD {
            return Err(Status::InvalidArgument);
        }
        let vep = self.vep(ep)?;
        let qp = self.fabric.create_qp(&vep.cq, &vep.srq);

        let conn = {
            let mut state = ep.state.lock();
            let id = state.conns.len();
            let mut core = ConnCore::new(attr);
            core.state = ConnState::Active;
            core.conn_req =
                Some(crate::conn::ConnRequestData { data: payload.to_vec(), context, attr });
            core.deadline =
                Some(Instant::now() + timeout.unwrap_or(defaults::CONNECT_TIMEOUT));
            core.priv_state = Some(Box::new(VerbsConn { qp: qp.clone() }));
            let conn = Arc::new(ConnInner::new(Arc::downgrade(ep), id, core));
            state.add_conn(conn.clone());
            state.active.push(id);
            state.qp_index.insert(qp.qp_num(), id);
            conn
        };

        let header = Header::new(MsgKind::ConnRequest);
        let result = self.fabric.connect(&qp, &vep.cm, SocketAddr::new(ip.into(), port), header.to_wire());
        if let Err(status) = result {
            let mut state = ep.state.lock();
            EpState::remove_from(&mut state.active, conn.id);
            state.qp_index.remove(&qp.qp_num());
            state.conns[conn.id] = None;
            return Err(status);
        }
        debug!("connecting to {}:{}", host, port);
        Ok(())
    }

    fn accept(
        &self,
        ep: &Arc<EndpointInner>,
        conn: &Arc<ConnInner>,
    ) -> Result<Connection, Status> {
        let qp = {
            let mut core = conn.core.lock();
            if core.state != ConnState::Passive {
                return Err(Status::InvalidArgument);
            }
            let qp = core
                .priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<VerbsConn>())
                .map(|v| v.qp.clone())
                .ok_or(Status::InvalidArgument)?;
            // Negotiated segment size comes from the fabric path MTU.
            core.mss = ep.max_send_size.min(qp.path_mtu());
            core.state = ConnState::Established;
            qp
        };
        ep.state.lock().established.push(conn.id);

        let header = Header::conn_reply(ReplyOutcome::Accepted);
        let posted = qp.post_send(work_id::NONE, std::ptr::null(), 0, Some(header.to_wire()));
        if let Err(status) = posted {
            let mut state = ep.state.lock();
            EpState::remove_from(&mut state.established, conn.id);
            conn.core.lock().state = ConnState::Passive;
            return Err(status);
        }
        Ok(Connection::from_inner(conn.clone()))
    }

    fn reject(&self, ep: &Arc<EndpointInner>, conn: &Arc<ConnInner>) -> Result<(), Status> {
        let qp = {
            let mut core = conn.core.lock();
            if core.state != ConnState::Passive {
                return Err(Status::InvalidArgument);
            }
            core.state = ConnState::Closing;
            core.priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<VerbsConn>())
                .map(|v| v.qp.clone())
                .ok_or(Status::InvalidArgument)?
        };
        let header = Header::conn_reply(ReplyOutcome::Rejected);
        qp.post_send(work_id::NONE, std::ptr::null(), 0, Some(header.to_wire()))?;
        ep.state.lock().qp_index.remove(&qp.qp_num());
        Ok(())
    }

    fn disconnect(&self, ep: &Arc<EndpointInner>, conn: &Arc<ConnInner>) -> Result<(), Status> {
        let qp = {
            let mut core = conn.core.lock();
            if matches!(core.state, ConnState::Closing | ConnState::Closed) {
                return Ok(());
            }
            core.state = ConnState::Closing;
            core.priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<VerbsConn>())
                .map(|v| v.qp.clone())
        };
        if let Some(qp) = qp {
            // Best effort notice, then tear the pair down.
            let header = Header::new(MsgKind::Disconnect);
            let _ = qp.post_send(work_id::NONE, std::ptr::null(), 0, Some(header.to_wire()));
            qp.unlink();
            let mut state = ep.state.lock();
            EpState::remove_from(&mut state.established, conn.id);
            EpState::remove_from(&mut state.active, conn.id);
            EpState::remove_from(&mut state.passive, conn.id);
            state.qp_index.remove(&qp.qp_num());
        }
        conn.core.lock().state = ConnState::Closed;
        Ok(())
    }

    fn return_event(&self, ep: &Arc<EndpointInner>, record: EventRecord) -> Result<(), Status> {
        match record.desc {
            DescRef::Rx(rx_index) => {
                // Connect outcomes release the request bookkeeping along
                // with their receive buffer.
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
                let vep = self.vep(ep)?;
                self.finish_rx(ep, vep, rx_index);
                Ok(())
            }
            DescRef::Tx(tx_index) => {
                ep.state.lock().idle_txs.push(tx_index);
                Ok(())
            }
            DescRef::RmaOp(op_index) => {
                let mut state = ep.state.lock();
                if let Some(op) = state.rma_ops.remove(op_index) {
                    state.regions.release_ref(op.local_handle);
                }
                Ok(())
            }
            DescRef::Conn => {
                if let Some(conn) = &record.conn {
                    conn.core.lock().conn_req = None;
                }
                Ok(())
            }
            DescRef::RingSlot(_) => Err(Status::InvalidArgument),
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
        self.send_common(ep, conn, segments, context, flags, false)
    }

    fn rma_register(
        &self,
        ep: &Arc<EndpointInner>,
        start: u64,
        length: u64,
    ) -> Result<u64, Status> {
        if start == 0 || length == 0 {
            return Err(Status::InvalidArgument);
        }
        let region = self.fabric.register(start, length);
        let handle =
            ep.state.lock().regions.insert(start, length, region.lkey, region.rkey);
        debug!("registered rma region {:#x} ({} bytes)", handle, length);
        Ok(handle)
    }

    fn rma_deregister(&self, ep: &Arc<EndpointInner>, handle: u64) -> Result<(), Status> {
        let region = ep.state.lock().regions.remove(handle)?;
        self.fabric.deregister(region.rkey);
        Ok(())
    }

    fn rma(
        &self,
        ep: &Arc<EndpointInner>,
        conn: &Arc<ConnInner>,
        msg: Option<&[u8]>,
        local_handle: u64,
        local_offset: u64,
        remote_handle: u64,
        remote_offset: u64,
        len: u64,
        context: u64,
        flags: Flags,
    ) -> Result<(), Status> {
        if len == 0 {
            return Err(Status::InvalidArgument);
        }
        let (qp, cached_remote) = {
            let core = conn.core.lock();
            if core.state != ConnState::Established {
                return Err(Status::Disconnected);
            }
            let qp = core
                .priv_state
                .as_ref()
                .and_then(|p| p.downcast_ref::<VerbsConn>())
                .map(|v| v.qp.clone())
                .ok_or(Status::Disconnected)?;
            (qp, None::<RmaRemote>)
        };
        // MRU lookup takes the connection lock mutably; done separately so
        // the state checks above stay read-mostly.
        let cached_remote =
            cached_remote.or_else(|| conn.core.lock().lookup_remote(remote_handle));

        let (op_index, local_addr, post) = {
            let mut state = ep.state.lock();
            let region = state.regions.resolve(local_handle).ok_or(Status::InvalidArgument)?;
            if local_offset.saturating_add(len) > region.len {
                return Err(Status::InvalidArgument);
            }
            let local_addr = region.start + local_offset;
            state.regions.add_ref(local_handle)?;

            let op = RmaOp {
                write: flags.contains(Flags::WRITE),
                local_handle,
                local_offset,
                remote_handle,
                remote_offset,
                len,
                context,
                flags,
                msg: msg.map(|m| m.to_vec()),
                remote: cached_remote,
                pending: cached_remote.is_none(),
                conn: conn.id,
            };
            let op_index = state.rma_ops.insert(op);

            let post = match cached_remote {
                Some(remote) => Some(Ok((remote, op_index))),
                None => {
                    // Ask the peer for the handle's address and key; the
                    // operation stays parked until the reply arrives.
                    let body = wire::encode_rma_request(remote_handle);
                    match self.take_tx(
                        &mut state,
                        MsgKind::RmaRemoteRequest,
                        Flags::empty(),
                        0,
                        Some(conn.id),
                        body.len() as u32,
                        true,
                    ) {
                        Ok((tx_index, offset)) => {
                            // SAFETY: freshly drawn descriptor range.
                            unsafe {
                                ep.tx_slab
                                    .as_ref()
                                    .expect("verbs endpoint has tx slab")
                                    .write(offset, &body)
                            };
                            Some(Err((tx_index, offset, body.len() as u32)))
                        }
                        Err(status) => {
                            state.rma_ops.remove(op_index);
                            state.regions.release_ref(local_handle);
                            return Err(status);
                        }
                    }
                }
            };
            (op_index, local_addr, post)
        };

        match post {
            Some(Ok((remote, op_index))) => {
                self.fabric.rdma(
                    &qp,
                    work_id::rma(op_index),
                    local_addr,
                    len,
                    remote.remote_addr + remote_offset,
                    remote.rkey,
                    flags.contains(Flags::WRITE),
                    flags.contains(Flags::FENCE),
                );
            }
            Some(Err((tx_index, offset, body_len))) => {
                let header = Header::new(MsgKind::RmaRemoteRequest);
                let posted = qp.post_send(
                    work_id::tx(tx_index),
                    ep.tx_ptr(offset),
                    body_len,
                    Some(header.to_wire()),
                );
                if let Err(status) = posted {
                    let mut state = ep.state.lock();
                    state.idle_txs.push(tx_index);
                    state.rma_ops.remove(op_index);
                    state.regions.release_ref(local_handle);
                    return Err(status);
                }
            }
            None => {}
        }

        if flags.contains(Flags::BLOCKING) {
            loop {
                self.progress(ep);
                if let Some(status) =
                    endpoint::take_blocking_event(ep, DescRef::RmaOp(op_index))
                {
                    let mut state = ep.state.lock();
                    if let Some(op) = state.rma_ops.remove(op_index) {
                        state.regions.release_ref(op.local_handle);
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
