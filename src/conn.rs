//! # Connections
//!
//! A connection is a logical bidirectional channel anchored at two
//! endpoints. The generic record here carries everything the framework
//! needs (state, attribute, negotiated segment size, the pending
//! connect-request payload, the remote RMA-handle cache); the owning
//! transport hangs its fabric-specific state off `priv_state`.
//!
//! State machine: `Init → {Active, Passive} → Established → Closing →
//! Closed`. The active side moves through Active while the four-way
//! handshake runs; the passive side sits in Passive until the application
//! accepts or rejects.
//!
//! Locking: each connection has its own small lock for its mutable core,
//! acquired after the owning endpoint's lock when both are needed.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::endpoint::EndpointInner;
use crate::error::Status;
use crate::rma::RmaRemote;
use crate::Flags;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Active,
    Passive,
    Established,
    Closing,
    Closed,
}

impl ConnState {
    /// Every state maps to its own string; no fallthrough.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Init => "init",
            ConnState::Active => "active",
            ConnState::Passive => "passive",
            ConnState::Established => "established",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        }
    }
}

/// Reliability and ordering class of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnAttribute {
    /// Reliable, ordered delivery.
    ReliableOrdered = 0,
    /// Reliable delivery, no ordering guarantee.
    ReliableUnordered = 1,
    /// Best-effort delivery.
    UnreliableUnordered = 2,
    /// Best-effort multicast.
    Multicast = 3,
}

impl ConnAttribute {
    /// Encode for the 4-bit attribute field of a ConnPayload header.
    pub fn to_bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<ConnAttribute> {
        match bits {
            0 => Some(ConnAttribute::ReliableOrdered),
            1 => Some(ConnAttribute::ReliableUnordered),
            2 => Some(ConnAttribute::UnreliableUnordered),
            3 => Some(ConnAttribute::Multicast),
            _ => None,
        }
    }

    pub fn is_reliable(self) -> bool {
        matches!(self, ConnAttribute::ReliableOrdered | ConnAttribute::ReliableUnordered)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, ConnAttribute::ReliableOrdered)
    }
}

/// Payload and context the active side holds until the handshake resolves.
#[derive(Debug)]
pub struct ConnRequestData {
    pub data: Vec<u8>,
    pub context: u64,
    pub attr: ConnAttribute,
}

/// Mutable core of a connection, guarded by the connection's lock.
pub struct ConnCore {
    pub state: ConnState,
    pub attr: ConnAttribute,
    /// Negotiated maximum segment size; zero until establishment.
    pub mss: u32,
    /// Pending connect-request bookkeeping on the active side.
    pub conn_req: Option<ConnRequestData>,
    /// Known remote RMA handles, most recently used first.
    pub remotes: Vec<RmaRemote>,
    /// Active-side handshake expiry.
    pub deadline: Option<Instant>,
    pub last_recv: Instant,
    pub last_send: Instant,
    /// A keepalive-timeout event has fired and not yet been rearmed.
    pub keepalive_fired: bool,
    /// Fabric-specific state owned by the transport.
    pub priv_state: Option<Box<dyn Any + Send + Sync>>,
}

impl ConnCore {
    pub fn new(attr: ConnAttribute) -> ConnCore {
        let now = Instant::now();
        ConnCore {
            state: ConnState::Init,
            attr,
            mss: 0,
            conn_req: None,
            remotes: Vec::new(),
            deadline: None,
            last_recv: now,
            last_send: now,
            keepalive_fired: false,
            priv_state: None,
        }
    }

    /// Look up a cached remote handle, promoting a hit to the head so the
    /// list stays in most-recently-used order.
    pub fn lookup_remote(&mut self, handle: u64) -> Option<RmaRemote> {
        let pos = self.remotes.iter().position(|r| r.handle == handle)?;
        if pos != 0 {
            let entry = self.remotes.remove(pos);
            self.remotes.insert(0, entry);
        }
        Some(self.remotes[0])
    }

    /// Insert (or refresh) a remote handle at the head of the cache.
    pub fn insert_remote(&mut self, remote: RmaRemote) {
        self.remotes.retain(|r| r.handle != remote.handle);
        self.remotes.insert(0, remote);
    }
}

/// A connection record owned by its endpoint.
pub struct ConnInner {
    pub ep: Weak<EndpointInner>,
    /// Slot in the endpoint's connection table; stable for the lifetime.
    pub id: usize,
    pub core: Mutex<ConnCore>,
}

impl ConnInner {
    pub fn new(ep: Weak<EndpointInner>, id: usize, core: ConnCore) -> ConnInner {
        ConnInner { ep, id, core: Mutex::new(core) }
    }
}

/// Application handle to an established (or pending) connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    pub(crate) fn from_inner(inner: Arc<ConnInner>) -> Connection {
        Connection { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnInner> {
        &self.inner
    }

    /// Whether two handles refer to the same connection.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn attribute(&self) -> ConnAttribute {
        self.inner.core.lock().attr
    }

    pub fn state(&self) -> ConnState {
        self.inner.core.lock().state
    }

    /// Negotiated maximum segment size for short messages.
    pub fn max_send_size(&self) -> u32 {
        self.inner.core.lock().mss
    }

    /// Send a short message on this connection.
    ///
    /// The payload is copied into a transmit descriptor; completion arrives
    /// as a `Send` event carrying `context`, unless `Flags::BLOCKING` was
    /// set, in which case the call drains progress inline and returns the
    /// completion status directly.
    pub fn send(&self, msg: &[u8], context: u64, flags: Flags) -> Result<(), Status> {
        let ep = self.inner.ep.upgrade().ok_or(Status::Disconnected)?;
        let transport = ep.transport();
        transport.send(&ep, &self.inner, &[msg], context, flags)
    }

    /// Gathering variant of [`Connection::send`]; the segments are copied
    /// back to back into one message.
    pub fn sendv(&self, segments: &[&[u8]], context: u64, flags: Flags) -> Result<(), Status> {
        let ep = self.inner.ep.upgrade().ok_or(Status::Disconnected)?;
        let transport = ep.transport();
        transport.send(&ep, &self.inner, segments, context, flags)
    }

    /// Post a one-sided RMA operation.
    ///
    /// `Flags::WRITE` selects a write (absence selects a read);
    /// `Flags::FENCE` orders the operation after prior posts on this
    /// connection. If `msg` is supplied, a short message is sent to the
    /// peer once the transfer completes locally.
    #[allow(clippy::too_many_arguments)]
    pub fn rma(
        &self,
        msg: Option<&[u8]>,
        local_handle: u64,
        local_offset: u64,
        remote_handle: u64,
        remote_offset: u64,
        len: u64,
        context: u64,
        flags: Flags,
    ) -> Result<(), Status> {
        let ep = self.inner.ep.upgrade().ok_or(Status::Disconnected)?;
        let transport = ep.transport();
        transport.rma(
            &ep,
            &self.inner,
            msg,
            local_handle,
            local_offset,
            remote_handle,
            remote_offset,
            len,
            context,
            flags,
        )
    }

    /// Tear the connection down. Application initiated, so no event is
    /// delivered locally.
    pub fn disconnect(&self) -> Result<(), Status> {
        let ep = self.inner.ep.upgrade().ok_or(Status::Disconnected)?;
        let transport = ep.transport();
        transport.disconnect(&ep, &self.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("attr", &core.attr)
            .field("mss", &core.mss)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_are_total_and_distinct() {
        let states = [
            ConnState::Init,
            ConnState::Active,
            ConnState::Passive,
            ConnState::Established,
            ConnState::Closing,
            ConnState::Closed,
        ];
        let mut seen = std::collections::HashSet::new();
        for state in states {
            assert!(seen.insert(state.as_str()), "duplicate string for {state:?}");
        }
    }

    #[test]
    fn attribute_bits_round_trip() {
        for attr in [
            ConnAttribute::ReliableOrdered,
            ConnAttribute::ReliableUnordered,
            ConnAttribute::UnreliableUnordered,
            ConnAttribute::Multicast,
        ] {
            assert_eq!(ConnAttribute::from_bits(attr.to_bits()), Some(attr));
        }
        assert_eq!(ConnAttribute::from_bits(4), None);
    }

    #[test]
    fn remote_cache_stays_in_mru_order() {
        let mut core = ConnCore::new(ConnAttribute::ReliableOrdered);
        for handle in [1u64, 2, 3] {
            core.insert_remote(RmaRemote { handle, remote_addr: handle * 100, rkey: 1 });
        }
        // 3 is at the head; touching 1 promotes it.
        assert_eq!(core.remotes[0].handle, 3);
        let hit = core.lookup_remote(1).unwrap();
        assert_eq!(hit.remote_addr, 100);
        assert_eq!(core.remotes[0].handle, 1);
        assert_eq!(core.remotes.len(), 3);
        assert!(core.lookup_remote(9).is_none());
    }
}
