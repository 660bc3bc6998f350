//! # Events
//!
//! Progress drains fabric completions into each endpoint's event list; the
//! application dequeues events with `get_event` and hands them back with
//! `return_event` so the backing descriptor can be recycled.
//!
//! Every event is backed by exactly one resource: a receive descriptor
//! (`Recv`, `ConnectRequest`, connect replies on the fabric transport), a
//! transmit descriptor (`Send` completions), an RMA operation record, a
//! ring slot on the kernel-assisted transport, or the connection itself for
//! synthesized notices (connect timeout, keepalive). Returning the event
//! releases that resource; an event dropped without being returned releases
//! it from the drop glue instead, so descriptors cannot leak.

use std::sync::Arc;

use crate::conn::{ConnAttribute, ConnInner, Connection};
use crate::endpoint::EndpointInner;
use crate::error::Status;

/// A raw view into buffer memory owned by a descriptor.
///
/// Valid exactly as long as the descriptor backing the event is held, which
/// the event guarantees until it is returned.
#[derive(Debug, Clone, Copy)]
pub struct RawSlice {
    ptr: *const u8,
    len: usize,
}

// SAFETY: the pointed-to range is immutable while the owning descriptor is
// embedded in a pending event; see module docs.
unsafe impl Send for RawSlice {}
unsafe impl Sync for RawSlice {}

impl RawSlice {
    pub(crate) fn new(ptr: *const u8, len: usize) -> RawSlice {
        RawSlice { ptr, len }
    }
}

/// Payload carried by an event: either a window into descriptor memory or
/// bytes decoded out of a ring slot.
#[derive(Debug)]
pub enum EventData {
    None,
    Raw(RawSlice),
    Owned(Vec<u8>),
}

impl EventData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            EventData::None => &[],
            // SAFETY: RawSlice validity is tied to the backing descriptor,
            // which outlives this view.
            EventData::Raw(raw) => unsafe { std::slice::from_raw_parts(raw.ptr, raw.len) },
            EventData::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The resource an event record is embedded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescRef {
    /// Transmit descriptor, by arena index.
    Tx(u32),
    /// Receive descriptor, by arena index.
    Rx(u32),
    /// In-flight RMA operation, by arena index.
    RmaOp(u32),
    /// Shared-ring slot, by byte offset.
    RingSlot(u32),
    /// The connection record itself (synthesized notices).
    Conn,
}

/// Kind and kind-specific payload of one event.
#[derive(Debug)]
pub enum EventKind {
    /// A peer asked to connect; accept or reject it.
    ConnectRequest { attr: ConnAttribute, data: EventData },
    /// Our connect was accepted; the connection is established.
    ConnectAccepted { context: u64 },
    /// Our connect was refused, timed out, or failed.
    ConnectRejected { context: u64, status: Status },
    /// A send (or RMA) we issued completed.
    Send { context: u64, status: Status },
    /// A short message arrived.
    Recv { data: EventData },
    /// The peer has been silent past the keepalive timeout.
    KeepaliveTimedOut,
    /// The device under this endpoint failed.
    EndpointDeviceFailed,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ConnectRequest { .. } => "connect_request",
            EventKind::ConnectAccepted { .. } => "connect_accepted",
            EventKind::ConnectRejected { .. } => "connect_rejected",
            EventKind::Send { .. } => "send",
            EventKind::Recv { .. } => "recv",
            EventKind::KeepaliveTimedOut => "keepalive_timed_out",
            EventKind::EndpointDeviceFailed => "endpoint_device_failed",
        }
    }
}

/// One entry on an endpoint's event list.
pub struct EventRecord {
    pub kind: EventKind,
    pub conn: Option<Arc<ConnInner>>,
    pub desc: DescRef,
    /// Set when the event belongs to an in-flight blocking operation, which
    /// drains it inline; `get_event` skips such entries.
    pub blocking: bool,
}

/// An event handed to the application.
///
/// Holds its backing descriptor until returned via
/// [`crate::Endpoint::return_event`] or dropped.
pub struct Event {
    pub(crate) ep: Arc<EndpointInner>,
    pub(crate) record: Option<EventRecord>,
}

impl Event {
    pub(crate) fn new(ep: Arc<EndpointInner>, record: EventRecord) -> Event {
        Event { ep, record: Some(record) }
    }

    fn record(&self) -> &EventRecord {
        self.record.as_ref().expect("event already returned")
    }

    pub fn kind(&self) -> &EventKind {
        &self.record().kind
    }

    /// The connection this event refers to, when it has one.
    pub fn connection(&self) -> Option<Connection> {
        self.record().conn.clone().map(Connection::from_inner)
    }

    /// Payload bytes for `Recv` and `ConnectRequest` events.
    pub fn data(&self) -> &[u8] {
        match &self.record().kind {
            EventKind::Recv { data } | EventKind::ConnectRequest { data, .. } => data.as_slice(),
            _ => &[],
        }
    }

    /// Caller context for `Send` and connect-outcome events.
    pub fn context(&self) -> Option<u64> {
        match self.record().kind {
            EventKind::Send { context, .. }
            | EventKind::ConnectAccepted { context }
            | EventKind::ConnectRejected { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Completion status, `Success` for kinds that cannot fail.
    pub fn status(&self) -> Status {
        match self.record().kind {
            EventKind::Send { status, .. } => status,
            EventKind::ConnectRejected { status, .. } => status,
            _ => Status::Success,
        }
    }

    /// Requested attribute of a `ConnectRequest`.
    pub fn request_attribute(&self) -> Option<ConnAttribute> {
        match self.record().kind {
            EventKind::ConnectRequest { attr, .. } => Some(attr),
            _ => None,
        }
    }

    pub(crate) fn take_record(&mut self) -> Option<EventRecord> {
        self.record.take()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            let transport = self.ep.transport();
            if let Err(status) = transport.return_event(&self.ep, record) {
                tracing::debug!("returning dropped event failed: {}", status);
            }
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.record {
            Some(record) => f
                .debug_struct("Event")
                .field("kind", &record.kind.name())
                .field("desc", &record.desc)
                .finish(),
            None => f.write_str("Event(returned)"),
        }
    }
}
