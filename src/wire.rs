//! # Wire Framing
//!
//! Every short message on the fabric carries a 32-bit immediate header in
//! network byte order. The low 4 bits hold the message kind; the remaining
//! bits are reused per kind:
//!
//! - `ConnPayload`: bits 4..7 = connection attribute, bits 8..19 = payload
//!   length (0–4095).
//! - `ConnReply`: bits 4..7 = reply outcome (accepted = 0, rejected = 1).
//! - everything else: reserved, zero.
//!
//! Control-message bodies are fixed layouts, also network byte order:
//!
//! - `RmaRemoteRequest`: the 64-bit remote handle, split high/low.
//! - `RmaRemoteReply`: `{u64 remote address, u32 rkey, u64 handle}`.
//!
//! The module also owns endpoint URI parsing (`<transport>://<host>:<port>`).

use crate::error::Status;

/// Maximum connect-request payload; the length field is 12 bits wide.
pub const MAX_CONN_PAYLOAD: usize = 0xFFF;

/// Body length of an [`MsgKind::RmaRemoteRequest`] message.
pub const RMA_REQUEST_BODY_LEN: usize = 8;

/// Body length of an [`MsgKind::RmaRemoteReply`] message.
pub const RMA_REPLY_BODY_LEN: usize = 20;

const KIND_MASK: u32 = 0xF;
const ATTR_SHIFT: u32 = 4;
const ATTR_MASK: u32 = 0xF;
const LEN_SHIFT: u32 = 8;
const LEN_MASK: u32 = 0xFFF;
const REPLY_SHIFT: u32 = 4;
const REPLY_MASK: u32 = 0xF;

/// Message kinds carried in the low 4 bits of the immediate header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    /// Out-of-band rendezvous tag; the only private data on the CM path.
    ConnRequest = 1,
    /// Initiator's attribute + payload message after fabric establishment.
    ConnPayload = 2,
    /// Acceptor's verdict, zero-length body.
    ConnReply = 3,
    /// Application short message.
    Send = 4,
    /// Ask the peer for the address/rkey behind an RMA handle.
    RmaRemoteRequest = 5,
    /// Answer to a remote-handle request.
    RmaRemoteReply = 6,
    /// Peer-initiated teardown notice.
    Disconnect = 7,
    /// Liveness probe on an otherwise idle connection.
    Keepalive = 8,
}

impl MsgKind {
    /// Decode the kind field, rejecting unknown values.
    pub fn from_bits(bits: u32) -> Option<MsgKind> {
        match bits & KIND_MASK {
            1 => Some(MsgKind::ConnRequest),
            2 => Some(MsgKind::ConnPayload),
            3 => Some(MsgKind::ConnReply),
            4 => Some(MsgKind::Send),
            5 => Some(MsgKind::RmaRemoteRequest),
            6 => Some(MsgKind::RmaRemoteReply),
            7 => Some(MsgKind::Disconnect),
            8 => Some(MsgKind::Keepalive),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MsgKind::ConnRequest => "conn_request",
            MsgKind::ConnPayload => "conn_payload",
            MsgKind::ConnReply => "conn_reply",
            MsgKind::Send => "send",
            MsgKind::RmaRemoteRequest => "rma_remote_request",
            MsgKind::RmaRemoteReply => "rma_remote_reply",
            MsgKind::Disconnect => "disconnect",
            MsgKind::Keepalive => "keepalive",
        }
    }
}

/// Outcome subfield of a [`MsgKind::ConnReply`] header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyOutcome {
    Accepted = 0,
    Rejected = 1,
}

/// The 32-bit immediate header, held in host order.
///
/// [`Header::to_wire`]/[`Header::from_wire`] convert to and from the
/// network-order word the fabric carries as immediate data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(u32);

impl Header {
    /// Header for a kind with no extra fields.
    pub fn new(kind: MsgKind) -> Header {
        Header(kind as u32)
    }

    /// Header for a `ConnPayload` message.
    ///
    /// Fails with `InvalidArgument` if the payload exceeds the 12-bit
    /// length field.
    pub fn conn_payload(attr_bits: u8, len: usize) -> Result<Header, Status> {
        if len > MAX_CONN_PAYLOAD {
            return Err(Status::InvalidArgument);
        }
        let mut word = MsgKind::ConnPayload as u32;
        word |= (u32::from(attr_bits) & ATTR_MASK) << ATTR_SHIFT;
        word |= (len as u32 & LEN_MASK) << LEN_SHIFT;
        Ok(Header(word))
    }

    /// Header for a `ConnReply` message.
    pub fn conn_reply(outcome: ReplyOutcome) -> Header {
        let word = MsgKind::ConnReply as u32 | ((outcome as u32 & REPLY_MASK) << REPLY_SHIFT);
        Header(word)
    }

    /// Network-order word for the fabric's immediate-data field.
    pub fn to_wire(self) -> u32 {
        self.0.to_be()
    }

    /// Decode a network-order immediate word.
    pub fn from_wire(wire: u32) -> Header {
        Header(u32::from_be(wire))
    }

    /// The kind field, if it holds a known value.
    pub fn kind(self) -> Option<MsgKind> {
        MsgKind::from_bits(self.0)
    }

    /// Attribute and payload-length fields of a `ConnPayload` header.
    pub fn conn_payload_fields(self) -> (u8, usize) {
        let attr = ((self.0 >> ATTR_SHIFT) & ATTR_MASK) as u8;
        let len = ((self.0 >> LEN_SHIFT) & LEN_MASK) as usize;
        (attr, len)
    }

    /// Outcome field of a `ConnReply` header.
    pub fn reply_outcome(self) -> Option<ReplyOutcome> {
        match (self.0 >> REPLY_SHIFT) & REPLY_MASK {
            0 => Some(ReplyOutcome::Accepted),
            1 => Some(ReplyOutcome::Rejected),
            _ => None,
        }
    }
}

/// Encode the body of an `RmaRemoteRequest`: the 64-bit handle, network
/// byte order (high word first).
pub fn encode_rma_request(handle: u64) -> [u8; RMA_REQUEST_BODY_LEN] {
    handle.to_be_bytes()
}

/// Decode an `RmaRemoteRequest` body.
pub fn decode_rma_request(body: &[u8]) -> Result<u64, Status> {
    let bytes: [u8; 8] = body
        .get(..RMA_REQUEST_BODY_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(Status::InvalidArgument)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Decoded body of an `RmaRemoteReply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaRemoteInfo {
    /// Base address of the peer's registered region.
    pub remote_addr: u64,
    /// Fabric key granting remote access to that region.
    pub rkey: u32,
    /// The handle this reply answers, echoed back for correlation.
    pub handle: u64,
}

/// Encode the body of an `RmaRemoteReply`.
pub fn encode_rma_reply(info: &RmaRemoteInfo) -> [u8; RMA_REPLY_BODY_LEN] {
    let mut body = [0u8; RMA_REPLY_BODY_LEN];
    body[..8].copy_from_slice(&info.remote_addr.to_be_bytes());
    body[8..12].copy_from_slice(&info.rkey.to_be_bytes());
    body[12..].copy_from_slice(&info.handle.to_be_bytes());
    body
}

/// Decode an `RmaRemoteReply` body.
pub fn decode_rma_reply(body: &[u8]) -> Result<RmaRemoteInfo, Status> {
    if body.len() < RMA_REPLY_BODY_LEN {
        return Err(Status::InvalidArgument);
    }
    let mut addr = [0u8; 8];
    addr.copy_from_slice(&body[..8]);
    let mut rkey = [0u8; 4];
    rkey.copy_from_slice(&body[8..12]);
    let mut handle = [0u8; 8];
    handle.copy_from_slice(&body[12..20]);
    Ok(RmaRemoteInfo {
        remote_addr: u64::from_be_bytes(addr),
        rkey: u32::from_be_bytes(rkey),
        handle: u64::from_be_bytes(handle),
    })
}

/// Parse `<scheme>://<host>:<port>` into host and port.
///
/// The scheme must match the transport's own; anything malformed fails with
/// `InvalidArgument`.
pub fn parse_uri<'a>(uri: &'a str, scheme: &str) -> Result<(&'a str, u16), Status> {
    let rest = uri
        .strip_prefix(scheme)
        .and_then(|r| r.strip_prefix("://"))
        .ok_or(Status::InvalidArgument)?;
    let (host, port) = rest.rsplit_once(':').ok_or(Status::InvalidArgument)?;
    if host.is_empty() {
        return Err(Status::InvalidArgument);
    }
    let port: u16 = port.parse().map_err(|_| Status::InvalidArgument)?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// decode(encode(kind, attr, len)) == (kind, attr, len) across the full
    /// attribute range and a sweep of the 12-bit length range.
    #[test]
    fn conn_payload_round_trip() {
        for attr in 0u8..16 {
            for len in [0usize, 1, 7, 100, 1024, 2048, 4094, 4095] {
                let header = Header::conn_payload(attr, len).unwrap();
                let decoded = Header::from_wire(header.to_wire());
                assert_eq!(decoded.kind(), Some(MsgKind::ConnPayload));
                assert_eq!(decoded.conn_payload_fields(), (attr, len));
            }
        }
    }

    #[test]
    fn conn_payload_rejects_oversize_length() {
        assert_eq!(
            Header::conn_payload(0, MAX_CONN_PAYLOAD + 1).unwrap_err(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn reply_outcome_round_trip() {
        for outcome in [ReplyOutcome::Accepted, ReplyOutcome::Rejected] {
            let header = Header::conn_reply(outcome);
            let decoded = Header::from_wire(header.to_wire());
            assert_eq!(decoded.kind(), Some(MsgKind::ConnReply));
            assert_eq!(decoded.reply_outcome(), Some(outcome));
        }
    }

    #[test]
    fn kind_decode_rejects_unknown() {
        assert_eq!(MsgKind::from_bits(0), None);
        assert_eq!(MsgKind::from_bits(9), None);
        assert_eq!(MsgKind::from_bits(15), None);
    }

    #[test]
    fn rma_bodies_round_trip() {
        let handle = 0x0123_4567_89AB_CDEF;
        assert_eq!(decode_rma_request(&encode_rma_request(handle)).unwrap(), handle);

        let info = RmaRemoteInfo {
            remote_addr: 0xDEAD_BEEF_0000_1234,
            rkey: 0xCAFE_F00D,
            handle,
        };
        assert_eq!(decode_rma_reply(&encode_rma_reply(&info)).unwrap(), info);
    }

    #[test]
    fn rma_request_is_network_order_split() {
        // High 32 bits first on the wire.
        let body = encode_rma_request(0x1122_3344_5566_7788);
        assert_eq!(&body[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&body[4..], &[0x55, 0x66, 0x77, 0x88]);
    }

    #[test]
    fn uri_parsing() {
        assert_eq!(parse_uri("verbs://10.0.0.1:5000", "verbs").unwrap(), ("10.0.0.1", 5000));
        assert!(parse_uri("verbs://10.0.0.1", "verbs").is_err());
        assert!(parse_uri("verbs://:5000", "verbs").is_err());
        assert!(parse_uri("tcp://10.0.0.1:5000", "verbs").is_err());
        assert!(parse_uri("verbs://host:notaport", "verbs").is_err());
        assert!(parse_uri("", "verbs").is_err());
    }
}
