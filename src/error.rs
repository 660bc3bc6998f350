//! # Error Taxonomy
//!
//! This module defines the status codes shared by every layer of the library.
//! A single `Status` enum covers both synchronous API failures and the
//! asynchronous outcome carried inside completion events, so applications
//! have exactly one vocabulary for "what went wrong".
//!
//! ## Propagation Policy
//!
//! - Argument and allocation errors propagate synchronously as the API
//!   return value.
//! - Fabric errors are translated at the completion site and surface as the
//!   status field of the in-flight operation's event.
//! - Receive-side fabric errors are logged and the descriptor is re-posted;
//!   a single bad receive never tears the connection down.
//! - Internal invariant violations are programming errors and assert.
//!
//! Applications distinguish transient conditions (`Timeout`, `RnrTimeout`)
//! from terminal ones (`Disconnected`, `RemoteError`) via
//! [`Status::is_transient`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the public API surface.
pub type Result<T> = std::result::Result<T, Status>;

/// Status codes for API returns and event outcomes.
///
/// The numeric discriminants are stable and part of the wire-adjacent
/// surface (they appear in ring-slot event payloads), so variants must not
/// be reordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Error,
)]
#[repr(u32)]
pub enum Status {
    /// Operation completed successfully.
    #[error("success")]
    Success = 0,

    /// No data available right now; retry later.
    #[error("resource temporarily unavailable")]
    Again = 1,

    /// A caller-supplied argument was malformed or out of range.
    #[error("invalid argument")]
    InvalidArgument = 2,

    /// An allocation failed.
    #[error("out of memory")]
    NoMemory = 3,

    /// No such device, or the device is down.
    #[error("no such device")]
    NoSuchDevice = 4,

    /// No transmit or receive descriptor was available.
    #[error("no buffers available")]
    NoBuffer = 5,

    /// The payload exceeds the connection's maximum segment size.
    #[error("message too large")]
    MessageTooLarge = 6,

    /// The resource is already in use.
    #[error("resource busy")]
    Busy = 7,

    /// The operation is not supported by this transport.
    #[error("not implemented")]
    NotImplemented = 8,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout = 9,

    /// The receiver ran out of receive buffers and retries were exhausted.
    #[error("receiver not ready")]
    RnrTimeout = 10,

    /// The connection is closed or was torn down while work was in flight.
    #[error("disconnected")]
    Disconnected = 11,

    /// The peer's fabric reported an error completing our operation.
    #[error("remote error")]
    RemoteError = 12,

    /// The peer's application rejected the connection request.
    #[error("connection rejected by peer")]
    PeerRejectedConnect = 13,

    /// Catch-all for fabric errors with no better classification.
    #[error("generic error")]
    Error = 14,
}

impl Status {
    /// Stable, human-readable message for this status.
    ///
    /// The original implementation routed its status enum through the libc
    /// `strerror`, producing nonsense for non-errno values; every kind here
    /// maps to its own fixed string.
    pub fn message(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Again => "resource temporarily unavailable",
            Status::InvalidArgument => "invalid argument",
            Status::NoMemory => "out of memory",
            Status::NoSuchDevice => "no such device",
            Status::NoBuffer => "no buffers available",
            Status::MessageTooLarge => "message too large",
            Status::Busy => "resource busy",
            Status::NotImplemented => "not implemented",
            Status::Timeout => "operation timed out",
            Status::RnrTimeout => "receiver not ready",
            Status::Disconnected => "disconnected",
            Status::RemoteError => "remote error",
            Status::PeerRejectedConnect => "connection rejected by peer",
            Status::Error => "generic error",
        }
    }

    /// Whether a failed operation with this status may succeed if retried.
    pub fn is_transient(self) -> bool {
        matches!(self, Status::Again | Status::Timeout | Status::RnrTimeout)
    }

    /// Whether this status indicates the connection is unusable.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Disconnected | Status::RemoteError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every kind must carry its own stable message; none may fall through
    /// to another kind's text.
    #[test]
    fn messages_are_stable_and_distinct() {
        let all = [
            Status::Success,
            Status::Again,
            Status::InvalidArgument,
            Status::NoMemory,
            Status::NoSuchDevice,
            Status::NoBuffer,
            Status::MessageTooLarge,
            Status::Busy,
            Status::NotImplemented,
            Status::Timeout,
            Status::RnrTimeout,
            Status::Disconnected,
            Status::RemoteError,
            Status::PeerRejectedConnect,
            Status::Error,
        ];
        let mut seen = std::collections::HashSet::new();
        for status in all {
            assert!(seen.insert(status.message()), "duplicate message for {status:?}");
            // Display goes through the same table.
            assert_eq!(status.to_string(), status.message());
        }
    }

    #[test]
    fn transient_and_terminal_are_disjoint() {
        for status in [Status::Timeout, Status::RnrTimeout, Status::Again] {
            assert!(status.is_transient());
            assert!(!status.is_terminal());
        }
        for status in [Status::Disconnected, Status::RemoteError] {
            assert!(status.is_terminal());
            assert!(!status.is_transient());
        }
    }
}
