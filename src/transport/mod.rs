//! # Transport Implementations
//!
//! Conforming transports behind the [`crate::plugin::Transport`] operation
//! table. `verbs` is the fabric-backed transport (connection state machine,
//! shared-receive-queue completion path, RMA remote-handle exchange);
//! `eth` is the kernel-assisted transport whose events arrive through a
//! memory-mapped ring.

pub mod eth;
pub mod verbs;

pub use eth::EthTransport;
pub use verbs::VerbsTransport;
