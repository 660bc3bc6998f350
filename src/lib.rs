//! # Unifabric
//!
//! A transport-neutral communication library for low-latency messaging
//! between processes across heterogeneous interconnects. Applications see
//! one uniform surface — endpoints, connections, events, short messages,
//! and one-sided remote-memory operations — while a pluggable transport
//! layer adapts to the underlying fabric.
//!
//! ## Shape of the API
//!
//! ```no_run
//! use unifabric::{ConnAttribute, DeviceSpec, Flags, Library};
//!
//! let library = Library::init(&[DeviceSpec::new("ib0", "verbs")]).unwrap();
//! let server = library.create_endpoint(None).unwrap();
//! let client = library.create_endpoint(None).unwrap();
//!
//! client
//!     .connect(server.name(), b"hello?", ConnAttribute::ReliableOrdered, 1, None)
//!     .unwrap();
//! // ... drive server.get_event() / client.get_event(), accept, send ...
//! ```
//!
//! Progress is poll-driven: `get_event` runs one progress tick (a bounded
//! batch of fabric completions alternating with a connection-management
//! poll) and hands back the next event; returning the event recycles its
//! buffer. Blocking integration goes through `arm_os_handle` and the
//! endpoint's OS handle.

pub mod config;
pub mod conn;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod ethdev;
pub mod event;
pub mod fabric;
pub mod plugin;
pub mod ring;
pub mod rma;
pub mod slab;
pub mod transport;
pub mod wire;

pub use config::{load_device_file, DeviceProfile, DeviceSpec};
pub use conn::{ConnAttribute, ConnState, Connection};
pub use device::{Device, Registry};
pub use endpoint::{Endpoint, EndpointOpt, OptName};
pub use error::{Result, Status};
pub use event::{Event, EventKind};
pub use plugin::{Transport, TransportDescriptor};
pub use transport::{EthTransport, VerbsTransport};

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

bitflags::bitflags! {
    /// Operation flags for sends and RMA posts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Complete the call synchronously, draining progress inline until
        /// the operation's own completion arrives. Send paths only.
        const BLOCKING = 1 << 0;
        /// RMA direction: write to the peer (absent selects read).
        const WRITE = 1 << 1;
        /// Order the RMA operation after prior posts on the connection.
        const FENCE = 1 << 2;
    }
}

/// Default tuning values.
pub mod defaults {
    use std::time::Duration;

    /// Transmit descriptors preallocated per endpoint.
    pub const EP_TX_COUNT: u32 = 64;

    /// Receive descriptors preallocated per endpoint and posted to the
    /// shared receive queue.
    pub const EP_RX_COUNT: u32 = 256;

    /// Connect handshake expiry when the caller passes no timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Slots in a kernel-assisted event ring (power of two).
    pub const ETH_RING_SLOTS: usize = 64;

    /// Ring-slot bytes reserved beyond the message payload for the slot
    /// header and event encoding.
    pub const ETH_SLOT_OVERHEAD: usize = 256;
}

/// A library instance: the bound transports and the device registry.
///
/// Dropping the instance finalizes every transport.
pub struct Library {
    registry: Arc<Registry>,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
}

impl Library {
    /// Initialize with the built-in transports.
    ///
    /// An empty spec list auto-discovers: each transport may contribute
    /// default devices.
    pub fn init(specs: &[DeviceSpec]) -> Result<Library> {
        Library::init_with_transports(
            specs,
            vec![
                Arc::new(VerbsTransport::new()) as Arc<dyn Transport>,
                Arc::new(EthTransport::new()) as Arc<dyn Transport>,
            ],
        )
    }

    /// Initialize with a caller-supplied transport set; used by tests and
    /// by embedders shipping their own back-ends.
    pub fn init_with_transports(
        specs: &[DeviceSpec],
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<Library> {
        let registry = Arc::new(Registry::new());
        let bound = plugin::bind_devices(&registry, &transports, specs);
        if bound == 0 {
            return Err(Status::NoSuchDevice);
        }
        info!("unifabric {} up with {} device(s)", VERSION, bound);
        Ok(Library { registry, transports: Mutex::new(transports) })
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.devices()
    }

    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.registry.find(name)
    }

    /// Create an endpoint on the given device, or on the default device
    /// (first marked default, else first) when `device` is `None`.
    pub fn create_endpoint(&self, device: Option<&Arc<Device>>) -> Result<Endpoint> {
        let device = match device {
            Some(device) => device.clone(),
            None => self.registry.default_device().ok_or(Status::NoSuchDevice)?,
        };
        if !device.up {
            return Err(Status::NoSuchDevice);
        }
        let transport = device.transport().ok_or(Status::NoSuchDevice)?;
        let ep = transport.create_endpoint(&device)?;
        device.track_endpoint(&ep);
        Ok(Endpoint::new(ep))
    }

    /// Stable message for a status code.
    pub fn strerror(&self, status: Status) -> &'static str {
        status.message()
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        for transport in self.transports.lock().drain(..) {
            transport.finalize();
        }
    }
}
