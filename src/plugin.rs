//! # Transport Plug-in Framework
//!
//! Every transport exports a descriptor (versions, tag, priority) and an
//! operation table covering the full API surface. The table is expressed as
//! the [`Transport`] trait; the framework holds transports as trait objects
//! and routes each call through the one bound to the device owning the
//! endpoint.
//!
//! Binding happens once at startup: each configured device is matched to
//! the transport whose tag equals its configured transport name, or, when
//! the tag is unset, to the highest-priority transport whose probe accepts
//! the spec. Devices with no match are dropped with a warning, and one
//! transport's init failure removes only that transport's devices.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DeviceSpec;
use crate::conn::{ConnAttribute, ConnInner, Connection};
use crate::device::{Device, Registry};
use crate::endpoint::{self, EndpointInner, EndpointOpt, OptName};
use crate::error::Status;
use crate::event::{Event, EventRecord};
use crate::Flags;

/// ABI version shared by the framework and every transport.
pub const ABI_VERSION: u32 = 1;

/// Static identity of a transport implementation.
#[derive(Debug, Clone, Copy)]
pub struct TransportDescriptor {
    pub abi_version: u32,
    pub api_version: (u16, u16, u16),
    /// The tag device records name in their `transport=` directive.
    pub name: &'static str,
    /// Higher wins when a device leaves its transport tag unset.
    pub priority: u32,
}

/// The operation table every transport satisfies.
///
/// Methods with defaults are either generic bookkeeping shared by all
/// transports (event delivery, options, wakeups) or capabilities a
/// transport may legitimately lack (RMA on transports without one-sided
/// support reports `NotImplemented`).
pub trait Transport: Send + Sync {
    fn descriptor(&self) -> &TransportDescriptor;

    /// Whether this transport could drive a device with an unset tag.
    fn probe(&self, _spec: &DeviceSpec) -> bool {
        true
    }

    /// Claim the given device specs, returning fully built device records.
    ///
    /// With `auto_discover` set (empty configuration), a transport may
    /// contribute default devices of its own.
    fn init(&self, specs: &[DeviceSpec], auto_discover: bool) -> Result<Vec<Arc<Device>>, Status>;

    /// Teardown hook invoked when the library shuts down.
    fn finalize(&self) {}

    /// Stable message for a status, per transport.
    fn strerror(&self, status: Status) -> &'static str {
        status.message()
    }

    fn create_endpoint(&self, device: &Arc<Device>) -> Result<Arc<EndpointInner>, Status>;

    fn destroy_endpoint(&self, ep: &Arc<EndpointInner>) -> Result<(), Status>;

    /// One progress tick: drain a bounded batch of fabric completions and
    /// connection-management events into the endpoint's event list.
    fn progress(&self, ep: &Arc<EndpointInner>);

    fn connect(
        &self,
        ep: &Arc<EndpointInner>,
        uri: &str,
        payload: &[u8],
        attr: ConnAttribute,
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<(), Status>;

    fn accept(&self, ep: &Arc<EndpointInner>, conn: &Arc<ConnInner>)
        -> Result<Connection, Status>;

    fn reject(&self, ep: &Arc<EndpointInner>, conn: &Arc<ConnInner>) -> Result<(), Status>;

    fn disconnect(&self, ep: &Arc<EndpointInner>, conn: &Arc<ConnInner>) -> Result<(), Status>;

    fn set_opt(&self, ep: &Arc<EndpointInner>, opt: EndpointOpt) -> Result<(), Status> {
        let mut state = ep.state.lock();
        match opt {
            EndpointOpt::KeepaliveTimeout(timeout) => state.keepalive_timeout = timeout,
            EndpointOpt::SendTimeout(timeout) => state.send_timeout = timeout,
        }
        Ok(())
    }

    fn get_opt(&self, ep: &Arc<EndpointInner>, name: OptName) -> Result<EndpointOpt, Status> {
        let state = ep.state.lock();
        Ok(match name {
            OptName::KeepaliveTimeout => EndpointOpt::KeepaliveTimeout(state.keepalive_timeout),
            OptName::SendTimeout => EndpointOpt::SendTimeout(state.send_timeout),
        })
    }

    fn arm_os_handle(&self, ep: &Arc<EndpointInner>) -> Result<(), Status> {
        ep.wakeup.arm()
    }

    /// Progress once, then pop the first deliverable event.
    fn get_event(&self, ep: &Arc<EndpointInner>) -> Result<Event, Status> {
        self.progress(ep);
        endpoint::pop_event(ep)
    }

    /// Recycle the resource backing a returned event.
    fn return_event(&self, ep: &Arc<EndpointInner>, record: EventRecord) -> Result<(), Status>;

    /// Post a short message; `segments` are gathered into one payload.
    fn send(
        &self,
        ep: &Arc<EndpointInner>,
        conn: &Arc<ConnInner>,
        segments: &[&[u8]],
        context: u64,
        flags: Flags,
    ) -> Result<(), Status>;

    fn rma_register(
        &self,
        _ep: &Arc<EndpointInner>,
        _start: u64,
        _length: u64,
    ) -> Result<u64, Status> {
        Err(Status::NotImplemented)
    }

    fn rma_deregister(&self, _ep: &Arc<EndpointInner>, _handle: u64) -> Result<(), Status> {
        Err(Status::NotImplemented)
    }

    #[allow(clippy::too_many_arguments)]
    fn rma(
        &self,
        _ep: &Arc<EndpointInner>,
        _conn: &Arc<ConnInner>,
        _msg: Option<&[u8]>,
        _local_handle: u64,
        _local_offset: u64,
        _remote_handle: u64,
        _remote_offset: u64,
        _len: u64,
        _context: u64,
        _flags: Flags,
    ) -> Result<(), Status> {
        Err(Status::NotImplemented)
    }
}

/// Match each spec to a transport and populate the registry.
///
/// Returns the number of devices that came up. Specs are grouped per
/// transport so each transport sees its whole configuration at once, the
/// way device selection directives (`ip=`, `hca_id=`, ...) expect.
pub(crate) fn bind_devices(
    registry: &Registry,
    transports: &[Arc<dyn Transport>],
    specs: &[DeviceSpec],
) -> usize {
    let auto_discover = specs.is_empty();

    // Highest priority first for unset-tag probing.
    let mut ordered: Vec<Arc<dyn Transport>> = transports.to_vec();
    ordered.sort_by(|a, b| b.descriptor().priority.cmp(&a.descriptor().priority));

    let mut assignments: Vec<Vec<DeviceSpec>> = vec![Vec::new(); ordered.len()];
    for spec in specs {
        let chosen = match &spec.transport {
            Some(tag) => ordered.iter().position(|t| t.descriptor().name == tag),
            None => ordered.iter().position(|t| t.probe(spec)),
        };
        match chosen {
            Some(index) => assignments[index].push(spec.clone()),
            None => warn!(
                "device {} has no matching transport ({:?}), dropping it",
                spec.name, spec.transport
            ),
        }
    }

    let mut bound = 0;
    for (transport, specs) in ordered.iter().zip(assignments) {
        let tag = transport.descriptor().name;
        if specs.is_empty() && !auto_discover {
            continue;
        }
        match transport.init(&specs, auto_discover) {
            Ok(devices) => {
                for device in devices {
                    device.bind_transport(transport.clone());
                    bound += 1;
                    registry.add(device);
                }
            }
            Err(status) => {
                // Only this transport's devices are lost.
                warn!("transport {} failed to initialize: {}", tag, status);
                registry.remove_transport(tag);
            }
        }
    }
    debug!("{} device(s) bound across {} transport(s)", bound, ordered.len());
    bound
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubTransport {
        desc: TransportDescriptor,
        probes: bool,
        fail_init: bool,
    }

    impl StubTransport {
        fn new(name: &'static str, priority: u32, probes: bool, fail_init: bool) -> Arc<Self> {
            Arc::new(StubTransport {
                desc: TransportDescriptor {
                    abi_version: ABI_VERSION,
                    api_version: (1, 0, 0),
                    name,
                    priority,
                },
                probes,
                fail_init,
            })
        }
    }

    impl Transport for StubTransport {
        fn descriptor(&self) -> &TransportDescriptor {
            &self.desc
        }

        fn probe(&self, _spec: &DeviceSpec) -> bool {
            self.probes
        }

        fn init(
            &self,
            specs: &[DeviceSpec],
            _auto: bool,
        ) -> Result<Vec<Arc<Device>>, Status> {
            if self.fail_init {
                return Err(Status::Error);
            }
            Ok(specs
                .iter()
                .map(|spec| {
                    Arc::new(Device::new(
                        spec.name.clone(),
                        self.desc.name.to_string(),
                        1024,
                        0,
                        Box::new(()),
                    ))
                })
                .collect())
        }

        fn create_endpoint(&self, _device: &Arc<Device>) -> Result<Arc<EndpointInner>, Status> {
            Err(Status::NotImplemented)
        }

        fn destroy_endpoint(&self, _ep: &Arc<EndpointInner>) -> Result<(), Status> {
            Ok(())
        }

        fn progress(&self, _ep: &Arc<EndpointInner>) {}

        fn connect(
            &self,
            _ep: &Arc<EndpointInner>,
            _uri: &str,
            _payload: &[u8],
            _attr: ConnAttribute,
            _context: u64,
            _timeout: Option<Duration>,
        ) -> Result<(), Status> {
            Err(Status::NotImplemented)
        }

        fn accept(
            &self,
            _ep: &Arc<EndpointInner>,
            _conn: &Arc<ConnInner>,
        ) -> Result<Connection, Status> {
            Err(Status::NotImplemented)
        }

        fn reject(&self, _ep: &Arc<EndpointInner>, _conn: &Arc<ConnInner>) -> Result<(), Status> {
            Err(Status::NotImplemented)
        }

        fn disconnect(
            &self,
            _ep: &Arc<EndpointInner>,
            _conn: &Arc<ConnInner>,
        ) -> Result<(), Status> {
            Err(Status::NotImplemented)
        }

        fn return_event(
            &self,
            _ep: &Arc<EndpointInner>,
            _record: EventRecord,
        ) -> Result<(), Status> {
            Ok(())
        }

        fn send(
            &self,
            _ep: &Arc<EndpointInner>,
            _conn: &Arc<ConnInner>,
            _segments: &[&[u8]],
            _context: u64,
            _flags: Flags,
        ) -> Result<(), Status> {
            Err(Status::NotImplemented)
        }
    }

    #[test]
    fn tagged_specs_bind_to_their_transport() {
        let registry = Registry::new();
        let alpha = StubTransport::new("alpha", 10, true, false);
        let beta = StubTransport::new("beta", 50, true, false);
        let specs =
            vec![DeviceSpec::new("dev0", "alpha"), DeviceSpec::new("dev1", "beta")];
        let bound = bind_devices(
            &registry,
            &[alpha as Arc<dyn Transport>, beta as Arc<dyn Transport>],
            &specs,
        );
        assert_eq!(bound, 2);
        assert_eq!(registry.find("dev0").unwrap().transport_tag, "alpha");
        assert_eq!(registry.find("dev1").unwrap().transport_tag, "beta");
    }

    #[test]
    fn unset_tag_picks_highest_priority_probe() {
        let registry = Registry::new();
        let low = StubTransport::new("low", 10, true, false);
        let high_no_probe = StubTransport::new("deaf", 90, false, false);
        let mid = StubTransport::new("mid", 50, true, false);

        let mut spec = DeviceSpec::new("dev0", "unused");
        spec.transport = None;
        let bound = bind_devices(
            &registry,
            &[
                low as Arc<dyn Transport>,
                high_no_probe as Arc<dyn Transport>,
                mid as Arc<dyn Transport>,
            ],
            &[spec],
        );
        assert_eq!(bound, 1);
        assert_eq!(registry.find("dev0").unwrap().transport_tag, "mid");
    }

    #[test]
    fn unknown_tags_are_dropped_with_a_warning() {
        let registry = Registry::new();
        let alpha = StubTransport::new("alpha", 10, true, false);
        let bound = bind_devices(
            &registry,
            &[alpha as Arc<dyn Transport>],
            &[DeviceSpec::new("dev0", "nonesuch")],
        );
        assert_eq!(bound, 0);
        assert!(registry.find("dev0").is_none());
    }

    #[test]
    fn one_failing_transport_leaves_the_others_usable() {
        let registry = Registry::new();
        let good = StubTransport::new("good", 10, true, false);
        let bad = StubTransport::new("bad", 50, true, true);
        let specs = vec![DeviceSpec::new("dev0", "good"), DeviceSpec::new("dev1", "bad")];
        let bound = bind_devices(
            &registry,
            &[good as Arc<dyn Transport>, bad as Arc<dyn Transport>],
            &specs,
        );
        assert_eq!(bound, 1);
        assert!(registry.find("dev0").is_some());
        assert!(registry.find("dev1").is_none());
    }
}
