//! # Device Configuration
//!
//! The library learns about devices either from a configuration file or by
//! auto-discovery. File parsing itself is a thin JSON loader; the
//! interesting part is the per-device directive list, a sequence of
//! `key=value` strings in the style the transports have always consumed:
//!
//! ```text
//! transport=<tag>  ip=<dotted>  interface=<ifname>  port=<u16>
//! mss=<u32>  hca_id=<name>  path=<dir>  id=<u32>
//! ```
//!
//! Unknown keys warn and are ignored so configurations stay forward
//! compatible. Each transport reads the profile fields it cares about and
//! leaves the rest alone.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::Status;

/// One device entry from a configuration file (or built by hand).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Stable device name, unique within the configuration.
    pub name: String,
    /// Transport tag; `None` leaves the choice to priority-ordered probing.
    #[serde(default)]
    pub transport: Option<String>,
    /// Raw `key=value` directives for the owning transport.
    #[serde(default)]
    pub args: Vec<String>,
    /// Marks the device the library should use when the caller names none.
    #[serde(default)]
    pub is_default: bool,
}

impl DeviceSpec {
    pub fn new(name: &str, transport: &str) -> DeviceSpec {
        DeviceSpec {
            name: name.to_string(),
            transport: Some(transport.to_string()),
            args: Vec::new(),
            is_default: false,
        }
    }

    pub fn arg(mut self, directive: &str) -> DeviceSpec {
        self.args.push(directive.to_string());
        self
    }

    pub fn default_device(mut self) -> DeviceSpec {
        self.is_default = true;
        self
    }
}

/// Recognized per-device directives, parsed out of a spec's `args`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    pub ip: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub port: Option<u16>,
    pub mss: Option<u32>,
    pub hca_id: Option<String>,
    pub path: Option<String>,
    pub id_base: Option<u32>,
}

impl DeviceProfile {
    /// Parse the directive list of one device.
    ///
    /// Malformed values for known keys are reported and skipped rather than
    /// failing the whole device; unknown keys warn and are ignored.
    pub fn parse(device: &str, args: &[String]) -> DeviceProfile {
        let mut profile = DeviceProfile::default();

        for arg in args {
            let (key, value) = match arg.split_once('=') {
                Some(kv) => kv,
                None => {
                    warn!("device {}: ignoring malformed directive {:?}", device, arg);
                    continue;
                }
            };
            match key {
                "ip" => match value.parse() {
                    Ok(ip) => profile.ip = Some(ip),
                    Err(_) => debug!("device {}: unable to parse {}", device, value),
                },
                "interface" => profile.interface = Some(value.to_string()),
                "port" => match value.parse() {
                    Ok(port) => profile.port = Some(port),
                    Err(_) => debug!("device {}: unable to parse port {}", device, value),
                },
                "mss" => match value.parse() {
                    Ok(mss) => profile.mss = Some(mss),
                    Err(_) => debug!("device {}: unable to parse mss {}", device, value),
                },
                "hca_id" => profile.hca_id = Some(value.to_string()),
                "path" => profile.path = Some(value.to_string()),
                "id" => match value.parse() {
                    Ok(id) => profile.id_base = Some(id),
                    Err(_) => debug!("device {}: unable to parse id {}", device, value),
                },
                "transport" => {
                    // Redundant with DeviceSpec::transport; accepted silently
                    // so file-based specs can carry it inline.
                }
                _ => warn!("device {}: unknown keyword {}", device, key),
            }
        }
        profile
    }
}

/// Load device specs from a JSON configuration file.
pub fn load_device_file(path: &Path) -> Result<Vec<DeviceSpec>, Status> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        warn!("unable to read config file {}: {}", path.display(), err);
        Status::NoSuchDevice
    })?;
    serde_json::from_str(&text).map_err(|err| {
        warn!("unable to parse config file {}: {}", path.display(), err);
        Status::InvalidArgument
    })
}
