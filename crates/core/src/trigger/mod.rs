use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::{parameter::ParameterWatch, pattern::PatternConfig, HaptickleError, Result};

/// How a trigger turns watch validity into loop starts and stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerMode {
    #[default]
    Off,
    Constant,
    Proximity,
    Velocity,
    OnChange,
}

impl TriggerMode {
    /// Modes that derive activity from the raw value rather than from watch
    /// validity.
    pub fn is_continuous(self) -> bool {
        matches!(self, Self::Proximity | Self::Velocity)
    }
}

/// Network-addressable vibration device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub id: String,
    pub device_ip: String,
    pub device_port: u16,
    pub osc_address: String,
}

impl DeviceMapping {
    /// Destination of control datagrams. `device_ip` must be a literal
    /// IPv4 or IPv6 address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.device_ip.trim().parse().map_err(|_| {
            HaptickleError::InvalidConfig(format!(
                "device mapping `{}` has an invalid ip address `{}`",
                self.id, self.device_ip
            ))
        })?;
        Ok(SocketAddr::new(ip, self.device_port))
    }

    /// Stable identity used for loop bookkeeping, e.g. `10.0.0.5:9000/motor`
    /// or `[::1]:9000/motor`.
    pub fn identity(&self) -> String {
        match self.socket_addr() {
            Ok(addr) => format!("{addr}{}", self.osc_address),
            Err(_) => format!("{}:{}{}", self.device_ip, self.device_port, self.osc_address),
        }
    }
}

/// Output a trigger drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceTarget {
    /// Tracker reachable through the local haptic API.
    Local { index: u32, serial_number: String },
    /// Device reached over UDP, referenced by [`DeviceMapping::id`].
    External { mapping: String },
}

impl Default for DeviceTarget {
    fn default() -> Self {
        Self::Local {
            index: 0,
            serial_number: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HapticTrigger {
    pub id: String,
    pub target: DeviceTarget,
    pub mode: TriggerMode,
    pub pattern: PatternConfig,
    pub watches: Vec<ParameterWatch>,
}

impl Default for HapticTrigger {
    fn default() -> Self {
        Self {
            id: String::new(),
            target: DeviceTarget::default(),
            mode: TriggerMode::Off,
            pattern: PatternConfig::default(),
            watches: Vec::new(),
        }
    }
}

impl HapticTrigger {
    pub fn local(id: impl Into<String>, index: u32, serial_number: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: DeviceTarget::Local {
                index,
                serial_number: serial_number.into(),
            },
            ..Default::default()
        }
    }

    pub fn external(id: impl Into<String>, mapping: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: DeviceTarget::External {
                mapping: mapping.into(),
            },
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: TriggerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_pattern(mut self, pattern: PatternConfig) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_watch(mut self, watch: ParameterWatch) -> Self {
        self.watches.push(watch);
        self
    }
}

/// Resolved output of a trigger, carrying the key used for loop bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedTarget {
    Local { index: u32, identity: String },
    External(DeviceMapping),
}

impl ResolvedTarget {
    pub fn identity(&self) -> String {
        match self {
            Self::Local { identity, .. } => identity.clone(),
            Self::External(mapping) => mapping.identity(),
        }
    }
}

/// Per-parameter runtime state key, `device-identity:parameter-name`.
pub fn state_key(identity: &str, parameter: &str) -> String {
    format!("{identity}:{parameter}")
}
