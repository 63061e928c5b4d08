use std::{collections::HashSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    trigger::{DeviceMapping, DeviceTarget, HapticTrigger, ResolvedTarget, TriggerMode},
    HaptickleError, Result,
};

/// Bounds accepted for [`EngineSettings::timeout_seconds`].
pub const TIMEOUT_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

/// Top-level configuration consumed by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HaptickleConfig {
    pub engine: EngineSettings,
    pub triggers: Vec<HapticTrigger>,
    pub device_mappings: Vec<DeviceMapping>,
}

impl HaptickleConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        let mut ids = HashSet::new();
        for mapping in &self.device_mappings {
            if !ids.insert(mapping.id.as_str()) {
                return Err(HaptickleError::InvalidConfig(format!(
                    "duplicate device mapping id `{}`",
                    mapping.id
                )));
            }
            mapping.socket_addr()?;
            if !mapping.osc_address.starts_with('/') {
                return Err(HaptickleError::InvalidConfig(format!(
                    "device mapping `{}` needs an osc address starting with `/`",
                    mapping.id
                )));
            }
        }

        for trigger in &self.triggers {
            self.resolve_target(trigger)?;
        }
        Ok(())
    }

    /// Resolves a trigger's target to the identity its loops are keyed by.
    pub fn resolve_target(&self, trigger: &HapticTrigger) -> Result<ResolvedTarget> {
        match &trigger.target {
            DeviceTarget::Local {
                index,
                serial_number,
            } => {
                let identity = if serial_number.is_empty() {
                    format!("device-{index}")
                } else {
                    serial_number.clone()
                };
                Ok(ResolvedTarget::Local {
                    index: *index,
                    identity,
                })
            }
            DeviceTarget::External { mapping } => self
                .device_mappings
                .iter()
                .find(|candidate| &candidate.id == mapping)
                .cloned()
                .map(ResolvedTarget::External)
                .ok_or_else(|| HaptickleError::UnknownDeviceMapping(mapping.clone())),
        }
    }

    /// True when at least one output is configured to do something.
    pub fn has_active_outputs(&self) -> bool {
        !self.device_mappings.is_empty()
            || self
                .triggers
                .iter()
                .any(|trigger| trigger.mode != TriggerMode::Off)
    }
}

/// Tunables of the trigger engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Dead-man timeout for loops bound to a parameter.
    pub timeout_seconds: u32,
    /// Pulse length at the lowest non-zero strength.
    pub pulse_min_us: u16,
    /// Pulse length at full strength.
    pub pulse_max_us: u16,
    /// Pause after each pulse.
    pub pulse_gap_ms: u64,
    /// Sleep used while there is nothing to pulse.
    pub idle_interval_ms: u64,
    /// Minimum velocity that counts as movement.
    pub velocity_threshold: f32,
    pub on_change_burst_ms: u64,
    pub identify_ms: u64,
    pub external_send_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 5,
            pulse_min_us: 100,
            pulse_max_us: 3999,
            pulse_gap_ms: 10,
            idle_interval_ms: 50,
            velocity_threshold: 0.02,
            on_change_burst_ms: 420,
            identify_ms: 1000,
            external_send_interval_ms: 50,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        if !TIMEOUT_RANGE.contains(&self.timeout_seconds) {
            return Err(HaptickleError::InvalidConfig(format!(
                "timeout_seconds must be within {}..={}, got {}",
                TIMEOUT_RANGE.start(),
                TIMEOUT_RANGE.end(),
                self.timeout_seconds
            )));
        }
        if self.pulse_min_us > self.pulse_max_us {
            return Err(HaptickleError::InvalidConfig(format!(
                "pulse_min_us ({}) exceeds pulse_max_us ({})",
                self.pulse_min_us, self.pulse_max_us
            )));
        }
        if !self.velocity_threshold.is_finite() || self.velocity_threshold < 0.0 {
            return Err(HaptickleError::InvalidConfig(
                "velocity_threshold must be a non-negative number".to_string(),
            ));
        }
        if self.idle_interval_ms == 0 || self.external_send_interval_ms == 0 {
            return Err(HaptickleError::InvalidConfig(
                "loop intervals must be at least one millisecond".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }

    pub fn pulse_gap(&self) -> Duration {
        Duration::from_millis(self.pulse_gap_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn on_change_burst(&self) -> Duration {
        Duration::from_millis(self.on_change_burst_ms)
    }

    pub fn identify_duration(&self) -> Duration {
        Duration::from_millis(self.identify_ms)
    }

    pub fn external_send_interval(&self) -> Duration {
        Duration::from_millis(self.external_send_interval_ms)
    }

    /// Maps a strength in `[0, 1]` linearly onto the pulse length band.
    pub fn pulse_duration_us(&self, strength: f32) -> u16 {
        let strength = if strength.is_finite() {
            strength.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let min = f32::from(self.pulse_min_us);
        let max = f32::from(self.pulse_max_us);
        (min + strength * (max - min)).round().clamp(min, max) as u16
    }
}
