use std::{
    fmt,
    sync::{Arc, RwLock},
};

use crate::{HaptickleError, Result};

/// Local haptic capability: "pulse device D on axis A for N microseconds".
///
/// Calls are fire-and-forget. Failures are logged by the caller and not
/// retried within the same loop iteration.
pub trait HapticDevice: Send + Sync {
    fn pulse(&self, device_index: u32, axis: u32, duration_us: u16) -> Result<()>;
}

/// Shared, swappable handle to the local haptic API.
///
/// Loops read the handle every iteration so they pick up a reconnecting
/// device without restarting.
#[derive(Clone, Default)]
pub struct DeviceSlot {
    shared: Arc<RwLock<Option<Arc<dyn HapticDevice>>>>,
}

impl DeviceSlot {
    pub fn new(device: Option<Arc<dyn HapticDevice>>) -> Self {
        Self {
            shared: Arc::new(RwLock::new(device)),
        }
    }

    /// Current device, or `None` while the haptic API is unavailable.
    pub fn get(&self) -> Option<Arc<dyn HapticDevice>> {
        self.shared.read().ok().and_then(|slot| slot.clone())
    }

    pub fn is_available(&self) -> bool {
        self.get().is_some()
    }

    pub fn attach(&self, device: Arc<dyn HapticDevice>) -> Result<()> {
        let mut slot = self
            .shared
            .write()
            .map_err(|_| HaptickleError::msg("device slot has been poisoned"))?;
        *slot = Some(device);
        Ok(())
    }

    /// Releases the handle, returning the device that was attached.
    pub fn detach(&self) -> Result<Option<Arc<dyn HapticDevice>>> {
        let mut slot = self
            .shared
            .write()
            .map_err(|_| HaptickleError::msg("device slot has been poisoned"))?;
        Ok(slot.take())
    }
}

impl fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("available", &self.is_available())
            .finish()
    }
}

/// Device that only logs the pulses it is asked to fire. Used when no
/// hardware driver is linked in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDevice;

impl HapticDevice for TracingDevice {
    fn pulse(&self, device_index: u32, axis: u32, duration_us: u16) -> Result<()> {
        tracing::info!(device_index, axis, duration_us, "haptic pulse");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_attaches_and_detaches() {
        let slot = DeviceSlot::default();
        assert!(!slot.is_available());

        slot.attach(Arc::new(TracingDevice)).unwrap();
        assert!(slot.is_available());

        assert!(slot.detach().unwrap().is_some());
        assert!(!slot.is_available());
    }
}
