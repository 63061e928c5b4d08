use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::watch};

use crate::{
    broadcast::ExternalBroadcaster,
    config::HaptickleConfig,
    device::{DeviceSlot, HapticDevice},
    evaluator::TriggerEvaluator,
    parameter::ParameterUpdate,
    registry::{CancelToken, LoopRegistry},
    scheduler::PulseScheduler,
    state::{KeyState, StateStore},
    trigger::ResolvedTarget,
    HaptickleError, Result,
};

/// Outbound status parameter names.
pub const STATUS_ENABLED: &str = "Haptickle/Enabled";
pub const STATUS_TRIGGERED: &str = "Haptickle/Triggered";
pub const STATUS_ACTIVE: &str = "Haptickle/Active";

/// Lifecycle of a [`HapticEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    /// Running, but the local haptic API is unavailable. Triggers are still
    /// evaluated so pulses resume as soon as a device is attached.
    Degraded,
}

/// Aggregate status published to the host bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Any output is configured.
    pub enabled: bool,
    /// Any device loop is running.
    pub triggered: bool,
    /// The local haptic API is available.
    pub active: bool,
}

impl EngineStatus {
    /// Boolean-as-float parameters for the host bus.
    pub fn as_parameters(&self) -> Vec<ParameterUpdate> {
        let flag = |on: bool| if on { 1.0 } else { 0.0 };
        vec![
            ParameterUpdate::float(STATUS_ENABLED, flag(self.enabled)),
            ParameterUpdate::float(STATUS_TRIGGERED, flag(self.triggered)),
            ParameterUpdate::float(STATUS_ACTIVE, flag(self.active)),
        ]
    }
}

/// Haptic trigger engine: evaluates parameter updates and owns every loop.
#[derive(Debug)]
pub struct HapticEngine {
    evaluator: TriggerEvaluator,
    scheduler: PulseScheduler,
    broadcaster: ExternalBroadcaster,
    registry: Arc<LoopRegistry>,
    state: StateStore,
    devices: DeviceSlot,
    status: watch::Sender<EngineStatus>,
    lifecycle: Mutex<EngineState>,
    shutdown: CancelToken,
}

impl HapticEngine {
    /// Starts an engine whose outbound socket binds an ephemeral port.
    pub async fn start(
        config: HaptickleConfig,
        device: Option<Arc<dyn HapticDevice>>,
    ) -> Result<Self> {
        Self::start_on(config, device, SocketAddr::from(([0, 0, 0, 0], 0))).await
    }

    /// Starts an engine with an explicit local address for outbound datagrams.
    pub async fn start_on(
        config: HaptickleConfig,
        device: Option<Arc<dyn HapticDevice>>,
        bind: SocketAddr,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = Handle::current();
        let settings = Arc::new(config.engine.clone());
        let devices = DeviceSlot::new(device);
        let state = StateStore::new();
        let shutdown = CancelToken::new();
        let (status, _) = watch::channel(EngineStatus {
            enabled: config.has_active_outputs(),
            triggered: false,
            active: devices.is_available(),
        });
        let registry = Arc::new(LoopRegistry::new(runtime, status.clone()));

        let scheduler = PulseScheduler::new(
            Arc::clone(&registry),
            devices.clone(),
            state.clone(),
            Arc::clone(&settings),
            shutdown.clone(),
        );
        let broadcaster = ExternalBroadcaster::bind(
            bind,
            Arc::clone(&registry),
            state.clone(),
            Arc::clone(&settings),
            shutdown.clone(),
        )
        .await?;
        let evaluator = TriggerEvaluator::new(
            &config,
            state.clone(),
            scheduler.clone(),
            broadcaster.clone(),
            Arc::clone(&registry),
            settings,
            shutdown.clone(),
        )?;

        let lifecycle = if devices.is_available() {
            EngineState::Running
        } else {
            EngineState::Degraded
        };
        tracing::info!(
            triggers = config.triggers.len(),
            device_mappings = config.device_mappings.len(),
            state = ?lifecycle,
            "haptic engine started"
        );

        Ok(Self {
            evaluator,
            scheduler,
            broadcaster,
            registry,
            state,
            devices,
            status,
            lifecycle: Mutex::new(lifecycle),
            shutdown,
        })
    }

    /// Feeds one parameter update through the evaluator. Never blocks on I/O.
    ///
    /// Returns the number of watches that matched the update.
    pub fn handle_update(&self, update: &ParameterUpdate) -> Result<usize> {
        if self.state() == EngineState::Stopped {
            tracing::trace!(parameter = %update.name, "engine stopped, update ignored");
            return Ok(0);
        }
        match self.evaluator.handle_update(update) {
            // Lost a race with `shutdown`: the registry refused the new loop.
            Err(_) if self.registry.is_closed() => {
                tracing::trace!(parameter = %update.name, "engine shutting down, update ignored");
                Ok(0)
            }
            result => result,
        }
    }

    pub fn attach_device(&self, device: Arc<dyn HapticDevice>) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle()?;
        if *lifecycle == EngineState::Stopped {
            return Err(HaptickleError::msg("engine has been shut down"));
        }
        self.devices.attach(device)?;
        *lifecycle = EngineState::Running;
        self.status.send_modify(|status| status.active = true);
        tracing::info!("haptic device attached");
        Ok(())
    }

    /// Drops the local device handle. Loops keep running and idle until a
    /// device is attached again.
    pub fn detach_device(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle()?;
        self.devices.detach()?;
        if *lifecycle == EngineState::Running {
            *lifecycle = EngineState::Degraded;
        }
        self.status.send_modify(|status| status.active = false);
        tracing::info!("haptic device detached");
        Ok(())
    }

    /// Fires the identify burst on the trigger's device. The burst runs in
    /// the background and [`shutdown`](Self::shutdown) waits for it.
    pub fn identify(&self, trigger_id: &str) -> Result<()> {
        let bound = self
            .evaluator
            .find(trigger_id)
            .ok_or_else(|| HaptickleError::UnknownTrigger(trigger_id.to_string()))?;
        match &bound.target {
            ResolvedTarget::Local { index, .. } => self.scheduler.identify(*index),
            ResolvedTarget::External(mapping) => self.broadcaster.identify(mapping),
        }
    }

    /// Stops the loop driving the trigger's device, if any.
    pub fn stop_trigger(&self, trigger_id: &str) -> Result<bool> {
        let bound = self
            .evaluator
            .find(trigger_id)
            .ok_or_else(|| HaptickleError::UnknownTrigger(trigger_id.to_string()))?;
        self.evaluator.stop(bound)
    }

    /// Stops any loop for `identity` and forgets its parameter state.
    pub fn evict_device(&self, identity: &str) -> Result<usize> {
        self.registry.stop(identity)?;
        self.state.evict_device(identity)
    }

    pub fn is_running(&self, identity: &str) -> bool {
        self.registry.is_running(identity)
    }

    pub fn loop_generation(&self, identity: &str) -> Option<u64> {
        self.registry.generation_of(identity)
    }

    pub fn parameter_state(&self, key: &str) -> Result<Option<KeyState>> {
        self.state.get(key)
    }

    pub fn state(&self) -> EngineState {
        self.lock_lifecycle()
            .map(|lifecycle| *lifecycle)
            .unwrap_or(EngineState::Stopped)
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    pub fn outbound_addr(&self) -> Result<SocketAddr> {
        self.broadcaster.local_addr()
    }

    /// Cancels every loop, waits for their cleanup and releases the device.
    pub async fn shutdown(&self) -> Result<usize> {
        {
            let mut lifecycle = self.lock_lifecycle()?;
            if *lifecycle == EngineState::Stopped {
                return Ok(0);
            }
            *lifecycle = EngineState::Stopped;
        }

        self.shutdown.cancel();
        let stopped = self.registry.shutdown().await?;
        self.devices.detach()?;
        self.status.send_modify(|status| {
            status.triggered = false;
            status.active = false;
        });
        tracing::info!(loops = stopped, "haptic engine shut down");
        Ok(stopped)
    }

    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.lifecycle
            .lock()
            .map_err(|_| HaptickleError::msg("engine lifecycle has been poisoned"))
    }
}
