use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    config::EngineSettings,
    device::DeviceSlot,
    pattern::PatternConfig,
    registry::{CancelToken, LoopLease, LoopRegistry},
    state::StateStore,
    Result,
};

/// Strengths at or below this are treated as "off".
const SILENT_STRENGTH: f32 = 1e-3;

const HAPTIC_AXIS: u32 = 0;

/// Where a loop reads its intensity from on every iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopSignal {
    /// Fixed intensity, not bound to any parameter and never timing out.
    Constant(f32),
    /// Raw value of the bound state key.
    Value(String),
    /// Velocity of the bound state key, used as both value and delta.
    Velocity(String),
}

impl LoopSignal {
    pub fn bound_key(&self) -> Option<&str> {
        match self {
            Self::Constant(_) => None,
            Self::Value(key) | Self::Velocity(key) => Some(key),
        }
    }

    /// Reads `(value, delta)` for this iteration, or `None` once the bound
    /// key has gone quiet for longer than `timeout`.
    pub(crate) fn sample(
        &self,
        state: &StateStore,
        now: Instant,
        timeout: Duration,
    ) -> Result<Option<(f32, f32)>> {
        let key = match self {
            Self::Constant(value) => return Ok(Some((*value, 0.0))),
            Self::Value(key) | Self::Velocity(key) => key,
        };

        let Some(entry) = state.get(key)? else {
            return Ok(None);
        };
        if now.saturating_duration_since(entry.last_update) > timeout {
            return Ok(None);
        }

        Ok(Some(match self {
            Self::Velocity(_) => (entry.velocity, entry.velocity),
            _ => (entry.value, 0.0),
        }))
    }
}

/// Shapes a sample into a strength in `[0, 1]`, never NaN.
pub(crate) fn shaped_strength(
    pattern: &PatternConfig,
    value: f32,
    delta: f32,
    phase: f32,
) -> f32 {
    let intensity = pattern.apply(value, delta, phase);
    if intensity.is_finite() {
        intensity.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Owns one pulse loop per local tracker.
#[derive(Debug, Clone)]
pub struct PulseScheduler {
    registry: Arc<LoopRegistry>,
    devices: DeviceSlot,
    state: StateStore,
    settings: Arc<EngineSettings>,
    shutdown: CancelToken,
}

impl PulseScheduler {
    pub fn new(
        registry: Arc<LoopRegistry>,
        devices: DeviceSlot,
        state: StateStore,
        settings: Arc<EngineSettings>,
        shutdown: CancelToken,
    ) -> Self {
        Self {
            registry,
            devices,
            state,
            settings,
            shutdown,
        }
    }

    /// Replaces whatever loop drives `identity` with a fresh one.
    pub fn start(
        &self,
        device_index: u32,
        identity: &str,
        pattern: &PatternConfig,
        signal: LoopSignal,
    ) -> Result<u64> {
        let job = PulseJob {
            device_index,
            pattern: pattern.clone(),
            signal,
            devices: self.devices.clone(),
            state: self.state.clone(),
            settings: Arc::clone(&self.settings),
        };
        self.registry.install(identity, None, move |lease| job.run(lease))
    }

    pub fn stop(&self, identity: &str) -> Result<bool> {
        self.registry.stop(identity)
    }

    pub fn is_running(&self, identity: &str) -> bool {
        self.registry.is_running(identity)
    }

    /// Fires full-length pulses for the identify window so a user can find
    /// the tracker. Runs beside any active loop without touching it and is
    /// awaited by registry shutdown.
    pub fn identify(&self, device_index: u32) -> Result<()> {
        let devices = self.devices.clone();
        let settings = Arc::clone(&self.settings);
        let shutdown = self.shutdown.clone();

        self.registry.spawn_detached(async move {
            let until = Instant::now() + settings.identify_duration();
            let pulse_us = settings.pulse_max_us;
            let period = Duration::from_micros(u64::from(pulse_us)) + settings.pulse_gap();

            while Instant::now() < until {
                match devices.get() {
                    Some(device) => {
                        if let Err(err) = device.pulse(device_index, HAPTIC_AXIS, pulse_us) {
                            tracing::warn!(device_index, %err, "identify pulse failed");
                        }
                    }
                    None => tracing::debug!(device_index, "identify skipped, no haptic device"),
                }
                if !shutdown.sleep(period).await {
                    break;
                }
            }
        })
    }
}

struct PulseJob {
    device_index: u32,
    pattern: PatternConfig,
    signal: LoopSignal,
    devices: DeviceSlot,
    state: StateStore,
    settings: Arc<EngineSettings>,
}

impl PulseJob {
    async fn run(self, lease: LoopLease) {
        let started = Instant::now();
        let timeout = self.settings.timeout();
        tracing::debug!(
            device = %lease.key(),
            generation = lease.generation(),
            "pulse loop started"
        );

        while !lease.is_cancelled() {
            let now = Instant::now();
            let (value, delta) = match self.signal.sample(&self.state, now, timeout) {
                Ok(Some(sample)) => sample,
                Ok(None) => {
                    tracing::debug!(device = %lease.key(), "parameter timed out, stopping");
                    break;
                }
                Err(err) => {
                    tracing::warn!(device = %lease.key(), %err, "pulse loop lost its state");
                    break;
                }
            };

            let phase = now.saturating_duration_since(started).as_secs_f32();
            let strength = shaped_strength(&self.pattern, value, delta, phase);

            let wait = match self.devices.get() {
                Some(device) if strength > SILENT_STRENGTH => {
                    let duration_us = self.settings.pulse_duration_us(strength);
                    tracing::trace!(device = %lease.key(), strength, duration_us, "pulse");
                    if let Err(err) = device.pulse(self.device_index, HAPTIC_AXIS, duration_us) {
                        tracing::warn!(device = %lease.key(), %err, "haptic pulse failed");
                    }
                    Duration::from_micros(u64::from(duration_us)) + self.settings.pulse_gap()
                }
                _ => self.settings.idle_interval(),
            };

            if !lease.sleep(wait).await {
                break;
            }
        }

        tracing::debug!(
            device = %lease.key(),
            generation = lease.generation(),
            "pulse loop exited"
        );
    }
}

#[cfg(test)]
mod tests {
    use tokio::{runtime::Handle, sync::watch};

    use super::*;
    use crate::{
        device::{recording::RecordingDevice, HapticDevice},
        engine::EngineStatus,
        pattern::PatternKind,
    };

    struct Fixture {
        scheduler: PulseScheduler,
        device: Arc<RecordingDevice>,
        state: StateStore,
        registry: Arc<LoopRegistry>,
    }

    fn fixture_with(device: RecordingDevice, settings: EngineSettings) -> Fixture {
        let (status, _) = watch::channel(EngineStatus::default());
        let registry = Arc::new(LoopRegistry::new(Handle::current(), status));
        let device = Arc::new(device);
        let slot = DeviceSlot::new(Some(device.clone() as Arc<dyn HapticDevice>));
        let state = StateStore::new();
        let scheduler = PulseScheduler::new(
            Arc::clone(&registry),
            slot,
            state.clone(),
            Arc::new(settings),
            CancelToken::new(),
        );
        Fixture {
            scheduler,
            device,
            state,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingDevice::default(), EngineSettings::default())
    }

    fn linear() -> PatternConfig {
        PatternConfig::new(PatternKind::Linear)
    }

    #[tokio::test(start_paused = true)]
    async fn constant_loop_pulses_at_full_strength() {
        let fx = fixture();
        fx.scheduler
            .start(2, "LHR-1", &linear(), LoopSignal::Constant(1.0))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let pulses = fx.device.pulses();
        assert!(pulses.len() >= 5);
        assert!(pulses.iter().all(|p| p.device_index == 2 && p.duration_us == 3999));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_replaces_first_loop() {
        let fx = fixture();
        fx.scheduler
            .start(1, "LHR-1", &linear(), LoopSignal::Constant(1.0))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.scheduler
            .start(2, "LHR-1", &linear(), LoopSignal::Constant(1.0))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let mark = Instant::now();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let after: Vec<_> = fx
            .device
            .pulses()
            .into_iter()
            .filter(|p| p.at >= mark)
            .collect();
        assert!(!after.is_empty());
        assert!(after.iter().all(|p| p.device_index == 2));
        // One loop at ~14 ms per pulse; two racing loops would double this.
        assert!(after.len() <= 16, "got {} pulses", after.len());
        assert_eq!(fx.registry.running_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_key_stops_the_loop() {
        let mut settings = EngineSettings::default();
        settings.timeout_seconds = 1;
        let fx = fixture_with(RecordingDevice::default(), settings);

        fx.state
            .update("LHR-1:Touch", Instant::now(), |entry| entry.value = 0.8)
            .unwrap();
        fx.scheduler
            .start(0, "LHR-1", &linear(), LoopSignal::Value("LHR-1:Touch".into()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!fx.scheduler.is_running("LHR-1"));

        let count = fx.device.count();
        assert!(count > 0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.device.count(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_strength_idles_without_pulsing() {
        let fx = fixture();
        fx.state
            .update("LHR-1:Touch", Instant::now(), |entry| entry.value = 0.0)
            .unwrap();
        fx.scheduler
            .start(0, "LHR-1", &linear(), LoopSignal::Value("LHR-1:Touch".into()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.device.count(), 0);
        assert!(fx.scheduler.is_running("LHR-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_keeps_loop_alive() {
        let (status, _) = watch::channel(EngineStatus::default());
        let registry = Arc::new(LoopRegistry::new(Handle::current(), status));
        let slot = DeviceSlot::default();
        let scheduler = PulseScheduler::new(
            Arc::clone(&registry),
            slot.clone(),
            StateStore::new(),
            Arc::new(EngineSettings::default()),
            CancelToken::new(),
        );

        scheduler
            .start(0, "LHR-1", &linear(), LoopSignal::Constant(1.0))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(scheduler.is_running("LHR-1"));

        let device = Arc::new(RecordingDevice::default());
        slot.attach(device.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(device.count() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_device_does_not_end_the_loop() {
        let fx = fixture_with(RecordingDevice::failing(), EngineSettings::default());
        fx.scheduler
            .start(0, "LHR-1", &linear(), LoopSignal::Constant(1.0))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.device.count() > 1);
        assert!(fx.scheduler.is_running("LHR-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_pulses_promptly() {
        let fx = fixture();
        fx.scheduler
            .start(0, "LHR-1", &linear(), LoopSignal::Constant(1.0))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(fx.scheduler.stop("LHR-1").unwrap());
        tokio::time::sleep(Duration::from_millis(1)).await;
        let count = fx.device.count();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.device.count(), count);
        assert!(!fx.scheduler.stop("LHR-1").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn identify_runs_beside_loop() {
        let fx = fixture();
        fx.scheduler
            .start(0, "LHR-1", &linear(), LoopSignal::Constant(0.1))
            .unwrap();
        fx.scheduler.identify(5).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(fx.scheduler.is_running("LHR-1"));
        assert!(fx
            .device
            .pulses()
            .iter()
            .any(|p| p.device_index == 5 && p.duration_us == 3999));
    }
}
