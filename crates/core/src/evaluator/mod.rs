//! Turns parameter updates into loop starts and stops.
//!
//! Evaluation runs synchronously on whichever thread delivers updates and
//! never waits on I/O: loops and burst timers are spawned through the
//! [`LoopRegistry`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::time::Instant;

use crate::{
    broadcast::ExternalBroadcaster,
    config::{EngineSettings, HaptickleConfig},
    parameter::{ParameterUpdate, ParameterWatch},
    registry::{CancelToken, LoopRegistry},
    scheduler::{LoopSignal, PulseScheduler},
    state::StateStore,
    trigger::{state_key, HapticTrigger, ResolvedTarget, TriggerMode},
    validity::evaluate_validity,
    HaptickleError, Result,
};

/// Floor for elapsed time in velocity calculations.
const VELOCITY_EPSILON_SECONDS: f32 = 1e-3;

/// A trigger together with the output it was resolved to.
#[derive(Debug, Clone)]
pub struct BoundTrigger {
    pub trigger: HapticTrigger,
    pub target: ResolvedTarget,
}

impl BoundTrigger {
    pub fn identity(&self) -> String {
        self.target.identity()
    }
}

/// What a single watch evaluation observed.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Observation {
    was_valid: bool,
    is_valid: bool,
    velocity: f32,
}

#[derive(Debug)]
pub struct TriggerEvaluator {
    triggers: Vec<BoundTrigger>,
    state: StateStore,
    scheduler: PulseScheduler,
    broadcaster: ExternalBroadcaster,
    registry: Arc<LoopRegistry>,
    settings: Arc<EngineSettings>,
    bursts: Arc<Mutex<HashMap<String, u64>>>,
    shutdown: CancelToken,
}

impl TriggerEvaluator {
    pub fn new(
        config: &HaptickleConfig,
        state: StateStore,
        scheduler: PulseScheduler,
        broadcaster: ExternalBroadcaster,
        registry: Arc<LoopRegistry>,
        settings: Arc<EngineSettings>,
        shutdown: CancelToken,
    ) -> Result<Self> {
        let triggers = config
            .triggers
            .iter()
            .map(|trigger| {
                Ok(BoundTrigger {
                    target: config.resolve_target(trigger)?,
                    trigger: trigger.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            triggers,
            state,
            scheduler,
            broadcaster,
            registry,
            settings,
            bursts: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        })
    }

    pub fn triggers(&self) -> &[BoundTrigger] {
        &self.triggers
    }

    pub fn find(&self, trigger_id: &str) -> Option<&BoundTrigger> {
        self.triggers
            .iter()
            .find(|bound| bound.trigger.id == trigger_id)
    }

    /// Evaluates every watch interested in `update` and returns how many
    /// matched. Watches of the same trigger are evaluated independently.
    pub fn handle_update(&self, update: &ParameterUpdate) -> Result<usize> {
        let mut matched = 0;
        for bound in &self.triggers {
            for watch in bound.trigger.watches.iter().filter(|watch| watch.matches(update)) {
                matched += 1;
                let key = state_key(&bound.identity(), &watch.name);
                let observation = self.observe(bound, watch, &key, update)?;
                self.dispatch(bound, &key, observation)?;
            }
        }

        if matched == 0 {
            tracing::trace!(parameter = %update.name, "no watch for parameter");
        }
        Ok(matched)
    }

    /// Stops whatever loop drives the trigger's device.
    pub fn stop(&self, bound: &BoundTrigger) -> Result<bool> {
        match &bound.target {
            ResolvedTarget::Local { identity, .. } => self.scheduler.stop(identity),
            ResolvedTarget::External(mapping) => self.broadcaster.stop(mapping),
        }
    }

    fn observe(
        &self,
        bound: &BoundTrigger,
        watch: &ParameterWatch,
        key: &str,
        update: &ParameterUpdate,
    ) -> Result<Observation> {
        let now = Instant::now();
        let mode = bound.trigger.mode;
        let speed = bound.trigger.pattern.effective_speed();
        let previous = self.state.get(key)?;

        let query = watch.query(update, previous.map(|entry| entry.satisfied));
        let was_valid = previous.map(|entry| entry.valid).unwrap_or(false);
        let is_valid = evaluate_validity(mode, &query, update, watch, was_valid);
        let value = update.value.as_f32();

        let velocity = match previous {
            Some(entry) if mode == TriggerMode::Velocity && entry.primed => {
                let elapsed = entry.age_seconds(now).max(VELOCITY_EPSILON_SECONDS);
                ((value - entry.value).abs() / elapsed * speed).clamp(0.0, 1.0)
            }
            _ => 0.0,
        };

        self.state.update(key, now, |entry| {
            entry.valid = is_valid;
            entry.satisfied = query.is_valid;
            entry.value = value;
            entry.velocity = velocity;
            entry.primed = true;
            entry.last_update = now;
        })?;

        Ok(Observation {
            was_valid,
            is_valid,
            velocity,
        })
    }

    fn dispatch(&self, bound: &BoundTrigger, key: &str, seen: Observation) -> Result<()> {
        let fell = seen.was_valid && !seen.is_valid;
        let rose = seen.is_valid && !seen.was_valid;

        match bound.trigger.mode {
            TriggerMode::Off => {
                self.stop(bound)?;
            }
            TriggerMode::Constant => {
                if fell {
                    self.stop(bound)?;
                } else if rose {
                    self.start(bound, LoopSignal::Constant(1.0))?;
                } else if seen.is_valid {
                    self.ensure_running(bound, LoopSignal::Constant(1.0))?;
                }
            }
            TriggerMode::Proximity => {
                if fell {
                    self.stop(bound)?;
                } else if seen.is_valid {
                    self.ensure_running(bound, LoopSignal::Value(key.to_string()))?;
                }
            }
            TriggerMode::Velocity => {
                let moving = seen.velocity >= self.settings.velocity_threshold;
                if fell || !moving {
                    if self.stop(bound)? {
                        self.state.reset_motion(key)?;
                    }
                } else if seen.is_valid {
                    self.ensure_running(bound, LoopSignal::Velocity(key.to_string()))?;
                }
            }
            TriggerMode::OnChange => {
                if seen.is_valid != seen.was_valid {
                    self.burst(bound)?;
                }
            }
        }
        Ok(())
    }

    fn start(&self, bound: &BoundTrigger, signal: LoopSignal) -> Result<u64> {
        let pattern = &bound.trigger.pattern;
        match &bound.target {
            ResolvedTarget::Local { index, identity } => {
                self.scheduler.start(*index, identity, pattern, signal)
            }
            ResolvedTarget::External(mapping) => self.broadcaster.start(mapping, pattern, signal),
        }
    }

    /// Local loops start only when idle; external loops get re-armed.
    fn ensure_running(&self, bound: &BoundTrigger, signal: LoopSignal) -> Result<()> {
        match &bound.target {
            ResolvedTarget::Local { identity, .. } => {
                if !self.scheduler.is_running(identity) {
                    self.start(bound, signal)?;
                }
                Ok(())
            }
            ResolvedTarget::External(mapping) => {
                self.broadcaster
                    .keep_alive(mapping, &bound.trigger.pattern, signal)
            }
        }
    }

    /// Starts a fixed-length burst. Flips during an active burst for the same
    /// device are ignored.
    fn burst(&self, bound: &BoundTrigger) -> Result<()> {
        let identity = bound.identity();
        let mut bursts = self.lock_bursts()?;
        if let Some(generation) = bursts.get(&identity) {
            if self.registry.generation_of(&identity) == Some(*generation) {
                tracing::trace!(device = %identity, "burst already running");
                return Ok(());
            }
        }

        let generation = self.start(bound, LoopSignal::Constant(1.0))?;
        bursts.insert(identity.clone(), generation);
        drop(bursts);

        let registry = Arc::clone(&self.registry);
        let bursts = Arc::clone(&self.bursts);
        let shutdown = self.shutdown.clone();
        let delay = self.settings.on_change_burst();
        self.registry.spawn_detached(async move {
            if shutdown.sleep(delay).await {
                if let Err(err) = registry.stop_generation(&identity, generation) {
                    tracing::warn!(device = %identity, %err, "failed to end burst");
                }
            }
            if let Ok(mut bursts) = bursts.lock() {
                if bursts.get(&identity) == Some(&generation) {
                    bursts.remove(&identity);
                }
            }
        })
    }

    fn lock_bursts(&self) -> Result<MutexGuard<'_, HashMap<String, u64>>> {
        self.bursts
            .lock()
            .map_err(|_| HaptickleError::msg("burst timers have been poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        device::recording::RecordingDevice,
        engine::HapticEngine,
        parameter::{Comparison, ParameterValue},
        pattern::{PatternConfig, PatternKind},
        trigger::DeviceMapping,
    };

    fn touch_watch() -> ParameterWatch {
        ParameterWatch::new("Touch", Comparison::GreaterThan, ParameterValue::Float(0.0))
    }

    async fn engine_with(trigger: HapticTrigger) -> (HapticEngine, Arc<RecordingDevice>) {
        let device = Arc::new(RecordingDevice::default());
        let config = HaptickleConfig {
            triggers: vec![trigger],
            ..Default::default()
        };
        let engine = HapticEngine::start(config, Some(device.clone()))
            .await
            .unwrap();
        (engine, device)
    }

    #[tokio::test(start_paused = true)]
    async fn constant_follows_validity_edges() {
        let trigger = HapticTrigger::local("hand", 0, "LHR-1")
            .with_mode(TriggerMode::Constant)
            .with_watch(touch_watch());
        let (engine, device) = engine_with(trigger).await;

        engine.handle_update(&ParameterUpdate::float("Touch", 0.3)).unwrap();
        assert!(engine.is_running("LHR-1"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Constant mode ignores the raw value and pulses at full strength.
        assert!(device.pulses().iter().all(|p| p.duration_us == 3999));

        let generation = engine.loop_generation("LHR-1");
        engine.handle_update(&ParameterUpdate::float("Touch", 0.5)).unwrap();
        assert_eq!(engine.loop_generation("LHR-1"), generation);

        engine.handle_update(&ParameterUpdate::float("Touch", 0.0)).unwrap();
        assert!(!engine.is_running("LHR-1"));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_without_watches_never_activates() {
        let trigger = HapticTrigger::local("idle", 0, "LHR-1").with_mode(TriggerMode::Constant);
        let (engine, device) = engine_with(trigger).await;

        assert_eq!(engine.handle_update(&ParameterUpdate::float("Touch", 1.0)).unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(device.count(), 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn off_mode_never_runs() {
        let trigger = HapticTrigger::local("off", 0, "LHR-1")
            .with_mode(TriggerMode::Off)
            .with_watch(touch_watch());
        let (engine, _device) = engine_with(trigger).await;

        assert_eq!(engine.handle_update(&ParameterUpdate::float("Touch", 1.0)).unwrap(), 1);
        assert!(!engine.is_running("LHR-1"));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn proximity_uses_raw_value_and_times_out() {
        let trigger = HapticTrigger::local("near", 3, "LHR-3")
            .with_mode(TriggerMode::Proximity)
            .with_watch(touch_watch());
        let (engine, device) = engine_with(trigger).await;

        engine.handle_update(&ParameterUpdate::float("Touch", 0.6)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let expected = 100 + (0.6f32 * 3899.0).round() as u16;
        let pulses = device.pulses();
        assert!(!pulses.is_empty());
        assert!(pulses
            .iter()
            .all(|p| p.device_index == 3 && p.duration_us.abs_diff(expected) <= 1));

        // Falling below the threshold is not an off edge for proximity.
        engine.handle_update(&ParameterUpdate::float("Touch", 0.0)).unwrap();
        assert!(engine.is_running("LHR-3"));

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(!engine.is_running("LHR-3"));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn velocity_starts_on_movement_and_resets_on_rest() {
        let trigger = HapticTrigger::local("swing", 0, "LHR-1")
            .with_mode(TriggerMode::Velocity)
            .with_watch(ParameterWatch::new(
                "Hand",
                Comparison::GreaterThanOrEqualTo,
                ParameterValue::Float(0.0),
            ));
        let (engine, device) = engine_with(trigger).await;

        engine.handle_update(&ParameterUpdate::float("Hand", 0.0)).unwrap();
        assert!(!engine.is_running("LHR-1"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.handle_update(&ParameterUpdate::float("Hand", 0.5)).unwrap();
        assert!(engine.is_running("LHR-1"));
        let state = engine.parameter_state("LHR-1:Hand").unwrap().unwrap();
        assert_eq!(state.velocity, 1.0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(device.count() > 0);

        engine.handle_update(&ParameterUpdate::float("Hand", 0.5)).unwrap();
        assert!(!engine.is_running("LHR-1"));
        let state = engine.parameter_state("LHR-1:Hand").unwrap().unwrap();
        assert_eq!(state.value, 0.0);
        assert_eq!(state.velocity, 0.0);

        // The reset value does not turn the next sample into a spike.
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.handle_update(&ParameterUpdate::float("Hand", 0.5)).unwrap();
        assert!(!engine.is_running("LHR-1"));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn velocity_is_scaled_by_speed() {
        let trigger = HapticTrigger::local("swing", 0, "LHR-1")
            .with_mode(TriggerMode::Velocity)
            .with_pattern(PatternConfig {
                pattern: PatternKind::Linear,
                speed: 0.1,
                ..Default::default()
            })
            .with_watch(touch_watch());
        let (engine, _device) = engine_with(trigger).await;

        engine.handle_update(&ParameterUpdate::float("Touch", 0.1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.handle_update(&ParameterUpdate::float("Touch", 0.6)).unwrap();

        let state = engine.parameter_state("LHR-1:Touch").unwrap().unwrap();
        assert!((state.velocity - 0.05).abs() < 1e-4);
        assert!(engine.is_running("LHR-1"));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn on_change_bursts_once_per_flip() {
        let trigger = HapticTrigger::local("tap", 0, "LHR-1")
            .with_mode(TriggerMode::OnChange)
            .with_watch(ParameterWatch::new(
                "Pat",
                Comparison::EqualTo,
                ParameterValue::Bool(true),
            ));
        let (engine, device) = engine_with(trigger).await;

        engine.handle_update(&ParameterUpdate::bool("Pat", true)).unwrap();
        let generation = engine.loop_generation("LHR-1");
        assert!(generation.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.handle_update(&ParameterUpdate::bool("Pat", false)).unwrap();
        engine.handle_update(&ParameterUpdate::bool("Pat", true)).unwrap();
        assert_eq!(engine.loop_generation("LHR-1"), generation);

        // The burst is 420 ms long, measured from the first flip.
        tokio::time::sleep(Duration::from_millis(310)).await;
        assert!(engine.is_running("LHR-1"));
        assert_eq!(engine.loop_generation("LHR-1"), generation);

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(!engine.is_running("LHR-1"));
        let pulses = device.count();
        assert!(pulses > 0);

        // A falling flip after the burst starts another one.
        engine.handle_update(&ParameterUpdate::bool("Pat", false)).unwrap();
        assert!(engine.is_running("LHR-1"));
        assert_ne!(engine.loop_generation("LHR-1"), generation);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn on_change_burst_on_external_device_ends_with_one_zero() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mapping = DeviceMapping {
            id: "vest".to_string(),
            device_ip: "127.0.0.1".to_string(),
            device_port: receiver.local_addr().unwrap().port(),
            osc_address: "/motor".to_string(),
        };
        let config = HaptickleConfig {
            engine: EngineSettings {
                external_send_interval_ms: 20,
                ..Default::default()
            },
            triggers: vec![HapticTrigger::external("tap", "vest")
                .with_mode(TriggerMode::OnChange)
                .with_watch(ParameterWatch::new(
                    "Pat",
                    Comparison::EqualTo,
                    ParameterValue::Bool(true),
                ))],
            device_mappings: vec![mapping.clone()],
        };
        let engine = HapticEngine::start(config, None).await.unwrap();

        let started = std::time::Instant::now();
        engine.handle_update(&ParameterUpdate::bool("Pat", true)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.handle_update(&ParameterUpdate::bool("Pat", false)).unwrap();

        let mut values = Vec::new();
        let mut buffer = [0u8; 64];
        let quiet = Duration::from_millis(300);
        while let Ok(Ok(len)) = tokio::time::timeout(quiet, receiver.recv(&mut buffer)).await {
            assert_eq!(len, 16);
            values.push(i32::from_be_bytes([buffer[12], buffer[13], buffer[14], buffer[15]]));
        }
        let elapsed = started.elapsed() - quiet;

        assert!(elapsed >= Duration::from_millis(400), "burst ended after {elapsed:?}");
        assert_eq!(values.last(), Some(&0));
        assert_eq!(values.iter().filter(|value| **value == 0).count(), 1);
        assert!(values[..values.len() - 1].iter().all(|value| *value == 255));
        assert!(!engine.is_running(&mapping.identity()));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn watches_are_matched_by_name() {
        let trigger = HapticTrigger::local("multi", 0, "LHR-1")
            .with_mode(TriggerMode::Constant)
            .with_watch(touch_watch())
            .with_watch(ParameterWatch::new(
                "Grab",
                Comparison::GreaterThan,
                ParameterValue::Int(0),
            ));
        let (engine, _device) = engine_with(trigger).await;

        assert_eq!(engine.handle_update(&ParameterUpdate::int("Grab", 2)).unwrap(), 1);
        assert!(engine.parameter_state("LHR-1:Grab").unwrap().is_some());
        assert!(engine.parameter_state("LHR-1:Touch").unwrap().is_none());
        assert_eq!(engine.handle_update(&ParameterUpdate::float("Other", 1.0)).unwrap(), 0);
        engine.shutdown().await.unwrap();
    }
}
