use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::time::Instant;

use crate::{HaptickleError, Result};

/// Runtime state tracked for one `device-identity:parameter-name` key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyState {
    /// Validity after the workaround policy has been applied.
    pub valid: bool,
    /// Raw query result, the basis for the next update's edge flags.
    pub satisfied: bool,
    pub value: f32,
    pub velocity: f32,
    pub last_update: Instant,
    /// False until `value` holds a real sample to measure velocity against.
    pub primed: bool,
}

impl KeyState {
    fn new(now: Instant) -> Self {
        Self {
            valid: false,
            satisfied: false,
            value: 0.0,
            velocity: 0.0,
            last_update: now,
            primed: false,
        }
    }

    /// Seconds since this key last received an update.
    pub fn age_seconds(&self, now: Instant) -> f32 {
        now.saturating_duration_since(self.last_update).as_secs_f32()
    }
}

/// Shared per-key state written by the evaluator and read by running loops.
///
/// Entries are created on first observation and live until evicted.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    shared: Arc<Mutex<HashMap<String, KeyState>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Result<Option<KeyState>> {
        Ok(self.lock()?.get(key).copied())
    }

    /// Runs `update` against the entry for `key`, creating it first if needed,
    /// and returns the closure's result.
    pub fn update<R>(
        &self,
        key: &str,
        now: Instant,
        update: impl FnOnce(&mut KeyState) -> R,
    ) -> Result<R> {
        let mut map = self.lock()?;
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| KeyState::new(now));
        Ok(update(entry))
    }

    /// Zeroes the motion fields so a restarted velocity loop does not spike.
    /// The next sample only re-seeds the value.
    pub fn reset_motion(&self, key: &str) -> Result<()> {
        if let Some(entry) = self.lock()?.get_mut(key) {
            entry.value = 0.0;
            entry.velocity = 0.0;
            entry.primed = false;
        }
        Ok(())
    }

    /// Drops every key that belongs to `identity`. Returns how many were removed.
    pub fn evict_device(&self, identity: &str) -> Result<usize> {
        let prefix = format!("{identity}:");
        let mut map = self.lock()?;
        let before = map.len();
        map.retain(|key, _| !key.starts_with(&prefix));
        Ok(before - map.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, KeyState>>> {
        self.shared
            .lock()
            .map_err(|_| HaptickleError::msg("parameter state has been poisoned"))
    }
}
