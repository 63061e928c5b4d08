//! Bookkeeping for device loops: at most one live loop per device identity.
//!
//! Installing a loop cancels and takes ownership of the previous loop for the
//! same identity while the map is locked, so two starts can never both win.
//! The new task awaits the previous task before it runs, which keeps loop
//! generations for one device strictly ordered.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{runtime::Handle, sync::watch, task::JoinHandle, time::Instant};

use crate::{engine::EngineStatus, HaptickleError, Result};

/// Cooperative cancellation flag checked at every loop iteration and wait.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.flag.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when the
    /// wait was cut short by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// State shared between a registry entry and the task it owns.
#[derive(Debug)]
struct LoopControl {
    cancel: CancelToken,
    deadline: Mutex<Option<Instant>>,
}

/// A running loop's view of its own registration.
#[derive(Debug)]
pub struct LoopLease {
    key: String,
    generation: u64,
    control: Arc<LoopControl>,
}

impl LoopLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.cancel.is_cancelled()
    }

    pub async fn sleep(&self, duration: Duration) -> bool {
        self.control.cancel.sleep(duration).await
    }

    /// Current end of the loop's run window, if it has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.control.deadline.lock().ok().and_then(|deadline| *deadline)
    }
}

#[derive(Debug)]
struct LoopEntry {
    generation: u64,
    control: Arc<LoopControl>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Loops {
    live: HashMap<String, LoopEntry>,
    /// Stopped tasks that may still be running their cleanup, per key.
    retiring: HashMap<String, Vec<JoinHandle<()>>>,
    /// One-shot tasks that run beside the loops, e.g. identify bursts.
    detached: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Loops {
    fn retire(&mut self, key: &str, task: JoinHandle<()>) {
        let tasks = self.retiring.entry(key.to_string()).or_default();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

/// Map from device identity to the single loop allowed to drive it.
#[derive(Debug)]
pub struct LoopRegistry {
    loops: Mutex<Loops>,
    next_generation: AtomicU64,
    status: watch::Sender<EngineStatus>,
    runtime: Handle,
}

impl LoopRegistry {
    pub fn new(runtime: Handle, status: watch::Sender<EngineStatus>) -> Self {
        Self {
            loops: Mutex::new(Loops::default()),
            next_generation: AtomicU64::new(0),
            status,
            runtime,
        }
    }

    /// Cancels any loop registered under `key` and spawns `body` in its place.
    ///
    /// The new task first awaits every earlier task for `key`, live or
    /// already stopped, so generations never overlap. Returns the generation
    /// number of the new loop.
    pub fn install<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        deadline: Option<Instant>,
        body: F,
    ) -> Result<u64>
    where
        F: FnOnce(LoopLease) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut loops = self.lock()?;
        if loops.closed {
            return Err(HaptickleError::msg("loop registry has been shut down"));
        }

        let mut previous = loops.retiring.remove(key).unwrap_or_default();
        if let Some(entry) = loops.live.remove(key) {
            entry.control.cancel.cancel();
            previous.push(entry.task);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let control = Arc::new(LoopControl {
            cancel: CancelToken::new(),
            deadline: Mutex::new(deadline),
        });
        let lease = LoopLease {
            key: key.to_string(),
            generation,
            control: Arc::clone(&control),
        };

        let work = body(lease);
        let registry = Arc::clone(self);
        let owned_key = key.to_string();
        let task = self.runtime.spawn(async move {
            for task in previous {
                let _ = task.await;
            }
            work.await;
            registry.release(&owned_key, generation);
        });

        loops.live.insert(
            key.to_string(),
            LoopEntry {
                generation,
                control,
                task,
            },
        );
        let running = loops.live.len();
        drop(loops);

        tracing::debug!(device = %key, generation, "loop installed");
        self.publish(running);
        Ok(generation)
    }

    /// Spawns a one-shot task that is not keyed to a device but is still
    /// awaited by [`shutdown`](Self::shutdown).
    pub fn spawn_detached<Fut>(&self, task: Fut) -> Result<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut loops = self.lock()?;
        if loops.closed {
            return Err(HaptickleError::msg("loop registry has been shut down"));
        }
        loops.detached.retain(|task| !task.is_finished());
        let handle = self.runtime.spawn(task);
        loops.detached.push(handle);
        Ok(())
    }

    /// Cancels and forgets the loop for `key`. A no-op when nothing runs.
    pub fn stop(&self, key: &str) -> Result<bool> {
        self.stop_matching(key, |_| true)
    }

    /// Stops the loop for `key` only if it is still `generation`.
    pub fn stop_generation(&self, key: &str, generation: u64) -> Result<bool> {
        self.stop_matching(key, |entry| entry.generation == generation)
    }

    /// Moves the run window of a live loop. Returns `false` when no loop is
    /// registered for `key`.
    pub fn rearm(&self, key: &str, deadline: Instant) -> Result<bool> {
        let loops = self.lock()?;
        let Some(entry) = loops.live.get(key) else {
            return Ok(false);
        };
        if entry.control.cancel.is_cancelled() {
            return Ok(false);
        }
        let mut slot = entry
            .control
            .deadline
            .lock()
            .map_err(|_| HaptickleError::msg("loop deadline has been poisoned"))?;
        *slot = Some(deadline);
        Ok(true)
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.lock()
            .map(|loops| loops.live.contains_key(key))
            .unwrap_or(false)
    }

    pub fn generation_of(&self, key: &str) -> Option<u64> {
        self.lock()
            .ok()
            .and_then(|loops| loops.live.get(key).map(|entry| entry.generation))
    }

    pub fn running_count(&self) -> usize {
        self.lock().map(|loops| loops.live.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|loops| loops.closed).unwrap_or(true)
    }

    /// Refuses new loops, cancels every live one and waits until all tasks,
    /// including stopped loops still cleaning up, have finished.
    ///
    /// Returns the number of live loops that were cancelled.
    pub async fn shutdown(&self) -> Result<usize> {
        let (live, retiring, detached) = {
            let mut loops = self.lock()?;
            loops.closed = true;
            let live: Vec<(String, LoopEntry)> = loops.live.drain().collect();
            let retiring: Vec<(String, JoinHandle<()>)> = loops
                .retiring
                .drain()
                .flat_map(|(key, tasks)| tasks.into_iter().map(move |task| (key.clone(), task)))
                .collect();
            let detached = std::mem::take(&mut loops.detached);
            (live, retiring, detached)
        };
        self.publish(0);

        for (_, entry) in &live {
            entry.control.cancel.cancel();
        }
        let count = live.len();
        let tasks = live
            .into_iter()
            .map(|(key, entry)| (key, entry.task))
            .chain(retiring);
        for (key, task) in tasks {
            if let Err(err) = task.await {
                tracing::warn!(device = %key, %err, "loop task ended abnormally");
            }
        }
        for task in detached {
            if let Err(err) = task.await {
                tracing::warn!(%err, "detached task ended abnormally");
            }
        }
        Ok(count)
    }

    fn stop_matching(
        &self,
        key: &str,
        matches: impl FnOnce(&LoopEntry) -> bool,
    ) -> Result<bool> {
        let mut loops = self.lock()?;
        let matched = loops.live.get(key).map(matches).unwrap_or(false);
        let Some(entry) = matched.then(|| loops.live.remove(key)).flatten() else {
            return Ok(false);
        };

        entry.control.cancel.cancel();
        let generation = entry.generation;
        loops.retire(key, entry.task);
        let running = loops.live.len();
        drop(loops);

        tracing::debug!(device = %key, generation, "loop stopped");
        self.publish(running);
        Ok(true)
    }

    /// Called by a finished task; only removes the entry it owns.
    fn release(&self, key: &str, generation: u64) {
        let Ok(mut loops) = self.lock() else {
            return;
        };
        if loops.live.get(key).map(|entry| entry.generation) == Some(generation) {
            loops.live.remove(key);
            let running = loops.live.len();
            drop(loops);
            tracing::debug!(device = %key, generation, "loop finished");
            self.publish(running);
        }
    }

    fn publish(&self, running: usize) {
        self.status.send_if_modified(|status| {
            let triggered = running > 0;
            let changed = status.triggered != triggered;
            status.triggered = triggered;
            changed
        });
    }

    fn lock(&self) -> Result<MutexGuard<'_, Loops>> {
        self.loops
            .lock()
            .map_err(|_| HaptickleError::msg("loop registry has been poisoned"))
    }
}
