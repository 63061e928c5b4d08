use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{net::UdpSocket, time::Instant};

use crate::{
    config::EngineSettings,
    osc::{encode_int_message, quantize_intensity},
    pattern::PatternConfig,
    registry::{CancelToken, LoopLease, LoopRegistry},
    scheduler::{shaped_strength, LoopSignal},
    state::StateStore,
    trigger::DeviceMapping,
    Result,
};

/// Shortest run window of an external loop.
const MIN_WINDOW_SECONDS: f64 = 0.1;

/// How long an external loop runs after being armed.
pub fn run_window(pattern: &PatternConfig) -> Duration {
    let speed = f64::from(pattern.effective_speed());
    Duration::from_secs_f64((1.0 / speed).max(MIN_WINDOW_SECONDS))
}

/// Outbound sockets: the configured one plus, when the host allows it, one
/// for the other address family.
#[derive(Debug)]
struct Outbound {
    primary: UdpSocket,
    secondary: Option<UdpSocket>,
}

impl Outbound {
    fn for_target(&self, target: &SocketAddr) -> Option<&UdpSocket> {
        std::iter::once(&self.primary)
            .chain(self.secondary.as_ref())
            .find(|socket| {
                socket
                    .local_addr()
                    .is_ok_and(|local| local.is_ipv4() == target.is_ipv4())
            })
    }
}

/// Drives network-addressable devices with single-integer control datagrams.
#[derive(Debug, Clone)]
pub struct ExternalBroadcaster {
    outbound: Arc<Outbound>,
    registry: Arc<LoopRegistry>,
    state: StateStore,
    settings: Arc<EngineSettings>,
    shutdown: CancelToken,
}

impl ExternalBroadcaster {
    /// Binds the outbound socket, plus a best-effort socket for the other
    /// address family. Use port 0 to let the OS choose.
    pub async fn bind(
        local_addr: SocketAddr,
        registry: Arc<LoopRegistry>,
        state: StateStore,
        settings: Arc<EngineSettings>,
        shutdown: CancelToken,
    ) -> Result<Self> {
        let primary = UdpSocket::bind(local_addr).await?;
        let other = if local_addr.is_ipv4() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let secondary = match UdpSocket::bind(other).await {
            Ok(socket) => Some(socket),
            Err(err) => {
                tracing::debug!(%err, "no outbound socket for the other address family");
                None
            }
        };
        tracing::debug!(local = ?primary.local_addr().ok(), "external broadcaster bound");
        Ok(Self {
            outbound: Arc::new(Outbound { primary, secondary }),
            registry,
            state,
            settings,
            shutdown,
        })
    }

    /// Starts a bounded loop for `mapping`, replacing any existing one.
    pub fn start(
        &self,
        mapping: &DeviceMapping,
        pattern: &PatternConfig,
        signal: LoopSignal,
    ) -> Result<u64> {
        let deadline = Instant::now() + run_window(pattern);
        let job = BroadcastJob {
            mapping: mapping.clone(),
            pattern: pattern.clone(),
            signal,
            outbound: Arc::clone(&self.outbound),
            state: self.state.clone(),
            settings: Arc::clone(&self.settings),
        };
        self.registry.install(&mapping.identity(), Some(deadline), move |lease| {
            job.run(lease)
        })
    }

    /// Extends the run window of a live loop. Returns `false` if none runs.
    pub fn rearm(&self, mapping: &DeviceMapping, pattern: &PatternConfig) -> Result<bool> {
        let deadline = Instant::now() + run_window(pattern);
        self.registry.rearm(&mapping.identity(), deadline)
    }

    /// Re-arms a live loop or starts a new one.
    pub fn keep_alive(
        &self,
        mapping: &DeviceMapping,
        pattern: &PatternConfig,
        signal: LoopSignal,
    ) -> Result<()> {
        if !self.rearm(mapping, pattern)? {
            self.start(mapping, pattern, signal)?;
        }
        Ok(())
    }

    /// Stops the loop; the loop itself sends the final zero datagram.
    pub fn stop(&self, mapping: &DeviceMapping) -> Result<bool> {
        self.registry.stop(&mapping.identity())
    }

    pub fn is_running(&self, mapping: &DeviceMapping) -> bool {
        self.registry.is_running(&mapping.identity())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.outbound.primary.local_addr()?)
    }

    /// Full intensity for the identify window, then zero. Shutdown cuts the
    /// window short but still waits for the zero.
    pub fn identify(&self, mapping: &DeviceMapping) -> Result<()> {
        let outbound = Arc::clone(&self.outbound);
        let mapping = mapping.clone();
        let window = self.settings.identify_duration();
        let shutdown = self.shutdown.clone();

        self.registry.spawn_detached(async move {
            send_intensity(&outbound, &mapping, 255).await;
            shutdown.sleep(window).await;
            send_intensity(&outbound, &mapping, 0).await;
        })
    }
}

struct BroadcastJob {
    mapping: DeviceMapping,
    pattern: PatternConfig,
    signal: LoopSignal,
    outbound: Arc<Outbound>,
    state: StateStore,
    settings: Arc<EngineSettings>,
}

impl BroadcastJob {
    async fn run(self, lease: LoopLease) {
        let started = Instant::now();
        let timeout = self.settings.timeout();
        let interval = self.settings.external_send_interval();
        tracing::debug!(
            device = %lease.key(),
            generation = lease.generation(),
            "broadcast loop started"
        );

        while !lease.is_cancelled() {
            let now = Instant::now();
            if lease.deadline().is_some_and(|deadline| now >= deadline) {
                break;
            }

            let (value, delta) = match self.signal.sample(&self.state, now, timeout) {
                Ok(Some(sample)) => sample,
                Ok(None) => {
                    tracing::debug!(device = %lease.key(), "parameter timed out, stopping");
                    break;
                }
                Err(err) => {
                    tracing::warn!(device = %lease.key(), %err, "broadcast loop lost its state");
                    break;
                }
            };

            let phase = now.saturating_duration_since(started).as_secs_f32();
            let strength = shaped_strength(&self.pattern, value, delta, phase);
            send_intensity(&self.outbound, &self.mapping, quantize_intensity(strength)).await;

            if !lease.sleep(interval).await {
                break;
            }
        }

        send_intensity(&self.outbound, &self.mapping, 0).await;
        tracing::debug!(
            device = %lease.key(),
            generation = lease.generation(),
            "broadcast loop exited"
        );
    }
}

/// Sends one control datagram. Failures are logged, never retried here.
async fn send_intensity(outbound: &Outbound, mapping: &DeviceMapping, value: i32) {
    let datagram = match encode_int_message(&mapping.osc_address, value) {
        Ok(datagram) => datagram,
        Err(err) => {
            tracing::warn!(device = %mapping.identity(), %err, "cannot encode control message");
            return;
        }
    };

    let target = match mapping.socket_addr() {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!(device = %mapping.identity(), %err, "cannot resolve device address");
            return;
        }
    };
    let Some(socket) = outbound.for_target(&target) else {
        tracing::warn!(device = %mapping.identity(), "no outbound socket for address family");
        return;
    };

    match socket.send_to(&datagram, target).await {
        Ok(_) => tracing::trace!(device = %mapping.identity(), value, "control message sent"),
        Err(err) => {
            tracing::warn!(device = %mapping.identity(), %err, "control message send failed")
        }
    }
}
