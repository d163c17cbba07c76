//! Keeps a ping-pong server registered with the discovery registry.
//!
//! The registrar owns the registry connection: it registers, heartbeats
//! with the current session count as load, and forwards `session_offer`
//! tickets into the server's [`TicketStore`]. A lost connection is retried
//! with exponential backoff until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::discovery::protocol::{
    RegisterParams, RegisterResult, SessionOfferParams, DISCOVERY_PROTOCOL_VERSION,
};
use crate::discovery::{DiscoveryClient, RegistryEvent};
use crate::pingpong::ServerStats;
use crate::tickets::{short_ticket, TicketStore};

/// First reconnect delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Reconnect delays never exceed this.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Bound on the best-effort unregister at shutdown.
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay before reconnect attempt `attempt` (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(multiplier).min(BACKOFF_MAX)
}

/// URL advertised when none is configured: the listen address itself.
///
/// An unspecified listen host (`::`, `0.0.0.0`) is replaced by the registry
/// with the address it observes.
pub fn default_advertise_url(listen: SocketAddr) -> String {
    format!("https://{}/", listen)
}

/// Random server id used when none is configured.
pub fn default_server_id() -> String {
    format!("pingpong-{:08x}", rand::random::<u32>())
}

/// What the registrar announces.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub registry_addr: String,
    pub server_id: String,
    pub url: String,
    pub cert_hash: Option<String>,
    pub capabilities: Vec<String>,
    pub heartbeat_interval: Duration,
}

/// Registrar lifecycle, observable through [`Registrar::phase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarPhase {
    Connecting,
    Registered { url: String },
    Lost,
    Backoff(Duration),
    Stopped,
}

pub struct Registrar {
    config: RegistrarConfig,
    tickets: Arc<TicketStore>,
    stats: Arc<ServerStats>,
    phase: watch::Sender<RegistrarPhase>,
}

impl Registrar {
    pub fn new(
        config: RegistrarConfig,
        tickets: Arc<TicketStore>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let (phase, _) = watch::channel(RegistrarPhase::Connecting);
        Self {
            config,
            tickets,
            stats,
            phase,
        }
    }

    pub fn phase(&self) -> watch::Receiver<RegistrarPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: RegistrarPhase) {
        debug!("Registrar phase: {:?}", phase);
        self.phase.send_replace(phase);
    }

    /// Run until `shutdown` completes, then unregister.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut attempt = 0u32;

        loop {
            self.set_phase(RegistrarPhase::Connecting);
            let connected = tokio::select! {
                _ = shutdown.as_mut() => break,
                connected = self.connect_and_register() => connected,
            };

            match connected {
                Ok((client, events, registered)) => {
                    attempt = 0;
                    // Heartbeat at least as often as the registry asks
                    let period = self
                        .config
                        .heartbeat_interval
                        .min(Duration::from_millis(registered.heartbeat_ms.max(1)));
                    self.set_phase(RegistrarPhase::Registered { url: registered.url });
                    match self.maintain(client, events, period, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) => warn!("Lost registry session: {:#}", e),
                    }
                }
                Err(e) => warn!("Failed to register with {}: {:#}", self.config.registry_addr, e),
            }

            self.set_phase(RegistrarPhase::Lost);
            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            self.set_phase(RegistrarPhase::Backoff(delay));
            info!("Reconnecting to registry in {:?}", delay);
            tokio::select! {
                _ = shutdown.as_mut() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_phase(RegistrarPhase::Stopped);
        Ok(())
    }

    async fn connect_and_register(
        &self,
    ) -> Result<(DiscoveryClient, mpsc::Receiver<RegistryEvent>, RegisterResult)> {
        let (mut client, events) = DiscoveryClient::connect(&self.config.registry_addr).await?;
        let params = RegisterParams {
            version: DISCOVERY_PROTOCOL_VERSION,
            server_id: self.config.server_id.clone(),
            url: self.config.url.clone(),
            cert_hash: self.config.cert_hash.clone(),
            capabilities: self.config.capabilities.clone(),
            load: self.stats.active_sessions(),
        };
        let registered = client.register(&params).await?;
        Ok((client, events, registered))
    }

    /// Heartbeat and collect offers until the session drops (`Err`) or shutdown (`Ok`).
    async fn maintain<F>(
        &self,
        mut client: DiscoveryClient,
        mut events: mpsc::Receiver<RegistryEvent>,
        mut period: Duration,
        shutdown: &mut Pin<&mut F>,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut seq = 0u32;
        let mut last_rtt_us: Option<u64> = None;

        loop {
            tokio::select! {
                _ = shutdown.as_mut() => {
                    match tokio::time::timeout(UNREGISTER_TIMEOUT, client.unregister()).await {
                        Ok(Ok(removed)) => {
                            info!("Unregistered '{}' (removed: {})", self.config.server_id, removed)
                        }
                        Ok(Err(e)) => warn!("Unregister failed: {:#}", e),
                        Err(_) => warn!("Unregister timed out"),
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {
                    seq = seq.wrapping_add(1);
                    let load = self.stats.active_sessions();
                    let heartbeat = client.heartbeat(seq, load, last_rtt_us);
                    tokio::pin!(heartbeat);
                    // Keep taking offers while the heartbeat is in flight
                    let (result, rtt) = loop {
                        tokio::select! {
                            answered = &mut heartbeat => break answered?,
                            Some(RegistryEvent::SessionOffer(offer)) = events.recv() => {
                                self.accept_offer(offer).await;
                            }
                        }
                    };
                    last_rtt_us = Some(rtt.as_micros() as u64);

                    let lease_bound = Duration::from_millis((result.lease_ttl_ms / 3).max(1));
                    let wanted = self.config.heartbeat_interval.min(lease_bound);
                    if wanted != period {
                        period = wanted;
                        ticker = tokio::time::interval(period);
                        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        ticker.tick().await;
                    }
                }
                event = events.recv() => match event {
                    Some(RegistryEvent::SessionOffer(offer)) => self.accept_offer(offer).await,
                    None => return Err(anyhow!("registry connection closed")),
                },
            }
        }
    }

    async fn accept_offer(&self, offer: SessionOfferParams) {
        debug!(
            "Session offer {} ({}ms)",
            short_ticket(&offer.ticket),
            offer.expires_in_ms
        );
        self.tickets
            .add(offer.ticket, Duration::from_millis(offer.expires_in_ms))
            .await;
    }
}
