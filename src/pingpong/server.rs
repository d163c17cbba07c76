//! WebTransport ping-pong server.
//!
//! Accepts WebTransport sessions on `/`. A bidirectional stream carrying
//! `ping` is answered with `pong`; datagrams are echoed (`quack` gets
//! `quack-ack`). When tickets are required, the session URL must carry a
//! `ticket` query parameter issued by the registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use wtransport::endpoint::endpoint_side::Server;
use wtransport::endpoint::IncomingSession;
use wtransport::{Connection, Endpoint, Identity, RecvStream, SendStream, ServerConfig};

use super::{datagram_reply, pong_for, MAX_REQUEST_BYTES};
use crate::tickets::{short_ticket, TicketStore};

/// How long a ticket check waits for a registry offer that is still in flight.
pub const OFFER_GRACE: Duration = Duration::from_secs(1);

/// How often expired tickets are dropped.
const TICKET_PURGE_INTERVAL: Duration = Duration::from_secs(5);

/// Keep-alive so idle sessions survive NAT timeouts.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Session counters, shared with the registrar for load reporting.
#[derive(Debug, Default)]
pub struct ServerStats {
    active: AtomicU32,
    total: AtomicU64,
}

impl ServerStats {
    pub fn active_sessions(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total_sessions(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn session_started(self: &Arc<Self>) -> SessionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        SessionGuard(self.clone())
    }
}

/// Decrements the active session count when the session ends.
struct SessionGuard(Arc<ServerStats>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Decision taken for an incoming session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    NotFound,
    Forbidden,
}

/// Split a raw `:path` into path and `ticket` query value.
pub fn parse_request_path(raw: &str) -> (String, Option<String>) {
    let base = url::Url::parse("https://localhost/").ok();
    let parsed = base.and_then(|b| b.join(raw).ok());
    match parsed {
        Some(url) => {
            let ticket = url
                .query_pairs()
                .find(|(k, _)| k == "ticket")
                .map(|(_, v)| v.into_owned());
            (url.path().to_string(), ticket)
        }
        None => (raw.to_string(), None),
    }
}

struct SessionContext {
    tickets: Arc<TicketStore>,
    stats: Arc<ServerStats>,
    require_ticket: bool,
}

impl SessionContext {
    async fn admit(&self, raw_path: &str) -> Admission {
        let (path, ticket) = parse_request_path(raw_path);
        if path != "/" {
            return Admission::NotFound;
        }
        if !self.require_ticket {
            return Admission::Accept;
        }
        match ticket {
            Some(ticket) if self.tickets.redeem_within(&ticket, OFFER_GRACE).await => {
                debug!("Ticket {} redeemed", short_ticket(&ticket));
                Admission::Accept
            }
            Some(ticket) => {
                warn!("Rejected unknown or expired ticket {}", short_ticket(&ticket));
                Admission::Forbidden
            }
            None => {
                warn!("Rejected session without ticket");
                Admission::Forbidden
            }
        }
    }
}

/// Server tuning.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    pub require_ticket: bool,
}

/// WebTransport ping-pong server
pub struct PingPongServer {
    endpoint: Endpoint<Server>,
    ctx: Arc<SessionContext>,
}

impl PingPongServer {
    /// Bind the QUIC endpoint.
    pub fn bind(
        identity: Identity,
        options: ServerOptions,
        tickets: Arc<TicketStore>,
    ) -> Result<Self> {
        let config = ServerConfig::builder()
            .with_bind_address(options.listen)
            .with_identity(identity)
            .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL))
            .build();
        let endpoint = Endpoint::server(config).with_context(|| {
            format!("Failed to bind WebTransport server on {}", options.listen)
        })?;

        Ok(Self {
            endpoint,
            ctx: Arc::new(SessionContext {
                tickets,
                stats: Arc::new(ServerStats::default()),
                require_ticket: options.require_ticket,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("Failed to read server address")
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.ctx.stats.clone()
    }

    /// Accept sessions until the task is dropped.
    pub async fn run(self) -> Result<()> {
        info!("Server is running on {}", self.local_addr()?);
        let mut purge = tokio::time::interval(TICKET_PURGE_INTERVAL);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_session(incoming, ctx).await {
                            debug!("Session ended with error: {:#}", e);
                        }
                    });
                }
                _ = purge.tick() => {
                    let purged = self.ctx.tickets.purge_expired().await;
                    if purged > 0 {
                        debug!("Purged {} expired ticket(s)", purged);
                    }
                }
            }
        }
    }
}

async fn handle_session(incoming: IncomingSession, ctx: Arc<SessionContext>) -> Result<()> {
    let request = incoming.await.context("Failed to receive session request")?;
    let remote = request.remote_address();
    info!("WebTransport request {} from {}", request.path(), remote);

    match ctx.admit(request.path()).await {
        Admission::Accept => {}
        Admission::NotFound => {
            request.not_found().await;
            return Ok(());
        }
        Admission::Forbidden => {
            request.forbidden().await;
            return Ok(());
        }
    }

    let connection = request
        .accept()
        .await
        .context("Failed to accept session")?;
    let _guard = ctx.stats.session_started();
    info!(
        "Session accepted from {} ({} active, {} total)",
        remote,
        ctx.stats.active_sessions(),
        ctx.stats.total_sessions()
    );

    serve_connection(connection).await;
    info!("Session with {} closed", remote);
    Ok(())
}

async fn serve_connection(connection: Connection) {
    loop {
        tokio::select! {
            stream = connection.accept_bi() => {
                let (send, recv) = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("accept_bi ended: {}", e);
                        break;
                    }
                };
                tokio::spawn(async move {
                    if let Err(e) = answer_bi(send, recv).await {
                        debug!("Stream error: {:#}", e);
                    }
                });
            }
            stream = connection.accept_uni() => {
                let recv = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("accept_uni ended: {}", e);
                        break;
                    }
                };
                tokio::spawn(async move {
                    let mut recv = recv;
                    match read_request(&mut recv).await {
                        Ok(data) => {
                            debug!("Ignoring {} byte(s) on unidirectional stream", data.len())
                        }
                        Err(e) => debug!("Unidirectional stream error: {:#}", e),
                    }
                });
            }
            dgram = connection.receive_datagram() => {
                let dgram = match dgram {
                    Ok(dgram) => dgram,
                    Err(e) => {
                        debug!("receive_datagram ended: {}", e);
                        break;
                    }
                };
                let reply = datagram_reply(&dgram);
                if let Err(e) = connection.send_datagram(reply) {
                    debug!("Failed to send datagram reply: {}", e);
                }
            }
        }
    }
}

/// Read a whole stream, bounded by [`MAX_REQUEST_BYTES`].
async fn read_request(recv: &mut RecvStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 256];
    while let Some(n) = recv.read(&mut chunk).await? {
        data.extend_from_slice(&chunk[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("Request exceeds {} bytes", MAX_REQUEST_BYTES);
        }
    }
    Ok(data)
}

async fn answer_bi(mut send: SendStream, mut recv: RecvStream) -> Result<()> {
    let request = read_request(&mut recv).await?;
    match pong_for(&request) {
        Some(reply) => {
            send.write_all(reply).await?;
            debug!("Answered ping");
        }
        None => debug!("Unrecognised request ({} bytes), no reply", request.len()),
    }
    send.finish().await?;
    Ok(())
}
