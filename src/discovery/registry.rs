//! Discovery registry server.
//!
//! Ping-pong servers register their WebTransport URL and capabilities and keep
//! a lease alive with heartbeats. Clients query the registry for servers and
//! negotiate a single-use ticket before connecting.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

use super::framing::{read_message, write_message, FrameError};
use super::protocol::*;
use crate::identity::normalize_fingerprint;
use crate::tickets::{generate_ticket, short_ticket, DEFAULT_TICKET_TTL};

/// Default lease duration granted on register/heartbeat.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Default number of servers returned by `discover`.
pub const DEFAULT_DISCOVER_LIMIT: usize = 16;

/// Maximum RTT samples to keep per server
const MAX_RTT_SAMPLES: usize = 10;

/// How often expired leases are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Registry tuning.
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    pub lease_ttl: Duration,
    pub ticket_ttl: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            ticket_ttl: DEFAULT_TICKET_TTL,
        }
    }
}

/// Message sent from the registry to a connection handler
#[derive(Debug, Clone)]
enum RegistryMessage {
    SessionOffer(SessionOfferParams),
}

/// A registered server.
#[derive(Debug)]
struct ServerEntry {
    record: ServerRecord,
    /// Connection that owns this registration.
    conn_id: u64,
    rtt_samples_us: Vec<u64>,
    lease_expires: Instant,
    tx: mpsc::Sender<RegistryMessage>,
}

impl ServerEntry {
    /// Average RTT in milliseconds (0 until the first sample arrives).
    fn avg_rtt_ms(&self) -> u64 {
        if self.rtt_samples_us.is_empty() {
            return 0;
        }
        let sum: u64 = self.rtt_samples_us.iter().sum();
        (sum / self.rtt_samples_us.len() as u64) / 1000
    }

    fn is_live(&self, now: Instant) -> bool {
        self.lease_expires > now
    }

    fn snapshot(&self) -> ServerRecord {
        ServerRecord {
            rtt_ms: self.avg_rtt_ms(),
            ..self.record.clone()
        }
    }
}

/// Shared registry state
struct RegistryState {
    servers: HashMap<String, ServerEntry>,
    options: RegistryOptions,
}

impl RegistryState {
    fn new(options: RegistryOptions) -> Self {
        Self {
            servers: HashMap::new(),
            options,
        }
    }

    /// Remove every entry whose lease ended before `now`.
    fn sweep_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .servers
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.servers.remove(id);
        }
        expired
    }

    /// Live servers supporting `capabilities`, best first.
    fn ranked(&self, capabilities: &[String], limit: usize, now: Instant) -> Vec<ServerRecord> {
        let mut records: Vec<ServerRecord> = self
            .servers
            .values()
            .filter(|entry| entry.is_live(now) && entry.record.supports_all(capabilities))
            .map(ServerEntry::snapshot)
            .collect();
        records.sort_by(|a, b| {
            a.failures
                .cmp(&b.failures)
                .then(a.load.cmp(&b.load))
                .then(a.rtt_ms.cmp(&b.rtt_ms))
                .then_with(|| a.server_id.cmp(&b.server_id))
        });
        records.truncate(limit);
        records
    }
}

/// Per-connection context passed to request handlers.
struct Session {
    conn_id: u64,
    peer_addr: SocketAddr,
    /// Server id registered over this connection, if any.
    server_id: Option<String>,
    tx: mpsc::Sender<RegistryMessage>,
}

/// Discovery registry server
pub struct RegistryServer {
    state: Arc<RwLock<RegistryState>>,
    next_conn_id: Arc<AtomicU64>,
}

impl RegistryServer {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::new(options))),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Run the registry on the given address
    pub async fn run(&self, bind_addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the registry on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Registry listening on {}", listener.local_addr()?);
        let sweeper = sweep_loop(self.state.clone());
        tokio::pin!(sweeper);

        loop {
            tokio::select! {
                _ = &mut sweeper => return Err(anyhow!("Lease sweeper stopped")),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Connection from {}", peer_addr);
                        let _ = stream.set_nodelay(true);
                        self.spawn_connection(stream, peer_addr);
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    /// Serve one registry connection over an arbitrary byte stream.
    pub fn spawn_connection<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let state = self.state.clone();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, conn_id, peer_addr, state).await {
                debug!("Connection {} ({}) closed: {}", conn_id, peer_addr, e);
            }
        });
    }

    /// Number of live registrations.
    pub async fn server_count(&self) -> usize {
        let now = Instant::now();
        let state = self.state.read().await;
        state.servers.values().filter(|e| e.is_live(now)).count()
    }
}

impl Default for RegistryServer {
    fn default() -> Self {
        Self::new(RegistryOptions::default())
    }
}

async fn sweep_loop(state: Arc<RwLock<RegistryState>>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let expired = state.write().await.sweep_expired(Instant::now());
        for id in expired {
            info!("Lease expired: {}", id);
        }
    }
}

/// Handle a single connection
async fn handle_connection<S>(
    stream: S,
    conn_id: u64,
    peer_addr: SocketAddr,
    state: Arc<RwLock<RegistryState>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Channel for registry-initiated messages
    let (tx, mut rx) = mpsc::channel::<RegistryMessage>(32);

    let mut session = Session {
        conn_id,
        peer_addr,
        server_id: None,
        tx,
    };
    let mut loop_error: Option<anyhow::Error> = None;

    // Frames are read on a dedicated task: read_message is not cancel-safe,
    // so it must not race against the notification branch in select!.
    let (req_tx, mut req_rx) = mpsc::channel::<Result<JsonRpcRequest, FrameError>>(8);
    let read_task = tokio::spawn(async move {
        loop {
            let msg = read_message::<_, JsonRpcRequest>(&mut reader).await;
            let stop = matches!(&msg, Err(e) if !e.is_recoverable());
            if req_tx.send(msg).await.is_err() || stop {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg_result = req_rx.recv() => {
                match msg_result {
                    Some(Ok(request)) => {
                        let response = handle_request(&request, &mut session, &state).await;

                        // Only requests with an id get a response
                        if let Some(id) = request.id {
                            let resp = match response {
                                Ok(result) => JsonRpcResponse::success(id, result),
                                Err(error) => JsonRpcResponse::error(id, error),
                            };
                            if let Err(e) = write_message(&mut writer, &resp).await {
                                loop_error = Some(anyhow!("Write error: {}", e));
                                break;
                            }
                        }
                    }
                    Some(Err(e)) if e.is_recoverable() => {
                        warn!("Ignoring malformed request from {}: {}", peer_addr, e);
                    }
                    Some(Err(e)) => {
                        loop_error = Some(anyhow!("Read error: {}", e));
                        break;
                    }
                    None => break,
                }
            }

            Some(registry_msg) = rx.recv() => {
                match registry_msg {
                    RegistryMessage::SessionOffer(params) => {
                        let params = match to_result_value(&params) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("Dropping session offer: {}", e.message);
                                continue;
                            }
                        };
                        let notification = JsonRpcNotification::new(method::SESSION_OFFER, params);
                        if let Err(e) = write_message(&mut writer, &notification).await {
                            loop_error = Some(anyhow!("Write error: {}", e));
                            break;
                        }
                    }
                }
            }
        }
    }

    read_task.abort();

    // Always drop the registration this connection owns
    if let Some(id) = &session.server_id {
        let mut state = state.write().await;
        if remove_owned(&mut state, id, conn_id) {
            info!("Server {} unregistered (connection closed)", id);
        }
    }

    match loop_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Remove `server_id` only if `conn_id` still owns it.
fn remove_owned(state: &mut RegistryState, server_id: &str, conn_id: u64) -> bool {
    let owned = state
        .servers
        .get(server_id)
        .map(|entry| entry.conn_id == conn_id)
        .unwrap_or(false);
    if owned {
        state.servers.remove(server_id);
    }
    owned
}

/// Dispatch a JSON-RPC request and return result or error
async fn handle_request(
    request: &JsonRpcRequest,
    session: &mut Session,
    state: &Arc<RwLock<RegistryState>>,
) -> Result<serde_json::Value, JsonRpcError> {
    match request.method.as_str() {
        method::REGISTER => handle_register(request, session, state).await,
        method::HEARTBEAT => handle_heartbeat(request, session, state).await,
        method::UNREGISTER => handle_unregister(session, state).await,
        method::DISCOVER => handle_discover(request, state).await,
        method::NEGOTIATE => handle_negotiate(request, state).await,
        method::REPORT => handle_report(request, state).await,
        _ => Err(JsonRpcError::method_not_found(&request.method)),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Validate an advertised URL and fill an unspecified host with the observed peer IP.
pub fn resolve_advertised_url(url: &str, observed: IpAddr) -> Result<String, JsonRpcError> {
    let mut parsed = url::Url::parse(url)
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid url '{}': {}", url, e)))?;
    if parsed.scheme() != "https" {
        return Err(JsonRpcError::invalid_params(format!(
            "url must use https, got '{}'",
            parsed.scheme()
        )));
    }
    if parsed.port_or_known_default().is_none() || parsed.host().is_none() {
        return Err(JsonRpcError::invalid_params(format!(
            "url '{}' has no host",
            url
        )));
    }

    let unspecified = match parsed.host() {
        Some(url::Host::Ipv4(ip)) => ip.is_unspecified(),
        Some(url::Host::Ipv6(ip)) => ip.is_unspecified(),
        _ => false,
    };
    if unspecified {
        let observed = match observed {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        parsed
            .set_ip_host(observed)
            .map_err(|_| JsonRpcError::internal_error("Failed to substitute observed address"))?;
    }
    Ok(parsed.to_string())
}

/// Handle "register" method
async fn handle_register(
    request: &JsonRpcRequest,
    session: &mut Session,
    state: &Arc<RwLock<RegistryState>>,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: RegisterParams = request.parse_params()?;
    if params.version != DISCOVERY_PROTOCOL_VERSION {
        return Err(JsonRpcError::version_mismatch(params.version));
    }
    if params.server_id.trim().is_empty() {
        return Err(JsonRpcError::invalid_params("server_id must not be empty"));
    }
    let url = resolve_advertised_url(&params.url, session.peer_addr.ip())?;
    let cert_hash = params
        .cert_hash
        .as_deref()
        .map(normalize_fingerprint)
        .transpose()
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid cert_hash: {:#}", e)))?;

    let mut state = state.write().await;
    let lease_ttl = state.options.lease_ttl;

    // A connection advertises one server; switching ids drops the old one
    if let Some(previous) = session.server_id.take() {
        if previous != params.server_id {
            remove_owned(&mut state, &previous, session.conn_id);
        }
    }

    let is_reregister = state.servers.contains_key(&params.server_id);
    if is_reregister {
        info!("Server re-registering (overwriting): {}", params.server_id);
    }

    let entry = ServerEntry {
        record: ServerRecord {
            server_id: params.server_id.clone(),
            url: url.clone(),
            cert_hash,
            capabilities: params.capabilities,
            load: params.load,
            rtt_ms: 0,
            failures: 0,
        },
        conn_id: session.conn_id,
        rtt_samples_us: Vec::new(),
        lease_expires: Instant::now() + lease_ttl,
        tx: session.tx.clone(),
    };
    state.servers.insert(params.server_id.clone(), entry);
    session.server_id = Some(params.server_id.clone());

    if !is_reregister {
        info!("Server registered: {} at {}", params.server_id, url);
    }

    to_result_value(&RegisterResult {
        lease_ttl_ms: lease_ttl.as_millis() as u64,
        heartbeat_ms: (lease_ttl / 3).as_millis() as u64,
        url,
    })
}

/// Handle "heartbeat" method: refresh the lease and record RTT and load
async fn handle_heartbeat(
    request: &JsonRpcRequest,
    session: &Session,
    state: &Arc<RwLock<RegistryState>>,
) -> Result<serde_json::Value, JsonRpcError> {
    let server_id = session
        .server_id
        .as_ref()
        .ok_or_else(JsonRpcError::not_registered)?;
    let params: HeartbeatParams = request.parse_params()?;

    let mut state = state.write().await;
    let lease_ttl = state.options.lease_ttl;
    let entry = state
        .servers
        .get_mut(server_id)
        .filter(|entry| entry.conn_id == session.conn_id)
        .ok_or_else(JsonRpcError::not_registered)?;

    entry.lease_expires = Instant::now() + lease_ttl;
    entry.record.load = params.load;
    if let Some(measured_rtt_us) = params.measured_rtt_us {
        if entry.rtt_samples_us.len() >= MAX_RTT_SAMPLES {
            entry.rtt_samples_us.remove(0);
        }
        entry.rtt_samples_us.push(measured_rtt_us);
    }
    debug!(
        "Heartbeat {} from {} (load {}, avg rtt {}ms)",
        params.seq,
        server_id,
        params.load,
        entry.avg_rtt_ms()
    );

    to_result_value(&HeartbeatResult {
        seq: params.seq,
        client_ts: params.timestamp,
        server_ts: now_ms(),
        lease_ttl_ms: lease_ttl.as_millis() as u64,
    })
}

/// Handle "unregister" method
async fn handle_unregister(
    session: &mut Session,
    state: &Arc<RwLock<RegistryState>>,
) -> Result<serde_json::Value, JsonRpcError> {
    let server_id = session.server_id.take().ok_or_else(JsonRpcError::not_registered)?;
    let removed = remove_owned(&mut *state.write().await, &server_id, session.conn_id);
    if removed {
        info!("Server unregistered: {}", server_id);
    }
    to_result_value(&UnregisterResult { removed })
}

/// Handle "discover" method
async fn handle_discover(
    request: &JsonRpcRequest,
    state: &Arc<RwLock<RegistryState>>,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: DiscoverParams = request.parse_params()?;
    if params.version != DISCOVERY_PROTOCOL_VERSION {
        return Err(JsonRpcError::version_mismatch(params.version));
    }
    let limit = params.limit.unwrap_or(DEFAULT_DISCOVER_LIMIT);
    let servers = state
        .read()
        .await
        .ranked(&params.capabilities, limit, Instant::now());
    debug!(
        "Discover {:?}: {} server(s)",
        params.capabilities,
        servers.len()
    );
    to_result_value(&DiscoverResult { servers })
}

/// Handle "negotiate" method: mint a ticket and offer it to the server
async fn handle_negotiate(
    request: &JsonRpcRequest,
    state: &Arc<RwLock<RegistryState>>,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: NegotiateParams = request.parse_params()?;

    let state = state.read().await;
    let ticket_ttl = state.options.ticket_ttl;
    let entry = state
        .servers
        .get(&params.server_id)
        .filter(|entry| entry.is_live(Instant::now()))
        .ok_or_else(|| JsonRpcError::server_not_found(&params.server_id))?;
    let server = entry.snapshot();
    let tx = entry.tx.clone();
    drop(state);

    let ticket = generate_ticket();
    let expires_in_ms = ticket_ttl.as_millis() as u64;
    tx.send(RegistryMessage::SessionOffer(SessionOfferParams {
        ticket: ticket.clone(),
        expires_in_ms,
    }))
    .await
    .map_err(|_| JsonRpcError::server_not_found(&params.server_id))?;

    info!(
        "Negotiated ticket {} for server {}",
        short_ticket(&ticket),
        params.server_id
    );

    to_result_value(&NegotiateResult {
        server,
        ticket,
        expires_in_ms,
    })
}

/// Handle "report" method
async fn handle_report(
    request: &JsonRpcRequest,
    state: &Arc<RwLock<RegistryState>>,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: ReportParams = request.parse_params()?;

    let mut state = state.write().await;
    if let Some(entry) = state.servers.get_mut(&params.server_id) {
        if params.success {
            entry.record.failures = 0;
        } else {
            entry.record.failures = entry.record.failures.saturating_add(1);
            warn!(
                "Client reported failure for {} ({} in a row): {}",
                params.server_id,
                entry.record.failures,
                params.reason.as_deref().unwrap_or("unknown")
            );
        }
    }

    Ok(serde_json::json!({"received": true}))
}

/// Run the registry (convenience function)
pub async fn run_registry(bind_addr: SocketAddr, options: RegistryOptions) -> Result<()> {
    let server = RegistryServer::new(options);
    server.run(bind_addr).await
}
