//! Registry client.
//!
//! Requests are matched to responses by id on a background reader task, so
//! registry notifications (`session_offer`) can arrive at any time without
//! confusing an in-flight call. Notifications are delivered on the channel
//! returned alongside the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::framing::{read_message, write_message};
use super::protocol::*;

/// How long to wait for a response before giving up on a call.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered notifications before the reader applies backpressure.
const NOTIFICATION_BUFFER: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;
type BoxedWriter = WriteHalf<Box<dyn AsyncStream>>;

/// Byte stream the client can run over (TCP in production, duplex in tests).
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Notifications pushed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    SessionOffer(SessionOfferParams),
}

/// Registry client
pub struct DiscoveryClient {
    writer: BoxedWriter,
    pending: PendingMap,
    next_id: u64,
    reader_task: JoinHandle<()>,
}

impl DiscoveryClient {
    /// Connect to a registry via TCP
    pub async fn connect(registry_addr: &str) -> Result<(Self, mpsc::Receiver<RegistryEvent>)> {
        info!("Connecting to registry at {}", registry_addr);
        let stream = TcpStream::connect(registry_addr)
            .await
            .with_context(|| format!("Failed to connect to registry at {}", registry_addr))?;
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream))
    }

    /// Create a client over an existing stream
    pub fn new<S>(stream: S) -> (Self, mpsc::Receiver<RegistryEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncStream> = Box::new(stream);
        let (mut reader, writer) = tokio::io::split(boxed);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::channel(NOTIFICATION_BUFFER);

        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let msg: serde_json::Value = match read_message(&mut reader).await {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Registry connection closed: {}", e);
                        break;
                    }
                };
                dispatch(msg, &reader_pending, &events_tx).await;
            }
            // Fail every in-flight call
            reader_pending.lock().await.clear();
        });

        let client = Self {
            writer,
            pending,
            next_id: 1,
            reader_task,
        };
        (client, events_rx)
    }

    /// Get the next request ID
    fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Issue a request and wait for its result.
    pub async fn call<P, R>(&mut self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_request_id();
        let request = JsonRpcRequest::new(method, Some(serde_json::to_value(params)?), id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = write_message(&mut self.writer, &request).await {
            self.pending.lock().await.remove(&id);
            let e = anyhow::Error::from(e);
            return Err(e.context(format!("Failed to send {} request", method)));
        }

        let response = match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(anyhow!("Registry connection closed during {}", method)),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(anyhow!("Registry did not answer {} within {:?}", method, RPC_TIMEOUT));
            }
        };

        if let Some(error) = response.error {
            return Err(RpcFailure { method: method.to_string(), error }.into());
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result)
            .with_context(|| format!("Malformed {} result", method))
    }

    // ------------------------------------------------------------------------
    // Server-side calls
    // ------------------------------------------------------------------------

    /// Register (or re-register) a server
    pub async fn register(&mut self, params: &RegisterParams) -> Result<RegisterResult> {
        info!("Registering with registry as '{}'", params.server_id);
        let result: RegisterResult = self.call(method::REGISTER, params).await?;
        info!(
            "Registered '{}' at {} (lease {}ms)",
            params.server_id, result.url, result.lease_ttl_ms
        );
        Ok(result)
    }

    /// Refresh the lease. Returns the result and the measured round trip.
    pub async fn heartbeat(
        &mut self,
        seq: u32,
        load: u32,
        measured_rtt_us: Option<u64>,
    ) -> Result<(HeartbeatResult, Duration)> {
        let started = std::time::Instant::now();
        let params = HeartbeatParams {
            seq,
            timestamp: current_time_ms(),
            measured_rtt_us,
            load,
        };
        let result: HeartbeatResult = self.call(method::HEARTBEAT, &params).await?;
        let rtt = started.elapsed();
        debug!("Heartbeat {} acknowledged in {:?}", seq, rtt);
        Ok((result, rtt))
    }

    /// Remove this connection's registration.
    pub async fn unregister(&mut self) -> Result<bool> {
        let result: UnregisterResult = self.call(method::UNREGISTER, &serde_json::json!({})).await?;
        Ok(result.removed)
    }

    // ------------------------------------------------------------------------
    // Client-side calls
    // ------------------------------------------------------------------------

    /// Query servers supporting every capability in `capabilities`.
    pub async fn discover(
        &mut self,
        capabilities: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<ServerRecord>> {
        let params = DiscoverParams {
            version: DISCOVERY_PROTOCOL_VERSION,
            capabilities: capabilities.to_vec(),
            limit,
        };
        let result: DiscoverResult = self.call(method::DISCOVER, &params).await?;
        info!(
            "Registry returned {} server(s) for {:?}",
            result.servers.len(),
            capabilities
        );
        Ok(result.servers)
    }

    /// Ask the registry for a session ticket on `server_id`.
    pub async fn negotiate(&mut self, server_id: &str) -> Result<NegotiateResult> {
        let params = NegotiateParams {
            server_id: server_id.to_string(),
        };
        self.call(method::NEGOTIATE, &params).await
    }

    /// Report the outcome of a connection attempt.
    pub async fn report(
        &mut self,
        server_id: &str,
        success: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let params = ReportParams {
            server_id: server_id.to_string(),
            success,
            reason,
        };
        let _: serde_json::Value = self.call(method::REPORT, &params).await?;
        Ok(())
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// A JSON-RPC error returned by the registry.
#[derive(Debug, thiserror::Error)]
#[error("{method} failed: {error}")]
pub struct RpcFailure {
    pub method: String,
    pub error: JsonRpcError,
}

/// Route an incoming frame to its waiting call or the event channel.
async fn dispatch(
    msg: serde_json::Value,
    pending: &PendingMap,
    events: &mpsc::Sender<RegistryEvent>,
) {
    let is_notification = msg.get("id").is_none() && msg.get("method").is_some();
    if is_notification {
        let notification: JsonRpcNotification = match serde_json::from_value(msg) {
            Ok(n) => n,
            Err(e) => {
                warn!("Malformed notification from registry: {}", e);
                return;
            }
        };
        match notification.method.as_str() {
            method::SESSION_OFFER => {
                let params = notification.params.unwrap_or(serde_json::Value::Null);
                match serde_json::from_value::<SessionOfferParams>(params) {
                    // Never block the reader: responses queued behind a
                    // burst of offers would otherwise time out.
                    Ok(offer) => match events.try_send(RegistryEvent::SessionOffer(offer)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(RegistryEvent::SessionOffer(offer))) => {
                            warn!(
                                "Event queue full, dropping offer {}",
                                crate::tickets::short_ticket(&offer.ticket)
                            );
                        }
                        Err(TrySendError::Closed(_)) => {}
                    },
                    Err(e) => warn!("Malformed session_offer: {}", e),
                }
            }
            other => debug!("Ignoring notification: {}", other),
        }
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(msg) {
        Ok(response) => {
            let waiter = pending.lock().await.remove(&response.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!("Response for unknown request id {}", response.id),
            }
        }
        Err(e) => warn!("Malformed response from registry: {}", e),
    }
}

/// Get current time in milliseconds since Unix epoch
fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::{RegistryOptions, RegistryServer};
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "198.51.100.4:50000".parse().unwrap()
    }

    fn connect_pair(registry: &RegistryServer) -> (DiscoveryClient, mpsc::Receiver<RegistryEvent>) {
        let (client_side, registry_side) = tokio::io::duplex(64 * 1024);
        registry.spawn_connection(registry_side, peer());
        DiscoveryClient::new(client_side)
    }

    fn register_params(id: &str, url: &str, caps: &[&str]) -> RegisterParams {
        RegisterParams {
            version: DISCOVERY_PROTOCOL_VERSION,
            server_id: id.to_string(),
            url: url.to_string(),
            cert_hash: Some("AB".repeat(32)),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            load: 0,
        }
    }

    fn rpc_code(err: &anyhow::Error) -> Option<i32> {
        err.downcast_ref::<RpcFailure>().map(|f| f.error.code)
    }

    #[tokio::test]
    async fn test_register_discover_negotiate() {
        let registry = RegistryServer::default();
        let (mut server, mut offers) = connect_pair(&registry);
        let (mut client, _) = connect_pair(&registry);

        let registered = server
            .register(&register_params("alpha", "https://[::]:4433/", &["ping-pong"]))
            .await
            .unwrap();
        // Unspecified host replaced with the observed peer address
        assert_eq!(registered.url, "https://198.51.100.4:4433/");

        let servers = client.discover(&["ping-pong".to_string()], None).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].server_id, "alpha");
        assert_eq!(servers[0].cert_hash.as_deref(), Some("ab".repeat(32).as_str()));

        let negotiated = client.negotiate("alpha").await.unwrap();
        assert_eq!(negotiated.server.server_id, "alpha");

        let offer = tokio::time::timeout(Duration::from_secs(2), offers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            offer,
            RegistryEvent::SessionOffer(SessionOfferParams {
                ticket: negotiated.ticket.clone(),
                expires_in_ms: negotiated.expires_in_ms,
            })
        );
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let registry = RegistryServer::default();
        let (mut server, _) = connect_pair(&registry);
        let err = server.heartbeat(0, 0, None).await.unwrap_err();
        assert_eq!(rpc_code(&err), Some(JsonRpcError::NOT_REGISTERED));
    }

    #[tokio::test]
    async fn test_heartbeat_updates_load_and_rtt() {
        let registry = RegistryServer::default();
        let (mut server, _) = connect_pair(&registry);
        let (mut client, _) = connect_pair(&registry);
        server
            .register(&register_params("alpha", "https://localhost:4433/", &[]))
            .await
            .unwrap();

        let (result, _rtt) = server.heartbeat(1, 4, Some(20_000)).await.unwrap();
        assert_eq!(result.seq, 1);

        let servers = client.discover(&[], None).await.unwrap();
        assert_eq!(servers[0].load, 4);
        assert_eq!(servers[0].rtt_ms, 20);
    }

    #[tokio::test]
    async fn test_negotiate_unknown_server() {
        let registry = RegistryServer::default();
        let (mut client, _) = connect_pair(&registry);
        let err = client.negotiate("ghost").await.unwrap_err();
        assert_eq!(rpc_code(&err), Some(JsonRpcError::SERVER_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_register_rejects_version_mismatch() {
        let registry = RegistryServer::default();
        let (mut server, _) = connect_pair(&registry);
        let mut params = register_params("alpha", "https://localhost:4433/", &[]);
        params.version = DISCOVERY_PROTOCOL_VERSION + 1;
        let err = server.register(&params).await.unwrap_err();
        assert_eq!(rpc_code(&err), Some(JsonRpcError::VERSION_MISMATCH));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = RegistryServer::default();
        let (mut client, _) = connect_pair(&registry);
        let err = client
            .call::<_, serde_json::Value>("bogus", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(rpc_code(&err), Some(JsonRpcError::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_closing_connection_drops_registration() {
        let registry = RegistryServer::default();
        let (mut server, _) = connect_pair(&registry);
        server
            .register(&register_params("alpha", "https://localhost:4433/", &[]))
            .await
            .unwrap();
        assert_eq!(registry.server_count().await, 1);

        drop(server);
        for _ in 0..50 {
            if registry.server_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.server_count().await, 0);
    }

    #[tokio::test]
    async fn test_reregistration_from_new_connection_survives_old_close() {
        let registry = RegistryServer::default();
        let (mut first, _) = connect_pair(&registry);
        let (mut second, _) = connect_pair(&registry);
        let params = register_params("alpha", "https://localhost:4433/", &[]);
        first.register(&params).await.unwrap();
        second.register(&params).await.unwrap();

        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.server_count().await, 1);

        assert!(second.unregister().await.unwrap());
        assert_eq!(registry.server_count().await, 0);
    }

    #[tokio::test]
    async fn test_failure_reports_demote_server() {
        let registry = RegistryServer::new(RegistryOptions::default());
        let (mut a, _) = connect_pair(&registry);
        let (mut b, _) = connect_pair(&registry);
        let (mut client, _) = connect_pair(&registry);
        a.register(&register_params("a", "https://a.example:4433/", &[]))
            .await
            .unwrap();
        b.register(&register_params("b", "https://b.example:4433/", &[]))
            .await
            .unwrap();

        client.report("a", false, Some("timeout".into())).await.unwrap();
        let order: Vec<String> = client
            .discover(&[], None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.server_id)
            .collect();
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);

        client.report("a", true, None).await.unwrap();
        let first = &client.discover(&[], None).await.unwrap()[0];
        assert_eq!(first.server_id, "a");
        assert_eq!(first.failures, 0);
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_cert_hash() {
        let registry = RegistryServer::default();
        let (mut server, _) = connect_pair(&registry);

        for bad in ["zz".repeat(32), "ab".repeat(16), String::new()] {
            let mut params = register_params("alpha", "https://localhost:4433/", &[]);
            params.cert_hash = Some(bad);
            let err = server.register(&params).await.unwrap_err();
            assert_eq!(rpc_code(&err), Some(JsonRpcError::INVALID_PARAMS));
        }
        assert_eq!(registry.server_count().await, 0);

        // Colon-separated fingerprints are accepted and stored as plain hex
        let mut params = register_params("alpha", "https://localhost:4433/", &[]);
        params.cert_hash = Some(vec!["AB"; 32].join(":"));
        server.register(&params).await.unwrap();
        let (mut client, _) = connect_pair(&registry);
        let servers = client.discover(&[], None).await.unwrap();
        assert_eq!(servers[0].cert_hash.as_deref(), Some("ab".repeat(32).as_str()));
    }

    #[tokio::test]
    async fn test_unanswered_offers_do_not_stall_heartbeat() {
        let registry = RegistryServer::default();
        // Offers are never drained from this receiver
        let (mut server, _offers) = connect_pair(&registry);
        let (mut client, _) = connect_pair(&registry);
        server
            .register(&register_params("alpha", "https://localhost:4433/", &[]))
            .await
            .unwrap();

        for _ in 0..NOTIFICATION_BUFFER + 6 {
            client.negotiate("alpha").await.unwrap();
        }

        let heartbeat = server.heartbeat(1, 0, None);
        let (result, _rtt) = tokio::time::timeout(Duration::from_secs(3), heartbeat)
            .await
            .expect("heartbeat answered while offers pile up")
            .unwrap();
        assert_eq!(result.seq, 1);
    }

    #[tokio::test]
    async fn test_unregister_requires_registration() {
        let registry = RegistryServer::default();
        let (mut server, _) = connect_pair(&registry);
        let err = server.unregister().await.unwrap_err();
        assert_eq!(rpc_code(&err), Some(JsonRpcError::NOT_REGISTERED));
    }

    #[tokio::test]
    async fn test_negotiate_skips_expired_lease() {
        let registry = RegistryServer::new(RegistryOptions {
            lease_ttl: Duration::from_millis(200),
            ..RegistryOptions::default()
        });
        let (mut server, _) = connect_pair(&registry);
        let (mut client, _) = connect_pair(&registry);
        server
            .register(&register_params("alpha", "https://localhost:4433/", &[]))
            .await
            .unwrap();
        client.negotiate("alpha").await.unwrap();

        // No heartbeat, so the lease runs out
        tokio::time::sleep(Duration::from_millis(400)).await;
        let err = client.negotiate("alpha").await.unwrap_err();
        assert_eq!(rpc_code(&err), Some(JsonRpcError::SERVER_NOT_FOUND));
    }
}
