//! Client-side connection negotiation through the registry.
//!
//! Discover servers, ask the registry for a ticket on the best candidate,
//! connect with that ticket and confirm with a ping. A failed attempt is
//! reported and the next candidate is tried, up to `max_attempts`.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::{info, warn};

use crate::discovery::{DiscoveryClient, ServerRecord};
use crate::error::{ClientError, ClientResult};
use crate::pingpong::{PingPongClient, Target};

/// Where the negotiation stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Discovering,
    Negotiating(String),
    Connecting(String),
    Connected(String),
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Discovering => write!(f, "Discovering"),
            Phase::Negotiating(id) => write!(f, "Negotiating({})", id),
            Phase::Connecting(id) => write!(f, "Connecting({})", id),
            Phase::Connected(id) => write!(f, "Connected({})", id),
            Phase::Failed => write!(f, "Failed"),
        }
    }
}

/// Inputs that move the negotiation forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    /// Discovery finished; carries the best candidate, if any.
    Candidates(Option<String>),
    TicketIssued,
    SessionEstablished,
    /// The current attempt failed; carries the next candidate, if any.
    AttemptFailed(Option<String>),
}

impl Phase {
    /// Apply `event`, rejecting out-of-order transitions.
    pub fn transition(&self, event: &Event) -> ClientResult<Phase> {
        let next = match (self, event) {
            (Phase::Idle, Event::Start) => Phase::Discovering,
            (Phase::Discovering, Event::Candidates(Some(id))) => Phase::Negotiating(id.clone()),
            (Phase::Discovering, Event::Candidates(None)) => Phase::Failed,
            (Phase::Negotiating(id), Event::TicketIssued) => Phase::Connecting(id.clone()),
            (Phase::Connecting(id), Event::SessionEstablished) => Phase::Connected(id.clone()),
            (Phase::Negotiating(_) | Phase::Connecting(_), Event::AttemptFailed(Some(next))) => {
                Phase::Negotiating(next.clone())
            }
            (Phase::Negotiating(_) | Phase::Connecting(_), Event::AttemptFailed(None)) => {
                Phase::Failed
            }
            (from, event) => {
                return Err(ClientError::InvalidTransition {
                    from: from.to_string(),
                    event: format!("{:?}", event),
                })
            }
        };
        Ok(next)
    }
}

/// Negotiation settings.
#[derive(Debug, Clone)]
pub struct NegotiateOptions {
    pub registry_addr: String,
    pub capabilities: Vec<String>,
    pub max_attempts: u32,
    pub timeout: Duration,
}

/// A verified session obtained through the registry.
pub struct Negotiated {
    pub client: PingPongClient,
    pub server: ServerRecord,
    pub attempts: u32,
    pub rtt: Duration,
}

struct Negotiation {
    phase: Phase,
}

impl Negotiation {
    fn apply(&mut self, event: Event) -> ClientResult<()> {
        let next = self.phase.transition(&event)?;
        info!("Negotiation: {} -> {}", self.phase, next);
        self.phase = next;
        Ok(())
    }
}

fn discovery_error(err: anyhow::Error) -> ClientError {
    ClientError::Discovery(format!("{:#}", err))
}

/// Discover, negotiate and connect, falling back across candidates.
pub async fn negotiate_session(options: &NegotiateOptions) -> ClientResult<Negotiated> {
    let max_attempts = options.max_attempts.max(1);
    let mut machine = Negotiation { phase: Phase::Idle };
    machine.apply(Event::Start)?;

    let (mut registry, _events) = DiscoveryClient::connect(&options.registry_addr)
        .await
        .map_err(discovery_error)?;
    let servers = registry
        .discover(&options.capabilities, None)
        .await
        .map_err(discovery_error)?;

    let mut candidates: VecDeque<ServerRecord> = servers.into();
    let Some(mut server) = candidates.pop_front() else {
        machine.apply(Event::Candidates(None))?;
        return Err(ClientError::NoServers(options.capabilities.clone()));
    };
    machine.apply(Event::Candidates(Some(server.server_id.clone())))?;

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt(&mut registry, &server, options.timeout, &mut machine).await {
            Ok((client, rtt)) => {
                machine.apply(Event::SessionEstablished)?;
                if let Err(e) = registry.report(&server.server_id, true, None).await {
                    warn!("Failed to report success for {}: {:#}", server.server_id, e);
                }
                return Ok(Negotiated {
                    client,
                    server,
                    attempts,
                    rtt,
                });
            }
            Err(e) => {
                warn!(
                    "Attempt {}/{} on {} failed: {}",
                    attempts, max_attempts, server.server_id, e
                );
                if let Err(report_err) = registry
                    .report(&server.server_id, false, Some(e.to_string()))
                    .await
                {
                    warn!("Failed to report failure for {}: {:#}", server.server_id, report_err);
                }

                if !e.is_recoverable() {
                    machine.apply(Event::AttemptFailed(None))?;
                    return Err(e);
                }

                let next = if attempts < max_attempts {
                    candidates.pop_front()
                } else {
                    None
                };
                machine.apply(Event::AttemptFailed(next.as_ref().map(|s| s.server_id.clone())))?;
                match next {
                    Some(next) => server = next,
                    None => {
                        return Err(ClientError::Exhausted {
                            attempts,
                            last: e.to_string(),
                        })
                    }
                }
            }
        }
    }
}

async fn attempt(
    registry: &mut DiscoveryClient,
    server: &ServerRecord,
    timeout: Duration,
    machine: &mut Negotiation,
) -> ClientResult<(PingPongClient, Duration)> {
    let negotiated = registry
        .negotiate(&server.server_id)
        .await
        .map_err(discovery_error)?;
    machine.apply(Event::TicketIssued)?;

    let target = Target {
        url: negotiated.server.url.clone(),
        cert_hash: negotiated.server.cert_hash.clone(),
        ticket: Some(negotiated.ticket),
    };
    let client = PingPongClient::connect(&target, timeout).await?;
    let rtt = client.ping().await?;
    Ok((client, rtt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::protocol::{
        method, DiscoverResult, JsonRpcRequest, JsonRpcResponse, NegotiateParams,
        NegotiateResult, RegisterParams, DISCOVERY_PROTOCOL_VERSION,
    };
    use crate::discovery::{read_message, write_message, RegistryServer};
    use crate::identity::{default_sans, identity_fingerprint, self_signed_identity};
    use crate::pingpong::{PingPongServer, ServerOptions};
    use crate::registrar::{Registrar, RegistrarConfig, RegistrarPhase};
    use crate::tickets::TicketStore;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    #[test]
    fn test_happy_path_transitions() {
        let mut phase = Phase::Idle;
        for event in [
            Event::Start,
            Event::Candidates(Some("a".into())),
            Event::TicketIssued,
            Event::SessionEstablished,
        ] {
            phase = phase.transition(&event).unwrap();
        }
        assert_eq!(phase, Phase::Connected("a".into()));
    }

    #[test]
    fn test_fallback_transitions() {
        let phase = Phase::Connecting("a".into());
        assert_eq!(
            phase.transition(&Event::AttemptFailed(Some("b".into()))).unwrap(),
            Phase::Negotiating("b".into())
        );
        assert_eq!(
            Phase::Negotiating("b".into())
                .transition(&Event::AttemptFailed(None))
                .unwrap(),
            Phase::Failed
        );
        assert_eq!(
            Phase::Discovering.transition(&Event::Candidates(None)).unwrap(),
            Phase::Failed
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let err = Phase::Idle.transition(&Event::TicketIssued).unwrap_err();
        assert!(matches!(err, ClientError::InvalidTransition { .. }));
        assert!(Phase::Connected("a".into()).transition(&Event::Start).is_err());
        assert!(Phase::Failed.transition(&Event::AttemptFailed(None)).is_err());
        assert!(Phase::Negotiating("a".into())
            .transition(&Event::SessionEstablished)
            .is_err());
    }

    async fn spawn_registry() -> (Arc<RegistryServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(RegistryServer::default());
        let serving = registry.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        (registry, addr)
    }

    /// Ticket-gated ping-pong server registered as `server_id`.
    async fn spawn_registered_server(registry_addr: SocketAddr, server_id: &str) {
        let identity = self_signed_identity(&default_sans()).unwrap();
        let hash = identity_fingerprint(&identity).unwrap();
        let tickets = Arc::new(TicketStore::new());
        let server = PingPongServer::bind(
            identity,
            ServerOptions {
                listen: "127.0.0.1:0".parse().unwrap(),
                require_ticket: true,
            },
            tickets.clone(),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        let registrar = Registrar::new(
            RegistrarConfig {
                registry_addr: registry_addr.to_string(),
                server_id: server_id.to_string(),
                url: format!("https://{}/", addr),
                cert_hash: Some(hash),
                capabilities: vec!["ping-pong".to_string()],
                heartbeat_interval: Duration::from_secs(1),
            },
            tickets,
            server.stats(),
        );
        let mut phase = registrar.phase();
        tokio::spawn(server.run());
        tokio::spawn(registrar.run(std::future::pending::<()>()));
        tokio::time::timeout(
            Duration::from_secs(2),
            phase.wait_for(|p| matches!(p, RegistrarPhase::Registered { .. })),
        )
        .await
        .unwrap()
        .unwrap();
    }

    fn options(registry_addr: SocketAddr) -> NegotiateOptions {
        NegotiateOptions {
            registry_addr: registry_addr.to_string(),
            capabilities: vec!["ping-pong".to_string()],
            max_attempts: 3,
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_negotiates_ticketed_session() {
        let (_registry, addr) = spawn_registry().await;
        spawn_registered_server(addr, "live").await;

        let negotiated = negotiate_session(&options(addr)).await.unwrap();
        assert_eq!(negotiated.server.server_id, "live");
        assert_eq!(negotiated.attempts, 1);
        negotiated.client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_falls_back_to_next_candidate() {
        let (_registry, addr) = spawn_registry().await;
        spawn_registered_server(addr, "b-live").await;

        // Ranks first by id but nothing answers there
        let (mut dead, _) = DiscoveryClient::connect(&addr.to_string()).await.unwrap();
        dead.register(&RegisterParams {
            version: DISCOVERY_PROTOCOL_VERSION,
            server_id: "a-dead".to_string(),
            url: "https://127.0.0.1:9/".to_string(),
            cert_hash: Some("00".repeat(32)),
            capabilities: vec!["ping-pong".to_string()],
            load: 0,
        })
        .await
        .unwrap();

        let mut opts = options(addr);
        opts.timeout = Duration::from_secs(1);
        let negotiated = negotiate_session(&opts).await.unwrap();
        assert_eq!(negotiated.server.server_id, "b-live");
        assert_eq!(negotiated.attempts, 2);

        // The failure was reported, so the dead server now ranks last
        let (mut client, _) = DiscoveryClient::connect(&addr.to_string()).await.unwrap();
        let servers = client.discover(&[], None).await.unwrap();
        assert_eq!(servers[0].server_id, "b-live");
        assert_eq!(servers[1].failures, 1);
    }

    #[tokio::test]
    async fn test_no_servers() {
        let (_registry, addr) = spawn_registry().await;
        let err = negotiate_session(&options(addr)).await.err().unwrap();
        assert!(matches!(err, ClientError::NoServers(_)));
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_discovery_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = negotiate_session(&options(addr)).await.err().unwrap();
        assert!(matches!(err, ClientError::Discovery(_)));
    }

    fn dead_server(id: &str) -> RegisterParams {
        RegisterParams {
            version: DISCOVERY_PROTOCOL_VERSION,
            server_id: id.to_string(),
            url: "https://127.0.0.1:9/".to_string(),
            cert_hash: Some("00".repeat(32)),
            capabilities: vec!["ping-pong".to_string()],
            load: 0,
        }
    }

    #[tokio::test]
    async fn test_attempt_limit_stops_with_candidates_left() {
        let (_registry, addr) = spawn_registry().await;
        let (mut a, _) = DiscoveryClient::connect(&addr.to_string()).await.unwrap();
        let (mut b, _) = DiscoveryClient::connect(&addr.to_string()).await.unwrap();
        a.register(&dead_server("a-dead")).await.unwrap();
        b.register(&dead_server("b-dead")).await.unwrap();

        let mut opts = options(addr);
        opts.max_attempts = 1;
        opts.timeout = Duration::from_secs(1);
        let err = negotiate_session(&opts).await.err().unwrap();
        assert!(
            matches!(err, ClientError::Exhausted { attempts: 1, .. }),
            "got {:?}",
            err
        );

        // Only the first candidate was tried
        let (mut client, _) = DiscoveryClient::connect(&addr.to_string()).await.unwrap();
        let servers = client.discover(&[], None).await.unwrap();
        assert_eq!(servers[0].server_id, "b-dead");
        assert_eq!(servers[0].failures, 0);
        assert_eq!(servers[1].failures, 1);
    }

    /// Registry stand-in that hands out `records` verbatim, as a registry
    /// without hash validation would. Resolves to the methods it was called with.
    async fn spawn_verbatim_registry(
        records: Vec<ServerRecord>,
    ) -> (SocketAddr, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut methods = Vec::new();
            while let Ok(request) = read_message::<_, JsonRpcRequest>(&mut stream).await {
                let id = request.id.unwrap_or_default();
                let result = match request.method.as_str() {
                    method::DISCOVER => serde_json::to_value(DiscoverResult {
                        servers: records.clone(),
                    }),
                    method::NEGOTIATE => {
                        let params: NegotiateParams = request.parse_params().unwrap();
                        let server = records
                            .iter()
                            .find(|r| r.server_id == params.server_id)
                            .cloned()
                            .unwrap();
                        serde_json::to_value(NegotiateResult {
                            server,
                            ticket: "tverbatim".to_string(),
                            expires_in_ms: 15_000,
                        })
                    }
                    _ => Ok(serde_json::json!({})),
                };
                methods.push(request.method);
                let response = JsonRpcResponse::success(id, result.unwrap());
                write_message(&mut stream, &response).await.unwrap();
            }
            methods
        });
        (addr, handle)
    }

    fn record(id: &str, cert_hash: &str) -> ServerRecord {
        ServerRecord {
            server_id: id.to_string(),
            url: "https://127.0.0.1:9/".to_string(),
            cert_hash: Some(cert_hash.to_string()),
            capabilities: vec!["ping-pong".to_string()],
            load: 0,
            rtt_ms: 0,
            failures: 0,
        }
    }

    #[tokio::test]
    async fn test_config_error_ends_negotiation_after_one_attempt() {
        let (addr, calls) = spawn_verbatim_registry(vec![
            record("a-garbled", "not-a-hash"),
            record("b-fine", &"00".repeat(32)),
        ])
        .await;

        let err = negotiate_session(&options(addr)).await.err().unwrap();
        assert!(matches!(err, ClientError::Config(_)), "got {:?}", err);

        // One negotiate, its failure report, and no attempt on the second record
        let methods = tokio::time::timeout(Duration::from_secs(2), calls)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(methods, vec!["discover", "negotiate", "report"]);
    }
}
