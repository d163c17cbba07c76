//! WebTransport ping-pong client.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, info};
use url::Url;
use wtransport::endpoint::endpoint_side::Client;
use wtransport::error::{ConnectingError, ConnectionError};
use wtransport::{ClientConfig, Connection, Endpoint, VarInt};

use super::{MAX_REQUEST_BYTES, PING, PONG, QUACK, QUACK_ACK};
use crate::error::{ClientError, ClientResult};
use crate::identity::parse_fingerprint;

/// Datagram sends per `ping_datagram` call before giving up.
const DATAGRAM_TRIES: u32 = 3;

/// Where to connect and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    /// Hex SHA-256 of the server certificate, pinned instead of using CA roots.
    pub cert_hash: Option<String>,
    /// Registry ticket appended as `?ticket=`.
    pub ticket: Option<String>,
}

impl Target {
    pub fn direct(url: impl Into<String>, cert_hash: Option<String>) -> Self {
        Self {
            url: url.into(),
            cert_hash,
            ticket: None,
        }
    }

    /// URL to request, including the ticket query when present.
    pub fn session_url(&self) -> ClientResult<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| ClientError::config(format!("Invalid URL '{}': {}", self.url, e)))?;
        if url.scheme() != "https" {
            return Err(ClientError::config(format!(
                "URL must use https://, got '{}'",
                self.url
            )));
        }
        if let Some(ticket) = &self.ticket {
            url.query_pairs_mut().append_pair("ticket", ticket);
        }
        Ok(url)
    }
}

fn client_config(target: &Target, url: &Url) -> ClientResult<ClientConfig> {
    // IPv4 literals get an IPv4 socket so dual-stack support is not required.
    let builder = match url.host() {
        Some(url::Host::Ipv4(_)) => ClientConfig::builder()
            .with_bind_address(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
        _ => ClientConfig::builder().with_bind_default(),
    };

    let config = match &target.cert_hash {
        Some(hash) => {
            let digest = parse_fingerprint(hash)
                .map_err(|e| ClientError::config(format!("{:#}", e)))?;
            builder.with_server_certificate_hashes([digest]).build()
        }
        None => builder.with_native_certs().build(),
    };
    Ok(config)
}

fn map_connecting_error(err: ConnectingError) -> ClientError {
    match err {
        ConnectingError::SessionRejected => {
            ClientError::Rejected("server refused the WebTransport session".to_string())
        }
        ConnectingError::ConnectionError(ConnectionError::TimedOut) => {
            ClientError::TimedOut("QUIC handshake".to_string())
        }
        ConnectingError::ConnectionError(ConnectionError::LocallyClosed) => {
            ClientError::LocallyClosed
        }
        other => ClientError::quic("Failed to connect", other),
    }
}

fn map_connection_error(err: ConnectionError, what: &str) -> ClientError {
    match err {
        ConnectionError::TimedOut => ClientError::TimedOut(what.to_string()),
        ConnectionError::LocallyClosed => ClientError::LocallyClosed,
        other => ClientError::quic(what.to_string(), other),
    }
}

/// An established ping-pong session.
pub struct PingPongClient {
    // Owns the socket the connection runs on.
    _endpoint: Endpoint<Client>,
    connection: Connection,
    timeout: Duration,
}

impl PingPongClient {
    /// Open a WebTransport session to `target`.
    pub async fn connect(target: &Target, timeout: Duration) -> ClientResult<Self> {
        let url = target.session_url()?;
        let config = client_config(target, &url)?;
        let endpoint = Endpoint::client(config)
            .map_err(|e| ClientError::quic("Failed to create client endpoint", e))?;

        info!("Connecting to {}", target.url);
        let connection = tokio::time::timeout(timeout, endpoint.connect(url.as_str()))
            .await
            .map_err(|_| ClientError::TimedOut(format!("connect to {}", target.url)))?
            .map_err(map_connecting_error)?;
        info!("Connected to {}", connection.remote_address());

        Ok(Self {
            _endpoint: endpoint,
            connection,
            timeout,
        })
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Send `ping` on a new bidirectional stream and wait for `pong`.
    ///
    /// Returns the round-trip time.
    pub async fn ping(&self) -> ClientResult<Duration> {
        tokio::time::timeout(self.timeout, self.ping_inner())
            .await
            .map_err(|_| ClientError::TimedOut("ping".to_string()))?
    }

    async fn ping_inner(&self) -> ClientResult<Duration> {
        let started = Instant::now();
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| map_connection_error(e, "open_bi"))?
            .await
            .map_err(|e| ClientError::stream_opening("bidirectional stream", e))?;

        send.write_all(PING)
            .await
            .map_err(|e| ClientError::quic("Failed to send ping", e))?;
        send.finish()
            .await
            .map_err(|e| ClientError::quic("Failed to finish ping stream", e))?;

        let mut reply = Vec::new();
        let mut chunk = [0u8; 64];
        while let Some(n) = recv
            .read(&mut chunk)
            .await
            .map_err(|e| ClientError::quic("Failed to read reply", e))?
        {
            reply.extend_from_slice(&chunk[..n]);
            if reply.len() > MAX_REQUEST_BYTES {
                return Err(ClientError::UnexpectedReply(format!(
                    "reply exceeds {} bytes",
                    MAX_REQUEST_BYTES
                )));
            }
        }

        if reply != PONG {
            return Err(ClientError::UnexpectedReply(
                String::from_utf8_lossy(&reply).into_owned(),
            ));
        }
        let rtt = started.elapsed();
        debug!("pong in {:?}", rtt);
        Ok(rtt)
    }

    /// Send `quack` as a datagram and wait for `quack-ack`.
    ///
    /// Datagrams may be lost, so the send is repeated a few times within the timeout.
    pub async fn ping_datagram(&self) -> ClientResult<Duration> {
        let per_try = self.timeout / DATAGRAM_TRIES;
        let started = Instant::now();

        for attempt in 1..=DATAGRAM_TRIES {
            self.connection
                .send_datagram(QUACK)
                .map_err(|e| ClientError::quic("Failed to send datagram", e))?;

            let deadline = tokio::time::Instant::now() + per_try;
            loop {
                let receiving = self.connection.receive_datagram();
                let received = match tokio::time::timeout_at(deadline, receiving).await {
                    Ok(received) => {
                        received.map_err(|e| map_connection_error(e, "receive_datagram"))?
                    }
                    Err(_) => break,
                };
                if &received[..] == QUACK_ACK {
                    return Ok(started.elapsed());
                }
                debug!("Ignoring unrelated datagram ({} bytes)", received.len());
            }
            debug!("No datagram reply (attempt {}/{})", attempt, DATAGRAM_TRIES);
        }
        Err(ClientError::TimedOut("datagram echo".to_string()))
    }

    pub fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"done");
    }
}
