//! Runners behind the `pingpong` subcommands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::oneshot;

use pingpong_rs::config::{ClientSection, ServerSection, CAP_PING_PONG};
use pingpong_rs::discovery::DiscoveryClient;
use pingpong_rs::identity::{
    default_sans, generate_pem_files, identity_fingerprint, load_identity, self_signed_identity,
};
use pingpong_rs::negotiate::{negotiate_session, NegotiateOptions};
use pingpong_rs::pingpong::{PingPongClient, PingPongServer, ServerOptions, Target};
use pingpong_rs::registrar::{
    default_advertise_url, default_server_id, Registrar, RegistrarConfig,
};
use pingpong_rs::tickets::TicketStore;

pub async fn run_serve(section: ServerSection) -> Result<()> {
    let listen = section.listen_addr()?;
    let require_ticket = section.require_ticket.unwrap_or(false);
    if require_ticket && section.registry.is_none() {
        anyhow::bail!("--require-ticket needs --registry: tickets are issued by the registry");
    }

    let identity = match &section.certificate {
        Some(cert) => load_identity(cert, section.private_key.as_deref()).await?,
        None => {
            warn!("No certificate configured, generating a self-signed one");
            self_signed_identity(&default_sans())?
        }
    };
    let cert_hash = identity_fingerprint(&identity)?;
    info!("Certificate SHA-256: {}", cert_hash);

    let tickets = Arc::new(TicketStore::new());
    let server = PingPongServer::bind(
        identity,
        ServerOptions {
            listen,
            require_ticket,
        },
        tickets.clone(),
    )?;
    let bound = server.local_addr()?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let registrar_task = match &section.registry {
        Some(registry_addr) => {
            let registrar = Registrar::new(
                RegistrarConfig {
                    registry_addr: registry_addr.clone(),
                    server_id: section.server_id.clone().unwrap_or_else(default_server_id),
                    url: section
                        .advertise_url
                        .clone()
                        .unwrap_or_else(|| default_advertise_url(bound)),
                    cert_hash: Some(cert_hash),
                    capabilities: section.capabilities(),
                    heartbeat_interval: section.heartbeat_interval(),
                },
                tickets,
                server.stats(),
            );
            Some(tokio::spawn(registrar.run(async move {
                let _ = stop_rx.await;
            })))
        }
        None => None,
    };

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    let _ = stop_tx.send(());
    if let Some(task) = registrar_task {
        task.await.context("Registrar task panicked")??;
    }
    Ok(())
}

pub async fn run_ping(section: ClientSection, count: u32, datagram: bool) -> Result<()> {
    let timeout = section.connect_timeout();

    let client = match (&section.url, &section.registry) {
        (Some(url), _) => {
            let target = Target::direct(url.clone(), section.cert_hash.clone());
            PingPongClient::connect(&target, timeout).await?
        }
        (None, Some(registry)) => {
            let options = NegotiateOptions {
                registry_addr: registry.clone(),
                capabilities: section
                    .capabilities
                    .clone()
                    .unwrap_or_else(|| vec![CAP_PING_PONG.to_string()]),
                max_attempts: section.max_attempts(),
                timeout,
            };
            let negotiated = negotiate_session(&options).await?;
            info!(
                "Using server '{}' at {} (attempts: {}, first pong in {:?})",
                negotiated.server.server_id,
                negotiated.server.url,
                negotiated.attempts,
                negotiated.rtt
            );
            negotiated.client
        }
        (None, None) => anyhow::bail!("Either --url or --registry is required"),
    };

    for i in 1..=count {
        let rtt = client.ping().await?;
        println!(
            "pong {}/{} from {}: time={:.2}ms",
            i,
            count,
            client.remote_address(),
            rtt.as_secs_f64() * 1000.0
        );
    }
    if datagram {
        let rtt = client.ping_datagram().await?;
        println!(
            "quack-ack from {}: time={:.2}ms",
            client.remote_address(),
            rtt.as_secs_f64() * 1000.0
        );
    }
    client.close();
    Ok(())
}

pub async fn run_discover(registry: &str, capabilities: &[String]) -> Result<()> {
    let (mut client, _events) = DiscoveryClient::connect(registry).await?;
    let servers = client.discover(capabilities, None).await?;
    if servers.is_empty() {
        println!("No servers registered");
        return Ok(());
    }
    for server in servers {
        println!(
            "{}  {}  load={} rtt={}ms failures={} caps=[{}]",
            server.server_id,
            server.url,
            server.load,
            server.rtt_ms,
            server.failures,
            server.capabilities.join(",")
        );
        if let Some(hash) = server.cert_hash {
            println!("    cert-hash {}", hash);
        }
    }
    Ok(())
}

pub fn run_generate_cert(cert: &Path, key: &Path, sans: Vec<String>, force: bool) -> Result<()> {
    let sans = if sans.is_empty() { default_sans() } else { sans };
    let fingerprint = generate_pem_files(cert, key, sans, force)?;
    println!("Certificate SHA-256: {}", fingerprint);
    println!(
        "Connect with: pingpong ping --url https://localhost:4433/ --cert-hash {}",
        fingerprint
    );
    Ok(())
}
