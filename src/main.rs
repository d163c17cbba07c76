//! pingpong-rs
//!
//! WebTransport ping-pong server and client with registry autodiscovery.
//!
//! Usage:
//!   Server:          pingpong serve -c cert.pem -k key.pem
//!   Registered:      pingpong serve --registry 127.0.0.1:9999 --require-ticket
//!   Direct client:   pingpong ping --url https://localhost:4433/ --cert-hash <HEX>
//!   Via registry:    pingpong ping --registry 127.0.0.1:9999
//!   List servers:    pingpong discover --registry 127.0.0.1:9999

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pingpong_rs::config::load_file_config;

#[derive(Parser)]
#[command(name = "pingpong")]
#[command(version)]
#[command(about = "WebTransport ping-pong with registry autodiscovery")]
struct Args {
    /// Path to config file (default: ~/.config/pingpong-rs/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the WebTransport ping-pong server
    Serve {
        /// TLS certificate (PEM). Without one a self-signed certificate is generated
        #[arg(short = 'c', long)]
        certificate: Option<PathBuf>,

        /// TLS private key (PEM). Defaults to the certificate file
        #[arg(short = 'k', long)]
        private_key: Option<PathBuf>,

        /// Listen address [default: ::]
        #[arg(long)]
        host: Option<String>,

        /// Listen port [default: 4433]
        #[arg(long)]
        port: Option<u16>,

        /// Registry to register with (host:port)
        #[arg(long)]
        registry: Option<String>,

        /// Server id announced to the registry (random if omitted)
        #[arg(long)]
        server_id: Option<String>,

        /// URL announced to the registry (defaults to the listen address)
        #[arg(long)]
        advertise_url: Option<String>,

        /// Capability to advertise (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Only accept sessions presenting a registry ticket
        #[arg(long)]
        require_ticket: bool,
    },
    /// Connect to a server and exchange pings
    Ping {
        /// Server URL for a direct connection
        #[arg(long, conflicts_with = "registry")]
        url: Option<String>,

        /// SHA-256 of the server certificate (hex), pinned instead of CA validation
        #[arg(long)]
        cert_hash: Option<String>,

        /// Registry to discover servers from (host:port)
        #[arg(long)]
        registry: Option<String>,

        /// Required server capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Number of pings
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Also test datagram echo
        #[arg(long)]
        datagram: bool,

        /// Connect and per-operation timeout in seconds [default: 10]
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List servers known to a registry
    Discover {
        /// Registry address (host:port)
        #[arg(long)]
        registry: Option<String>,

        /// Required server capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Generate a self-signed certificate and key (PEM)
    GenerateCert {
        /// Certificate output path
        #[arg(long)]
        cert: PathBuf,

        /// Private key output path
        #[arg(long)]
        key: PathBuf,

        /// Subject alternative name (repeatable, default: localhost 127.0.0.1 ::1)
        #[arg(long = "san")]
        sans: Vec<String>,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.mode {
        Mode::Serve {
            certificate,
            private_key,
            host,
            port,
            registry,
            server_id,
            advertise_url,
            capabilities,
            require_ticket,
        } => {
            let mut section = load_file_config(args.config.as_deref())?.server();
            // CLI overrides file
            section.certificate = certificate.or(section.certificate);
            section.private_key = private_key.or(section.private_key);
            section.host = host.or(section.host);
            section.port = port.or(section.port);
            section.registry = registry.or(section.registry);
            section.server_id = server_id.or(section.server_id);
            section.advertise_url = advertise_url.or(section.advertise_url);
            if !capabilities.is_empty() {
                section.capabilities = Some(capabilities);
            }
            if require_ticket {
                section.require_ticket = Some(true);
            }
            commands::run_serve(section).await
        }
        Mode::Ping {
            url,
            cert_hash,
            registry,
            capabilities,
            count,
            datagram,
            timeout,
        } => {
            let mut section = load_file_config(args.config.as_deref())?.client();
            if url.is_some() || registry.is_some() {
                section.url = url;
                section.registry = registry;
            }
            section.cert_hash = cert_hash.or(section.cert_hash);
            if !capabilities.is_empty() {
                section.capabilities = Some(capabilities);
            }
            section.connect_timeout_secs = timeout.or(section.connect_timeout_secs);
            commands::run_ping(section, count, datagram).await
        }
        Mode::Discover {
            registry,
            capabilities,
        } => {
            let section = load_file_config(args.config.as_deref())?.client();
            let registry = registry.or(section.registry).ok_or_else(|| {
                anyhow::anyhow!("--registry is required (or set [client].registry in the config)")
            })?;
            let capabilities = if capabilities.is_empty() {
                section.capabilities.unwrap_or_default()
            } else {
                capabilities
            };
            commands::run_discover(&registry, &capabilities).await
        }
        Mode::GenerateCert {
            cert,
            key,
            sans,
            force,
        } => commands::run_generate_cert(&cert, &key, sans, force),
    }
}
