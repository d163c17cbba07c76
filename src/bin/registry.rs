//! Discovery registry binary.
//!
//! Usage:
//! ```bash
//! pingpong-registry --bind 0.0.0.0:9999
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use pingpong_rs::config::load_file_config;
use pingpong_rs::discovery::{run_registry, RegistryOptions};

#[derive(Parser, Debug)]
#[command(name = "pingpong-registry")]
#[command(about = "Registry that lets ping-pong clients discover and negotiate with servers")]
#[command(version)]
struct Args {
    /// Address to bind the registry [default: 0.0.0.0:9999]
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Seconds a registration lives without a heartbeat [default: 30]
    #[arg(long)]
    lease_ttl: Option<u64>,

    /// Seconds a negotiated ticket stays valid [default: 15]
    #[arg(long)]
    ticket_ttl: Option<u64>,

    /// Path to config file (default: ~/.config/pingpong-rs/config.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let file = load_file_config(args.config.as_deref())?.registry();

    let bind = args.bind.unwrap_or_else(|| file.bind_addr());
    let options = RegistryOptions {
        lease_ttl: args
            .lease_ttl
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or_else(|| file.lease_ttl()),
        ticket_ttl: args
            .ticket_ttl
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or_else(|| file.ticket_ttl()),
    };

    log::info!(
        "Starting registry on {} (lease {:?}, tickets {:?})",
        bind,
        options.lease_ttl,
        options.ticket_ttl
    );

    tokio::select! {
        result = run_registry(bind, options) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            Ok(())
        }
    }
}
