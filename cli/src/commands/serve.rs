//! API server management

use anyhow::{Context, Result};
use kronk_core::Config;
use std::net::{SocketAddr, ToSocketAddrs};

pub async fn execute(host: Option<&str>) -> Result<()> {
    let config = Config::load()?;

    let host = host.unwrap_or(&config.server.api_host).to_string();
    let addr: SocketAddr = host
        .to_socket_addrs()
        .with_context(|| format!("unable to resolve {host}"))?
        .next()
        .with_context(|| format!("no address for {host}"))?;

    println!("Starting kronk (PID: {})...", std::process::id());
    println!("Listening on http://{}", host);
    println!();
    println!("API endpoints:");
    println!("  Chat:        POST /v1/chat/completions");
    println!("  Embeddings:  POST /v1/embeddings");
    println!("  Models:      GET  /v1/models");
    println!("  Health:      GET  /health");
    println!();
    println!("Press Ctrl+C to stop.");
    println!();

    kronk_daemon::run_server(addr, config).await
}
