//! noded - nodemesh overlay node daemon
//!
//! Joins the mesh by listening for and/or connecting to peers, optionally
//! answers requests, and logs what the node sees until Ctrl-C.

use clap::Parser;
use nodemesh_core::{RequestTarget, ResponseStatus};
use nodemesh_net::Node;
use noded::config::Config;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    init_logging(&config);

    info!("noded v{} - nodemesh node", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_logging(config: &Config) {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("noded={level},nodemesh_net={level}")));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let node = Arc::new(Node::with_config(&config.name, config.node_config()?)?);
    info!("Node {} id {}", node.info().name, node.info().id);

    if config.echo {
        node.set_request_handler(|payload: Vec<u8>| {
            let mut reply = payload;
            reply.extend_from_slice(b" ok");
            Some(reply)
        });
        info!("Echo handler installed");
    }

    if let Some(port) = config.listen {
        let addr = node.start_listener(port).await?;
        info!("Accepting peers on {}", addr);
    }

    for (host, port) in config.peers()? {
        match node.connect(&host, port).await {
            Ok(remote) => info!("Connected to {} ({}) at {}:{}", remote.name, remote.id, host, port),
            Err(e) => warn!("Failed to connect to {}:{}: {}", host, port, e),
        }
    }

    if let Some(text) = &config.send {
        let target = config
            .to
            .clone()
            .map(RequestTarget::name)
            .unwrap_or_default();
        let response = node.send(text.clone().into_bytes(), target.clone()).await;
        match response.status {
            ResponseStatus::Success => info!(
                "Response from {}: {}",
                target,
                String::from_utf8_lossy(&response.data)
            ),
            status => warn!("Request to {} failed: {:?}", target, status),
        }

        if config.listen.is_none() {
            node.shutdown();
            return Ok(());
        }
    }

    // Spawn peer logging task
    if config.status_interval_secs > 0 {
        let status_node = node.clone();
        let period = Duration::from_secs(config.status_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let peers = status_node.connected_node_info();
                match serde_json::to_string(&peers) {
                    Ok(json) => info!("{} peers: {}", peers.len(), json),
                    Err(e) => warn!("Failed to serialize peer list: {}", e),
                }
            }
        });
    }

    // Wait for shutdown
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    node.shutdown();

    Ok(())
}
