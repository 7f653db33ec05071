//! Configuration for noded

use anyhow::Context;
use clap::Parser;
use nodemesh_net::NodeConfig;
use std::path::PathBuf;

/// noded - nodemesh overlay node
#[derive(Parser, Debug, Clone)]
#[command(name = "noded")]
#[command(about = "nodemesh overlay node daemon")]
pub struct Config {
    /// Node name advertised to peers
    #[arg(short, long, env = "NODEMESH_NAME")]
    pub name: String,

    /// Port to accept peers on (0 picks a free port)
    #[arg(short, long, env = "NODEMESH_LISTEN")]
    pub listen: Option<u16>,

    /// Peers to connect to as host:port (comma-separated or repeated)
    #[arg(short, long, value_delimiter = ',', env = "NODEMESH_CONNECT")]
    pub connect: Vec<String>,

    /// Node configuration file (JSON)
    #[arg(long, env = "NODEMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the request timeout (ms, 0 = fire-and-forget)
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// Override the keepalive interval (ms, 0 = off)
    #[arg(long)]
    pub keepalive_interval_ms: Option<u64>,

    /// Override the idle timeout (ms)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Answer requests with their payload followed by " ok"
    #[arg(long)]
    pub echo: bool,

    /// Send this text once peers are connected
    #[arg(long)]
    pub send: Option<String>,

    /// Target node name for --send
    #[arg(long, requires = "send")]
    pub to: Option<String>,

    /// Seconds between connected-peer logs (0 disables)
    #[arg(long, default_value = "60")]
    pub status_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        nodemesh_core::validate_name(&self.name)
            .with_context(|| format!("invalid node name {:?}", self.name))?;
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty, got {:?}", self.log_format);
        }
        if self.listen.is_none() && self.connect.is_empty() {
            anyhow::bail!("Nothing to do: pass --listen and/or --connect");
        }
        if let Some(to) = &self.to {
            nodemesh_core::validate_name(to)
                .with_context(|| format!("invalid target name {:?}", to))?;
        }
        self.peers()?;
        Ok(())
    }

    /// Peers from --connect as (host, port)
    pub fn peers(&self) -> anyhow::Result<Vec<(String, u16)>> {
        self.connect.iter().map(|peer| parse_peer(peer)).collect()
    }

    /// Node configuration: file (or defaults), then command-line overrides
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut node_config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };

        if let Some(ms) = self.request_timeout_ms {
            node_config.request_timeout_ms = ms;
        }
        if let Some(ms) = self.keepalive_interval_ms {
            node_config.keepalive_interval_ms = ms;
        }
        if let Some(ms) = self.idle_timeout_ms {
            node_config.idle_timeout_ms = ms;
        }

        node_config.validate()?;
        Ok(node_config)
    }
}

/// Split `host:port`
pub fn parse_peer(peer: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = peer
        .rsplit_once(':')
        .with_context(|| format!("peer {:?} is not host:port", peer))?;
    if host.is_empty() {
        anyhow::bail!("peer {:?} has no host", peer);
    }
    let port = port
        .parse()
        .with_context(|| format!("peer {:?} has a bad port", peer))?;
    Ok((host.to_string(), port))
}
