use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use quarry_controllerd::config::ClusterConfig;

mod serve;
mod spawn;

#[derive(Debug, Parser)]
#[command(name = "quarry-noded", version, about = "quarry per-node daemon")]
struct Cli {
    /// Cluster configuration file (falls back to $QUARRY_CONF).
    #[arg(long, env = "QUARRY_CONF")]
    config: Option<PathBuf>,

    /// This node's name; defaults to the short hostname.
    #[arg(long)]
    node_name: Option<String>,

    /// Override the configured listen address for this node.
    #[arg(long)]
    listen: Option<String>,

    /// Path to the step manager binary.
    #[arg(long, default_value = "quarry-stepmgr")]
    stepmgr: PathBuf,

    /// Seconds between controller pings.
    #[arg(long, default_value_t = 15)]
    ping_interval: u64,
}

fn short_hostname() -> anyhow::Result<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        anyhow::bail!("gethostname failed");
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let full = std::str::from_utf8(&buf[..end]).context("hostname is not utf-8")?;
    Ok(full.split('.').next().unwrap_or(full).to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = ClusterConfig::load(cli.config.as_deref())?;
    let node_name = match cli.node_name {
        Some(name) => name,
        None => short_hostname()?,
    };
    let node_cfg = cfg
        .nodes
        .iter()
        .find(|n| n.name == node_name)
        .cloned()
        .with_context(|| format!("node {node_name:?} not in configuration"))?;
    let listen = cli.listen.clone().unwrap_or_else(|| node_cfg.addr.clone());

    let ctx = Arc::new(serve::NodeCtx::new(cfg, node_cfg, cli.stepmgr.clone())?);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    info!(node = %node_name, %listen, "node daemon up");

    let heartbeat = tokio::spawn(serve::run_heartbeat(
        ctx.clone(),
        std::time::Duration::from_secs(cli.ping_interval.max(1)),
    ));
    let accept = tokio::spawn(serve::run_accept(ctx, listener));

    tokio::signal::ctrl_c().await?;
    info!("node daemon shutting down");
    heartbeat.abort();
    accept.abort();
    Ok(())
}
