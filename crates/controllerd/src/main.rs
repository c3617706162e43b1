use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use quarry_core as _;
use quarry_net as _;
use quarry_proto as _;
use serde as _;
use serde_json as _;
use sha2 as _;
use thiserror as _;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::info;

use quarry_controllerd::acct::{AcctSink, FileAcctSink, NullAcctSink};
use quarry_controllerd::config::ClusterConfig;
use quarry_controllerd::persist::{self, RecoverMode};
use quarry_controllerd::rpc::CtlContext;
use quarry_controllerd::select::LinearSelect;
use quarry_controllerd::server;

#[derive(Debug, Parser)]
#[command(name = "quarryd", version, about = "quarry cluster controller")]
struct Cli {
    /// Cluster configuration file (falls back to $QUARRY_CONF).
    #[arg(long, env = "QUARRY_CONF")]
    config: Option<PathBuf>,

    /// State recovery mode at startup.
    #[arg(long, default_value = "full")]
    recover: RecoverMode,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Scheduler tick interval in seconds.
    #[arg(long, default_value_t = 5)]
    sched_tick: u64,
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
    let listen = cli.listen.clone().unwrap_or_else(|| cfg.control_addr.clone());
    let key = cfg.auth_key()?;
    let save_interval = Duration::from_secs(cfg.save_interval_sec.max(5) as u64);
    let state_dir = cfg.state_dir.clone();
    let acct: Arc<dyn AcctSink> = match &cfg.acct_file {
        Some(path) => Arc::new(FileAcctSink::new(path.clone())),
        None => Arc::new(NullAcctSink),
    };

    let now = chrono::Utc::now().timestamp();
    let regs = Arc::new(persist::recover(cfg, cli.recover, now));

    let kick = Arc::new(Notify::new());
    let ctx = Arc::new(CtlContext {
        regs,
        select: Arc::new(LinearSelect),
        acct,
        key,
        sched_kick: kick.clone(),
        triggers: std::sync::Mutex::new(Default::default()),
    });

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind {listen}"))?;

    let sched_task = tokio::spawn(server::run_scheduler(
        ctx.clone(),
        kick.clone(),
        Duration::from_secs(cli.sched_tick.max(1)),
    ));
    let save_task = tokio::spawn(server::run_state_save(ctx.clone(), save_interval));
    let rpc_task = tokio::spawn(server::run_rpc(ctx.clone(), listener));

    info!("quarryd started");
    shutdown_signal().await;
    info!("shutting down; saving state");

    rpc_task.abort();
    sched_task.abort();
    save_task.abort();
    persist::save_all(&state_dir, &ctx.regs).await?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(_) => return tokio::signal::ctrl_c().await.map(|_| ()).unwrap_or(()),
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
