use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};

use quarry_controllerd::config::ClusterConfig;
use quarry_core::StepLayout;
use quarry_net::eio::Reactor;
use quarry_proto::codec::NO_VAL;
use quarry_proto::message::{
    JobDescriptor, LaunchTasksMsg, MsgBody, StepCreateRequest,
};
use quarry_proto::{AuthToken, Envelope, ErrorCode};

mod cli;
mod io;
mod launch;
mod pmi;

use cli::Cli;
use launch::{estimate_nports, LaunchState};

const JOBID_ENV: &str = "QUARRY_JOBID";

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("qrun: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

#[tokio::main]
async fn run() -> anyhow::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    if let Err(msg) = args.validate() {
        anyhow::bail!("{msg}");
    }

    let cfg = ClusterConfig::load(args.config.as_deref())?;
    let key = cfg.auth_key()?;
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let auth = AuthToken::issue(&key, uid, gid);
    let timeout = cfg.msg_timeout();

    // The address the managers will reach us at: the interface that talks
    // to the controller.
    let client_host = {
        let probe = tokio::net::TcpStream::connect(&cfg.control_addr)
            .await
            .with_context(|| format!("controller {} unreachable", cfg.control_addr))?;
        probe.local_addr()?.ip().to_string()
    };

    // Allocation: reuse $QUARRY_JOBID or request one.
    let (job_id, allocated_here, alloc_nodes) = match std::env::var(JOBID_ENV) {
        Ok(raw) => {
            let job_id: u32 = raw.parse().context("bad QUARRY_JOBID")?;
            (job_id, false, query_job_nodes(&cfg, &auth, job_id, timeout).await?)
        }
        Err(_) => {
            let (job_id, nodes) = allocate(&cfg, &auth, &args, uid, gid, timeout).await?;
            (job_id, true, nodes)
        }
    };
    debug!(job_id, nodes = ?alloc_nodes, "allocation ready");

    let want_nodes = args
        .nodes
        .unwrap_or_else(|| (alloc_nodes.len() as u32).min(args.ntasks));

    let (reactor, io_handle) = Reactor::new();
    let reactor_task = tokio::spawn(reactor.run());

    // One connection per manager drives the port estimate. The response
    // ports are bound before step creation so the controller can reach us
    // for node events from the start.
    let nports = estimate_nports(want_nodes as usize);
    let (resp_listeners, resp_ports) = io::bind_resp_ports(nports).await?;
    let pmi = Arc::new(pmi::KvsStore::default());

    let step_req = MsgBody::JobStepCreate(StepCreateRequest {
        job_id,
        user_id: uid,
        task_cnt: args.ntasks,
        node_cnt: want_nodes,
        relative: args.relative,
        dist: args.distribution,
        name: args.job_name.clone(),
        resp_addr: Some(format!("{client_host}:{}", resp_ports[0])),
    });
    let reply = send_controller(&cfg, Envelope::new(auth.clone(), step_req), timeout).await?;
    let resp = match reply.body {
        MsgBody::JobStepCreateResponse(resp) => resp,
        MsgBody::Rc { rc } => anyhow::bail!("step creation failed: {}", ErrorCode::strerror(rc)),
        other => anyhow::bail!("unexpected step-create reply {:?}", other.msg_type()),
    };
    info!(job_id, step_id = resp.step_id, nodes = ?resp.node_names, "step created");

    let layout = StepLayout::build(
        resp.node_names.clone(),
        resp.tasks_per_node.clone(),
        args.distribution,
    )
    .map_err(|err| anyhow::anyhow!("task distribution failed: {err}"))?;

    let node_addrs: HashMap<String, String> = resp
        .node_names
        .iter()
        .zip(resp.node_addrs.iter())
        .map(|(n, a)| (n.clone(), a.clone()))
        .collect();

    let state = LaunchState::new(
        job_id,
        resp.step_id,
        layout.clone(),
        resp.cred.clone(),
        auth.clone(),
        cfg.control_addr.clone(),
        node_addrs,
        cfg.fanout,
        timeout,
        args.user_managed_io,
    );

    // Stdio endpoint (framed mode only), keyed by the step credential.
    let endpoint = if args.user_managed_io {
        None
    } else {
        Some(io::IoEndpoint::new(
            *state.cred.signature(),
            args.label,
            io_handle.clone(),
        ))
    };
    let io_ports = match &endpoint {
        Some(endpoint) => {
            io::bind_io_listeners(nports, endpoint.clone(), &io_handle).await?
        }
        None => Vec::new(),
    };
    io::install_resp_listeners(
        resp_listeners,
        state.clone(),
        pmi.clone(),
        endpoint.clone(),
        &io_handle,
    );

    // Launch payload.
    let env_vars: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    let cwd = std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/".to_string());
    let launch_msg = LaunchTasksMsg {
        job_id,
        step_id: resp.step_id,
        uid,
        gid,
        ntasks: args.ntasks,
        nnodes: want_nodes,
        argv: args.argv.clone(),
        env: env_vars,
        cwd,
        dist: args.distribution,
        cred: resp.cred.clone(),
        node_names: layout.node_names.clone(),
        tasks: layout.tasks.clone(),
        tids: layout.tids.clone(),
        client_host: client_host.clone(),
        resp_ports: resp_ports.clone(),
        io_ports: io_ports.clone(),
        buffered_stdio: !args.unbuffered,
        user_managed_io: args.user_managed_io,
        stdin_mode: args.stdin_mode(),
        ofname: args.output.clone(),
        efname: args.error.clone(),
        ifname: args.input.clone(),
        complete_fanout: cfg.fanout,
    };

    if let Err(code) = launch::launch_tasks(&state, launch_msg, &client_host).await {
        eprintln!("qrun: launch failed: {code}");
        finish(&cfg, &auth, job_id, allocated_here, &state, timeout).await;
        io_handle.shutdown();
        let _ = reactor_task.await;
        return Ok(1);
    }

    // Interactive stdin.
    if let Some(endpoint) = &endpoint {
        tokio::spawn(io::pump_stdin(
            endpoint.clone(),
            layout.clone(),
            args.stdin_mode(),
        ));
    }

    // Interrupt handling: one ^C forwards SIGINT, a quick second aborts.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut last: Option<Instant> = None;
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                let now = Instant::now();
                if let Some(prev) = last {
                    if now.duration_since(prev) < Duration::from_secs(1) {
                        eprintln!("qrun: aborting step");
                        state.abort();
                        return;
                    }
                }
                last = Some(now);
                eprintln!("qrun: interrupt (one more within 1s aborts)");
                state.fwd_signal(libc::SIGINT as u16).await;
            }
        });
    }

    // Optional timed signal relative to the time limit.
    if let (Some((signo, before)), Some(limit)) = (args.signal, effective_limit(&cfg, &args)) {
        let state = state.clone();
        let fire_in = Duration::from_secs((limit as u64) * 60).saturating_sub(
            Duration::from_secs(before as u64),
        );
        tokio::spawn(async move {
            tokio::time::sleep(fire_in).await;
            state.fwd_signal(signo).await;
        });
    }

    if state.wait_start().await.is_err() {
        eprintln!("qrun: step aborted while starting");
        state.wait_finish().await;
        finish(&cfg, &auth, job_id, allocated_here, &state, timeout).await;
        io_handle.shutdown();
        let _ = reactor_task.await;
        return Ok(1);
    }
    debug!("all tasks started");

    state.wait_finish().await;
    let code = state.exit_code();
    if state.with_inner(|inner| inner.timed_out) {
        eprintln!("qrun: step terminated by time limit");
    } else if state.with_inner(|inner| inner.job_complete) {
        eprintln!("qrun: job allocation was revoked");
    }

    finish(&cfg, &auth, job_id, allocated_here, &state, timeout).await;
    io_handle.shutdown();
    let _ = reactor_task.await;
    Ok(code)
}

fn effective_limit(cfg: &ClusterConfig, args: &Cli) -> Option<u32> {
    args.time.or_else(|| {
        cfg.partitions
            .iter()
            .find(|p| match &args.partition {
                Some(name) => &p.name == name,
                None => p.default,
            })
            .and_then(|p| p.max_time_min)
    })
}

async fn send_controller(
    cfg: &ClusterConfig,
    env: Envelope,
    timeout: Duration,
) -> anyhow::Result<Envelope> {
    quarry_net::send_recv_one(&cfg.control_addr, &env, timeout)
        .await
        .map_err(|err| anyhow::anyhow!("controller request failed: {err}"))
}

async fn allocate(
    cfg: &ClusterConfig,
    auth: &AuthToken,
    args: &Cli,
    uid: u32,
    gid: u32,
    timeout: Duration,
) -> anyhow::Result<(u32, Vec<String>)> {
    let desc = JobDescriptor {
        name: args.job_name.clone(),
        partition: args.partition.clone(),
        uid,
        gid,
        min_nodes: args.nodes.unwrap_or(1),
        max_nodes: NO_VAL,
        min_cpus_per_node: args.cpus_per_task,
        min_mem_mb: 0,
        min_tmp_mb: 0,
        req_nodes: args.nodelist.clone(),
        exc_nodes: args.exclude.clone(),
        features: Vec::new(),
        contiguous: false,
        shared: if args.exclusive { 0 } else { u16::MAX },
        priority: 100,
        time_limit_min: args.time.unwrap_or(NO_VAL),
        immediate: args.immediate,
        account: None,
        dependency: None,
        work_dir: std::env::current_dir()
            .ok()
            .map(|p| p.to_string_lossy().into_owned()),
        script: None,
    };

    let reply = send_controller(cfg, Envelope::new(auth.clone(), MsgBody::Allocate(desc)), timeout)
        .await?;
    let info = match reply.body {
        MsgBody::AllocateResponse(info) => info,
        MsgBody::Rc { rc } => anyhow::bail!("allocation failed: {}", ErrorCode::strerror(rc)),
        other => anyhow::bail!("unexpected allocation reply {:?}", other.msg_type()),
    };

    if info.error_code == 0 {
        return Ok((info.job_id, info.node_names));
    }
    if info.error_code != ErrorCode::TryAgain.as_u32() {
        anyhow::bail!(
            "allocation failed: {}",
            ErrorCode::strerror(info.error_code)
        );
    }

    // Queued: poll until the scheduler finds room.
    eprintln!("qrun: job {} queued, waiting for resources...", info.job_id);
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let nodes = query_job_nodes(cfg, auth, info.job_id, timeout).await?;
        if !nodes.is_empty() {
            return Ok((info.job_id, nodes));
        }
    }
}

/// Node names of a job's allocation; empty while it is still pending.
async fn query_job_nodes(
    cfg: &ClusterConfig,
    auth: &AuthToken,
    job_id: u32,
    timeout: Duration,
) -> anyhow::Result<Vec<String>> {
    let reply = send_controller(
        cfg,
        Envelope::new(
            auth.clone(),
            MsgBody::JobInfo {
                job_id: Some(job_id),
                show_all: false,
            },
        ),
        timeout,
    )
    .await?;
    match reply.body {
        MsgBody::JobInfoResponse { jobs, .. } => {
            let job = jobs
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("job {job_id} vanished"))?;
            let state = job.job_state & 0x7fff;
            if state > 2 {
                anyhow::bail!("job {job_id} already finished");
            }
            match job.nodes {
                Some(pattern) => Ok(quarry_core::hostlist::expand(&pattern)?),
                None => Ok(Vec::new()),
            }
        }
        MsgBody::Rc { rc } => anyhow::bail!("job query failed: {}", ErrorCode::strerror(rc)),
        other => anyhow::bail!("unexpected job query reply {:?}", other.msg_type()),
    }
}

/// Tear down: release the allocation if this invocation created it.
async fn finish(
    cfg: &ClusterConfig,
    auth: &AuthToken,
    job_id: u32,
    allocated_here: bool,
    state: &Arc<LaunchState>,
    timeout: Duration,
) {
    if !allocated_here {
        return;
    }
    let rc = state.exit_code().max(0) as u32;
    let env = Envelope::new(
        auth.clone(),
        MsgBody::CompleteJobAllocation { job_id, rc },
    );
    if let Err(err) = quarry_net::send_recv_one(&cfg.control_addr, &env, timeout).await {
        warn!(%err, "allocation release not delivered");
    }
}
