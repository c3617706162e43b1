use libc as _;
use quarry_core as _;
use thiserror as _;

use anyhow::Context;
use tracing::{info, warn};

use quarry_net::eio::Reactor;
use quarry_proto::message::MsgBody;
use quarry_proto::Envelope;
use quarry_stepmgr::handoff::Handoff;
use quarry_stepmgr::mgr::{MgrError, StepManager};
use quarry_stepmgr::{io as stepio, req};

/// Spawned by the node daemon with the launch handoff on stdin; everything
/// else is derived from it.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut stdin = tokio::io::stdin();
    let frame = quarry_net::read_frame(&mut stdin)
        .await
        .context("read launch handoff")?;
    let handoff = Handoff::decode(&frame).context("decode launch handoff")?;
    let node_name = handoff.node_name.clone();
    let job_id = handoff.launch.job_id;
    let step_id = handoff.launch.step_id;
    info!(job_id, step_id, node = %node_name, "step manager starting");

    let now = chrono_now();
    let (reactor, io_handle) = Reactor::new();
    let reactor_task = tokio::spawn(reactor.run());

    let mgr = match StepManager::new(handoff, io_handle.clone(), now) {
        Ok(mgr) => mgr,
        Err(err) => {
            // The client learns about the refusal; no task ever starts.
            report_launch_failure(&frame, &err).await;
            anyhow::bail!("launch rejected: {err}");
        }
    };

    // Stdio plane first so early task output has somewhere to go.
    if let Some(shared) = &mgr.io_shared {
        let launch = &mgr.handoff.launch;
        let io_addr = format!(
            "{}:{}",
            launch.client_host,
            launch.io_ports[mgr.nodeid as usize % launch.io_ports.len()]
        );
        if let Err(err) = stepio::connect_client(&io_addr, shared, &io_handle).await {
            warn!(%io_addr, %err, "stdio connect failed");
        }
    }

    let mut children = match mgr.spawn_tasks() {
        Ok(children) => children,
        Err(err) => {
            mgr.notify_clients(MsgBody::LaunchTasksResponse {
                rc: quarry_proto::ErrorCode::NoSuchProcess.as_u32(),
                node_name: node_name.clone(),
                local_pids: Vec::new(),
                gtids: Vec::new(),
            })
            .await;
            anyhow::bail!("task spawn failed: {err}");
        }
    };
    mgr.start_io(&mut children);

    // Request plane.
    let sock_path = mgr.handoff.socket_path();
    let listener = req::bind(&sock_path)
        .with_context(|| format!("bind request socket {}", sock_path.display()))?;
    let req_task = tokio::spawn(req::serve(listener, mgr.clone()));

    // Tell the client its tasks started.
    let (pids, gtids) = {
        let tasks = mgr.tasks.lock().unwrap();
        (
            tasks.iter().map(|t| t.pid).collect::<Vec<_>>(),
            tasks.iter().map(|t| t.gtid).collect::<Vec<_>>(),
        )
    };
    mgr.notify_clients(MsgBody::LaunchTasksResponse {
        rc: 0,
        node_name: node_name.clone(),
        local_pids: pids,
        gtids,
    })
    .await;

    mgr.supervise(children).await;
    info!(job_id, step_id, "all local tasks complete");

    // Let straggling output frames drain before the plane goes away.
    if let Some(shared) = &mgr.io_shared {
        shared.flush_out(std::time::Duration::from_secs(5)).await;
    }

    mgr.finish_completion().await;

    req_task.abort();
    io_handle.shutdown();
    let _ = reactor_task.await;
    {
        let mut container = mgr.container.lock().unwrap();
        use quarry_stepmgr::container::Container;
        let _ = container.destroy();
    }
    let _ = std::fs::remove_file(&sock_path);
    info!(job_id, step_id, "step manager exiting");
    Ok(())
}

fn chrono_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Best-effort launch failure report when the manager never came up: decode
/// just enough of the handoff to find the client.
async fn report_launch_failure(frame: &[u8], err: &MgrError) {
    let Ok(handoff) = Handoff::decode(frame) else {
        return;
    };
    let Ok(key) = quarry_proto::AuthKey::from_hex(&handoff.auth_key_hex) else {
        return;
    };
    let launch = &handoff.launch;
    let rc = match err {
        MgrError::Cred(code) => code.as_u32(),
        _ => quarry_proto::ErrorCode::NoSuchProcess.as_u32(),
    };
    let rank = launch
        .node_names
        .iter()
        .position(|n| n == &handoff.node_name)
        .unwrap_or(0);
    let addr = format!(
        "{}:{}",
        launch.client_host,
        launch.resp_ports[rank % launch.resp_ports.len().max(1)]
    );
    let auth = quarry_proto::AuthToken::issue(&key, handoff.operator_uid, handoff.operator_uid);
    let env = Envelope::new(
        auth,
        MsgBody::LaunchTasksResponse {
            rc,
            node_name: handoff.node_name.clone(),
            local_pids: Vec::new(),
            gtids: Vec::new(),
        },
    );
    let _ = quarry_net::send_one(&addr, &env, std::time::Duration::from_secs(5)).await;
}
