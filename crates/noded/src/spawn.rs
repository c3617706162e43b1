//! Step manager spawning.
//!
//! One `quarry-stepmgr` process per step. The launch request travels over
//! the child's stdin as a single framed handoff; the child reports to the
//! client and the controller on its own from there.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info};

use quarry_proto::message::LaunchTasksMsg;
use quarry_stepmgr::handoff::Handoff;

use crate::serve::NodeCtx;

pub async fn spawn_stepmgr(ctx: &Arc<NodeCtx>, launch: &LaunchTasksMsg) -> anyhow::Result<()> {
    let node_addrs: Vec<String> = launch
        .node_names
        .iter()
        .map(|name| {
            ctx.addr_map
                .get(name)
                .cloned()
                .unwrap_or_else(|| ctx.cfg.control_addr.clone())
        })
        .collect();

    let handoff = Handoff {
        node_name: ctx.node.name.clone(),
        spool_dir: ctx.cfg.spool_dir.to_string_lossy().into_owned(),
        controller_addr: ctx.cfg.control_addr.clone(),
        auth_key_hex: ctx.cfg.auth_key.trim().to_string(),
        operator_uid: ctx.cfg.operator_uid,
        node_addrs,
        launch: launch.clone(),
    };

    let mut child = Command::new(&ctx.stepmgr_bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("step manager stdin unavailable"))?;
    quarry_net::write_frame(&mut stdin, &handoff.encode()).await?;
    drop(stdin);

    info!(
        job_id = launch.job_id,
        step_id = launch.step_id,
        pid = child.id().unwrap_or(0),
        "step manager spawned"
    );

    let job_id = launch.job_id;
    let step_id = launch.step_id;
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(job_id, step_id, %status, "step manager exited"),
            Err(err) => debug!(job_id, step_id, %err, "step manager reap failed"),
        }
    });
    Ok(())
}
