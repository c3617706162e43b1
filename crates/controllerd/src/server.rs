//! Controller server loops: the RPC accept loop, the scheduler task, the
//! state-save task, and execution of deferred network actions.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use quarry_proto::{AuthToken, Envelope, MsgBody};

use crate::persist;
use crate::rpc::{handle_envelope, CtlContext};
use crate::sched::{self, SchedAction};

/// Turn a deferred action into wire traffic. Failures are logged and
/// dropped: a vanished client or node must not wedge the controller.
pub async fn execute_actions(ctx: &CtlContext, actions: Vec<SchedAction>) {
    if actions.is_empty() {
        return;
    }
    let (addr_map, fanout, timeout) = {
        let cfg = ctx.regs.config.read().await;
        let nodes = ctx.regs.nodes.read().await;
        (nodes.addr_map(), cfg.fanout, cfg.msg_timeout())
    };
    let auth = AuthToken::issue(&ctx.key, 0, 0);

    for action in actions {
        match action {
            SchedAction::NotifyClient { addr, body } => {
                // Notifications get no reply; send and move on.
                let env = Envelope::new(auth.clone(), body);
                if let Err(err) = quarry_net::send_one(&addr, &env, timeout).await {
                    debug!(%addr, %err, "client notification failed");
                }
            }
            SchedAction::FanTerminate {
                job_id,
                step_id,
                nodes,
            } => {
                let env = Envelope::new(
                    auth.clone(),
                    MsgBody::TerminateTasks { job_id, step_id },
                );
                let records =
                    quarry_net::send_recv_msgs(&addr_map, &nodes, &env, fanout, timeout).await;
                for rec in records {
                    let rc = quarry_net::fanout::record_return_code(&rec);
                    if rc != 0 {
                        debug!(node = %rec.node_name, rc, "terminate not delivered");
                    }
                }
            }
            SchedAction::FanSignal {
                job_id,
                step_id,
                signal,
                nodes,
            } => {
                let env = Envelope::new(
                    auth.clone(),
                    MsgBody::SignalTasks {
                        job_id,
                        step_id,
                        signal,
                    },
                );
                quarry_net::send_recv_msgs(&addr_map, &nodes, &env, fanout, timeout).await;
            }
            SchedAction::FanSuspend {
                job_id,
                suspend,
                nodes,
            } => {
                let env = Envelope::new(auth.clone(), MsgBody::SuspendJob { job_id, suspend });
                quarry_net::send_recv_msgs(&addr_map, &nodes, &env, fanout, timeout).await;
            }
        }
    }
}

pub async fn run_rpc(ctx: Arc<CtlContext>, listener: TcpListener) {
    info!(addr = ?listener.local_addr().ok(), "controller accepting requests");
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let env = match quarry_net::read_envelope(&mut stream).await {
                Ok(env) => env,
                Err(err) => {
                    debug!(%peer, %err, "bad request");
                    return;
                }
            };
            let msg_type = env.msg_type();
            let (reply, actions) = handle_envelope(&ctx, env).await;
            if let Err(err) = quarry_net::write_envelope(&mut stream, &reply).await {
                debug!(%peer, ?msg_type, %err, "reply not delivered");
            }
            execute_actions(&ctx, actions).await;
        });
    }
}

/// Dedicated scheduler task: wakes on demand and on a periodic tick.
pub async fn run_scheduler(ctx: Arc<CtlContext>, kick: Arc<Notify>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = kick.notified() => {}
            _ = interval.tick() => {}
        }
        let now = chrono::Utc::now().timestamp();
        let actions = sched::maintenance_pass(&ctx.regs, &ctx.select, &ctx.acct, now).await;
        execute_actions(&ctx, actions).await;
        sched::schedule_pass(&ctx.regs, &ctx.select, &ctx.acct, now).await;
    }
}

/// Periodic checkpoint of the registries.
pub async fn run_state_save(ctx: Arc<CtlContext>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let dir = ctx.regs.config.read().await.state_dir.clone();
        if let Err(err) = persist::save_all(&dir, &ctx.regs).await {
            warn!(%err, "state checkpoint failed");
        }
    }
}
