//! Node daemon service loops.
//!
//! Two jobs: keep the controller informed (register, then periodic pings)
//! and serve the node's RPC port. A fanned request is handled locally and
//! simultaneously forwarded to the subtree named in its directive; the
//! reply aggregates the local record with every descendant's.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use quarry_controllerd::config::{ClusterConfig, NodeConfig};
use quarry_proto::message::{MsgBody, MsgType, NodeRegInfo, RetDataInfo};
use quarry_proto::stepreq::{StepdReply, StepdRequest};
use quarry_proto::{AuthKey, AuthToken, Envelope, ErrorCode};

use crate::spawn;

pub struct NodeCtx {
    pub cfg: ClusterConfig,
    pub node: NodeConfig,
    pub stepmgr_bin: PathBuf,
    pub key: AuthKey,
    pub auth: AuthToken,
    pub addr_map: HashMap<String, String>,
}

impl NodeCtx {
    pub fn new(
        cfg: ClusterConfig,
        node: NodeConfig,
        stepmgr_bin: PathBuf,
    ) -> anyhow::Result<Self> {
        let key = cfg.auth_key()?;
        let uid = unsafe { libc::getuid() };
        let auth = AuthToken::issue(&key, uid, uid);
        let addr_map = cfg
            .nodes
            .iter()
            .map(|n| (n.name.clone(), n.addr.clone()))
            .collect();
        Ok(Self {
            cfg,
            node,
            stepmgr_bin,
            key,
            auth,
            addr_map,
        })
    }

    fn step_socket(&self, job_id: u32, step_id: u32) -> PathBuf {
        self.cfg
            .spool_dir
            .join("steps")
            .join(format!("{job_id}.{step_id}"))
            .join("reqsock")
    }

    /// Sockets of every step of a job present on this node.
    fn job_sockets(&self, job_id: u32) -> Vec<PathBuf> {
        let dir = self.cfg.spool_dir.join("steps");
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&format!("{job_id}.")) {
                let sock = entry.path().join("reqsock");
                if sock.exists() {
                    out.push(sock);
                }
            }
        }
        out
    }
}

pub async fn run_heartbeat(ctx: Arc<NodeCtx>, every: Duration) {
    let reg = MsgBody::NodeRegister(NodeRegInfo {
        node_name: ctx.node.name.clone(),
        addr: ctx.node.addr.clone(),
        cpus: ctx.node.cpus,
        sockets: ctx.node.sockets,
        cores: ctx.node.cores,
        threads: ctx.node.threads,
        real_mem_mb: ctx.node.real_mem_mb,
        tmp_disk_mb: ctx.node.tmp_disk_mb,
        features: ctx.node.features.clone(),
    });
    let timeout = ctx.cfg.msg_timeout();

    // Register until the controller acknowledges, then ping.
    loop {
        let env = Envelope::new(ctx.auth.clone(), reg.clone());
        match quarry_net::send_recv_one(&ctx.cfg.control_addr, &env, timeout).await {
            Ok(reply) => match reply.body {
                MsgBody::Rc { rc: 0 } => {
                    info!("registered with controller");
                    break;
                }
                MsgBody::Rc { rc } => {
                    warn!(rc, msg = ErrorCode::strerror(rc), "controller refused registration");
                }
                _ => warn!("unexpected registration reply"),
            },
            Err(err) => debug!(%err, "controller not reachable yet"),
        }
        tokio::time::sleep(every).await;
    }

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let env = Envelope::new(
            ctx.auth.clone(),
            MsgBody::Ping {
                node_name: ctx.node.name.clone(),
            },
        );
        if let Err(err) = quarry_net::send_recv_one(&ctx.cfg.control_addr, &env, timeout).await {
            debug!(%err, "ping failed");
        }
    }
}

pub async fn run_accept(ctx: Arc<NodeCtx>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(ctx, stream).await {
                debug!(%peer, %err, "connection failed");
            }
        });
    }
}

fn is_fanned(msg_type: MsgType) -> bool {
    matches!(
        msg_type,
        MsgType::LaunchTasks
            | MsgType::SignalTasks
            | MsgType::TerminateTasks
            | MsgType::SuspendJob
            | MsgType::ReattachTasks
    )
}

async fn handle_conn(ctx: Arc<NodeCtx>, mut stream: TcpStream) -> Result<(), quarry_net::MsgIoError> {
    let env = quarry_net::read_envelope(&mut stream).await?;
    if env.auth.verify(&ctx.key).is_err() {
        let reply = Envelope::new(
            ctx.auth.clone(),
            MsgBody::Rc {
                rc: ErrorCode::CredVerify.as_u32(),
            },
        );
        return quarry_net::write_envelope(&mut stream, &reply).await;
    }

    let msg_type = env.msg_type();
    let reply_body = if is_fanned(msg_type) {
        // Forward to the subtree while handling the local copy.
        let forward = env.forward.clone();
        let mut template = env.clone();
        template.forward = Default::default();
        let subtree = async {
            if forward.nodes.is_empty() {
                Vec::new()
            } else {
                quarry_net::send_recv_msgs(
                    &ctx.addr_map,
                    &forward.nodes,
                    &template,
                    forward.fanout.max(1),
                    Duration::from_millis(forward.timeout_ms.max(1000) as u64),
                )
                .await
            }
        };
        let local = handle_local(&ctx, &env);
        let (children, local_rec) = tokio::join!(subtree, local);

        let mut records = vec![local_rec];
        records.extend(children);
        MsgBody::ForwardAggregate { records }
    } else {
        handle_direct(&ctx, &env).await
    };

    let reply = Envelope::new(ctx.auth.clone(), reply_body);
    quarry_net::write_envelope(&mut stream, &reply).await
}

/// Handle the node-local copy of a fanned request; the result becomes this
/// node's record in the aggregate. Step-plane requests carry the verified
/// caller's identity, re-signed locally, so the manager's per-operation
/// authorization still sees the real requester.
async fn handle_local(ctx: &Arc<NodeCtx>, env: &Envelope) -> RetDataInfo {
    let caller = AuthToken::issue(&ctx.key, env.auth.uid, env.auth.gid);
    let node_name = ctx.node.name.clone();
    let rec = |msg_type: MsgType, rc: u32, body: Option<MsgBody>| RetDataInfo {
        msg_type: msg_type as u16,
        rc,
        node_name: node_name.clone(),
        body: body.map(Box::new),
    };

    match &env.body {
        MsgBody::LaunchTasks(launch) => {
            match spawn::spawn_stepmgr(ctx, launch).await {
                Ok(()) => rec(MsgType::Rc, 0, Some(MsgBody::Rc { rc: 0 })),
                Err(err) => {
                    warn!(%err, "step manager spawn failed");
                    rec(
                        MsgType::Rc,
                        ErrorCode::NoSuchProcess.as_u32(),
                        Some(MsgBody::Rc {
                            rc: ErrorCode::NoSuchProcess.as_u32(),
                        }),
                    )
                }
            }
        }
        MsgBody::SignalTasks {
            job_id,
            step_id,
            signal,
        } => {
            let rc = step_request(
                ctx,
                &caller,
                *job_id,
                *step_id,
                &StepdRequest::SignalContainer { signal: *signal },
            )
            .await;
            rec(MsgType::Rc, rc, Some(MsgBody::Rc { rc }))
        }
        MsgBody::TerminateTasks { job_id, step_id } => {
            let rc =
                step_request(ctx, &caller, *job_id, *step_id, &StepdRequest::Terminate).await;
            rec(MsgType::Rc, rc, Some(MsgBody::Rc { rc }))
        }
        MsgBody::SuspendJob { job_id, suspend } => {
            let req = if *suspend {
                StepdRequest::Suspend
            } else {
                StepdRequest::Resume
            };
            let sockets = ctx.job_sockets(*job_id);
            let mut rc = 0;
            if sockets.is_empty() {
                rc = ErrorCode::InvalidJobId.as_u32();
            }
            for sock in sockets {
                let one = socket_request(&caller, &sock, &req).await;
                if one != 0 {
                    rc = one;
                }
            }
            rec(MsgType::Rc, rc, Some(MsgBody::Rc { rc }))
        }
        MsgBody::ReattachTasks {
            job_id,
            step_id,
            resp_ports,
            io_ports,
            signature,
        } => {
            let host = env.orig_addr.clone();
            let ioaddr = io_ports
                .first()
                .map(|p| format!("{host}:{p}"))
                .unwrap_or_default();
            let respaddr = resp_ports
                .first()
                .map(|p| format!("{host}:{p}"))
                .unwrap_or_default();
            let sock = ctx.step_socket(*job_id, *step_id);
            let req = StepdRequest::Attach {
                ioaddr,
                respaddr,
                signature: signature.clone(),
            };
            match quarry_stepmgr::req::request(&sock, &caller, &req).await {
                Ok(StepdReply::Attach {
                    rc,
                    pids,
                    gtids,
                    executable,
                }) => rec(
                    MsgType::ReattachTasksResponse,
                    rc,
                    Some(MsgBody::ReattachTasksResponse {
                        node_name: ctx.node.name.clone(),
                        rc,
                        pids,
                        gtids,
                        executable,
                    }),
                ),
                Ok(_) | Err(_) => rec(
                    MsgType::Rc,
                    ErrorCode::StepNotFound.as_u32(),
                    Some(MsgBody::Rc {
                        rc: ErrorCode::StepNotFound.as_u32(),
                    }),
                ),
            }
        }
        other => rec(other.msg_type(), ErrorCode::UnexpectedMessage.as_u32(), None),
    }
}

/// Point-to-point messages: today that is the completion flow climbing the
/// step tree through this node.
async fn handle_direct(ctx: &Arc<NodeCtx>, env: &Envelope) -> MsgBody {
    match &env.body {
        MsgBody::StepComplete(msg) => {
            // The sender is a child step manager; keep its identity.
            let caller = AuthToken::issue(&ctx.key, env.auth.uid, env.auth.gid);
            let sock = ctx.step_socket(msg.job_id, msg.step_id);
            if sock.exists() {
                let req = StepdRequest::Completion {
                    first: msg.range_first,
                    last: msg.range_last,
                    step_rc: msg.step_rc,
                    acct: msg.acct,
                };
                let rc = socket_request(&caller, &sock, &req).await;
                if rc == 0 {
                    return MsgBody::Rc { rc: 0 };
                }
            }
            // No local manager for this step: relay to the controller so
            // the record is not lost.
            debug!(
                job_id = msg.job_id,
                step_id = msg.step_id,
                "no local manager; relaying completion to controller"
            );
            let relay = Envelope::new(ctx.auth.clone(), env.body.clone());
            match quarry_net::send_recv_one(&ctx.cfg.control_addr, &relay, ctx.cfg.msg_timeout())
                .await
            {
                Ok(reply) => reply.body,
                Err(err) => MsgBody::Rc {
                    rc: err.error_code().as_u32(),
                },
            }
        }
        other => {
            debug!(msg_type = ?other.msg_type(), "unexpected message at node daemon");
            MsgBody::Rc {
                rc: ErrorCode::UnexpectedMessage.as_u32(),
            }
        }
    }
}

async fn step_request(
    ctx: &Arc<NodeCtx>,
    caller: &AuthToken,
    job_id: u32,
    step_id: u32,
    req: &StepdRequest,
) -> u32 {
    let sock = ctx.step_socket(job_id, step_id);
    if !sock.exists() {
        // Races with normal step teardown; callers treat this as benign.
        return ErrorCode::InvalidJobId.as_u32();
    }
    socket_request(caller, &sock, req).await
}

async fn socket_request(caller: &AuthToken, sock: &Path, req: &StepdRequest) -> u32 {
    match quarry_stepmgr::req::request(sock, caller, req).await {
        Ok(StepdReply::Rc { rc }) => rc,
        Ok(StepdReply::RcErrno { rc, .. }) => rc,
        Ok(_) => 0,
        Err(err) => {
            debug!(%err, sock = %sock.display(), "step request failed");
            ErrorCode::InvalidJobId.as_u32()
        }
    }
}
