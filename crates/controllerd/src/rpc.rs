//! RPC dispatch.
//!
//! Every inbound envelope passes the authenticator gate first; the identity
//! it carries is then authorized per operation. Handlers mutate the
//! registries under the canonical lock order and hand network side effects
//! back to the caller as deferred actions, so no lock is ever held across a
//! send.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use quarry_proto::message::{
    AllocationInfo, MsgBody, StepCreateRequest, StepCreateResponse, TriggerRec,
};
use quarry_proto::{AuthKey, AuthToken, Credential, Envelope, ErrorCode};

use crate::acct::{AcctEvent, AcctRecord, AcctSink};
use crate::registry::job::{JobState, StepRecord};
use crate::registry::Registries;
use crate::sched::{self, SchedAction};
use crate::select::SelectCapability;

const SIGKILL: u16 = 9;

pub struct CtlContext {
    pub regs: Arc<Registries>,
    pub select: Arc<dyn SelectCapability>,
    pub acct: Arc<dyn AcctSink>,
    pub key: AuthKey,
    pub sched_kick: Arc<Notify>,
    pub triggers: std::sync::Mutex<TriggerTable>,
}

#[derive(Debug, Default)]
pub struct TriggerTable {
    next_id: u32,
    recs: Vec<TriggerRec>,
}

impl TriggerTable {
    pub fn set(&mut self, mut rec: TriggerRec) -> u32 {
        self.next_id += 1;
        rec.trig_id = self.next_id;
        let id = rec.trig_id;
        self.recs.push(rec);
        id
    }

    pub fn clear(&mut self, trig_id: u32) -> bool {
        let before = self.recs.len();
        self.recs.retain(|r| r.trig_id != trig_id);
        self.recs.len() != before
    }

    pub fn list(&self) -> Vec<TriggerRec> {
        self.recs.clone()
    }
}

impl CtlContext {
    fn reply(&self, body: MsgBody) -> Envelope {
        Envelope::new(AuthToken::issue(&self.key, 0, 0), body)
    }

    fn rc(&self, code: ErrorCode) -> Envelope {
        self.reply(MsgBody::Rc { rc: code.as_u32() })
    }

    async fn is_operator(&self, uid: u32) -> bool {
        uid == 0 || uid == self.regs.config.read().await.operator_uid
    }
}

/// Handle one request; the reply goes back on the same connection, the
/// actions are executed by the server after this returns.
pub async fn handle_envelope(
    ctx: &CtlContext,
    env: Envelope,
) -> (Envelope, Vec<SchedAction>) {
    if env.auth.verify(&ctx.key).is_err() {
        warn!("request with bad authenticator");
        return (ctx.rc(ErrorCode::CredVerify), Vec::new());
    }
    let uid = env.auth.uid;
    let now = Utc::now().timestamp();
    let mut actions = Vec::new();

    let reply = match env.body {
        MsgBody::Allocate(desc) => handle_allocate(ctx, desc, uid, now).await,
        MsgBody::SubmitBatch(desc) => handle_submit_batch(ctx, desc, uid, now).await,
        MsgBody::JobInfo { job_id, show_all } => handle_job_info(ctx, job_id, show_all, uid, now).await,
        MsgBody::JobStepCreate(req) => handle_step_create(ctx, req, uid, now).await,
        MsgBody::StepComplete(msg) => handle_step_complete(ctx, msg, uid).await,
        MsgBody::KillJob { job_id, signal } => {
            handle_kill_job(ctx, job_id, signal, uid, now, &mut actions).await
        }
        MsgBody::KillJobStep {
            job_id,
            step_id,
            signal,
        } => handle_kill_step(ctx, job_id, step_id, signal, uid, &mut actions).await,
        MsgBody::CompleteJobAllocation { job_id, rc } => {
            handle_complete_allocation(ctx, job_id, rc, uid, now).await
        }
        MsgBody::SuspendJob { job_id, suspend } => {
            handle_suspend(ctx, job_id, suspend, uid, now, &mut actions).await
        }
        MsgBody::NodeRegister(info) => {
            if !ctx.is_operator(uid).await {
                ctx.rc(ErrorCode::Unauthorized)
            } else {
                let mut nodes = ctx.regs.nodes.write().await;
                let known = nodes.register(&info, now);
                drop(nodes);
                if known {
                    ctx.sched_kick.notify_one();
                    ctx.rc(ErrorCode::Success)
                } else {
                    ctx.rc(ErrorCode::InvalidNodeName)
                }
            }
        }
        MsgBody::Ping { node_name } => {
            if !ctx.is_operator(uid).await {
                ctx.rc(ErrorCode::Unauthorized)
            } else {
                let mut nodes = ctx.regs.nodes.write().await;
                if nodes.ping(&node_name, now) {
                    ctx.rc(ErrorCode::Success)
                } else {
                    ctx.rc(ErrorCode::InvalidNodeName)
                }
            }
        }
        MsgBody::TriggerSet(rec) => {
            let id = ctx.triggers.lock().unwrap().set(rec);
            debug!(trig_id = id, "trigger registered");
            ctx.rc(ErrorCode::Success)
        }
        MsgBody::TriggerGet => {
            let triggers = ctx.triggers.lock().unwrap().list();
            ctx.reply(MsgBody::TriggerGetResponse { triggers })
        }
        MsgBody::TriggerClear { trig_id } => {
            if ctx.triggers.lock().unwrap().clear(trig_id) {
                ctx.rc(ErrorCode::Success)
            } else {
                ctx.rc(ErrorCode::InvalidJobId)
            }
        }
        MsgBody::Checkpoint { .. } | MsgBody::FileBcast { .. } => ctx.rc(ErrorCode::Unsupported),
        other => {
            debug!(msg_type = ?other.msg_type(), "unexpected message at controller");
            ctx.rc(ErrorCode::UnexpectedMessage)
        }
    };

    (reply, actions)
}

async fn handle_allocate(
    ctx: &CtlContext,
    desc: quarry_proto::message::JobDescriptor,
    uid: u32,
    now: i64,
) -> Envelope {
    if uid != desc.uid && !ctx.is_operator(uid).await {
        return ctx.rc(ErrorCode::Unauthorized);
    }

    let partition = {
        let parts = ctx.regs.parts.read().await;
        match sched::admit_job(&parts, &desc) {
            Ok(name) => name,
            Err(code) => return ctx.rc(code),
        }
    };

    let immediate = desc.immediate;
    let job_id = {
        let mut jobs = ctx.regs.jobs.write().await;
        jobs.submit(&desc, partition, now).job_id
    };

    // One synchronous pass gives interactive requests their answer now.
    sched::schedule_pass(&ctx.regs, &ctx.select, &ctx.acct, now).await;
    ctx.sched_kick.notify_one();

    let placed = {
        let jobs = ctx.regs.jobs.read().await;
        let nodes = ctx.regs.nodes.read().await;
        let job = jobs.find(job_id).expect("job just submitted");
        if job.state == JobState::Running {
            let addrs: Vec<String> = job
                .node_names
                .iter()
                .map(|n| {
                    nodes
                        .idx(n)
                        .map(|i| nodes.get(i).addr.clone())
                        .unwrap_or_default()
                })
                .collect();
            Some(AllocationInfo {
                job_id,
                error_code: 0,
                node_names: job.node_names.clone(),
                node_addrs: addrs,
                cpus_per_node: job.cpus_per_node.clone(),
            })
        } else {
            None
        }
    };

    if let Some(info) = placed {
        ctx.reply(MsgBody::AllocateResponse(info))
    } else if immediate {
        let mut jobs = ctx.regs.jobs.write().await;
        if let Some(job) = jobs.find_mut(job_id) {
            let _ = job.finish(JobState::Cancelled, now);
        }
        ctx.rc(ErrorCode::InsufficientNodes)
    } else {
        ctx.reply(MsgBody::AllocateResponse(AllocationInfo {
            job_id,
            error_code: ErrorCode::TryAgain.as_u32(),
            node_names: Vec::new(),
            node_addrs: Vec::new(),
            cpus_per_node: Vec::new(),
        }))
    }
}

async fn handle_submit_batch(
    ctx: &CtlContext,
    desc: quarry_proto::message::JobDescriptor,
    uid: u32,
    now: i64,
) -> Envelope {
    if uid != desc.uid && !ctx.is_operator(uid).await {
        return ctx.rc(ErrorCode::Unauthorized);
    }
    if desc.script.is_none() {
        return ctx.rc(ErrorCode::MalformedFrame);
    }
    let partition = {
        let parts = ctx.regs.parts.read().await;
        match sched::admit_job(&parts, &desc) {
            Ok(name) => name,
            Err(code) => return ctx.rc(code),
        }
    };
    let job_id = {
        let mut jobs = ctx.regs.jobs.write().await;
        jobs.submit(&desc, partition, now).job_id
    };
    ctx.sched_kick.notify_one();
    info!(job_id, "batch job queued");
    ctx.reply(MsgBody::SubmitBatchResponse { job_id, rc: 0 })
}

async fn handle_job_info(
    ctx: &CtlContext,
    job_id: Option<u32>,
    show_all: bool,
    uid: u32,
    now: i64,
) -> Envelope {
    let operator = ctx.is_operator(uid).await;
    let jobs = ctx.regs.jobs.read().await;
    let recs: Vec<_> = jobs
        .iter()
        .filter(|j| job_id.is_none_or(|id| j.job_id == id))
        .filter(|j| show_all || operator || j.uid == uid)
        .map(|j| j.info_rec())
        .collect();
    if job_id.is_some() && recs.is_empty() {
        return ctx.rc(ErrorCode::InvalidJobId);
    }
    ctx.reply(MsgBody::JobInfoResponse {
        last_update: now,
        jobs: recs,
    })
}

/// Spread `task_cnt` tasks over `node_cnt` nodes, earlier nodes taking the
/// remainder.
fn tasks_per_node(task_cnt: u32, node_cnt: u32) -> Vec<u32> {
    let base = task_cnt / node_cnt;
    let extra = task_cnt % node_cnt;
    (0..node_cnt)
        .map(|i| base + u32::from(i < extra))
        .collect()
}

async fn handle_step_create(
    ctx: &CtlContext,
    req: StepCreateRequest,
    uid: u32,
    now: i64,
) -> Envelope {
    if req.task_cnt == 0 || req.node_cnt == 0 {
        return ctx.rc(ErrorCode::PlacementInfeasible);
    }
    let operator = ctx.is_operator(uid).await;

    let mut jobs = ctx.regs.jobs.write().await;
    let nodes = ctx.regs.nodes.read().await;
    let Some(job) = jobs.find_mut(req.job_id) else {
        return ctx.rc(ErrorCode::InvalidJobId);
    };
    if job.uid != uid && !operator {
        return ctx.rc(ErrorCode::Unauthorized);
    }
    match job.state {
        JobState::Running => {}
        JobState::Pending => return ctx.rc(ErrorCode::JobPending),
        JobState::Suspended => return ctx.rc(ErrorCode::StepSuspended),
        _ => return ctx.rc(ErrorCode::JobNotRunning),
    }

    let offset = req.relative.unwrap_or(0) as usize;
    if offset + req.node_cnt as usize > job.node_names.len() {
        return ctx.rc(ErrorCode::PlacementInfeasible);
    }
    let step_nodes: Vec<String> =
        job.node_names[offset..offset + req.node_cnt as usize].to_vec();
    let per_node = tasks_per_node(req.task_cnt, req.node_cnt);

    let expires = if job.unlimited() {
        0
    } else {
        job.start_time + (job.time_limit_min as i64) * 60
    };
    let cred = Credential::issue(
        &ctx.key,
        job.job_id,
        job.next_step_id,
        job.uid,
        job.gid,
        step_nodes.clone(),
        per_node.clone(),
        expires,
    );

    let step = StepRecord {
        step_id: job.next_step_id,
        name: req.name.clone(),
        task_cnt: req.task_cnt,
        node_names: step_nodes.clone(),
        tasks_per_node: per_node.clone(),
        cred: cred.clone(),
        resp_addr: req.resp_addr.clone(),
        completion: quarry_core::Bitmap::new(req.node_cnt as usize),
        step_rc: 0,
        acct: Default::default(),
        start_time: now,
    };
    job.next_step_id += 1;
    job.steps.push(step);

    let rec = AcctRecord::for_job(AcctEvent::StepStart, job, 0, None)
        .with_step(job.next_step_id - 1, &Default::default());
    let _ = ctx.acct.log_record(&rec);
    info!(job_id = job.job_id, step_id = job.next_step_id - 1, tasks = req.task_cnt, "step created");

    let node_addrs: Vec<String> = step_nodes
        .iter()
        .map(|n| {
            nodes
                .idx(n)
                .map(|i| nodes.get(i).addr.clone())
                .unwrap_or_default()
        })
        .collect();

    ctx.reply(MsgBody::JobStepCreateResponse(StepCreateResponse {
        job_id: req.job_id,
        step_id: cred.step_id,
        node_names: step_nodes,
        node_addrs,
        tasks_per_node: per_node,
        cred,
    }))
}

async fn handle_step_complete(
    ctx: &CtlContext,
    msg: quarry_proto::message::StepCompleteMsg,
    uid: u32,
) -> Envelope {
    if !ctx.is_operator(uid).await {
        // Completion flows up from step managers, which run as the
        // operator; the step owner cannot forge completions.
        return ctx.rc(ErrorCode::Unauthorized);
    }
    let mut jobs = ctx.regs.jobs.write().await;
    let Some(job) = jobs.find_mut(msg.job_id) else {
        return ctx.rc(ErrorCode::InvalidJobId);
    };
    let Some(step) = job.find_step_mut(msg.step_id) else {
        // Duplicate delivery after the step drained: idempotent success.
        return ctx.rc(ErrorCode::Success);
    };
    let full = step.merge_completion(msg.range_first, msg.range_last, msg.step_rc, &msg.acct);
    if full {
        let step = job.remove_step(msg.step_id).expect("step present");
        let rec = AcctRecord::for_job(AcctEvent::StepComplete, job, step.step_rc, None)
            .with_step(step.step_id, &step.acct);
        let _ = ctx.acct.log_record(&rec);
        info!(job_id = msg.job_id, step_id = msg.step_id, rc = step.step_rc, "step complete");
        ctx.sched_kick.notify_one();
    }
    ctx.rc(ErrorCode::Success)
}

async fn handle_kill_job(
    ctx: &CtlContext,
    job_id: u32,
    signal: u16,
    uid: u32,
    now: i64,
    actions: &mut Vec<SchedAction>,
) -> Envelope {
    let operator = ctx.is_operator(uid).await;
    let mut jobs = ctx.regs.jobs.write().await;
    let mut nodes = ctx.regs.nodes.write().await;
    let Some(job) = jobs.find_mut(job_id) else {
        return ctx.rc(ErrorCode::InvalidJobId);
    };
    if job.uid != uid && !operator {
        return ctx.rc(ErrorCode::Unauthorized);
    }

    match job.state {
        JobState::Pending => {
            let was_batch = job.script.is_some();
            let _ = job.finish(JobState::Cancelled, now);
            if was_batch {
                // A batch job cancelled before launch leaves a completion
                // record with a distinguishable reason.
                let rec = AcctRecord::for_job(
                    AcctEvent::JobComplete,
                    job,
                    0,
                    Some("cancelled before launch".to_string()),
                );
                let _ = ctx.acct.log_record(&rec);
            }
            info!(job_id, "pending job cancelled");
            ctx.rc(ErrorCode::Success)
        }
        JobState::Running | JobState::Suspended => {
            if signal == SIGKILL {
                let _ = job.finish(JobState::Cancelled, now);
                let bitmap = job.node_bitmap.clone();
                for step in &job.steps {
                    actions.push(SchedAction::FanTerminate {
                        job_id,
                        step_id: step.step_id,
                        nodes: step.node_names.clone(),
                    });
                }
                if let Some(bm) = bitmap {
                    nodes.job_completing(&bm, job.no_share);
                }
                ctx.sched_kick.notify_one();
                info!(job_id, "job cancelled");
            } else {
                for step in &job.steps {
                    actions.push(SchedAction::FanSignal {
                        job_id,
                        step_id: step.step_id,
                        signal,
                        nodes: step.node_names.clone(),
                    });
                }
            }
            ctx.rc(ErrorCode::Success)
        }
        _ => ctx.rc(ErrorCode::JobNotRunning),
    }
}

async fn handle_kill_step(
    ctx: &CtlContext,
    job_id: u32,
    step_id: u32,
    signal: u16,
    uid: u32,
    actions: &mut Vec<SchedAction>,
) -> Envelope {
    let operator = ctx.is_operator(uid).await;
    let jobs = ctx.regs.jobs.read().await;
    let Some(job) = jobs.find(job_id) else {
        return ctx.rc(ErrorCode::InvalidJobId);
    };
    if job.uid != uid && !operator {
        return ctx.rc(ErrorCode::Unauthorized);
    }
    if !job.state.is_active() {
        return ctx.rc(ErrorCode::JobNotRunning);
    }
    let Some(step) = job.find_step(step_id) else {
        // Cancelling a finished step is a no-op.
        return ctx.rc(ErrorCode::Success);
    };
    if signal == SIGKILL {
        actions.push(SchedAction::FanTerminate {
            job_id,
            step_id,
            nodes: step.node_names.clone(),
        });
    } else {
        actions.push(SchedAction::FanSignal {
            job_id,
            step_id,
            signal,
            nodes: step.node_names.clone(),
        });
    }
    ctx.rc(ErrorCode::Success)
}

async fn handle_complete_allocation(
    ctx: &CtlContext,
    job_id: u32,
    rc: u32,
    uid: u32,
    now: i64,
) -> Envelope {
    let operator = ctx.is_operator(uid).await;
    let mut jobs = ctx.regs.jobs.write().await;
    let mut nodes = ctx.regs.nodes.write().await;
    let Some(job) = jobs.find_mut(job_id) else {
        return ctx.rc(ErrorCode::InvalidJobId);
    };
    if job.uid != uid && !operator {
        return ctx.rc(ErrorCode::Unauthorized);
    }
    let target = if rc == 0 {
        JobState::Complete
    } else {
        JobState::Failed
    };
    match job.finish(target, now) {
        Ok(()) => {
            if let Some(bm) = job.node_bitmap.clone() {
                nodes.job_completing(&bm, job.no_share);
            }
            ctx.sched_kick.notify_one();
            info!(job_id, rc, "job allocation released");
            ctx.rc(ErrorCode::Success)
        }
        Err(code) => ctx.rc(code),
    }
}

async fn handle_suspend(
    ctx: &CtlContext,
    job_id: u32,
    suspend: bool,
    uid: u32,
    now: i64,
    actions: &mut Vec<SchedAction>,
) -> Envelope {
    if !ctx.is_operator(uid).await {
        return ctx.rc(ErrorCode::Unauthorized);
    }
    let mut jobs = ctx.regs.jobs.write().await;
    let Some(job) = jobs.find_mut(job_id) else {
        return ctx.rc(ErrorCode::InvalidJobId);
    };
    let result = if suspend {
        job.suspend(now)
    } else {
        job.resume()
    };
    match result {
        Ok(()) => {
            if suspend {
                ctx.select.job_suspend(job);
            } else {
                ctx.select.job_resume(job);
            }
            actions.push(SchedAction::FanSuspend {
                job_id,
                suspend,
                nodes: job.node_names.clone(),
            });
            ctx.rc(ErrorCode::Success)
        }
        Err(code) => ctx.rc(code),
    }
}
