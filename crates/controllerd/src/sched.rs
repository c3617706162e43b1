//! Scheduler.
//!
//! One loop owns every placement decision. It wakes on allocation requests,
//! resource-freeing events, reconfiguration, and a periodic tick, walks the
//! pending queue in priority order, and asks the select capability for a
//! placement. Network side effects (client notifications, fanned
//! terminations) are collected as actions and executed after the registry
//! locks are released.

use std::sync::Arc;

use tracing::{debug, info};

use quarry_proto::codec::NO_VAL;
use quarry_proto::message::MsgBody;
use quarry_proto::ErrorCode;

use crate::acct::{AcctEvent, AcctRecord, AcctSink};
use crate::registry::job::{JobState, PendReason};
use crate::registry::node::BaseState;
use crate::registry::Registries;
use crate::select::SelectCapability;

/// Deferred network side effect from a scheduling or maintenance pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedAction {
    /// Send a message to a step client's response endpoint.
    NotifyClient { addr: String, body: MsgBody },
    /// Fan a terminate-tasks to the named nodes.
    FanTerminate {
        job_id: u32,
        step_id: u32,
        nodes: Vec<String>,
    },
    /// Fan a signal to the named nodes.
    FanSignal {
        job_id: u32,
        step_id: u32,
        signal: u16,
        nodes: Vec<String>,
    },
    /// Fan a suspend or resume to the named nodes.
    FanSuspend {
        job_id: u32,
        suspend: bool,
        nodes: Vec<String>,
    },
}

/// Try to place pending jobs. Returns the number of new allocations.
pub async fn schedule_pass(
    regs: &Registries,
    select: &Arc<dyn SelectCapability>,
    acct: &Arc<dyn AcctSink>,
    now: i64,
) -> usize {
    let parts = regs.parts.read().await;
    let mut jobs = regs.jobs.write().await;
    let mut nodes = regs.nodes.write().await;

    let mut placed = 0usize;
    let mut blocked = false;

    for job_id in jobs.pending_ids() {
        if blocked {
            if let Some(job) = jobs.find_mut(job_id) {
                job.reason = PendReason::Priority;
            }
            continue;
        }

        // Immutable checks first; the mutable borrow comes after placement.
        let Some(job) = jobs.find(job_id) else { continue };
        let Some(part) = parts.find(&job.partition) else {
            let job = jobs.find_mut(job_id).unwrap();
            job.reason = PendReason::PartitionDown;
            continue;
        };
        if !part.up {
            let job = jobs.find_mut(job_id).unwrap();
            job.reason = PendReason::PartitionDown;
            continue;
        }
        if let Some(dep) = job.dependency {
            let satisfied = match jobs.find(dep) {
                None => true,
                Some(dep_job) => dep_job.state.is_terminal() && !dep_job.completing,
            };
            if !satisfied {
                let job = jobs.find_mut(job_id).unwrap();
                job.reason = PendReason::Dependency;
                continue;
            }
        }

        let mut candidates = part.node_bitmap.clone();
        candidates.intersect_with(&nodes.usable_bitmap());
        let share = part.shared;
        let no_share = match share {
            crate::config::SharePolicy::Exclusive => true,
            crate::config::SharePolicy::Force => false,
            crate::config::SharePolicy::Yes => job.shared_req == 0,
        };

        match select.job_test(job, &candidates, &nodes, share, false) {
            Ok(placement) => {
                let names = nodes.names_for(&placement.bitmap);
                let cpus: Vec<u32> = placement
                    .bitmap
                    .iter_set()
                    .map(|i| nodes.get(i).cpus as u32)
                    .collect();
                let bitmap = placement.bitmap.clone();
                let job = jobs.find_mut(job_id).unwrap();
                job.select_jobinfo = placement.jobinfo;
                if job.allocate(bitmap.clone(), names, cpus, no_share, now).is_ok() {
                    nodes.allocate_job(&bitmap, no_share);
                    select.job_begin(job);
                    let _ = acct.log_record(&AcctRecord::for_job(
                        AcctEvent::JobStart,
                        job,
                        0,
                        None,
                    ));
                    info!(job_id, nodes = ?job.node_names, "job allocated");
                    placed += 1;
                }
            }
            Err(code) => {
                debug!(job_id, %code, "placement deferred");
                let job = jobs.find_mut(job_id).unwrap();
                job.reason = match code {
                    ErrorCode::InsufficientNodes | ErrorCode::TryAgain => PendReason::Resources,
                    _ => PendReason::Resources,
                };
                // FIFO within priority: nothing below may jump the queue.
                blocked = true;
            }
        }
    }

    placed
}

/// Periodic upkeep: node response sweep, time limits, completing-job drain,
/// and purge of aged-out records.
pub async fn maintenance_pass(
    regs: &Registries,
    select: &Arc<dyn SelectCapability>,
    acct: &Arc<dyn AcctSink>,
    now: i64,
) -> Vec<SchedAction> {
    let (ping_to, down_to, min_age) = {
        let cfg = regs.config.read().await;
        (
            cfg.ping_timeout_sec as i64,
            cfg.down_timeout_sec as i64,
            cfg.min_job_age_sec as i64,
        )
    };

    let mut jobs = regs.jobs.write().await;
    let mut nodes = regs.nodes.write().await;
    let mut actions = Vec::new();

    // Nodes that stopped responding take their jobs with them.
    let newly_down = nodes.sweep_responses(now, ping_to, down_to);
    for idx in newly_down {
        apply_node_down(&mut jobs, &mut nodes, idx, now, &mut actions, acct);
    }

    // Wall-clock limits.
    let mut timed_out = Vec::new();
    for job in jobs.iter() {
        if job.state == JobState::Running
            && !job.unlimited()
            && job.start_time > 0
            && now >= job.start_time + (job.time_limit_min as i64) * 60
        {
            timed_out.push(job.job_id);
        }
    }
    for job_id in timed_out {
        let job = jobs.find_mut(job_id).unwrap();
        if job.finish(JobState::Timeout, now).is_ok() {
            info!(job_id, "job reached its time limit");
            for step in &job.steps {
                if let Some(addr) = &step.resp_addr {
                    actions.push(SchedAction::NotifyClient {
                        addr: addr.clone(),
                        body: MsgBody::SrunTimeout {
                            job_id,
                            step_id: step.step_id,
                            timeout_at: now,
                        },
                    });
                }
                actions.push(SchedAction::FanTerminate {
                    job_id,
                    step_id: step.step_id,
                    nodes: step.node_names.clone(),
                });
            }
            let bitmap = job.node_bitmap.clone();
            let no_share = job.no_share;
            if let Some(bm) = bitmap {
                nodes.job_completing(&bm, no_share);
            }
        }
    }

    // Completing jobs whose steps have drained release their allocation.
    let mut drained = Vec::new();
    for job in jobs.iter() {
        if job.completing && job.steps.is_empty() {
            drained.push(job.job_id);
        }
    }
    for job_id in drained {
        let job = jobs.find_mut(job_id).unwrap();
        job.drained();
        if let Some(bm) = job.node_bitmap.clone() {
            nodes.job_done(&bm);
        }
        select.job_fini(job);
        let _ = acct.log_record(&AcctRecord::for_job(AcctEvent::JobComplete, job, 0, None));
        info!(job_id, state = ?job.state, "job resources drained");
    }

    for job_id in jobs.purge(now, min_age) {
        debug!(job_id, "purged finished job");
    }

    actions
}

/// A node went down: fail the running jobs allocated on it, tell their step
/// clients, and complete the step bits that will never report.
pub fn apply_node_down(
    jobs: &mut crate::registry::job::JobRegistry,
    nodes: &mut crate::registry::node::NodeRegistry,
    node_idx: usize,
    now: i64,
    actions: &mut Vec<SchedAction>,
    acct: &Arc<dyn AcctSink>,
) {
    debug_assert_eq!(nodes.get(node_idx).base, BaseState::Down);
    let node_name = nodes.get(node_idx).name.clone();

    let affected: Vec<u32> = jobs
        .iter()
        .filter(|j| {
            j.state.is_active()
                && j.node_bitmap
                    .as_ref()
                    .map(|bm| bm.test(node_idx))
                    .unwrap_or(false)
        })
        .map(|j| j.job_id)
        .collect();

    for job_id in affected {
        let job = jobs.find_mut(job_id).unwrap();
        if job.finish(JobState::NodeFail, now).is_err() {
            continue;
        }
        info!(job_id, node = %node_name, "job failed with its node");
        let bitmap = job.node_bitmap.clone();
        let no_share = job.no_share;

        let mut finished_steps = Vec::new();
        for step in &mut job.steps {
            if let Some(addr) = &step.resp_addr {
                actions.push(SchedAction::NotifyClient {
                    addr: addr.clone(),
                    body: MsgBody::SrunNodeFail {
                        job_id,
                        step_id: step.step_id,
                        nodelist: node_name.clone(),
                    },
                });
            }
            // The dead node's completion record will never arrive.
            if let Some(pos) = step.node_names.iter().position(|n| n == &node_name) {
                let full = step.merge_completion(
                    pos as u32,
                    pos as u32,
                    ErrorCode::NodeDown.as_u32(),
                    &Default::default(),
                );
                if full {
                    finished_steps.push(step.step_id);
                }
            }
        }
        for step_id in finished_steps {
            if let Some(step) = job.remove_step(step_id) {
                let rec = AcctRecord::for_job(AcctEvent::StepComplete, job, step.step_rc, None)
                    .with_step(step.step_id, &step.acct);
                let _ = acct.log_record(&rec);
            }
        }

        if let Some(bm) = bitmap {
            nodes.job_completing(&bm, no_share);
        }
    }

    // Pending jobs that required this node go back to waiting on resources.
    for job in jobs.iter_mut() {
        if job.state == JobState::Pending {
            job.reason = PendReason::Resources;
        }
    }
}

/// Validate a submitted descriptor against partition policy.
pub fn admit_job(
    parts: &crate::registry::part::PartRegistry,
    desc: &quarry_proto::message::JobDescriptor,
) -> Result<String, ErrorCode> {
    let part = match &desc.partition {
        Some(name) => parts.find(name).ok_or(ErrorCode::InvalidPartition)?,
        None => parts.default_part().ok_or(ErrorCode::InvalidPartition)?,
    };
    if part.root_only && desc.uid != 0 {
        return Err(ErrorCode::PartitionAccessDenied);
    }
    if !part.allows_gid(desc.gid) {
        return Err(ErrorCode::PartitionAccessDenied);
    }
    if let (Some(max), false) = (part.max_time_min, desc.time_limit_min == NO_VAL) {
        if desc.time_limit_min > max {
            return Err(ErrorCode::TimeLimitOverPartition);
        }
    } else if part.max_time_min.is_some() && desc.time_limit_min == NO_VAL {
        return Err(ErrorCode::TimeLimitOverPartition);
    }
    if desc.min_nodes < part.min_nodes_per_job {
        return Err(ErrorCode::PlacementInfeasible);
    }
    if let Some(max) = part.max_nodes_per_job {
        if desc.min_nodes > max {
            return Err(ErrorCode::PlacementInfeasible);
        }
    }
    Ok(part.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acct::NullAcctSink;
    use crate::config::test_config;
    use crate::registry::node::NODE_COMPLETING;
    use crate::select::LinearSelect;
    use quarry_core::Bitmap;
    use quarry_proto::message::JobDescriptor;

    fn sink() -> Arc<dyn AcctSink> {
        Arc::new(NullAcctSink)
    }

    fn selector() -> Arc<dyn SelectCapability> {
        Arc::new(LinearSelect)
    }

    fn descriptor(min_nodes: u32) -> JobDescriptor {
        JobDescriptor {
            name: None,
            partition: None,
            uid: 1000,
            gid: 1000,
            min_nodes,
            max_nodes: NO_VAL,
            min_cpus_per_node: 1,
            min_mem_mb: 0,
            min_tmp_mb: 0,
            req_nodes: None,
            exc_nodes: None,
            features: vec![],
            contiguous: false,
            shared: u16::MAX,
            priority: 10,
            time_limit_min: 1,
            immediate: false,
            account: None,
            dependency: None,
            work_dir: None,
            script: None,
        }
    }

    async fn regs_with_idle_nodes(n: usize) -> Registries {
        let regs = Registries::from_config(test_config(n));
        {
            let mut nodes = regs.nodes.write().await;
            for i in 0..n {
                nodes.get_mut(i).base = BaseState::Idle;
                nodes.get_mut(i).last_response = 1;
            }
        }
        regs
    }

    #[tokio::test]
    async fn places_pending_jobs_in_priority_order() {
        let regs = regs_with_idle_nodes(4).await;
        let (lo, hi) = {
            let mut jobs = regs.jobs.write().await;
            let mut d = descriptor(2);
            d.priority = 1;
            let lo = jobs.submit(&d, "batch".into(), 1).job_id;
            d.priority = 50;
            let hi = jobs.submit(&d, "batch".into(), 2).job_id;
            (lo, hi)
        };

        let placed = schedule_pass(&regs, &selector(), &sink(), 100).await;
        assert_eq!(placed, 2);
        let jobs = regs.jobs.read().await;
        // Higher priority got the lower node indices.
        assert_eq!(
            jobs.find(hi).unwrap().node_names,
            vec!["n0".to_string(), "n1".to_string()]
        );
        assert_eq!(
            jobs.find(lo).unwrap().node_names,
            vec!["n2".to_string(), "n3".to_string()]
        );
        let nodes = regs.nodes.read().await;
        assert!(nodes.iter().all(|n| n.run_job_cnt == 1));
    }

    #[tokio::test]
    async fn blocked_job_blocks_the_queue() {
        let regs = regs_with_idle_nodes(2).await;
        let (big, small) = {
            let mut jobs = regs.jobs.write().await;
            let mut d = descriptor(4); // cannot fit
            d.priority = 50;
            let big = jobs.submit(&d, "batch".into(), 1).job_id;
            let small = jobs.submit(&descriptor(1), "batch".into(), 2).job_id;
            (big, small)
        };

        let placed = schedule_pass(&regs, &selector(), &sink(), 100).await;
        assert_eq!(placed, 0);
        let jobs = regs.jobs.read().await;
        assert_eq!(jobs.find(big).unwrap().reason, PendReason::Resources);
        assert_eq!(jobs.find(small).unwrap().reason, PendReason::Priority);
        assert_eq!(jobs.find(small).unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn dependency_gates_scheduling() {
        let regs = regs_with_idle_nodes(2).await;
        let (first, second) = {
            let mut jobs = regs.jobs.write().await;
            let first = jobs.submit(&descriptor(1), "batch".into(), 1).job_id;
            let mut d = descriptor(1);
            d.dependency = Some(first);
            let second = jobs.submit(&d, "batch".into(), 2).job_id;
            (first, second)
        };

        schedule_pass(&regs, &selector(), &sink(), 100).await;
        {
            let jobs = regs.jobs.read().await;
            assert_eq!(jobs.find(first).unwrap().state, JobState::Running);
            assert_eq!(jobs.find(second).unwrap().state, JobState::Pending);
            assert_eq!(jobs.find(second).unwrap().reason, PendReason::Dependency);
        }

        // Finish and drain the first; the second becomes eligible.
        {
            let mut jobs = regs.jobs.write().await;
            let mut nodes = regs.nodes.write().await;
            let job = jobs.find_mut(first).unwrap();
            job.finish(JobState::Complete, 160).unwrap();
            let bm = job.node_bitmap.clone().unwrap();
            let no_share = job.no_share;
            nodes.job_completing(&bm, no_share);
        }
        maintenance_pass(&regs, &selector(), &sink(), 200).await;
        schedule_pass(&regs, &selector(), &sink(), 220).await;
        let jobs = regs.jobs.read().await;
        assert_eq!(jobs.find(second).unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn time_limit_expires_jobs() {
        let regs = regs_with_idle_nodes(2).await;
        let id = {
            let mut jobs = regs.jobs.write().await;
            jobs.submit(&descriptor(1), "batch".into(), 1).job_id
        };
        schedule_pass(&regs, &selector(), &sink(), 100).await;

        // One minute limit; nothing at +30 s, timeout at +90 s.
        let actions = maintenance_pass(&regs, &selector(), &sink(), 130).await;
        assert!(actions.is_empty());
        {
            let jobs = regs.jobs.read().await;
            assert_eq!(jobs.find(id).unwrap().state, JobState::Running);
        }
        maintenance_pass(&regs, &selector(), &sink(), 190).await;
        let jobs = regs.jobs.read().await;
        let job = jobs.find(id).unwrap();
        assert_eq!(job.state, JobState::Timeout);
        // No steps: drained in the same pass.
        assert!(!job.completing);
        let nodes = regs.nodes.read().await;
        assert_eq!(nodes.get(0).base, BaseState::Idle);
    }

    #[tokio::test]
    async fn node_down_fails_jobs_and_notifies_steps() {
        let regs = regs_with_idle_nodes(3).await;
        let id = {
            let mut jobs = regs.jobs.write().await;
            jobs.submit(&descriptor(2), "batch".into(), 1).job_id
        };
        schedule_pass(&regs, &selector(), &sink(), 100).await;

        // Attach a step with a client endpoint on the allocation.
        {
            let mut jobs = regs.jobs.write().await;
            let job = jobs.find_mut(id).unwrap();
            let key = quarry_proto::AuthKey::from_bytes(b"k".to_vec());
            let cred = quarry_proto::Credential::issue(
                &key, id, 0, 1000, 1000,
                job.node_names.clone(), vec![1, 1], 0,
            );
            job.steps.push(crate::registry::job::StepRecord {
                step_id: 0,
                name: None,
                task_cnt: 2,
                node_names: job.node_names.clone(),
                tasks_per_node: vec![1, 1],
                cred,
                resp_addr: Some("10.9.9.9:4000".into()),
                completion: Bitmap::new(2),
                step_rc: 0,
                acct: Default::default(),
                start_time: 100,
            });
            job.next_step_id = 1;
        }

        let mut actions = Vec::new();
        {
            let mut jobs = regs.jobs.write().await;
            let mut nodes = regs.nodes.write().await;
            nodes.set_down(0, "power lost");
            apply_node_down(&mut jobs, &mut nodes, 0, 500, &mut actions, &sink());
        }

        let jobs = regs.jobs.read().await;
        let job = jobs.find(id).unwrap();
        assert_eq!(job.state, JobState::NodeFail);
        assert!(job.completing);
        assert_eq!(job.end_time, 500);
        assert!(actions.iter().any(|a| matches!(
            a,
            SchedAction::NotifyClient { addr, body: MsgBody::SrunNodeFail { nodelist, .. } }
                if addr == "10.9.9.9:4000" && nodelist == "n0"
        )));
        // The dead node's completion bit is pre-marked.
        assert!(job.steps[0].completion.test(0));
        assert!(!job.steps[0].completion.test(1));
        let nodes = regs.nodes.read().await;
        assert!(nodes.get(1).has_flag(NODE_COMPLETING));
    }

    #[test]
    fn admit_checks_partition_policy() {
        let cfg = test_config(2);
        let nodes = crate::registry::node::NodeRegistry::from_config(&cfg);
        let parts = crate::registry::part::PartRegistry::from_config(&cfg, &nodes);

        let mut d = descriptor(1);
        assert_eq!(admit_job(&parts, &d), Ok("batch".to_string()));

        d.time_limit_min = 6000; // over the 600 min partition cap
        assert_eq!(admit_job(&parts, &d), Err(ErrorCode::TimeLimitOverPartition));

        d.time_limit_min = NO_VAL; // unlimited against a capped partition
        assert_eq!(admit_job(&parts, &d), Err(ErrorCode::TimeLimitOverPartition));

        d.time_limit_min = 10;
        d.partition = Some("nope".into());
        assert_eq!(admit_job(&parts, &d), Err(ErrorCode::InvalidPartition));
    }
}
