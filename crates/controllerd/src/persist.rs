//! State persistence and recovery.
//!
//! Three files in the state directory: `node_state`, `part_state`,
//! `job_state`. Each is `magic | version | record count | records…` followed
//! by a SHA-256 trailer over everything before it. Writes go to a temp file
//! renamed into place, so a torn write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use quarry_core::Bitmap;
use quarry_proto::codec::{PackBuf, UnpackBuf, UnpackError, NO_VAL};
use quarry_proto::cred::CredError;
use quarry_proto::message::AcctSnapshot;
use quarry_proto::Credential;

use crate::config::ClusterConfig;
use crate::registry::job::{JobRegistry, JobState, PendReason, StepRecord};
use crate::registry::node::{BaseState, NodeRegistry};
use crate::registry::part::PartRegistry;
use crate::registry::Registries;

const STATE_MAGIC: u32 = 0x51_52_59_53; // "QRYS"
const STATE_VERSION: u16 = 2;
const DIGEST_LEN: usize = 32;

pub const NODE_STATE_FILE: &str = "node_state";
pub const PART_STATE_FILE: &str = "part_state";
pub const JOB_STATE_FILE: &str = "job_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverMode {
    /// Configuration only; all snapshot state discarded.
    None,
    /// Replay jobs, reconciled against fresh node state.
    Jobs,
    /// Replay nodes, partitions, and jobs.
    Full,
}

impl std::str::FromStr for RecoverMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RecoverMode::None),
            "jobs" => Ok(RecoverMode::Jobs),
            "full" => Ok(RecoverMode::Full),
            other => Err(format!("unknown recover mode {other:?}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file corrupt: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Unpack(#[from] UnpackError),
    #[error(transparent)]
    Cred(#[from] CredError),
}

fn frame_records(count: u32, records: &[u8]) -> Vec<u8> {
    let mut p = PackBuf::new();
    p.pack_u32(STATE_MAGIC);
    p.pack_u16(STATE_VERSION);
    p.pack_u32(count);
    let mut out = p.into_inner();
    out.extend_from_slice(records);
    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    out
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("new");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a state file, verify the trailer, return `(record count, records)`.
fn read_framed(path: &Path) -> Result<Option<(u32, Vec<u8>)>, PersistError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if raw.len() < 4 + 2 + 4 + DIGEST_LEN {
        return Err(PersistError::Corrupt("too short"));
    }
    let (body, trailer) = raw.split_at(raw.len() - DIGEST_LEN);
    let digest = Sha256::digest(body);
    if digest.as_slice() != trailer {
        return Err(PersistError::Corrupt("integrity trailer mismatch"));
    }
    let mut u = UnpackBuf::new(body);
    if u.unpack_u32()? != STATE_MAGIC {
        return Err(PersistError::Corrupt("bad magic"));
    }
    if u.unpack_u16()? != STATE_VERSION {
        return Err(PersistError::Corrupt("unsupported state version"));
    }
    let count = u.unpack_u32()?;
    let records = body[body.len() - u.remaining()..].to_vec();
    Ok(Some((count, records)))
}

pub fn save_nodes(dir: &Path, nodes: &NodeRegistry) -> Result<(), PersistError> {
    let mut p = PackBuf::new();
    let mut count = 0u32;
    for rec in nodes.iter() {
        p.pack_str(&rec.name);
        p.pack_u16(rec.base.as_wire());
        p.pack_u16(rec.flags);
        p.pack_opt_str(rec.reason.as_deref());
        p.pack_time(rec.last_response);
        count += 1;
    }
    write_atomic(&dir.join(NODE_STATE_FILE), &frame_records(count, &p.into_inner()))
}

pub fn load_nodes(dir: &Path, nodes: &mut NodeRegistry) -> Result<(), PersistError> {
    let Some((count, records)) = read_framed(&dir.join(NODE_STATE_FILE))? else {
        return Ok(());
    };
    let mut u = UnpackBuf::new(&records);
    for _ in 0..count {
        let name = u.unpack_str()?;
        let base = BaseState::from_wire(u.unpack_u16()?)
            .ok_or(PersistError::Corrupt("node base state"))?;
        let flags = u.unpack_u16()?;
        let reason = u.unpack_opt_str()?;
        let last_response = u.unpack_time()?;
        // Nodes absent from the current configuration are dropped.
        if let Some(idx) = nodes.idx(&name) {
            let rec = nodes.get_mut(idx);
            rec.base = base;
            rec.flags = flags;
            rec.reason = reason;
            rec.last_response = last_response;
        }
    }
    u.expect_done()?;
    Ok(())
}

pub fn save_parts(dir: &Path, parts: &PartRegistry) -> Result<(), PersistError> {
    let mut p = PackBuf::new();
    let mut count = 0u32;
    for part in parts.iter() {
        p.pack_str(&part.name);
        p.pack_str(&part.node_pattern);
        p.pack_bool(part.up);
        count += 1;
    }
    write_atomic(&dir.join(PART_STATE_FILE), &frame_records(count, &p.into_inner()))
}

pub fn load_parts(dir: &Path, parts: &mut PartRegistry) -> Result<(), PersistError> {
    let Some((count, records)) = read_framed(&dir.join(PART_STATE_FILE))? else {
        return Ok(());
    };
    let mut u = UnpackBuf::new(&records);
    let mut up_by_name = std::collections::HashMap::new();
    for _ in 0..count {
        let name = u.unpack_str()?;
        let _pattern = u.unpack_str()?;
        let up = u.unpack_bool()?;
        up_by_name.insert(name, up);
    }
    u.expect_done()?;
    // Configuration stays canonical for membership and policy; only the
    // dynamic up/down survives the restart.
    parts.restore_up_flags(&up_by_name);
    Ok(())
}

fn pack_step(p: &mut PackBuf, step: &StepRecord) {
    p.pack_u32(step.step_id);
    p.pack_opt_str(step.name.as_deref());
    p.pack_u32(step.task_cnt);
    p.pack_str_array(&step.node_names);
    p.pack_u32_array(&step.tasks_per_node);
    step.cred.pack(p);
    p.pack_opt_str(step.resp_addr.as_deref());
    p.pack_mem(&step.completion.to_bytes());
    p.pack_u32(step.step_rc);
    p.pack_u64(step.acct.user_sec);
    p.pack_u64(step.acct.sys_sec);
    p.pack_u64(step.acct.max_rss_kb);
    p.pack_time(step.start_time);
}

fn unpack_step(u: &mut UnpackBuf<'_>) -> Result<StepRecord, PersistError> {
    Ok(StepRecord {
        step_id: u.unpack_u32()?,
        name: u.unpack_opt_str()?,
        task_cnt: u.unpack_u32()?,
        node_names: u.unpack_str_array()?,
        tasks_per_node: u.unpack_u32_array()?,
        cred: Credential::unpack(u)?,
        resp_addr: u.unpack_opt_str()?,
        completion: Bitmap::from_bytes(&u.unpack_mem()?)
            .ok_or(PersistError::Corrupt("step completion bitmap"))?,
        step_rc: u.unpack_u32()?,
        acct: AcctSnapshot {
            user_sec: u.unpack_u64()?,
            sys_sec: u.unpack_u64()?,
            max_rss_kb: u.unpack_u64()?,
        },
        start_time: u.unpack_time()?,
    })
}

pub fn save_jobs(dir: &Path, jobs: &JobRegistry) -> Result<(), PersistError> {
    let mut p = PackBuf::new();
    let mut count = 0u32;
    for job in jobs.iter() {
        p.pack_u32(job.job_id);
        p.pack_opt_str(job.name.as_deref());
        p.pack_u32(job.uid);
        p.pack_u32(job.gid);
        p.pack_str(&job.partition);
        p.pack_opt_str(job.account.as_deref());
        p.pack_u32(job.dependency.unwrap_or(NO_VAL));
        p.pack_opt_str(job.work_dir.as_deref());
        p.pack_opt_str(job.script.as_deref());
        p.pack_u32(job.min_nodes);
        p.pack_u32(job.max_nodes);
        p.pack_u32(job.min_cpus_per_node);
        p.pack_u32(job.min_mem_mb);
        p.pack_u32(job.min_tmp_mb);
        p.pack_opt_str(job.req_pattern.as_deref());
        p.pack_opt_str(job.exc_pattern.as_deref());
        p.pack_str_array(&job.features);
        p.pack_bool(job.contiguous);
        p.pack_u16(job.shared_req);
        p.pack_u32(job.priority);
        p.pack_u32(job.time_limit_min);
        p.pack_u16(job.wire_state());
        p.pack_u16(job.reason.as_wire());
        p.pack_time(job.submit_time);
        p.pack_time(job.start_time);
        p.pack_time(job.end_time);
        p.pack_time(job.suspend_time);
        p.pack_str_array(&job.node_names);
        p.pack_u32_array(&job.cpus_per_node);
        p.pack_mem(&job.select_jobinfo);
        p.pack_bool(job.no_share);
        p.pack_u32(job.next_step_id);
        p.pack_u32(job.steps.len() as u32);
        for step in &job.steps {
            pack_step(&mut p, step);
        }
        count += 1;
    }
    write_atomic(&dir.join(JOB_STATE_FILE), &frame_records(count, &p.into_inner()))
}

pub fn load_jobs(dir: &Path, jobs: &mut JobRegistry) -> Result<(), PersistError> {
    let Some((count, records)) = read_framed(&dir.join(JOB_STATE_FILE))? else {
        return Ok(());
    };
    let mut u = UnpackBuf::new(&records);
    for _ in 0..count {
        let job_id = u.unpack_u32()?;
        let name = u.unpack_opt_str()?;
        let uid = u.unpack_u32()?;
        let gid = u.unpack_u32()?;
        let partition = u.unpack_str()?;
        let account = u.unpack_opt_str()?;
        let dependency = match u.unpack_u32()? {
            NO_VAL => None,
            v => Some(v),
        };
        let work_dir = u.unpack_opt_str()?;
        let script = u.unpack_opt_str()?;
        let min_nodes = u.unpack_u32()?;
        let max_nodes = u.unpack_u32()?;
        let min_cpus_per_node = u.unpack_u32()?;
        let min_mem_mb = u.unpack_u32()?;
        let min_tmp_mb = u.unpack_u32()?;
        let req_pattern = u.unpack_opt_str()?;
        let exc_pattern = u.unpack_opt_str()?;
        let features = u.unpack_str_array()?;
        let contiguous = u.unpack_bool()?;
        let shared_req = u.unpack_u16()?;
        let priority = u.unpack_u32()?;
        let time_limit_min = u.unpack_u32()?;
        let wire_state = u.unpack_u16()?;
        let state = JobState::from_wire(wire_state)
            .ok_or(PersistError::Corrupt("job state"))?;
        let completing = wire_state & crate::registry::job::COMPLETING_FLAG != 0;
        let reason = PendReason::from_wire(u.unpack_u16()?);
        let submit_time = u.unpack_time()?;
        let start_time = u.unpack_time()?;
        let end_time = u.unpack_time()?;
        let suspend_time = u.unpack_time()?;
        let node_names = u.unpack_str_array()?;
        let cpus_per_node = u.unpack_u32_array()?;
        let select_jobinfo = u.unpack_mem()?;
        let no_share = u.unpack_bool()?;
        let next_step_id = u.unpack_u32()?;
        let step_cnt = u.unpack_u32()?;
        let mut steps = Vec::with_capacity(step_cnt.min(1024) as usize);
        for _ in 0..step_cnt {
            steps.push(unpack_step(&mut u)?);
        }
        jobs.restore(crate::registry::job::JobRecord {
            job_id,
            name,
            uid,
            gid,
            partition,
            account,
            dependency,
            work_dir,
            script,
            min_nodes,
            max_nodes,
            min_cpus_per_node,
            min_mem_mb,
            min_tmp_mb,
            req_pattern,
            exc_pattern,
            features,
            contiguous,
            shared_req,
            priority,
            time_limit_min,
            state,
            completing,
            reason,
            submit_time,
            start_time,
            end_time,
            suspend_time,
            node_bitmap: None, // recomputed against the current node table
            node_names,
            cpus_per_node,
            select_jobinfo,
            no_share,
            steps,
            next_step_id,
        });
    }
    u.expect_done()?;
    Ok(())
}

pub async fn save_all(dir: &Path, regs: &Registries) -> Result<(), PersistError> {
    // Read locks in the canonical order.
    let parts = regs.parts.read().await;
    let jobs = regs.jobs.read().await;
    let nodes = regs.nodes.read().await;
    save_parts(dir, &parts)?;
    save_jobs(dir, &jobs)?;
    save_nodes(dir, &nodes)?;
    Ok(())
}

/// Build registries from configuration plus whatever the snapshot offers,
/// then reconcile per the recovery rules.
pub fn recover(cfg: ClusterConfig, mode: RecoverMode, now: i64) -> Registries {
    let dir: PathBuf = cfg.state_dir.clone();
    let mut nodes = NodeRegistry::from_config(&cfg);
    let mut parts = PartRegistry::from_config(&cfg, &nodes);
    let mut jobs = JobRegistry::new();

    if mode == RecoverMode::Full {
        if let Err(err) = load_nodes(&dir, &mut nodes) {
            warn!(%err, "node state not recovered");
        }
        if let Err(err) = load_parts(&dir, &mut parts) {
            warn!(%err, "partition state not recovered");
        }
    }
    if mode != RecoverMode::None {
        if let Err(err) = load_jobs(&dir, &mut jobs) {
            warn!(%err, "job state not recovered");
        }
        reconcile(&mut jobs, &mut nodes, now);
    }

    info!(
        nodes = nodes.len(),
        jobs = jobs.iter().count(),
        "controller state recovered"
    );
    Registries {
        config: tokio::sync::RwLock::new(cfg),
        parts: tokio::sync::RwLock::new(parts),
        jobs: tokio::sync::RwLock::new(jobs),
        nodes: tokio::sync::RwLock::new(nodes),
    }
}

/// Post-replay reconciliation: rebuild allocation bitmaps against the
/// current node table, fail running jobs that lost a node, finish completing
/// jobs whose nodes are gone, and resync the per-node counters.
pub fn reconcile(jobs: &mut JobRegistry, nodes: &mut NodeRegistry, now: i64) {
    for job in jobs.iter_mut() {
        if job.node_names.is_empty() {
            continue;
        }
        let mut bitmap = Bitmap::new(nodes.len());
        let mut missing = false;
        let mut down = false;
        for name in &job.node_names {
            match nodes.idx(name) {
                Some(idx) => {
                    bitmap.set(idx);
                    if nodes.get(idx).base == BaseState::Down {
                        down = true;
                    }
                }
                None => missing = true,
            }
        }
        let all_gone = job.node_names.iter().all(|name| {
            nodes
                .idx(name)
                .map(|idx| nodes.get(idx).base == BaseState::Down)
                .unwrap_or(true)
        });
        job.node_bitmap = Some(bitmap);

        if job.state.is_active() && (missing || down) {
            let _ = job.finish(JobState::NodeFail, now);
        }
        if job.completing && all_gone {
            job.drained();
            // Nothing left to drain; nothing to keep the record in limbo.
        }
    }

    let running: Vec<(Bitmap, bool)> = jobs
        .iter()
        .filter(|j| j.state.is_active())
        .filter_map(|j| j.node_bitmap.clone().map(|b| (b, j.no_share)))
        .collect();
    let completing: Vec<Bitmap> = jobs
        .iter()
        .filter(|j| j.completing)
        .filter_map(|j| j.node_bitmap.clone())
        .collect();
    nodes.resync_counters(
        running.iter().map(|(b, s)| (b, *s)),
        completing.iter(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use quarry_proto::message::JobDescriptor;

    fn tmpdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("quarry-persist-tests").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn desc() -> JobDescriptor {
        JobDescriptor {
            name: Some("j".into()),
            partition: None,
            uid: 1000,
            gid: 1000,
            min_nodes: 2,
            max_nodes: NO_VAL,
            min_cpus_per_node: 1,
            min_mem_mb: 0,
            min_tmp_mb: 0,
            req_nodes: None,
            exc_nodes: None,
            features: vec![],
            contiguous: false,
            shared: u16::MAX,
            priority: 1,
            time_limit_min: 30,
            immediate: false,
            account: Some("acct".into()),
            dependency: None,
            work_dir: None,
            script: None,
        }
    }

    fn allocated_registry(node_cnt: usize) -> (JobRegistry, u32) {
        let mut jobs = JobRegistry::new();
        let id = jobs.submit(&desc(), "batch".into(), 10).job_id;
        let job = jobs.find_mut(id).unwrap();
        let mut bm = Bitmap::new(node_cnt);
        bm.set(0);
        bm.set(3);
        job.allocate(bm, vec!["n0".into(), "n3".into()], vec![4, 4], true, 20)
            .unwrap();
        let key = quarry_proto::AuthKey::from_bytes(b"k".to_vec());
        let cred = Credential::issue(
            &key,
            id,
            0,
            1000,
            1000,
            vec!["n0".into(), "n3".into()],
            vec![1, 1],
            0,
        );
        job.steps.push(StepRecord {
            step_id: 0,
            name: None,
            task_cnt: 2,
            node_names: vec!["n0".into(), "n3".into()],
            tasks_per_node: vec![1, 1],
            cred,
            resp_addr: Some("10.0.0.9:41000".into()),
            completion: Bitmap::new(2),
            step_rc: 0,
            acct: AcctSnapshot::default(),
            start_time: 25,
        });
        job.next_step_id = 1;
        (jobs, id)
    }

    #[test]
    fn node_state_round_trip() {
        let dir = tmpdir("nodes");
        let cfg = test_config(4);
        let mut nodes = NodeRegistry::from_config(&cfg);
        nodes.get_mut(0).base = BaseState::Idle;
        nodes.set_down(2, "bad disk");
        nodes.get_mut(1).flags = crate::registry::node::NODE_DRAINING;
        save_nodes(&dir, &nodes).unwrap();

        let mut restored = NodeRegistry::from_config(&cfg);
        load_nodes(&dir, &mut restored).unwrap();
        assert_eq!(restored.get(0).base, BaseState::Idle);
        assert_eq!(restored.get(2).base, BaseState::Down);
        assert_eq!(restored.get(2).reason.as_deref(), Some("bad disk"));
        assert_eq!(restored.get(1).flags, crate::registry::node::NODE_DRAINING);
    }

    #[test]
    fn job_state_round_trip() {
        let dir = tmpdir("jobs");
        let (jobs, id) = allocated_registry(4);
        save_jobs(&dir, &jobs).unwrap();

        let mut restored = JobRegistry::new();
        load_jobs(&dir, &mut restored).unwrap();
        let job = restored.find(id).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.node_names, vec!["n0".to_string(), "n3".to_string()]);
        assert_eq!(job.account.as_deref(), Some("acct"));
        assert_eq!(job.steps.len(), 1);
        let step = &job.steps[0];
        assert_eq!(step.resp_addr.as_deref(), Some("10.0.0.9:41000"));
        assert_eq!(step.cred.job_id, id);
        // New submissions never reuse a replayed id.
        let next = restored.submit(&desc(), "batch".into(), 99).job_id;
        assert!(next > id);
    }

    #[test]
    fn corrupt_trailer_detected() {
        let dir = tmpdir("corrupt");
        let (jobs, _) = allocated_registry(4);
        save_jobs(&dir, &jobs).unwrap();
        let path = dir.join(JOB_STATE_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();
        let mut restored = JobRegistry::new();
        assert!(matches!(
            load_jobs(&dir, &mut restored),
            Err(PersistError::Corrupt(_))
        ));
    }

    #[test]
    fn missing_files_are_fine() {
        let dir = tmpdir("empty");
        let mut jobs = JobRegistry::new();
        load_jobs(&dir, &mut jobs).unwrap();
        assert_eq!(jobs.iter().count(), 0);
    }

    #[test]
    fn reconcile_downed_node_fails_running_job() {
        let cfg = test_config(4);
        let mut nodes = NodeRegistry::from_config(&cfg);
        for i in 0..4 {
            nodes.get_mut(i).base = BaseState::Idle;
        }
        nodes.set_down(3, "lost");
        let (mut jobs, id) = allocated_registry(4);

        reconcile(&mut jobs, &mut nodes, 777);
        let job = jobs.find(id).unwrap();
        assert_eq!(job.state, JobState::NodeFail);
        assert!(job.completing);
        assert_eq!(job.end_time, 777);
        // The surviving node carries the completing count.
        assert_eq!(nodes.get(0).comp_job_cnt, 1);
    }

    #[test]
    fn reconcile_completes_job_with_all_nodes_gone() {
        let cfg = test_config(4);
        let mut nodes = NodeRegistry::from_config(&cfg);
        nodes.set_down(0, "gone");
        nodes.set_down(3, "gone");
        let (mut jobs, id) = allocated_registry(4);
        jobs.find_mut(id)
            .unwrap()
            .finish(JobState::Complete, 50)
            .unwrap();

        reconcile(&mut jobs, &mut nodes, 100);
        let job = jobs.find(id).unwrap();
        assert!(!job.completing);
    }

    #[test]
    fn full_recover_round_trip() {
        let mut cfg = test_config(4);
        cfg.state_dir = tmpdir("full");
        let dir = cfg.state_dir.clone();

        let mut nodes = NodeRegistry::from_config(&cfg);
        for i in 0..4 {
            nodes.get_mut(i).base = BaseState::Idle;
            nodes.get_mut(i).last_response = 1000;
        }
        let parts = PartRegistry::from_config(&cfg, &nodes);
        let (mut jobs, id) = allocated_registry(4);
        let bm = jobs.find(id).unwrap().node_bitmap.clone().unwrap();
        nodes.allocate_job(&bm, true);
        save_nodes(&dir, &nodes).unwrap();
        save_parts(&dir, &parts).unwrap();
        save_jobs(&dir, &jobs).unwrap();

        let regs = recover(cfg, RecoverMode::Full, 2000);
        let jobs = regs.jobs.try_read().unwrap();
        let nodes = regs.nodes.try_read().unwrap();
        let job = jobs.find(id).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(nodes.get(0).run_job_cnt, 1);
        assert_eq!(nodes.get(0).no_share_job_cnt, 1);
        assert_eq!(nodes.get(0).base, BaseState::Allocated);
        assert_eq!(nodes.get(1).run_job_cnt, 0);
    }
}
