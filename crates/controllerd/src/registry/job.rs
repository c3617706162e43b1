//! Job and step registry.
//!
//! Jobs are created by allocation or batch submission, mutated by the
//! scheduler and the step lifecycle, and purged a while after they finish.
//! `completing` is a flag, not a state: a cancelled or failed job keeps its
//! terminal state while its resources drain, and only then is the
//! allocation released.

use quarry_core::Bitmap;
use quarry_proto::codec::NO_VAL;
use quarry_proto::message::{AcctSnapshot, JobDescriptor, JobInfoRec};
use quarry_proto::{Credential, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Complete,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
}

impl JobState {
    pub fn as_wire(self) -> u16 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Suspended => 2,
            JobState::Complete => 3,
            JobState::Cancelled => 4,
            JobState::Failed => 5,
            JobState::Timeout => 6,
            JobState::NodeFail => 7,
        }
    }

    pub fn from_wire(v: u16) -> Option<Self> {
        match v & !COMPLETING_FLAG {
            0 => Some(JobState::Pending),
            1 => Some(JobState::Running),
            2 => Some(JobState::Suspended),
            3 => Some(JobState::Complete),
            4 => Some(JobState::Cancelled),
            5 => Some(JobState::Failed),
            6 => Some(JobState::Timeout),
            7 => Some(JobState::NodeFail),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Complete
                | JobState::Cancelled
                | JobState::Failed
                | JobState::Timeout
                | JobState::NodeFail
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Running | JobState::Suspended)
    }
}

/// Set on the wire state when resources are still draining.
pub const COMPLETING_FLAG: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendReason {
    None,
    Resources,
    Priority,
    PartitionDown,
    Dependency,
    LaunchFailed,
}

impl PendReason {
    pub fn as_wire(self) -> u16 {
        match self {
            PendReason::None => 0,
            PendReason::Resources => 1,
            PendReason::Priority => 2,
            PendReason::PartitionDown => 3,
            PendReason::Dependency => 4,
            PendReason::LaunchFailed => 5,
        }
    }

    pub fn from_wire(v: u16) -> Self {
        match v {
            1 => PendReason::Resources,
            2 => PendReason::Priority,
            3 => PendReason::PartitionDown,
            4 => PendReason::Dependency,
            5 => PendReason::LaunchFailed,
            _ => PendReason::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step_id: u32,
    pub name: Option<String>,
    pub task_cnt: u32,
    pub node_names: Vec<String>,
    pub tasks_per_node: Vec<u32>,
    pub cred: Credential,
    /// Client endpoint for srun-* notifications.
    pub resp_addr: Option<String>,
    /// One bit per step node; set as completion records arrive.
    pub completion: Bitmap,
    pub step_rc: u32,
    pub acct: AcctSnapshot,
    pub start_time: i64,
}

impl StepRecord {
    /// Merge an inclusive range of completed node ids. Repeated ranges are
    /// idempotent. Returns true once the whole step is complete.
    pub fn merge_completion(&mut self, first: u32, last: u32, rc: u32, acct: &AcctSnapshot) -> bool {
        let last = (last as usize).min(self.completion.len().saturating_sub(1));
        if (first as usize) <= last {
            self.completion.set_range(first as usize, last);
        }
        self.step_rc = self.step_rc.max(rc);
        self.acct.merge_max(acct);
        self.completion.is_full()
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: u32,
    pub name: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub partition: String,
    pub account: Option<String>,
    pub dependency: Option<u32>,
    pub work_dir: Option<String>,
    pub script: Option<String>,

    pub min_nodes: u32,
    pub max_nodes: u32,
    pub min_cpus_per_node: u32,
    pub min_mem_mb: u32,
    pub min_tmp_mb: u32,
    pub req_pattern: Option<String>,
    pub exc_pattern: Option<String>,
    pub features: Vec<String>,
    pub contiguous: bool,
    /// Requested sharing, `u16::MAX` defers to the partition.
    pub shared_req: u16,
    pub priority: u32,
    pub time_limit_min: u32,

    pub state: JobState,
    pub completing: bool,
    pub reason: PendReason,
    pub submit_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub suspend_time: i64,

    pub node_bitmap: Option<Bitmap>,
    pub node_names: Vec<String>,
    pub cpus_per_node: Vec<u32>,
    /// Opaque placement payload from the select capability.
    pub select_jobinfo: Vec<u8>,
    /// Resolved at allocation: true when this job forbids sharing its nodes.
    pub no_share: bool,

    pub steps: Vec<StepRecord>,
    pub next_step_id: u32,
}

impl JobRecord {
    pub fn wire_state(&self) -> u16 {
        let mut v = self.state.as_wire();
        if self.completing {
            v |= COMPLETING_FLAG;
        }
        v
    }

    pub fn unlimited(&self) -> bool {
        self.time_limit_min == NO_VAL
    }

    /// pending → running with the chosen allocation.
    pub fn allocate(
        &mut self,
        bitmap: Bitmap,
        node_names: Vec<String>,
        cpus_per_node: Vec<u32>,
        no_share: bool,
        now: i64,
    ) -> Result<(), ErrorCode> {
        if self.state != JobState::Pending {
            return Err(ErrorCode::InvalidTransition);
        }
        debug_assert!(!bitmap.is_empty());
        self.state = JobState::Running;
        self.reason = PendReason::None;
        self.node_bitmap = Some(bitmap);
        self.node_names = node_names;
        self.cpus_per_node = cpus_per_node;
        self.no_share = no_share;
        self.start_time = now;
        Ok(())
    }

    pub fn suspend(&mut self, now: i64) -> Result<(), ErrorCode> {
        if self.state != JobState::Running {
            return Err(ErrorCode::InvalidTransition);
        }
        self.state = JobState::Suspended;
        self.suspend_time = now;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), ErrorCode> {
        if self.state != JobState::Suspended {
            return Err(ErrorCode::StepNotSuspended);
        }
        self.state = JobState::Running;
        self.suspend_time = 0;
        Ok(())
    }

    /// Move to a terminal state; resources keep draining until
    /// [`Self::drained`].
    pub fn finish(&mut self, state: JobState, now: i64) -> Result<(), ErrorCode> {
        debug_assert!(state.is_terminal());
        match self.state {
            JobState::Pending => {
                // Queued work vanishes without a completing phase.
                if state != JobState::Cancelled && state != JobState::Failed {
                    return Err(ErrorCode::InvalidTransition);
                }
                self.state = state;
                self.end_time = now;
                Ok(())
            }
            JobState::Running | JobState::Suspended => {
                self.state = state;
                self.completing = true;
                self.end_time = now;
                Ok(())
            }
            _ => Err(ErrorCode::InvalidTransition),
        }
    }

    /// All steps gone and the allocation released.
    pub fn drained(&mut self) {
        self.completing = false;
    }

    pub fn find_step(&self, step_id: u32) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn find_step_mut(&mut self, step_id: u32) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn remove_step(&mut self, step_id: u32) -> Option<StepRecord> {
        let pos = self.steps.iter().position(|s| s.step_id == step_id)?;
        Some(self.steps.remove(pos))
    }

    pub fn info_rec(&self) -> JobInfoRec {
        JobInfoRec {
            job_id: self.job_id,
            name: self.name.clone(),
            user_id: self.uid,
            partition: self.partition.clone(),
            job_state: self.wire_state(),
            state_reason: self.reason.as_wire(),
            nodes: if self.node_names.is_empty() {
                None
            } else {
                Some(quarry_core::hostlist::compress(&self.node_names))
            },
            num_nodes: self.node_names.len() as u32,
            submit_time: self.submit_time,
            start_time: self.start_time,
            end_time: self.end_time,
            time_limit_min: self.time_limit_min,
        }
    }
}

#[derive(Debug)]
pub struct JobRegistry {
    jobs: Vec<JobRecord>,
    next_job_id: u32,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            next_job_id: 1,
        }
    }

    pub fn submit(&mut self, desc: &JobDescriptor, partition: String, now: i64) -> &mut JobRecord {
        let job_id = self.next_job_id;
        self.next_job_id += 1;
        self.jobs.push(JobRecord {
            job_id,
            name: desc.name.clone(),
            uid: desc.uid,
            gid: desc.gid,
            partition,
            account: desc.account.clone(),
            dependency: desc.dependency,
            work_dir: desc.work_dir.clone(),
            script: desc.script.clone(),
            min_nodes: desc.min_nodes.max(1),
            max_nodes: desc.max_nodes,
            min_cpus_per_node: desc.min_cpus_per_node,
            min_mem_mb: desc.min_mem_mb,
            min_tmp_mb: desc.min_tmp_mb,
            req_pattern: desc.req_nodes.clone(),
            exc_pattern: desc.exc_nodes.clone(),
            features: desc.features.clone(),
            contiguous: desc.contiguous,
            shared_req: desc.shared,
            priority: desc.priority,
            time_limit_min: desc.time_limit_min,
            state: JobState::Pending,
            completing: false,
            reason: PendReason::None,
            submit_time: now,
            start_time: 0,
            end_time: 0,
            suspend_time: 0,
            node_bitmap: None,
            node_names: Vec::new(),
            cpus_per_node: Vec::new(),
            select_jobinfo: Vec::new(),
            no_share: false,
            steps: Vec::new(),
            next_step_id: 0,
        });
        self.jobs.last_mut().unwrap()
    }

    /// Recovery path: readmit a job keeping its original id.
    pub fn restore(&mut self, job: JobRecord) {
        self.next_job_id = self.next_job_id.max(job.job_id + 1);
        self.jobs.push(job);
    }

    pub fn find(&self, job_id: u32) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn find_mut(&mut self, job_id: u32) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| j.job_id == job_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut JobRecord> {
        self.jobs.iter_mut()
    }

    /// Pending jobs in scheduling order: priority desc, then age.
    pub fn pending_ids(&self) -> Vec<u32> {
        let mut pending: Vec<&JobRecord> = self
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submit_time.cmp(&b.submit_time))
                .then(a.job_id.cmp(&b.job_id))
        });
        pending.iter().map(|j| j.job_id).collect()
    }

    /// Drop finished jobs older than `min_age` seconds. Returns purged ids.
    pub fn purge(&mut self, now: i64, min_age: i64) -> Vec<u32> {
        let mut purged = Vec::new();
        self.jobs.retain(|j| {
            let done = j.state.is_terminal() && !j.completing;
            if done && now - j.end_time > min_age {
                purged.push(j.job_id);
                false
            } else {
                true
            }
        });
        purged
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
