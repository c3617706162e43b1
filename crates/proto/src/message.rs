//! Message catalogue and envelope.
//!
//! Every inter-role message is `header || body`. The header embeds the
//! forward directive (fan-out is an explicit field, agreed in-band) and the
//! caller's authenticator. Bodies are enum variants with hand-written codecs
//! so the wire form stays canonical and bit-stable.

use quarry_core::layout::TaskDistribution;
use thiserror::Error;

use crate::codec::{PackBuf, UnpackBuf, UnpackError, NO_VAL};
use crate::cred::{AuthToken, CredError, Credential};

pub const PROTO_VERSION: u16 = 0x0101;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("incompatible protocol version {0:#06x}")]
    Version(u16),
    #[error("unexpected message type {0}")]
    UnknownType(u16),
    #[error(transparent)]
    Unpack(#[from] UnpackError),
    #[error(transparent)]
    Cred(#[from] CredError),
}

/// Reject a header whose version we cannot speak.
pub fn check_header_version(version: u16) -> Result<(), ProtoError> {
    if version != PROTO_VERSION {
        return Err(ProtoError::Version(version));
    }
    Ok(())
}

macro_rules! msg_types {
    ($( $name:ident = $val:expr, )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum MsgType {
            $( $name = $val, )*
        }

        impl MsgType {
            pub fn from_u16(v: u16) -> Option<Self> {
                match v {
                    $( $val => Some(MsgType::$name), )*
                    _ => None,
                }
            }
        }
    };
}

msg_types! {
    NodeRegister = 1001,
    Ping = 1002,

    Allocate = 2001,
    SubmitBatch = 2002,
    JobInfo = 2003,
    KillJob = 2004,
    CompleteJobAllocation = 2005,
    SuspendJob = 2006,
    Checkpoint = 2007,
    JobStepCreate = 2008,
    KillJobStep = 2009,
    StepComplete = 2010,
    FileBcast = 2011,
    TriggerSet = 2012,
    TriggerGet = 2013,
    TriggerClear = 2014,

    LaunchTasks = 3001,
    SignalTasks = 3002,
    TerminateTasks = 3003,
    ReattachTasks = 3004,

    PmiKvsPut = 5001,
    PmiKvsGet = 5002,

    Rc = 8001,
    ForwardAggregate = 8002,
    ResponseForwardFailed = 8003,

    AllocateResponse = 9001,
    SubmitBatchResponse = 9002,
    JobInfoResponse = 9003,
    JobStepCreateResponse = 9004,
    LaunchTasksResponse = 9005,
    ReattachTasksResponse = 9006,
    TriggerGetResponse = 9007,
    PmiKvsGetResponse = 9008,

    TaskExit = 9101,
    SrunNodeFail = 9102,
    SrunTimeout = 9103,
    SrunJobComplete = 9104,
    TaskUserManagedIo = 9105,
}

/// How far and how fast an RPC spreads: the receiver forwards to `nodes`
/// split into up to `fanout` subtrees, waiting `timeout_ms` per hop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardDirective {
    pub fanout: u16,
    pub timeout_ms: u32,
    pub nodes: Vec<String>,
}

impl ForwardDirective {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u16(self.fanout);
        p.pack_u32(self.timeout_ms);
        p.pack_str_array(&self.nodes);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        Ok(Self {
            fanout: u.unpack_u16()?,
            timeout_ms: u.unpack_u32()?,
            nodes: u.unpack_str_array()?,
        })
    }
}

/// One record per target node in a fanned RPC's result list.
#[derive(Debug, Clone, PartialEq)]
pub struct RetDataInfo {
    pub msg_type: u16,
    pub rc: u32,
    pub node_name: String,
    pub body: Option<Box<MsgBody>>,
}

impl RetDataInfo {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u16(self.msg_type);
        p.pack_u32(self.rc);
        p.pack_str(&self.node_name);
        match &self.body {
            None => p.pack_bool(false),
            Some(body) => {
                p.pack_bool(true);
                let mut inner = PackBuf::new();
                body.pack(&mut inner);
                p.pack_mem(&inner.into_inner());
            }
        }
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, ProtoError> {
        let msg_type = u.unpack_u16()?;
        let rc = u.unpack_u32()?;
        let node_name = u.unpack_str()?;
        let body = if u.unpack_bool()? {
            let raw = u.unpack_mem()?;
            let ty = MsgType::from_u16(msg_type).ok_or(ProtoError::UnknownType(msg_type))?;
            let mut inner = UnpackBuf::new(&raw);
            let body = MsgBody::unpack(ty, &mut inner)?;
            inner.expect_done().map_err(ProtoError::Unpack)?;
            Some(Box::new(body))
        } else {
            None
        };
        Ok(Self {
            msg_type,
            rc,
            node_name,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegInfo {
    pub node_name: String,
    pub addr: String,
    pub cpus: u16,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub real_mem_mb: u32,
    pub tmp_disk_mb: u32,
    pub features: Vec<String>,
}

impl NodeRegInfo {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_str(&self.node_name);
        p.pack_str(&self.addr);
        p.pack_u16(self.cpus);
        p.pack_u16(self.sockets);
        p.pack_u16(self.cores);
        p.pack_u16(self.threads);
        p.pack_u32(self.real_mem_mb);
        p.pack_u32(self.tmp_disk_mb);
        p.pack_str_array(&self.features);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        Ok(Self {
            node_name: u.unpack_str()?,
            addr: u.unpack_str()?,
            cpus: u.unpack_u16()?,
            sockets: u.unpack_u16()?,
            cores: u.unpack_u16()?,
            threads: u.unpack_u16()?,
            real_mem_mb: u.unpack_u32()?,
            tmp_disk_mb: u.unpack_u32()?,
            features: u.unpack_str_array()?,
        })
    }
}

/// Job submission / allocation request. `time_limit_min == NO_VAL` means
/// unlimited; `shared == u16::MAX` defers to the partition policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub name: Option<String>,
    pub partition: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub min_cpus_per_node: u32,
    pub min_mem_mb: u32,
    pub min_tmp_mb: u32,
    pub req_nodes: Option<String>,
    pub exc_nodes: Option<String>,
    pub features: Vec<String>,
    pub contiguous: bool,
    pub shared: u16,
    pub priority: u32,
    pub time_limit_min: u32,
    pub immediate: bool,
    pub account: Option<String>,
    pub dependency: Option<u32>,
    pub work_dir: Option<String>,
    pub script: Option<String>,
}

impl JobDescriptor {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_opt_str(self.name.as_deref());
        p.pack_opt_str(self.partition.as_deref());
        p.pack_u32(self.uid);
        p.pack_u32(self.gid);
        p.pack_u32(self.min_nodes);
        p.pack_u32(self.max_nodes);
        p.pack_u32(self.min_cpus_per_node);
        p.pack_u32(self.min_mem_mb);
        p.pack_u32(self.min_tmp_mb);
        p.pack_opt_str(self.req_nodes.as_deref());
        p.pack_opt_str(self.exc_nodes.as_deref());
        p.pack_str_array(&self.features);
        p.pack_bool(self.contiguous);
        p.pack_u16(self.shared);
        p.pack_u32(self.priority);
        p.pack_u32(self.time_limit_min);
        p.pack_bool(self.immediate);
        p.pack_opt_str(self.account.as_deref());
        p.pack_u32(self.dependency.unwrap_or(NO_VAL));
        p.pack_opt_str(self.work_dir.as_deref());
        p.pack_opt_str(self.script.as_deref());
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        Ok(Self {
            name: u.unpack_opt_str()?,
            partition: u.unpack_opt_str()?,
            uid: u.unpack_u32()?,
            gid: u.unpack_u32()?,
            min_nodes: u.unpack_u32()?,
            max_nodes: u.unpack_u32()?,
            min_cpus_per_node: u.unpack_u32()?,
            min_mem_mb: u.unpack_u32()?,
            min_tmp_mb: u.unpack_u32()?,
            req_nodes: u.unpack_opt_str()?,
            exc_nodes: u.unpack_opt_str()?,
            features: u.unpack_str_array()?,
            contiguous: u.unpack_bool()?,
            shared: u.unpack_u16()?,
            priority: u.unpack_u32()?,
            time_limit_min: u.unpack_u32()?,
            immediate: u.unpack_bool()?,
            account: u.unpack_opt_str()?,
            dependency: match u.unpack_u32()? {
                NO_VAL => None,
                v => Some(v),
            },
            work_dir: u.unpack_opt_str()?,
            script: u.unpack_opt_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub job_id: u32,
    pub error_code: u32,
    pub node_names: Vec<String>,
    pub node_addrs: Vec<String>,
    pub cpus_per_node: Vec<u32>,
}

impl AllocationInfo {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u32(self.job_id);
        p.pack_u32(self.error_code);
        p.pack_str_array(&self.node_names);
        p.pack_str_array(&self.node_addrs);
        p.pack_u32_array(&self.cpus_per_node);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        Ok(Self {
            job_id: u.unpack_u32()?,
            error_code: u.unpack_u32()?,
            node_names: u.unpack_str_array()?,
            node_addrs: u.unpack_str_array()?,
            cpus_per_node: u.unpack_u32_array()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfoRec {
    pub job_id: u32,
    pub name: Option<String>,
    pub user_id: u32,
    pub partition: String,
    pub job_state: u16,
    pub state_reason: u16,
    pub nodes: Option<String>,
    pub num_nodes: u32,
    pub submit_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub time_limit_min: u32,
}

impl JobInfoRec {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u32(self.job_id);
        p.pack_opt_str(self.name.as_deref());
        p.pack_u32(self.user_id);
        p.pack_str(&self.partition);
        p.pack_u16(self.job_state);
        p.pack_u16(self.state_reason);
        p.pack_opt_str(self.nodes.as_deref());
        p.pack_u32(self.num_nodes);
        p.pack_time(self.submit_time);
        p.pack_time(self.start_time);
        p.pack_time(self.end_time);
        p.pack_u32(self.time_limit_min);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        Ok(Self {
            job_id: u.unpack_u32()?,
            name: u.unpack_opt_str()?,
            user_id: u.unpack_u32()?,
            partition: u.unpack_str()?,
            job_state: u.unpack_u16()?,
            state_reason: u.unpack_u16()?,
            nodes: u.unpack_opt_str()?,
            num_nodes: u.unpack_u32()?,
            submit_time: u.unpack_time()?,
            start_time: u.unpack_time()?,
            end_time: u.unpack_time()?,
            time_limit_min: u.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCreateRequest {
    pub job_id: u32,
    pub user_id: u32,
    pub task_cnt: u32,
    pub node_cnt: u32,
    pub relative: Option<u32>,
    pub dist: TaskDistribution,
    pub name: Option<String>,
    /// Where the submitting client listens for srun-* notifications.
    pub resp_addr: Option<String>,
}

impl StepCreateRequest {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u32(self.job_id);
        p.pack_u32(self.user_id);
        p.pack_u32(self.task_cnt);
        p.pack_u32(self.node_cnt);
        p.pack_u32(self.relative.unwrap_or(NO_VAL));
        let (kind, plane) = self.dist.as_wire();
        p.pack_u16(kind);
        p.pack_u16(plane);
        p.pack_opt_str(self.name.as_deref());
        p.pack_opt_str(self.resp_addr.as_deref());
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        let job_id = u.unpack_u32()?;
        let user_id = u.unpack_u32()?;
        let task_cnt = u.unpack_u32()?;
        let node_cnt = u.unpack_u32()?;
        let relative = match u.unpack_u32()? {
            NO_VAL => None,
            v => Some(v),
        };
        let kind = u.unpack_u16()?;
        let plane = u.unpack_u16()?;
        let dist = TaskDistribution::from_wire(kind, plane)
            .ok_or(UnpackError::BadValue("task distribution"))?;
        Ok(Self {
            job_id,
            user_id,
            task_cnt,
            node_cnt,
            relative,
            dist,
            name: u.unpack_opt_str()?,
            resp_addr: u.unpack_opt_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCreateResponse {
    pub job_id: u32,
    pub step_id: u32,
    pub node_names: Vec<String>,
    pub node_addrs: Vec<String>,
    pub tasks_per_node: Vec<u32>,
    pub cred: Credential,
}

impl StepCreateResponse {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u32(self.job_id);
        p.pack_u32(self.step_id);
        p.pack_str_array(&self.node_names);
        p.pack_str_array(&self.node_addrs);
        p.pack_u32_array(&self.tasks_per_node);
        self.cred.pack(p);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            job_id: u.unpack_u32()?,
            step_id: u.unpack_u32()?,
            node_names: u.unpack_str_array()?,
            node_addrs: u.unpack_str_array()?,
            tasks_per_node: u.unpack_u32_array()?,
            cred: Credential::unpack(u)?,
        })
    }
}

/// Which task, if any, receives the client's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    AllTasks,
    OneTask(u32),
    NoTask,
}

impl StdinMode {
    fn pack(&self, p: &mut PackBuf) {
        match self {
            StdinMode::AllTasks => {
                p.pack_u8(0);
                p.pack_u32(0);
            }
            StdinMode::OneTask(gtid) => {
                p.pack_u8(1);
                p.pack_u32(*gtid);
            }
            StdinMode::NoTask => {
                p.pack_u8(2);
                p.pack_u32(0);
            }
        }
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        let kind = u.unpack_u8()?;
        let arg = u.unpack_u32()?;
        match kind {
            0 => Ok(StdinMode::AllTasks),
            1 => Ok(StdinMode::OneTask(arg)),
            2 => Ok(StdinMode::NoTask),
            _ => Err(UnpackError::BadValue("stdin mode")),
        }
    }
}

/// The step launch payload broadcast to every node of the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTasksMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub ntasks: u32,
    pub nnodes: u32,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub dist: TaskDistribution,
    pub cred: Credential,
    pub node_names: Vec<String>,
    pub tasks: Vec<u32>,
    pub tids: Vec<Vec<u32>>,
    /// Host the client listens on, for both response and stdio traffic.
    pub client_host: String,
    pub resp_ports: Vec<u16>,
    pub io_ports: Vec<u16>,
    pub buffered_stdio: bool,
    pub user_managed_io: bool,
    pub stdin_mode: StdinMode,
    pub ofname: Option<String>,
    pub efname: Option<String>,
    pub ifname: Option<String>,
    /// Fan-out of the step-complete aggregation tree.
    pub complete_fanout: u16,
}

impl LaunchTasksMsg {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u32(self.job_id);
        p.pack_u32(self.step_id);
        p.pack_u32(self.uid);
        p.pack_u32(self.gid);
        p.pack_u32(self.ntasks);
        p.pack_u32(self.nnodes);
        p.pack_str_array(&self.argv);
        p.pack_str_array(&self.env);
        p.pack_str(&self.cwd);
        let (kind, plane) = self.dist.as_wire();
        p.pack_u16(kind);
        p.pack_u16(plane);
        self.cred.pack(p);
        p.pack_str_array(&self.node_names);
        p.pack_u32_array(&self.tasks);
        p.pack_u32(self.tids.len() as u32);
        for node_tids in &self.tids {
            p.pack_u32_array(node_tids);
        }
        p.pack_str(&self.client_host);
        p.pack_u16_array(&self.resp_ports);
        p.pack_u16_array(&self.io_ports);
        p.pack_bool(self.buffered_stdio);
        p.pack_bool(self.user_managed_io);
        self.stdin_mode.pack(p);
        p.pack_opt_str(self.ofname.as_deref());
        p.pack_opt_str(self.efname.as_deref());
        p.pack_opt_str(self.ifname.as_deref());
        p.pack_u16(self.complete_fanout);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, ProtoError> {
        let job_id = u.unpack_u32()?;
        let step_id = u.unpack_u32()?;
        let uid = u.unpack_u32()?;
        let gid = u.unpack_u32()?;
        let ntasks = u.unpack_u32()?;
        let nnodes = u.unpack_u32()?;
        let argv = u.unpack_str_array()?;
        let env = u.unpack_str_array()?;
        let cwd = u.unpack_str()?;
        let kind = u.unpack_u16()?;
        let plane = u.unpack_u16()?;
        let dist = TaskDistribution::from_wire(kind, plane)
            .ok_or(UnpackError::BadValue("task distribution"))?;
        let cred = Credential::unpack(u)?;
        let node_names = u.unpack_str_array()?;
        let tasks = u.unpack_u32_array()?;
        let tid_rows = u.unpack_u32()?;
        if tid_rows as usize != node_names.len() {
            return Err(ProtoError::Unpack(UnpackError::BadValue("tid row count")));
        }
        let mut tids = Vec::with_capacity(tid_rows as usize);
        for _ in 0..tid_rows {
            tids.push(u.unpack_u32_array()?);
        }
        Ok(Self {
            job_id,
            step_id,
            uid,
            gid,
            ntasks,
            nnodes,
            argv,
            env,
            cwd,
            dist,
            cred,
            node_names,
            tasks,
            tids,
            client_host: u.unpack_str()?,
            resp_ports: u.unpack_u16_array()?,
            io_ports: u.unpack_u16_array()?,
            buffered_stdio: u.unpack_bool()?,
            user_managed_io: u.unpack_bool()?,
            stdin_mode: StdinMode::unpack(u)?,
            ofname: u.unpack_opt_str()?,
            efname: u.unpack_opt_str()?,
            ifname: u.unpack_opt_str()?,
            complete_fanout: u.unpack_u16()?,
        })
    }
}

/// Resource usage summary carried in step completion records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcctSnapshot {
    pub user_sec: u64,
    pub sys_sec: u64,
    pub max_rss_kb: u64,
}

impl AcctSnapshot {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u64(self.user_sec);
        p.pack_u64(self.sys_sec);
        p.pack_u64(self.max_rss_kb);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        Ok(Self {
            user_sec: u.unpack_u64()?,
            sys_sec: u.unpack_u64()?,
            max_rss_kb: u.unpack_u64()?,
        })
    }

    pub fn merge_max(&mut self, other: &AcctSnapshot) {
        self.user_sec = self.user_sec.max(other.user_sec);
        self.sys_sec = self.sys_sec.max(other.sys_sec);
        self.max_rss_kb = self.max_rss_kb.max(other.max_rss_kb);
    }
}

/// One range-encoded completion record, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCompleteMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub range_first: u32,
    pub range_last: u32,
    pub step_rc: u32,
    pub acct: AcctSnapshot,
}

impl StepCompleteMsg {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u32(self.job_id);
        p.pack_u32(self.step_id);
        p.pack_u32(self.range_first);
        p.pack_u32(self.range_last);
        p.pack_u32(self.step_rc);
        self.acct.pack(p);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        Ok(Self {
            job_id: u.unpack_u32()?,
            step_id: u.unpack_u32()?,
            range_first: u.unpack_u32()?,
            range_last: u.unpack_u32()?,
            step_rc: u.unpack_u32()?,
            acct: AcctSnapshot::unpack(u)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRec {
    pub trig_id: u32,
    pub trig_type: u16,
    pub res_id: String,
    pub program: String,
}

impl TriggerRec {
    fn pack(&self, p: &mut PackBuf) {
        p.pack_u32(self.trig_id);
        p.pack_u16(self.trig_type);
        p.pack_str(&self.res_id);
        p.pack_str(&self.program);
    }

    fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        Ok(Self {
            trig_id: u.unpack_u32()?,
            trig_type: u.unpack_u16()?,
            res_id: u.unpack_str()?,
            program: u.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvsPair {
    pub kvs_name: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MsgBody {
    NodeRegister(NodeRegInfo),
    Ping { node_name: String },

    Allocate(JobDescriptor),
    SubmitBatch(JobDescriptor),
    JobInfo { job_id: Option<u32>, show_all: bool },
    KillJob { job_id: u32, signal: u16 },
    CompleteJobAllocation { job_id: u32, rc: u32 },
    SuspendJob { job_id: u32, suspend: bool },
    Checkpoint { job_id: u32, step_id: u32, op: u16 },
    JobStepCreate(StepCreateRequest),
    KillJobStep { job_id: u32, step_id: u32, signal: u16 },
    StepComplete(StepCompleteMsg),
    FileBcast { job_id: u32, fname: String, data: Vec<u8> },
    TriggerSet(TriggerRec),
    TriggerGet,
    TriggerClear { trig_id: u32 },

    LaunchTasks(Box<LaunchTasksMsg>),
    SignalTasks { job_id: u32, step_id: u32, signal: u16 },
    TerminateTasks { job_id: u32, step_id: u32 },
    ReattachTasks {
        job_id: u32,
        step_id: u32,
        resp_ports: Vec<u16>,
        io_ports: Vec<u16>,
        signature: Vec<u8>,
    },

    PmiKvsPut { pairs: Vec<KvsPair> },
    PmiKvsGet { task_id: u32, kvs_name: String, key: String },

    Rc { rc: u32 },
    ForwardAggregate { records: Vec<RetDataInfo> },
    ResponseForwardFailed { node_name: String, rc: u32 },

    AllocateResponse(AllocationInfo),
    SubmitBatchResponse { job_id: u32, rc: u32 },
    JobInfoResponse { last_update: i64, jobs: Vec<JobInfoRec> },
    JobStepCreateResponse(StepCreateResponse),
    LaunchTasksResponse {
        rc: u32,
        node_name: String,
        local_pids: Vec<u32>,
        gtids: Vec<u32>,
    },
    ReattachTasksResponse {
        node_name: String,
        rc: u32,
        pids: Vec<u32>,
        gtids: Vec<u32>,
        executable: String,
    },
    TriggerGetResponse { triggers: Vec<TriggerRec> },
    PmiKvsGetResponse { rc: u32, value: Option<String> },

    TaskExit {
        job_id: u32,
        step_id: u32,
        return_code: u32,
        gtids: Vec<u32>,
    },
    SrunNodeFail { job_id: u32, step_id: u32, nodelist: String },
    SrunTimeout { job_id: u32, step_id: u32, timeout_at: i64 },
    SrunJobComplete { job_id: u32, step_id: u32 },
    TaskUserManagedIo { task_id: u32 },
}

impl MsgBody {
    pub fn msg_type(&self) -> MsgType {
        match self {
            MsgBody::NodeRegister(_) => MsgType::NodeRegister,
            MsgBody::Ping { .. } => MsgType::Ping,
            MsgBody::Allocate(_) => MsgType::Allocate,
            MsgBody::SubmitBatch(_) => MsgType::SubmitBatch,
            MsgBody::JobInfo { .. } => MsgType::JobInfo,
            MsgBody::KillJob { .. } => MsgType::KillJob,
            MsgBody::CompleteJobAllocation { .. } => MsgType::CompleteJobAllocation,
            MsgBody::SuspendJob { .. } => MsgType::SuspendJob,
            MsgBody::Checkpoint { .. } => MsgType::Checkpoint,
            MsgBody::JobStepCreate(_) => MsgType::JobStepCreate,
            MsgBody::KillJobStep { .. } => MsgType::KillJobStep,
            MsgBody::StepComplete(_) => MsgType::StepComplete,
            MsgBody::FileBcast { .. } => MsgType::FileBcast,
            MsgBody::TriggerSet(_) => MsgType::TriggerSet,
            MsgBody::TriggerGet => MsgType::TriggerGet,
            MsgBody::TriggerClear { .. } => MsgType::TriggerClear,
            MsgBody::LaunchTasks(_) => MsgType::LaunchTasks,
            MsgBody::SignalTasks { .. } => MsgType::SignalTasks,
            MsgBody::TerminateTasks { .. } => MsgType::TerminateTasks,
            MsgBody::ReattachTasks { .. } => MsgType::ReattachTasks,
            MsgBody::PmiKvsPut { .. } => MsgType::PmiKvsPut,
            MsgBody::PmiKvsGet { .. } => MsgType::PmiKvsGet,
            MsgBody::Rc { .. } => MsgType::Rc,
            MsgBody::ForwardAggregate { .. } => MsgType::ForwardAggregate,
            MsgBody::ResponseForwardFailed { .. } => MsgType::ResponseForwardFailed,
            MsgBody::AllocateResponse(_) => MsgType::AllocateResponse,
            MsgBody::SubmitBatchResponse { .. } => MsgType::SubmitBatchResponse,
            MsgBody::JobInfoResponse { .. } => MsgType::JobInfoResponse,
            MsgBody::JobStepCreateResponse(_) => MsgType::JobStepCreateResponse,
            MsgBody::LaunchTasksResponse { .. } => MsgType::LaunchTasksResponse,
            MsgBody::ReattachTasksResponse { .. } => MsgType::ReattachTasksResponse,
            MsgBody::TriggerGetResponse { .. } => MsgType::TriggerGetResponse,
            MsgBody::PmiKvsGetResponse { .. } => MsgType::PmiKvsGetResponse,
            MsgBody::TaskExit { .. } => MsgType::TaskExit,
            MsgBody::SrunNodeFail { .. } => MsgType::SrunNodeFail,
            MsgBody::SrunTimeout { .. } => MsgType::SrunTimeout,
            MsgBody::SrunJobComplete { .. } => MsgType::SrunJobComplete,
            MsgBody::TaskUserManagedIo { .. } => MsgType::TaskUserManagedIo,
        }
    }

    pub fn pack(&self, p: &mut PackBuf) {
        match self {
            MsgBody::NodeRegister(info) => info.pack(p),
            MsgBody::Ping { node_name } => p.pack_str(node_name),
            MsgBody::Allocate(desc) | MsgBody::SubmitBatch(desc) => desc.pack(p),
            MsgBody::JobInfo { job_id, show_all } => {
                p.pack_u32(job_id.unwrap_or(NO_VAL));
                p.pack_bool(*show_all);
            }
            MsgBody::KillJob { job_id, signal } => {
                p.pack_u32(*job_id);
                p.pack_u16(*signal);
            }
            MsgBody::CompleteJobAllocation { job_id, rc } => {
                p.pack_u32(*job_id);
                p.pack_u32(*rc);
            }
            MsgBody::SuspendJob { job_id, suspend } => {
                p.pack_u32(*job_id);
                p.pack_bool(*suspend);
            }
            MsgBody::Checkpoint { job_id, step_id, op } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
                p.pack_u16(*op);
            }
            MsgBody::JobStepCreate(req) => req.pack(p),
            MsgBody::KillJobStep {
                job_id,
                step_id,
                signal,
            } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
                p.pack_u16(*signal);
            }
            MsgBody::StepComplete(msg) => msg.pack(p),
            MsgBody::FileBcast { job_id, fname, data } => {
                p.pack_u32(*job_id);
                p.pack_str(fname);
                p.pack_mem(data);
            }
            MsgBody::TriggerSet(rec) => rec.pack(p),
            MsgBody::TriggerGet => {}
            MsgBody::TriggerClear { trig_id } => p.pack_u32(*trig_id),
            MsgBody::LaunchTasks(msg) => msg.pack(p),
            MsgBody::SignalTasks {
                job_id,
                step_id,
                signal,
            } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
                p.pack_u16(*signal);
            }
            MsgBody::TerminateTasks { job_id, step_id } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
            }
            MsgBody::ReattachTasks {
                job_id,
                step_id,
                resp_ports,
                io_ports,
                signature,
            } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
                p.pack_u16_array(resp_ports);
                p.pack_u16_array(io_ports);
                p.pack_mem(signature);
            }
            MsgBody::PmiKvsPut { pairs } => {
                p.pack_u32(pairs.len() as u32);
                for pair in pairs {
                    p.pack_str(&pair.kvs_name);
                    p.pack_str(&pair.key);
                    p.pack_str(&pair.value);
                }
            }
            MsgBody::PmiKvsGet {
                task_id,
                kvs_name,
                key,
            } => {
                p.pack_u32(*task_id);
                p.pack_str(kvs_name);
                p.pack_str(key);
            }
            MsgBody::Rc { rc } => p.pack_u32(*rc),
            MsgBody::ForwardAggregate { records } => {
                p.pack_u32(records.len() as u32);
                for rec in records {
                    rec.pack(p);
                }
            }
            MsgBody::ResponseForwardFailed { node_name, rc } => {
                p.pack_str(node_name);
                p.pack_u32(*rc);
            }
            MsgBody::AllocateResponse(info) => info.pack(p),
            MsgBody::SubmitBatchResponse { job_id, rc } => {
                p.pack_u32(*job_id);
                p.pack_u32(*rc);
            }
            MsgBody::JobInfoResponse { last_update, jobs } => {
                p.pack_time(*last_update);
                p.pack_u32(jobs.len() as u32);
                for job in jobs {
                    job.pack(p);
                }
            }
            MsgBody::JobStepCreateResponse(resp) => resp.pack(p),
            MsgBody::LaunchTasksResponse {
                rc,
                node_name,
                local_pids,
                gtids,
            } => {
                p.pack_u32(*rc);
                p.pack_str(node_name);
                p.pack_u32_array(local_pids);
                p.pack_u32_array(gtids);
            }
            MsgBody::ReattachTasksResponse {
                node_name,
                rc,
                pids,
                gtids,
                executable,
            } => {
                p.pack_str(node_name);
                p.pack_u32(*rc);
                p.pack_u32_array(pids);
                p.pack_u32_array(gtids);
                p.pack_str(executable);
            }
            MsgBody::TriggerGetResponse { triggers } => {
                p.pack_u32(triggers.len() as u32);
                for t in triggers {
                    t.pack(p);
                }
            }
            MsgBody::PmiKvsGetResponse { rc, value } => {
                p.pack_u32(*rc);
                p.pack_opt_str(value.as_deref());
            }
            MsgBody::TaskExit {
                job_id,
                step_id,
                return_code,
                gtids,
            } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
                p.pack_u32(*return_code);
                p.pack_u32_array(gtids);
            }
            MsgBody::SrunNodeFail {
                job_id,
                step_id,
                nodelist,
            } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
                p.pack_str(nodelist);
            }
            MsgBody::SrunTimeout {
                job_id,
                step_id,
                timeout_at,
            } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
                p.pack_time(*timeout_at);
            }
            MsgBody::SrunJobComplete { job_id, step_id } => {
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
            }
            MsgBody::TaskUserManagedIo { task_id } => p.pack_u32(*task_id),
        }
    }

    pub fn unpack(ty: MsgType, u: &mut UnpackBuf<'_>) -> Result<Self, ProtoError> {
        let body = match ty {
            MsgType::NodeRegister => MsgBody::NodeRegister(NodeRegInfo::unpack(u)?),
            MsgType::Ping => MsgBody::Ping {
                node_name: u.unpack_str()?,
            },
            MsgType::Allocate => MsgBody::Allocate(JobDescriptor::unpack(u)?),
            MsgType::SubmitBatch => MsgBody::SubmitBatch(JobDescriptor::unpack(u)?),
            MsgType::JobInfo => MsgBody::JobInfo {
                job_id: match u.unpack_u32()? {
                    NO_VAL => None,
                    v => Some(v),
                },
                show_all: u.unpack_bool()?,
            },
            MsgType::KillJob => MsgBody::KillJob {
                job_id: u.unpack_u32()?,
                signal: u.unpack_u16()?,
            },
            MsgType::CompleteJobAllocation => MsgBody::CompleteJobAllocation {
                job_id: u.unpack_u32()?,
                rc: u.unpack_u32()?,
            },
            MsgType::SuspendJob => MsgBody::SuspendJob {
                job_id: u.unpack_u32()?,
                suspend: u.unpack_bool()?,
            },
            MsgType::Checkpoint => MsgBody::Checkpoint {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
                op: u.unpack_u16()?,
            },
            MsgType::JobStepCreate => MsgBody::JobStepCreate(StepCreateRequest::unpack(u)?),
            MsgType::KillJobStep => MsgBody::KillJobStep {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
                signal: u.unpack_u16()?,
            },
            MsgType::StepComplete => MsgBody::StepComplete(StepCompleteMsg::unpack(u)?),
            MsgType::FileBcast => MsgBody::FileBcast {
                job_id: u.unpack_u32()?,
                fname: u.unpack_str()?,
                data: u.unpack_mem()?,
            },
            MsgType::TriggerSet => MsgBody::TriggerSet(TriggerRec::unpack(u)?),
            MsgType::TriggerGet => MsgBody::TriggerGet,
            MsgType::TriggerClear => MsgBody::TriggerClear {
                trig_id: u.unpack_u32()?,
            },
            MsgType::LaunchTasks => MsgBody::LaunchTasks(Box::new(LaunchTasksMsg::unpack(u)?)),
            MsgType::SignalTasks => MsgBody::SignalTasks {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
                signal: u.unpack_u16()?,
            },
            MsgType::TerminateTasks => MsgBody::TerminateTasks {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
            },
            MsgType::ReattachTasks => MsgBody::ReattachTasks {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
                resp_ports: u.unpack_u16_array()?,
                io_ports: u.unpack_u16_array()?,
                signature: u.unpack_mem()?,
            },
            MsgType::PmiKvsPut => {
                let count = u.unpack_u32()?;
                let mut pairs = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    pairs.push(KvsPair {
                        kvs_name: u.unpack_str()?,
                        key: u.unpack_str()?,
                        value: u.unpack_str()?,
                    });
                }
                MsgBody::PmiKvsPut { pairs }
            }
            MsgType::PmiKvsGet => MsgBody::PmiKvsGet {
                task_id: u.unpack_u32()?,
                kvs_name: u.unpack_str()?,
                key: u.unpack_str()?,
            },
            MsgType::Rc => MsgBody::Rc {
                rc: u.unpack_u32()?,
            },
            MsgType::ForwardAggregate => {
                let count = u.unpack_u32()?;
                let mut records = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    records.push(RetDataInfo::unpack(u)?);
                }
                MsgBody::ForwardAggregate { records }
            }
            MsgType::ResponseForwardFailed => MsgBody::ResponseForwardFailed {
                node_name: u.unpack_str()?,
                rc: u.unpack_u32()?,
            },
            MsgType::AllocateResponse => MsgBody::AllocateResponse(AllocationInfo::unpack(u)?),
            MsgType::SubmitBatchResponse => MsgBody::SubmitBatchResponse {
                job_id: u.unpack_u32()?,
                rc: u.unpack_u32()?,
            },
            MsgType::JobInfoResponse => {
                let last_update = u.unpack_time()?;
                let count = u.unpack_u32()?;
                let mut jobs = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    jobs.push(JobInfoRec::unpack(u)?);
                }
                MsgBody::JobInfoResponse { last_update, jobs }
            }
            MsgType::JobStepCreateResponse => {
                MsgBody::JobStepCreateResponse(StepCreateResponse::unpack(u)?)
            }
            MsgType::LaunchTasksResponse => MsgBody::LaunchTasksResponse {
                rc: u.unpack_u32()?,
                node_name: u.unpack_str()?,
                local_pids: u.unpack_u32_array()?,
                gtids: u.unpack_u32_array()?,
            },
            MsgType::ReattachTasksResponse => MsgBody::ReattachTasksResponse {
                node_name: u.unpack_str()?,
                rc: u.unpack_u32()?,
                pids: u.unpack_u32_array()?,
                gtids: u.unpack_u32_array()?,
                executable: u.unpack_str()?,
            },
            MsgType::TriggerGetResponse => {
                let count = u.unpack_u32()?;
                let mut triggers = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    triggers.push(TriggerRec::unpack(u)?);
                }
                MsgBody::TriggerGetResponse { triggers }
            }
            MsgType::PmiKvsGetResponse => MsgBody::PmiKvsGetResponse {
                rc: u.unpack_u32()?,
                value: u.unpack_opt_str()?,
            },
            MsgType::TaskExit => MsgBody::TaskExit {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
                return_code: u.unpack_u32()?,
                gtids: u.unpack_u32_array()?,
            },
            MsgType::SrunNodeFail => MsgBody::SrunNodeFail {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
                nodelist: u.unpack_str()?,
            },
            MsgType::SrunTimeout => MsgBody::SrunTimeout {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
                timeout_at: u.unpack_time()?,
            },
            MsgType::SrunJobComplete => MsgBody::SrunJobComplete {
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
            },
            MsgType::TaskUserManagedIo => MsgBody::TaskUserManagedIo {
                task_id: u.unpack_u32()?,
            },
        };
        Ok(body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub msg_type: MsgType,
    pub ret_cnt: u16,
    pub forward: ForwardDirective,
    pub orig_addr: String,
    pub auth: AuthToken,
}

/// A complete framed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub flags: u16,
    pub ret_cnt: u16,
    pub forward: ForwardDirective,
    pub orig_addr: String,
    pub auth: AuthToken,
    pub body: MsgBody,
}

impl Envelope {
    pub fn new(auth: AuthToken, body: MsgBody) -> Self {
        Self {
            flags: 0,
            ret_cnt: 0,
            forward: ForwardDirective::default(),
            orig_addr: String::new(),
            auth,
            body,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.body.msg_type()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body_buf = PackBuf::new();
        self.body.pack(&mut body_buf);
        let body = body_buf.into_inner();

        let mut p = PackBuf::new();
        p.pack_u16(PROTO_VERSION);
        p.pack_u16(self.flags);
        p.pack_u16(self.body.msg_type() as u16);
        p.pack_u32(body.len() as u32);
        p.pack_u16(self.ret_cnt);
        self.forward.pack(&mut p);
        p.pack_str(&self.orig_addr);
        self.auth.pack(&mut p);
        let mut out = p.into_inner();
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut u = UnpackBuf::new(data);
        let version = u.unpack_u16()?;
        check_header_version(version)?;
        let flags = u.unpack_u16()?;
        let raw_type = u.unpack_u16()?;
        let msg_type = MsgType::from_u16(raw_type).ok_or(ProtoError::UnknownType(raw_type))?;
        let body_len = u.unpack_u32()?;
        let ret_cnt = u.unpack_u16()?;
        let forward = ForwardDirective::unpack(&mut u)?;
        let orig_addr = u.unpack_str()?;
        let auth = AuthToken::unpack(&mut u)?;
        if u.remaining() != body_len as usize {
            return Err(ProtoError::Unpack(UnpackError::Truncated {
                wanted: body_len as usize,
                had: u.remaining(),
            }));
        }
        let body = MsgBody::unpack(msg_type, &mut u)?;
        u.expect_done().map_err(ProtoError::Unpack)?;
        Ok(Self {
            flags,
            ret_cnt,
            forward,
            orig_addr,
            auth,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::AuthKey;

    fn auth() -> AuthToken {
        AuthToken::issue(&AuthKey::from_bytes(b"k".to_vec()), 1000, 1000)
    }

    fn key() -> AuthKey {
        AuthKey::from_bytes(b"k".to_vec())
    }

    fn round_trip(body: MsgBody) {
        let env = Envelope::new(auth(), body.clone());
        let bytes = env.encode();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back.body, body);
    }

    fn sample_cred() -> Credential {
        Credential::issue(
            &key(),
            7,
            0,
            1000,
            1000,
            vec!["n0".into(), "n1".into()],
            vec![2, 2],
            0,
        )
    }

    #[test]
    fn rc_round_trip() {
        round_trip(MsgBody::Rc { rc: 17 });
    }

    #[test]
    fn allocate_round_trip() {
        round_trip(MsgBody::Allocate(JobDescriptor {
            name: Some("build".into()),
            partition: None,
            uid: 1000,
            gid: 1000,
            min_nodes: 2,
            max_nodes: 4,
            min_cpus_per_node: 1,
            min_mem_mb: 0,
            min_tmp_mb: 0,
            req_nodes: Some("n[0-1]".into()),
            exc_nodes: None,
            features: vec!["fast".into()],
            contiguous: true,
            shared: u16::MAX,
            priority: 100,
            time_limit_min: NO_VAL,
            immediate: false,
            account: None,
            dependency: Some(6),
            work_dir: Some("/tmp".into()),
            script: None,
        }));
    }

    #[test]
    fn launch_tasks_round_trip() {
        round_trip(MsgBody::LaunchTasks(Box::new(LaunchTasksMsg {
            job_id: 7,
            step_id: 0,
            uid: 1000,
            gid: 1000,
            ntasks: 4,
            nnodes: 2,
            argv: vec!["hostname".into()],
            env: vec!["PATH=/bin".into()],
            cwd: "/home/u".into(),
            dist: TaskDistribution::Cyclic,
            cred: sample_cred(),
            node_names: vec!["n0".into(), "n1".into()],
            tasks: vec![2, 2],
            tids: vec![vec![0, 2], vec![1, 3]],
            client_host: "10.0.0.1".into(),
            resp_ports: vec![40100],
            io_ports: vec![40200],
            buffered_stdio: true,
            user_managed_io: false,
            stdin_mode: StdinMode::OneTask(0),
            ofname: None,
            efname: None,
            ifname: None,
            complete_fanout: 2,
        })));
    }

    #[test]
    fn step_complete_round_trip() {
        round_trip(MsgBody::StepComplete(StepCompleteMsg {
            job_id: 7,
            step_id: 1,
            range_first: 0,
            range_last: 7,
            step_rc: 139,
            acct: AcctSnapshot {
                user_sec: 10,
                sys_sec: 2,
                max_rss_kb: 4096,
            },
        }));
    }

    #[test]
    fn step_create_response_round_trip() {
        round_trip(MsgBody::JobStepCreateResponse(StepCreateResponse {
            job_id: 7,
            step_id: 0,
            node_names: vec!["n0".into()],
            node_addrs: vec!["10.0.0.2:6820".into()],
            tasks_per_node: vec![4],
            cred: sample_cred(),
        }));
    }

    #[test]
    fn forward_aggregate_round_trip() {
        round_trip(MsgBody::ForwardAggregate {
            records: vec![
                RetDataInfo {
                    msg_type: MsgType::Rc as u16,
                    rc: 0,
                    node_name: "n0".into(),
                    body: Some(Box::new(MsgBody::Rc { rc: 0 })),
                },
                RetDataInfo {
                    msg_type: MsgType::ResponseForwardFailed as u16,
                    rc: 7003,
                    node_name: "n1".into(),
                    body: None,
                },
            ],
        });
    }

    #[test]
    fn forward_directive_travels_in_header() {
        let mut env = Envelope::new(
            auth(),
            MsgBody::SignalTasks {
                job_id: 1,
                step_id: 0,
                signal: 15,
            },
        );
        env.forward = ForwardDirective {
            fanout: 2,
            timeout_ms: 5000,
            nodes: vec!["n1".into(), "n2".into()],
        };
        let back = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(back.forward, env.forward);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let env = Envelope::new(auth(), MsgBody::Rc { rc: 0 });
        let mut bytes = env.encode();
        // Corrupt the message type field (bytes 4..6 of the header).
        bytes[4] = 0xff;
        bytes[5] = 0xff;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ProtoError::UnknownType(0xffff))
        ));
    }

    #[test]
    fn version_gate() {
        let env = Envelope::new(auth(), MsgBody::Rc { rc: 0 });
        let mut bytes = env.encode();
        bytes[0] = 0x00;
        bytes[1] = 0x99;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ProtoError::Version(0x0099))
        ));
    }

    #[test]
    fn short_body_is_framing_error() {
        let env = Envelope::new(auth(), MsgBody::Ping {
            node_name: "n0".into(),
        });
        let bytes = env.encode();
        assert!(matches!(
            Envelope::decode(&bytes[..bytes.len() - 2]),
            Err(ProtoError::Unpack(UnpackError::Truncated { .. }))
        ));
    }

    #[test]
    fn pmi_round_trip() {
        round_trip(MsgBody::PmiKvsPut {
            pairs: vec![KvsPair {
                kvs_name: "kvs_7_0".into(),
                key: "rank0addr".into(),
                value: "10.0.0.2:5000".into(),
            }],
        });
        round_trip(MsgBody::PmiKvsGetResponse {
            rc: 0,
            value: Some("10.0.0.2:5000".into()),
        });
    }

    #[test]
    fn auth_token_verifies_after_decode() {
        let env = Envelope::new(auth(), MsgBody::Rc { rc: 0 });
        let back = Envelope::decode(&env.encode()).unwrap();
        back.auth.verify(&key()).unwrap();
        assert_eq!(back.auth.uid, 1000);
    }
}
