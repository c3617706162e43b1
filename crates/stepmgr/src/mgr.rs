//! Step supervision.
//!
//! The manager validates the credential against the launch payload, puts
//! every task in one container, wires their stdio, reports starts and exits
//! to the launch client, and drives the completion tree. Tasks walk
//! init → starting → running → complete; a record is retired only after its
//! exit has been delivered.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use quarry_net::eio::EioHandle;
use quarry_proto::message::{AcctSnapshot, MsgBody, StdinMode, StepCompleteMsg};
use quarry_proto::stepreq::StepState;
use quarry_proto::{AuthKey, AuthToken, Envelope, ErrorCode};

use crate::complete::{parent, CompleteTree};
use crate::container::{Container, PgidContainer};
use crate::fname;
use crate::handoff::Handoff;
use crate::io::{self, StepIoShared};

const MSG_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the manager waits for missing descendants before it reports the
/// ranges it does have straight to the controller.
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Starting,
    Running,
    Complete,
}

#[derive(Debug)]
pub struct TaskRec {
    pub ltid: u32,
    pub gtid: u32,
    pub pid: u32,
    pub state: TaskState,
    pub estatus: Option<u32>,
    /// Exit delivered to the client.
    pub esent: bool,
}

pub struct StepManager {
    pub handoff: Handoff,
    pub key: AuthKey,
    pub auth: AuthToken,
    /// This node's rank within the step.
    pub nodeid: u32,
    pub state: Mutex<StepState>,
    pub suspended: Mutex<bool>,
    pub container: Mutex<PgidContainer>,
    pub tasks: Mutex<Vec<TaskRec>>,
    pub tree: Mutex<CompleteTree>,
    pub tree_notify: Notify,
    pub io_shared: Option<Arc<StepIoShared>>,
    pub io_handle: EioHandle,
    /// Client endpoints receiving launch/exit notifications; attach adds.
    pub resp_addrs: Mutex<Vec<String>>,
}

impl std::fmt::Debug for StepManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepManager")
            .field("nodeid", &self.nodeid)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MgrError {
    #[error("credential rejected: {0}")]
    Cred(ErrorCode),
    #[error("node {0:?} not part of this step")]
    UnknownNode(String),
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

impl StepManager {
    pub fn new(handoff: Handoff, io_handle: EioHandle, now: i64) -> Result<Arc<Self>, MgrError> {
        let key = AuthKey::from_hex(&handoff.auth_key_hex)
            .map_err(|_| MgrError::Cred(ErrorCode::CredUnpack))?;
        let launch = &handoff.launch;

        // The credential gate: signature, node membership, identity.
        let cred = &launch.cred;
        if cred.verify(&key, now).is_err() {
            return Err(MgrError::Cred(ErrorCode::CredVerify));
        }
        if !cred.has_node(&handoff.node_name) {
            return Err(MgrError::Cred(ErrorCode::IdentityMismatch));
        }
        if cred.job_id != launch.job_id
            || cred.step_id != launch.step_id
            || cred.uid != launch.uid
        {
            return Err(MgrError::Cred(ErrorCode::IdentityMismatch));
        }

        let nodeid = launch
            .node_names
            .iter()
            .position(|n| n == &handoff.node_name)
            .ok_or_else(|| MgrError::UnknownNode(handoff.node_name.clone()))? as u32;

        let resp_addr = format!(
            "{}:{}",
            launch.client_host,
            launch.resp_ports[nodeid as usize % launch.resp_ports.len()]
        );
        let io_shared = if launch.user_managed_io {
            None
        } else {
            Some(StepIoShared::new(nodeid, *cred.signature()))
        };
        let auth = AuthToken::issue(&key, handoff.operator_uid, handoff.operator_uid);
        let tree = CompleteTree::new(nodeid, launch.nnodes, launch.complete_fanout.max(1));

        Ok(Arc::new(Self {
            key,
            auth,
            nodeid,
            state: Mutex::new(StepState::Starting),
            suspended: Mutex::new(false),
            container: Mutex::new(PgidContainer::new()),
            tasks: Mutex::new(Vec::new()),
            tree: Mutex::new(tree),
            tree_notify: Notify::new(),
            io_shared,
            io_handle,
            resp_addrs: Mutex::new(vec![resp_addr]),
            handoff,
        }))
    }

    pub fn owner_uid(&self) -> u32 {
        self.handoff.launch.uid
    }

    pub fn is_operator(&self, uid: u32) -> bool {
        uid == 0 || uid == self.handoff.operator_uid
    }

    pub fn local_tids(&self) -> &[u32] {
        &self.handoff.launch.tids[self.nodeid as usize]
    }

    pub fn executable(&self) -> String {
        self.handoff
            .launch
            .argv
            .first()
            .cloned()
            .unwrap_or_default()
    }

    /// Fan a message to every registered client endpoint.
    pub async fn notify_clients(&self, body: MsgBody) {
        let addrs = self.resp_addrs.lock().unwrap().clone();
        for addr in addrs {
            let env = Envelope::new(self.auth.clone(), body.clone());
            if let Err(err) = quarry_net::send_one(&addr, &env, MSG_TIMEOUT).await {
                debug!(%addr, %err, "client notification failed");
            }
        }
    }

    fn task_stdio(&self, gtid: u32) -> (Stdio, Stdio, Stdio) {
        let launch = &self.handoff.launch;
        let job = launch.job_id;
        let step = launch.step_id;
        let open_out = |pattern: &Option<String>| -> Stdio {
            match pattern {
                Some(p) => {
                    let path = fname::expand(p, job, step, gtid);
                    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                        Ok(f) => Stdio::from(f),
                        Err(err) => {
                            warn!(%path, %err, "task output file; falling back to null");
                            Stdio::null()
                        }
                    }
                }
                None if launch.user_managed_io => Stdio::null(),
                None => Stdio::piped(),
            }
        };

        let stdin = match &launch.ifname {
            Some(p) => {
                let path = fname::expand(p, job, step, gtid);
                match std::fs::File::open(&path) {
                    Ok(f) => Stdio::from(f),
                    Err(err) => {
                        warn!(%path, %err, "task input file; falling back to null");
                        Stdio::null()
                    }
                }
            }
            None => {
                let wants_stdin = match launch.stdin_mode {
                    StdinMode::AllTasks => true,
                    StdinMode::OneTask(target) => target == gtid,
                    StdinMode::NoTask => false,
                };
                if wants_stdin && !launch.user_managed_io {
                    Stdio::piped()
                } else {
                    // Tasks outside the stdin target see EOF from the start.
                    Stdio::null()
                }
            }
        };

        (stdin, open_out(&launch.ofname), open_out(&launch.efname))
    }

    /// Fork the tasks under the container with their stdio wired up.
    /// Returns the children paired with their local ids.
    pub fn spawn_tasks(self: &Arc<Self>) -> Result<Vec<(u32, Child)>, MgrError> {
        let launch = &self.handoff.launch;
        let tids = self.local_tids().to_vec();
        let mut children = Vec::with_capacity(tids.len());
        let mut leader_pid: Option<i32> = None;

        self.container.lock().unwrap().create()?;

        for (slot, gtid) in tids.iter().enumerate() {
            let ltid = slot as u32;
            let (stdin, stdout, stderr) = self.task_stdio(*gtid);

            let mut cmd = Command::new(launch.argv.first().map(String::as_str).unwrap_or(""));
            cmd.args(&launch.argv[1.min(launch.argv.len())..])
                .current_dir(&launch.cwd)
                .env_clear()
                .stdin(stdin)
                .stdout(stdout)
                .stderr(stderr)
                .kill_on_drop(false);
            for kv in &launch.env {
                if let Some((k, v)) = kv.split_once('=') {
                    cmd.env(k, v);
                }
            }
            cmd.env("QUARRY_JOBID", launch.job_id.to_string());
            cmd.env("QUARRY_STEPID", launch.step_id.to_string());
            cmd.env("QUARRY_PROCID", gtid.to_string());
            cmd.env("QUARRY_LOCALID", ltid.to_string());
            cmd.env("QUARRY_NODEID", self.nodeid.to_string());

            let group = leader_pid.unwrap_or(0);
            let uid = launch.uid;
            let gid = launch.gid;
            unsafe {
                cmd.pre_exec(move || {
                    // Join the step's process group before exec so one
                    // container signal reaches everything.
                    if libc::setpgid(0, group) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::geteuid() == 0 {
                        if libc::setgid(gid) != 0 || libc::setuid(uid) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }

            let child = cmd.spawn()?;
            let pid = child.id().unwrap_or(0);
            if leader_pid.is_none() {
                leader_pid = Some(pid as i32);
            }
            {
                let mut container = self.container.lock().unwrap();
                let _ = container.add(pid);
            }
            self.tasks.lock().unwrap().push(TaskRec {
                ltid,
                gtid: *gtid,
                pid,
                state: TaskState::Starting,
                estatus: None,
                esent: false,
            });
            children.push((ltid, child));
        }

        info!(
            job_id = launch.job_id,
            step_id = launch.step_id,
            ntasks = children.len(),
            "tasks spawned"
        );
        Ok(children)
    }

    /// Wire the spawned children's pipes into the stdio plane and mark them
    /// running.
    pub fn start_io(self: &Arc<Self>, children: &mut [(u32, Child)]) {
        let Some(shared) = &self.io_shared else {
            return;
        };
        let launch = &self.handoff.launch;
        for (ltid, child) in children.iter_mut() {
            let gtid = self.local_tids()[*ltid as usize];
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(io::pump_output(
                    stdout,
                    quarry_proto::iohdr::IoMsgType::Stdout,
                    gtid as u16,
                    *ltid as u16,
                    launch.buffered_stdio,
                    shared.clone(),
                    self.io_handle.clone(),
                ));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(io::pump_output(
                    stderr,
                    quarry_proto::iohdr::IoMsgType::Stderr,
                    gtid as u16,
                    *ltid as u16,
                    launch.buffered_stdio,
                    shared.clone(),
                    self.io_handle.clone(),
                ));
            }
            if let Some(stdin) = child.stdin.take() {
                let (tx, rx) = mpsc::channel(64);
                shared.register_stdin(gtid as u16, tx);
                tokio::spawn(io::pump_stdin(stdin, rx, shared.clone()));
            }
        }
        let mut tasks = self.tasks.lock().unwrap();
        for rec in tasks.iter_mut() {
            rec.state = TaskState::Running;
        }
        *self.state.lock().unwrap() = StepState::Running;
    }

    /// Supervise the children to completion, reporting exits as they land.
    pub async fn supervise(self: &Arc<Self>, children: Vec<(u32, Child)>) {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(u32, u32)>();
        let total = children.len();

        for (ltid, mut child) in children {
            let exit_tx = exit_tx.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => wait_status_code(status),
                    Err(_) => 1,
                };
                let _ = exit_tx.send((ltid, code));
            });
        }
        drop(exit_tx);

        let mut exited = 0usize;
        while exited < total {
            let Some((ltid, code)) = exit_rx.recv().await else {
                break;
            };
            exited += 1;
            let gtid = {
                let mut tasks = self.tasks.lock().unwrap();
                let rec = tasks
                    .iter_mut()
                    .find(|t| t.ltid == ltid)
                    .expect("known task");
                rec.state = TaskState::Complete;
                rec.estatus = Some(code);
                if let Some(shared) = &self.io_shared {
                    shared.drop_stdin(rec.gtid as u16);
                }
                rec.gtid
            };
            debug!(ltid, gtid, code, "task exited");
            self.notify_clients(MsgBody::TaskExit {
                job_id: self.handoff.launch.job_id,
                step_id: self.handoff.launch.step_id,
                return_code: code,
                gtids: vec![gtid],
            })
            .await;
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(rec) = tasks.iter_mut().find(|t| t.ltid == ltid) {
                rec.esent = true;
            }
        }

        *self.state.lock().unwrap() = StepState::Complete;
    }

    fn local_rc(&self) -> u32 {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter_map(|t| t.estatus)
            .max()
            .unwrap_or(0)
    }

    fn rusage_snapshot(&self) -> AcctSnapshot {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
        if rc != 0 {
            return AcctSnapshot::default();
        }
        AcctSnapshot {
            user_sec: usage.ru_utime.tv_sec.max(0) as u64,
            sys_sec: usage.ru_stime.tv_sec.max(0) as u64,
            max_rss_kb: usage.ru_maxrss.max(0) as u64,
        }
    }

    /// Record a descendant's completion; forwards upward on subtree
    /// completion. Called from the request plane.
    pub async fn child_completion(&self, first: u32, last: u32, rc: u32, acct: &AcctSnapshot) {
        let forward = {
            let mut tree = self.tree.lock().unwrap();
            tree.record(first, last, rc, acct)
        };
        self.tree_notify.notify_waiters();
        if forward {
            self.forward_completion().await;
        }
    }

    async fn forward_completion(&self) {
        let (first, last, rc, acct) = {
            let tree = self.tree.lock().unwrap();
            let (first, last) = tree.range();
            (first, last, tree.step_rc(), tree.acct())
        };
        self.send_completion(first, last, rc, acct).await;
    }

    async fn send_completion(&self, first: u32, last: u32, rc: u32, acct: AcctSnapshot) {
        let launch = &self.handoff.launch;
        let body = MsgBody::StepComplete(StepCompleteMsg {
            job_id: launch.job_id,
            step_id: launch.step_id,
            range_first: first,
            range_last: last,
            step_rc: rc,
            acct,
        });
        let target = match parent(self.nodeid, launch.nnodes, launch.complete_fanout.max(1)) {
            None => self.handoff.controller_addr.clone(),
            Some(parent_rank) => self
                .handoff
                .node_addrs
                .get(parent_rank as usize)
                .cloned()
                .unwrap_or_else(|| self.handoff.controller_addr.clone()),
        };
        let env = Envelope::new(self.auth.clone(), body);
        match quarry_net::send_recv_one(&target, &env, MSG_TIMEOUT).await {
            Ok(_) => debug!(first, last, rc, %target, "completion forwarded"),
            Err(err) => {
                // The parent is gone: report straight to the controller so
                // the step does not dangle.
                warn!(%target, %err, "completion forward failed; reporting to controller");
                let env = Envelope::new(self.auth.clone(), env.body.clone());
                if let Err(err) =
                    quarry_net::send_recv_one(&self.handoff.controller_addr, &env, MSG_TIMEOUT)
                        .await
                {
                    warn!(%err, "controller unreachable for completion");
                }
            }
        }
    }

    /// After local tasks finish: fold our rank into the tree, then wait for
    /// descendants. If they never report, push what we have to the
    /// controller rather than stalling the step forever.
    pub async fn finish_completion(&self) {
        let acct = self.rusage_snapshot();
        let rc = self.local_rc();
        let forward = {
            let mut tree = self.tree.lock().unwrap();
            tree.record(self.nodeid, self.nodeid, rc, &acct)
        };
        if forward {
            self.forward_completion().await;
            return;
        }

        let deadline = tokio::time::Instant::now() + COMPLETE_TIMEOUT;
        loop {
            let full = self.tree.lock().unwrap().is_full();
            if full {
                // The final record was forwarded by child_completion.
                return;
            }
            if tokio::time::timeout_at(deadline, self.tree_notify.notified())
                .await
                .is_err()
            {
                break;
            }
        }

        let ranges = {
            let tree = self.tree.lock().unwrap();
            tree.completed_ranges()
        };
        warn!(?ranges, "descendants missing; reporting partial completion");
        let (rc, acct) = {
            let tree = self.tree.lock().unwrap();
            (tree.step_rc(), tree.acct())
        };
        for (first, last) in ranges {
            let body = MsgBody::StepComplete(StepCompleteMsg {
                job_id: self.handoff.launch.job_id,
                step_id: self.handoff.launch.step_id,
                range_first: first,
                range_last: last,
                step_rc: rc,
                acct,
            });
            let env = Envelope::new(self.auth.clone(), body);
            if let Err(err) =
                quarry_net::send_recv_one(&self.handoff.controller_addr, &env, MSG_TIMEOUT).await
            {
                warn!(%err, "controller unreachable for partial completion");
            }
        }
    }

    // Operations behind the request plane.

    pub fn op_state(&self) -> StepState {
        *self.state.lock().unwrap()
    }

    pub fn op_signal_container(&self, signum: i32) -> Result<(), ErrorCode> {
        if *self.suspended.lock().unwrap() {
            return Err(ErrorCode::StepSuspended);
        }
        self.container
            .lock()
            .unwrap()
            .signal(signum)
            .map_err(|_| ErrorCode::NoSuchProcess)
    }

    pub fn op_signal_task(&self, signum: i32, ltid: u32) -> Result<(), ErrorCode> {
        if *self.suspended.lock().unwrap() {
            return Err(ErrorCode::StepSuspended);
        }
        let tasks = self.tasks.lock().unwrap();
        let rec = tasks
            .iter()
            .find(|t| t.ltid == ltid)
            .ok_or(ErrorCode::NoSuchProcess)?;
        if rec.state == TaskState::Complete {
            return Err(ErrorCode::NoSuchProcess);
        }
        let rc = unsafe { libc::kill(rec.pid as libc::pid_t, signum) };
        if rc != 0 {
            return Err(ErrorCode::NoSuchProcess);
        }
        Ok(())
    }

    pub fn op_suspend(&self) -> Result<(), ErrorCode> {
        let mut suspended = self.suspended.lock().unwrap();
        if *suspended {
            return Err(ErrorCode::StepSuspended);
        }
        self.container
            .lock()
            .unwrap()
            .signal(libc::SIGSTOP)
            .map_err(|_| ErrorCode::NoSuchProcess)?;
        *suspended = true;
        *self.state.lock().unwrap() = StepState::Suspended;
        Ok(())
    }

    pub fn op_resume(&self) -> Result<(), ErrorCode> {
        let mut suspended = self.suspended.lock().unwrap();
        if !*suspended {
            return Err(ErrorCode::StepNotSuspended);
        }
        self.container
            .lock()
            .unwrap()
            .signal(libc::SIGCONT)
            .map_err(|_| ErrorCode::NoSuchProcess)?;
        *suspended = false;
        *self.state.lock().unwrap() = StepState::Running;
        Ok(())
    }

    /// Kill the whole container regardless of suspend state.
    pub fn op_terminate(&self) -> Result<(), ErrorCode> {
        let container = self.container.lock().unwrap();
        container
            .signal(libc::SIGKILL)
            .map_err(|_| ErrorCode::NoSuchProcess)?;
        // A stopped process only dies once it runs again.
        if *self.suspended.lock().unwrap() {
            let _ = container.signal(libc::SIGCONT);
        }
        Ok(())
    }

    pub fn op_pid_in_container(&self, pid: u32) -> bool {
        self.container.lock().unwrap().find(pid).is_some()
    }

    pub async fn op_attach(
        &self,
        ioaddr: &str,
        respaddr: &str,
        signature: &[u8],
    ) -> Result<(Vec<u32>, Vec<u32>, String), ErrorCode> {
        if !quarry_proto::cred::sig_eq(signature, self.handoff.launch.cred.signature()) {
            return Err(ErrorCode::CredVerify);
        }
        if !respaddr.is_empty() {
            self.resp_addrs.lock().unwrap().push(respaddr.to_string());
        }
        if let Some(shared) = &self.io_shared {
            if !ioaddr.is_empty() {
                io::attach_client(ioaddr, shared, &self.io_handle)
                    .await
                    .map_err(|_| ErrorCode::ConnectionAborted)?;
            }
        }
        let tasks = self.tasks.lock().unwrap();
        let pids = tasks.iter().map(|t| t.pid).collect();
        let gtids = tasks.iter().map(|t| t.gtid).collect();
        Ok((pids, gtids, self.executable()))
    }
}

/// Collapse a wait status into the wire return code: the exit code, or
/// 128 + signal for a signalled death.
pub fn wait_status_code(status: std::process::ExitStatus) -> u32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        return code as u32;
    }
    match status.signal() {
        Some(sig) => 128 + sig as u32,
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::layout::TaskDistribution;
    use quarry_proto::message::LaunchTasksMsg;
    use quarry_proto::Credential;

    fn key() -> AuthKey {
        AuthKey::from_bytes(b"k".to_vec())
    }

    fn handoff_for(node: &str, tamper: bool) -> Handoff {
        let cred = Credential::issue(
            &key(),
            9,
            0,
            1000,
            1000,
            vec!["n0".into(), "n1".into()],
            vec![1, 1],
            0,
        );
        let mut launch = LaunchTasksMsg {
            job_id: 9,
            step_id: 0,
            uid: 1000,
            gid: 1000,
            ntasks: 2,
            nnodes: 2,
            argv: vec!["true".into()],
            env: vec![],
            cwd: "/tmp".into(),
            dist: TaskDistribution::Block,
            cred,
            node_names: vec!["n0".into(), "n1".into()],
            tasks: vec![1, 1],
            tids: vec![vec![0], vec![1]],
            client_host: "127.0.0.1".into(),
            resp_ports: vec![40000, 40001],
            io_ports: vec![40100],
            buffered_stdio: true,
            user_managed_io: false,
            stdin_mode: StdinMode::NoTask,
            ofname: None,
            efname: None,
            ifname: None,
            complete_fanout: 2,
        };
        if tamper {
            launch.uid = 4242; // no longer matches the credential
        }
        Handoff {
            node_name: node.into(),
            spool_dir: "/tmp/quarry-test".into(),
            controller_addr: "127.0.0.1:1".into(),
            auth_key_hex: "6b".into(),
            operator_uid: 0,
            node_addrs: vec!["127.0.0.1:1".into(), "127.0.0.1:1".into()],
            launch,
        }
    }

    fn mk(node: &str, tamper: bool) -> Result<Arc<StepManager>, MgrError> {
        let (_reactor, handle) = quarry_net::eio::Reactor::new();
        StepManager::new(handoff_for(node, tamper), handle, 100)
    }

    #[test]
    fn credential_gate_accepts_valid_launch() {
        let mgr = mk("n1", false).unwrap();
        assert_eq!(mgr.nodeid, 1);
        assert_eq!(mgr.local_tids(), &[1]);
        assert_eq!(mgr.op_state(), StepState::Starting);
    }

    #[test]
    fn credential_gate_rejects_identity_mismatch() {
        match mk("n0", true) {
            Err(MgrError::Cred(code)) => assert_eq!(code, ErrorCode::IdentityMismatch),
            other => panic!("expected identity mismatch, got {other:?}"),
        }
    }

    #[test]
    fn credential_gate_rejects_foreign_node() {
        match mk("n9", false) {
            Err(MgrError::Cred(code)) => assert_eq!(code, ErrorCode::IdentityMismatch),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn resp_port_selected_by_rank() {
        let mgr = mk("n1", false).unwrap();
        let addrs = mgr.resp_addrs.lock().unwrap();
        assert_eq!(addrs[0], "127.0.0.1:40001");
    }

    #[test]
    fn suspend_resume_state_machine() {
        let mgr = mk("n0", false).unwrap();
        // No container processes yet: suspend fails on delivery, resume on
        // state.
        assert_eq!(mgr.op_resume(), Err(ErrorCode::StepNotSuspended));
        assert_eq!(mgr.op_suspend(), Err(ErrorCode::NoSuchProcess));
        assert!(!*mgr.suspended.lock().unwrap());
    }

    #[test]
    fn wait_status_mapping() {
        use std::os::unix::process::ExitStatusExt;
        let normal = std::process::ExitStatus::from_raw(0x0200); // exit 2
        assert_eq!(wait_status_code(normal), 2);
        let signalled = std::process::ExitStatus::from_raw(15); // SIGTERM
        assert_eq!(wait_status_code(signalled), 143);
    }

    #[tokio::test]
    async fn attach_requires_matching_signature() {
        let mgr = mk("n0", false).unwrap();
        let err = mgr
            .op_attach("", "", &[0u8; 32])
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::CredVerify);

        let sig = *mgr.handoff.launch.cred.signature();
        let (pids, gtids, exe) = mgr.op_attach("", "", &sig).await.unwrap();
        assert!(pids.is_empty());
        assert!(gtids.is_empty());
        assert_eq!(exe, "true");
    }
}
