//! Step launch state machine.
//!
//! Tracks per-task start and exit over the whole step, drives the fanned
//! launch broadcast, forwards signals to nodes that still have active
//! tasks, and implements the three blocking operations callers see:
//! wait-for-start, wait-for-finish, abort. Every mutation happens under one
//! mutex with a notify for the waiters; message handlers are synchronous
//! state updates so the accounting can be exercised without a network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use quarry_core::{hostlist, Bitmap, StepLayout};
use quarry_proto::message::MsgBody;
use quarry_proto::{AuthToken, Credential, Envelope, ErrorCode};

/// Grace period between an abort's kill and giving up on exits.
pub const ABORT_DRAIN: Duration = Duration::from_secs(10);

/// Listener capacity planning: at most this many remote peers per port.
pub const CLIENTS_PER_PORT: usize = 48;

pub fn estimate_nports(nclients: usize) -> usize {
    nclients.div_ceil(CLIENTS_PER_PORT).max(1)
}

#[derive(Debug)]
pub struct LaunchInner {
    pub tasks_started: Bitmap,
    pub tasks_exited: Bitmap,
    pub exit_codes: Vec<Option<u32>>,
    pub abort: bool,
    pub abort_action_taken: bool,
    /// Connected user-managed I/O sockets, when that mode is active.
    pub user_io_connected: u32,
    /// Nodes whose launch response reported failure.
    pub failed_nodes: Vec<String>,
    /// Layout indices the stdio plane should expect nothing more from.
    pub downed_nodes: Vec<usize>,
    pub timed_out: bool,
    pub job_complete: bool,
}

pub struct LaunchState {
    pub job_id: u32,
    pub step_id: u32,
    pub layout: StepLayout,
    pub cred: Credential,
    pub auth: AuthToken,
    pub controller_addr: String,
    /// Node daemon addresses for the step's nodes.
    pub node_addrs: HashMap<String, String>,
    pub fanout: u16,
    pub msg_timeout: Duration,
    pub user_managed_io: bool,
    inner: Mutex<LaunchInner>,
    cond: Notify,
}

impl LaunchState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: u32,
        step_id: u32,
        layout: StepLayout,
        cred: Credential,
        auth: AuthToken,
        controller_addr: String,
        node_addrs: HashMap<String, String>,
        fanout: u16,
        msg_timeout: Duration,
        user_managed_io: bool,
    ) -> Arc<Self> {
        let total = layout.task_cnt as usize;
        Arc::new(Self {
            job_id,
            step_id,
            layout,
            cred,
            auth,
            controller_addr,
            node_addrs,
            fanout,
            msg_timeout,
            user_managed_io,
            inner: Mutex::new(LaunchInner {
                tasks_started: Bitmap::new(total),
                tasks_exited: Bitmap::new(total),
                exit_codes: vec![None; total],
                abort: false,
                abort_action_taken: false,
                user_io_connected: 0,
                failed_nodes: Vec::new(),
                downed_nodes: Vec::new(),
                timed_out: false,
                job_complete: false,
            }),
            cond: Notify::new(),
        })
    }

    pub fn requested(&self) -> u32 {
        self.layout.task_cnt
    }

    pub fn with_inner<T>(&self, f: impl FnOnce(&mut LaunchInner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner)
    }

    /// Synchronous part of message handling; returns a reply for the
    /// request/response message types (PMI) and `None` for notifications.
    pub fn handle_msg(&self, body: &MsgBody, pmi: &crate::pmi::KvsStore) -> Option<MsgBody> {
        match body {
            MsgBody::LaunchTasksResponse {
                rc,
                node_name,
                gtids,
                ..
            } => {
                let mut inner = self.inner.lock().unwrap();
                if *rc == 0 {
                    for gtid in gtids {
                        inner.tasks_started.set(*gtid as usize);
                    }
                    debug!(node = %node_name, count = gtids.len(), "tasks started");
                } else {
                    // Tasks that never launched will never start or exit;
                    // account for them so the waits can terminate.
                    error!(
                        node = %node_name,
                        msg = ErrorCode::strerror(*rc),
                        "task launch failed"
                    );
                    inner.failed_nodes.push(node_name.clone());
                    self.mark_node_dead_locked(&mut inner, node_name);
                }
                drop(inner);
                self.cond.notify_waiters();
                None
            }
            MsgBody::TaskExit {
                return_code,
                gtids,
                ..
            } => {
                let mut inner = self.inner.lock().unwrap();
                for gtid in gtids {
                    debug!(gtid, code = return_code, "task done");
                    inner.tasks_exited.set(*gtid as usize);
                    inner.exit_codes[*gtid as usize] = Some(*return_code);
                }
                drop(inner);
                self.cond.notify_waiters();
                None
            }
            MsgBody::SrunNodeFail { nodelist, .. } => {
                let names = hostlist::expand(nodelist).unwrap_or_default();
                let mut inner = self.inner.lock().unwrap();
                for name in &names {
                    warn!(node = %name, "node failed");
                    self.mark_node_dead_locked(&mut inner, name);
                }
                drop(inner);
                self.cond.notify_waiters();
                None
            }
            MsgBody::SrunTimeout { .. } => {
                let mut inner = self.inner.lock().unwrap();
                inner.timed_out = true;
                inner.abort = true;
                drop(inner);
                error!("step reached its time limit");
                self.cond.notify_waiters();
                None
            }
            MsgBody::SrunJobComplete { .. } => {
                let mut inner = self.inner.lock().unwrap();
                inner.job_complete = true;
                inner.abort = true;
                drop(inner);
                self.cond.notify_waiters();
                None
            }
            MsgBody::TaskUserManagedIo { task_id } => {
                let mut inner = self.inner.lock().unwrap();
                if *task_id >= self.requested() {
                    error!(task_id, "user-managed io for task outside the step");
                } else {
                    inner.user_io_connected += 1;
                }
                drop(inner);
                self.cond.notify_waiters();
                None
            }
            MsgBody::PmiKvsPut { pairs } => {
                for pair in pairs {
                    pmi.put(&pair.kvs_name, &pair.key, &pair.value);
                }
                Some(MsgBody::Rc { rc: 0 })
            }
            MsgBody::PmiKvsGet { kvs_name, key, .. } => {
                let value = pmi.get(kvs_name, key);
                let rc = if value.is_some() {
                    0
                } else {
                    ErrorCode::InvalidJobId.as_u32()
                };
                Some(MsgBody::PmiKvsGetResponse { rc, value })
            }
            other => {
                warn!(msg_type = ?other.msg_type(), "spurious message");
                None
            }
        }
    }

    /// Every task owned by a dead or launch-failed node counts as started
    /// and exited: it never will do either for real.
    fn mark_node_dead_locked(&self, inner: &mut LaunchInner, node_name: &str) {
        let Some(idx) = self.layout.node_names.iter().position(|n| n == node_name) else {
            return;
        };
        for gtid in &self.layout.tids[idx] {
            inner.tasks_started.set(*gtid as usize);
            inner.tasks_exited.set(*gtid as usize);
        }
        if !inner.downed_nodes.contains(&idx) {
            inner.downed_nodes.push(idx);
        }
    }

    pub fn abort(&self) {
        self.inner.lock().unwrap().abort = true;
        self.cond.notify_waiters();
    }

    async fn kill_step(&self) {
        let env = Envelope::new(
            self.auth.clone(),
            MsgBody::KillJobStep {
                job_id: self.job_id,
                step_id: self.step_id,
                signal: 9,
            },
        );
        if let Err(err) =
            quarry_net::send_recv_one(&self.controller_addr, &env, self.msg_timeout).await
        {
            warn!(%err, "step kill not delivered");
        }
    }

    /// Block until every task started (and, in user-managed mode, every
    /// user socket connected). Failure means the launch was aborted.
    pub async fn wait_start(&self) -> Result<(), ErrorCode> {
        loop {
            let notified = self.cond.notified();
            tokio::pin!(notified);
            // Arm before checking so a signal between check and await is
            // not lost.
            notified.as_mut().enable();
            let (done, aborted, act) = {
                let mut inner = self.inner.lock().unwrap();
                let started = inner.tasks_started.count() as u32 == self.requested();
                let io_ready =
                    !self.user_managed_io || inner.user_io_connected >= self.requested();
                if inner.abort && !inner.abort_action_taken {
                    inner.abort_action_taken = true;
                    (false, true, true)
                } else {
                    (started && io_ready, inner.abort, false)
                }
            };
            if act {
                self.kill_step().await;
            }
            if aborted {
                return Err(ErrorCode::ConnectionAborted);
            }
            if done {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Block until every task exited. On abort, kill the step and allow it
    /// the drain grace; a second kill goes out if the grace expires.
    pub async fn wait_finish(&self) {
        let mut deadline: Option<tokio::time::Instant> = None;
        loop {
            let notified = self.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let (done, aborted, act) = {
                let mut inner = self.inner.lock().unwrap();
                let done = inner.tasks_exited.count() as u32 == self.requested();
                let act = inner.abort && !inner.abort_action_taken;
                if act {
                    inner.abort_action_taken = true;
                }
                (done, inner.abort, act)
            };
            if done {
                return;
            }
            if act {
                self.kill_step().await;
            }
            if aborted && deadline.is_none() {
                // One fixed grace window, however often the waiters wake.
                info!(
                    "step aborted; waiting up to {}s for tasks to finish",
                    ABORT_DRAIN.as_secs()
                );
                deadline = Some(tokio::time::Instant::now() + ABORT_DRAIN);
            }
            match (aborted, deadline) {
                (true, Some(when)) => {
                    if tokio::time::timeout_at(when, notified).await.is_err() {
                        error!("timed out waiting for the step to finish");
                        // The kill may have raced tasks still launching.
                        self.kill_step().await;
                        return;
                    }
                }
                _ => notified.await,
            }
        }
    }

    /// Host names with at least one active task: started but not exited.
    pub fn signal_targets(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for (idx, name) in self.layout.node_names.iter().enumerate() {
            let active = self.layout.tids[idx].iter().any(|gtid| {
                inner.tasks_started.test(*gtid as usize)
                    && !inner.tasks_exited.test(*gtid as usize)
            });
            if active {
                out.push(name.clone());
            }
        }
        out
    }

    /// Forward a signal to the nodes that still run tasks. Replies that
    /// race normal exit are ignored.
    pub async fn fwd_signal(&self, signo: u16) {
        let targets = self.signal_targets();
        if targets.is_empty() {
            debug!("no active tasks; nothing to signal");
            return;
        }
        info!(signal = signo, nodes = ?targets, "forwarding signal");
        let env = Envelope::new(
            self.auth.clone(),
            MsgBody::SignalTasks {
                job_id: self.job_id,
                step_id: self.step_id,
                signal: signo,
            },
        );
        let records = quarry_net::send_recv_msgs(
            &self.node_addrs,
            &targets,
            &env,
            self.fanout,
            self.msg_timeout,
        )
        .await;
        for rec in records {
            let rc = quarry_net::fanout::record_return_code(&rec);
            if rc == 0 {
                continue;
            }
            let ignorable = ErrorCode::from_u32(rc)
                .map(|c| c.ignorable_on_signal())
                .unwrap_or(false);
            if !ignorable {
                error!(node = %rec.node_name, msg = ErrorCode::strerror(rc), "signal failed");
            }
        }
    }

    /// Final client exit code: max task exit code, 128+signal encodes
    /// itself in the codes, 1 when any task failed to launch.
    pub fn exit_code(&self) -> i32 {
        let inner = self.inner.lock().unwrap();
        if !inner.failed_nodes.is_empty() {
            return 1;
        }
        inner
            .exit_codes
            .iter()
            .filter_map(|c| *c)
            .max()
            .unwrap_or(0) as i32
    }

}

/// Broadcast the launch payload over the forwarding tree and fold the
/// per-node outcomes into the state.
pub async fn launch_tasks(
    state: &Arc<LaunchState>,
    launch: quarry_proto::message::LaunchTasksMsg,
    client_host: &str,
) -> Result<(), ErrorCode> {
    let mut env = Envelope::new(state.auth.clone(), MsgBody::LaunchTasks(Box::new(launch)));
    env.orig_addr = client_host.to_string();
    let records = quarry_net::send_recv_msgs(
        &state.node_addrs,
        &state.layout.node_names,
        &env,
        state.fanout,
        state.msg_timeout,
    )
    .await;

    let mut delivered = 0usize;
    for rec in &records {
        let rc = quarry_net::fanout::record_return_code(rec);
        if rc == 0 {
            delivered += 1;
        } else {
            let body = MsgBody::LaunchTasksResponse {
                rc,
                node_name: rec.node_name.clone(),
                local_pids: Vec::new(),
                gtids: Vec::new(),
            };
            state.handle_msg(&body, &crate::pmi::KvsStore::default());
        }
    }
    if delivered == 0 {
        return Err(ErrorCode::ForwardFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmi::KvsStore;
    use quarry_core::layout::TaskDistribution;
    use quarry_proto::AuthKey;

    fn state(nodes: usize, tasks_per_node: u32) -> Arc<LaunchState> {
        let names: Vec<String> = (0..nodes).map(|i| format!("n{i}")).collect();
        let layout = StepLayout::build(
            names.clone(),
            vec![tasks_per_node; nodes],
            TaskDistribution::Block,
        )
        .unwrap();
        let key = AuthKey::from_bytes(b"k".to_vec());
        let cred = Credential::issue(
            &key,
            7,
            0,
            1000,
            1000,
            names.clone(),
            vec![tasks_per_node; nodes],
            0,
        );
        let auth = AuthToken::issue(&key, 1000, 1000);
        let addrs = names
            .iter()
            .map(|n| (n.clone(), "127.0.0.1:1".to_string()))
            .collect();
        LaunchState::new(
            7,
            0,
            layout,
            cred,
            auth,
            "127.0.0.1:1".into(),
            addrs,
            2,
            Duration::from_millis(200),
            false,
        )
    }

    fn pmi() -> KvsStore {
        KvsStore::default()
    }

    fn launch_response(node: &str, gtids: Vec<u32>) -> MsgBody {
        MsgBody::LaunchTasksResponse {
            rc: 0,
            node_name: node.into(),
            local_pids: gtids.iter().map(|g| 1000 + g).collect(),
            gtids,
        }
    }

    fn task_exit(gtids: Vec<u32>, code: u32) -> MsgBody {
        MsgBody::TaskExit {
            job_id: 7,
            step_id: 0,
            return_code: code,
            gtids,
        }
    }

    #[tokio::test]
    async fn two_node_four_task_block_launch() {
        // §8 scenario 1: block layout [[0,1],[2,3]]; four responses, four
        // exits, final code 0.
        let state = state(2, 2);
        assert_eq!(state.layout.tids, vec![vec![0, 1], vec![2, 3]]);

        state.handle_msg(&launch_response("n0", vec![0, 1]), &pmi());
        state.handle_msg(&launch_response("n1", vec![2, 3]), &pmi());
        state.wait_start().await.unwrap();

        state.handle_msg(&task_exit(vec![0, 1], 0), &pmi());
        state.handle_msg(&task_exit(vec![2, 3], 0), &pmi());
        state.wait_finish().await;
        assert_eq!(state.exit_code(), 0);
    }

    #[tokio::test]
    async fn signal_targets_skip_exited_nodes() {
        // §8 scenario 2: tids 0,1 exited; only n1 is signalled.
        let state = state(2, 2);
        state.handle_msg(&launch_response("n0", vec![0, 1]), &pmi());
        state.handle_msg(&launch_response("n1", vec![2, 3]), &pmi());
        state.handle_msg(&task_exit(vec![0, 1], 0), &pmi());
        assert_eq!(state.signal_targets(), vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn node_fail_accounts_tasks_both_ways() {
        // §8 scenario 3: 3 nodes × 1 task; n1 fails; its task shows as both
        // started and exited and the stdio plane learns about node index 1.
        let state = state(3, 1);
        state.handle_msg(&launch_response("n0", vec![0]), &pmi());
        state.handle_msg(&launch_response("n2", vec![2]), &pmi());
        state.handle_msg(
            &MsgBody::SrunNodeFail {
                job_id: 7,
                step_id: 0,
                nodelist: "n1".into(),
            },
            &pmi(),
        );

        state.with_inner(|inner| {
            assert!(inner.tasks_started.test(1));
            assert!(inner.tasks_exited.test(1));
            assert_eq!(inner.downed_nodes, vec![1]);
        });
        // Start accounting is complete even though n1 never responded.
        state.wait_start().await.unwrap();

        state.handle_msg(&task_exit(vec![0], 0), &pmi());
        state.handle_msg(&task_exit(vec![2], 0), &pmi());
        state.wait_finish().await;
    }

    #[tokio::test]
    async fn launch_failure_resolves_waits_and_exit_code() {
        let state = state(2, 1);
        state.handle_msg(&launch_response("n0", vec![0]), &pmi());
        state.handle_msg(
            &MsgBody::LaunchTasksResponse {
                rc: ErrorCode::CredVerify.as_u32(),
                node_name: "n1".into(),
                local_pids: vec![],
                gtids: vec![],
            },
            &pmi(),
        );
        state.wait_start().await.unwrap();
        state.handle_msg(&task_exit(vec![0], 0), &pmi());
        state.wait_finish().await;
        assert_eq!(state.exit_code(), 1);
    }

    #[tokio::test]
    async fn exit_code_is_max_of_tasks() {
        let state = state(1, 3);
        state.handle_msg(&launch_response("n0", vec![0, 1, 2]), &pmi());
        state.handle_msg(&task_exit(vec![0], 0), &pmi());
        state.handle_msg(&task_exit(vec![1], 143), &pmi()); // signalled
        state.handle_msg(&task_exit(vec![2], 2), &pmi());
        state.wait_finish().await;
        assert_eq!(state.exit_code(), 143);
    }

    #[tokio::test]
    async fn abort_during_wait_start_kills_once_and_fails() {
        let state = state(1, 1);
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_start().await })
        };
        tokio::task::yield_now().await;
        state.abort();
        let result = waiter.await.unwrap();
        assert!(result.is_err());
        state.with_inner(|inner| assert!(inner.abort_action_taken));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_wait_finish_gives_ten_seconds() {
        let state = state(1, 1);
        state.handle_msg(&launch_response("n0", vec![0]), &pmi());
        state.abort();
        let started = tokio::time::Instant::now();
        state.wait_finish().await;
        let waited = tokio::time::Instant::now() - started;
        // Paused time: the drain window elapses virtually.
        assert!(waited >= ABORT_DRAIN);
    }

    #[tokio::test]
    async fn pmi_round_trip_does_not_touch_bitmaps() {
        let state = state(1, 1);
        let store = pmi();
        let reply = state.handle_msg(
            &MsgBody::PmiKvsPut {
                pairs: vec![quarry_proto::message::KvsPair {
                    kvs_name: "kvs".into(),
                    key: "a".into(),
                    value: "1".into(),
                }],
            },
            &store,
        );
        assert_eq!(reply, Some(MsgBody::Rc { rc: 0 }));
        let reply = state.handle_msg(
            &MsgBody::PmiKvsGet {
                task_id: 0,
                kvs_name: "kvs".into(),
                key: "a".into(),
            },
            &store,
        );
        assert_eq!(
            reply,
            Some(MsgBody::PmiKvsGetResponse {
                rc: 0,
                value: Some("1".into())
            })
        );
        state.with_inner(|inner| {
            assert!(inner.tasks_started.is_empty());
            assert!(inner.tasks_exited.is_empty());
        });
    }

    #[test]
    fn port_estimate() {
        assert_eq!(estimate_nports(1), 1);
        assert_eq!(estimate_nports(48), 1);
        assert_eq!(estimate_nports(49), 2);
        assert_eq!(estimate_nports(0), 1);
    }

    #[tokio::test]
    async fn user_managed_io_gates_wait_start() {
        let names = vec!["n0".to_string()];
        let layout =
            StepLayout::build(names.clone(), vec![2], TaskDistribution::Block).unwrap();
        let key = AuthKey::from_bytes(b"k".to_vec());
        let cred = Credential::issue(&key, 7, 0, 1000, 1000, names.clone(), vec![2], 0);
        let auth = AuthToken::issue(&key, 1000, 1000);
        let state = LaunchState::new(
            7,
            0,
            layout,
            cred,
            auth,
            "127.0.0.1:1".into(),
            HashMap::new(),
            2,
            Duration::from_millis(100),
            true,
        );
        state.handle_msg(&launch_response("n0", vec![0, 1]), &pmi());
        state.handle_msg(&MsgBody::TaskUserManagedIo { task_id: 0 }, &pmi());

        // One socket missing: the wait must still block.
        let pending = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_start().await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        state.handle_msg(&MsgBody::TaskUserManagedIo { task_id: 1 }, &pmi());
        pending.await.unwrap().unwrap();
    }
}
