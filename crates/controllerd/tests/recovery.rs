//! Controller restart: snapshot, reload, reconcile.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow as _;
use chrono as _;
use clap as _;
use quarry_core as _;
use quarry_net as _;
use serde as _;
use serde_json as _;
use sha2 as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

use quarry_controllerd::acct::{AcctEvent, AcctFilter, AcctSink, FileAcctSink};
use quarry_controllerd::config::{ClusterConfig, NodeConfig, PartitionConfig, SharePolicy};
use quarry_controllerd::persist::{self, RecoverMode};
use quarry_controllerd::registry::job::JobState;
use quarry_controllerd::registry::node::BaseState;
use quarry_controllerd::sched;
use quarry_controllerd::select::{LinearSelect, SelectCapability};
use quarry_proto::codec::NO_VAL;
use quarry_proto::message::JobDescriptor;

fn tmpdir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("quarry-recovery-tests")
        .join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn config(nodes: usize, dir: &std::path::Path) -> ClusterConfig {
    ClusterConfig {
        cluster_name: "recovery".into(),
        control_addr: "127.0.0.1:16817".into(),
        auth_key: "30313233343536373839616263646566".into(),
        nodes: (0..nodes)
            .map(|i| NodeConfig {
                name: format!("n{i}"),
                addr: format!("127.0.0.1:{}", 18000 + i),
                cpus: 4,
                sockets: 1,
                cores: 4,
                threads: 1,
                real_mem_mb: 4096,
                tmp_disk_mb: 512,
                features: Vec::new(),
            })
            .collect(),
        partitions: vec![PartitionConfig {
            name: "batch".into(),
            nodes: format!("n[0-{}]", nodes - 1),
            default: true,
            hidden: false,
            root_only: false,
            up: true,
            max_time_min: Some(120),
            min_nodes_per_job: 1,
            max_nodes_per_job: None,
            shared: SharePolicy::Exclusive,
            allow_gids: Vec::new(),
        }],
        state_dir: dir.to_path_buf(),
        spool_dir: dir.join("spool"),
        acct_file: Some(dir.join("acct.jsonl")),
        fanout: 2,
        msg_timeout_ms: 1000,
        ping_timeout_sec: 60,
        down_timeout_sec: 300,
        min_job_age_sec: 300,
        save_interval_sec: 60,
        operator_uid: 0,
    }
}

fn descriptor(min_nodes: u32) -> JobDescriptor {
    JobDescriptor {
        name: Some("restartable".into()),
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
        features: Vec::new(),
        contiguous: false,
        shared: u16::MAX,
        priority: 10,
        time_limit_min: 60,
        immediate: false,
        account: None,
        dependency: None,
        work_dir: None,
        script: None,
    }
}

/// Snapshot reload with a downed node: the running job moves to
/// node-fail + completing with its end time stamped at reload, and the
/// accounting record lands once the job drains.
#[tokio::test]
async fn reload_with_downed_node_fails_the_job() {
    let dir = tmpdir("downed-node");
    let cfg = config(4, &dir);
    let select: Arc<dyn SelectCapability> = Arc::new(LinearSelect);
    let acct: Arc<dyn AcctSink> = Arc::new(FileAcctSink::new(dir.join("acct.jsonl")));

    // Before restart: job J runs on n0,n1 (including n3's sibling set).
    let job_id = {
        let regs = quarry_controllerd::registry::Registries::from_config(cfg.clone());
        {
            let mut nodes = regs.nodes.write().await;
            for i in 0..4 {
                nodes.get_mut(i).base = BaseState::Idle;
                nodes.get_mut(i).last_response = 100;
            }
        }
        let job_id = {
            let mut jobs = regs.jobs.write().await;
            jobs.submit(&descriptor(2), "batch".into(), 100).job_id
        };
        sched::schedule_pass(&regs, &select, &acct, 100).await;
        {
            let jobs = regs.jobs.read().await;
            assert_eq!(jobs.find(job_id).unwrap().state, JobState::Running);
        }
        persist::save_all(&cfg.state_dir, &regs).await.unwrap();
        job_id
    };

    // Restart at t=2000. n0 comes back marked down by the operator's
    // snapshot edit (simulating a crash while the controller was away).
    {
        // Rewrite node state with n0 down, as the pre-restart controller
        // would have if it saw the failure.
        let regs = persist::recover(cfg.clone(), RecoverMode::Full, 1500);
        {
            let mut nodes = regs.nodes.write().await;
            let idx = nodes.idx("n0").unwrap();
            nodes.set_down(idx, "power failure");
        }
        persist::save_all(&cfg.state_dir, &regs).await.unwrap();
    }

    let regs = persist::recover(cfg.clone(), RecoverMode::Full, 2000);
    {
        let jobs = regs.jobs.read().await;
        let job = jobs.find(job_id).unwrap();
        assert_eq!(job.state, JobState::NodeFail);
        assert!(job.completing);
        assert_eq!(job.end_time, 2000);
    }

    // Draining emits the completion record.
    sched::maintenance_pass(&regs, &select, &acct, 2100).await;
    {
        let jobs = regs.jobs.read().await;
        assert!(!jobs.find(job_id).unwrap().completing);
    }
    let records = acct
        .get_jobs(&AcctFilter {
            job_id: Some(job_id),
            ..Default::default()
        })
        .unwrap();
    assert!(records
        .iter()
        .any(|r| matches!(r.event, AcctEvent::JobComplete)));
}

/// The jobs-only mode replays jobs against fresh node state; the none mode
/// discards everything.
#[tokio::test]
async fn recover_mode_selection() {
    let dir = tmpdir("modes");
    let cfg = config(2, &dir);
    let select: Arc<dyn SelectCapability> = Arc::new(LinearSelect);
    let acct: Arc<dyn AcctSink> =
        Arc::new(quarry_controllerd::acct::NullAcctSink);

    let job_id = {
        let regs = quarry_controllerd::registry::Registries::from_config(cfg.clone());
        {
            let mut nodes = regs.nodes.write().await;
            for i in 0..2 {
                nodes.get_mut(i).base = BaseState::Idle;
                nodes.get_mut(i).last_response = 50;
            }
        }
        let job_id = {
            let mut jobs = regs.jobs.write().await;
            jobs.submit(&descriptor(1), "batch".into(), 50).job_id
        };
        sched::schedule_pass(&regs, &select, &acct, 60).await;
        persist::save_all(&cfg.state_dir, &regs).await.unwrap();
        job_id
    };

    let regs = persist::recover(cfg.clone(), RecoverMode::None, 100);
    assert!(regs.jobs.read().await.find(job_id).is_none());
    assert_eq!(
        regs.nodes.read().await.get(0).base,
        BaseState::Unknown
    );

    let regs = persist::recover(cfg.clone(), RecoverMode::Jobs, 100);
    {
        let jobs = regs.jobs.read().await;
        // Fresh nodes are unknown, so the replayed running job fails over.
        let job = jobs.find(job_id).unwrap();
        assert_eq!(job.state, JobState::Running);
        // Nodes not down: unknown is not down, job stays running.
        assert!(!job.completing);
    }

    let regs = persist::recover(cfg, RecoverMode::Full, 100);
    {
        let jobs = regs.jobs.read().await;
        assert_eq!(jobs.find(job_id).unwrap().state, JobState::Running);
        let nodes = regs.nodes.read().await;
        assert_eq!(nodes.get(0).base, BaseState::Allocated);
        assert_eq!(nodes.get(0).run_job_cnt, 1);
    }
}

/// Counter resync: run/no-share counts equal the number of running jobs
/// covering each node after recovery.
#[tokio::test]
async fn counters_resync_after_recovery() {
    let dir = tmpdir("counters");
    let cfg = config(3, &dir);
    let select: Arc<dyn SelectCapability> = Arc::new(LinearSelect);
    let acct: Arc<dyn AcctSink> =
        Arc::new(quarry_controllerd::acct::NullAcctSink);

    {
        let regs = quarry_controllerd::registry::Registries::from_config(cfg.clone());
        {
            let mut nodes = regs.nodes.write().await;
            for i in 0..3 {
                nodes.get_mut(i).base = BaseState::Idle;
                nodes.get_mut(i).last_response = 10;
            }
        }
        {
            let mut jobs = regs.jobs.write().await;
            jobs.submit(&descriptor(1), "batch".into(), 10);
            jobs.submit(&descriptor(2), "batch".into(), 11);
        }
        sched::schedule_pass(&regs, &select, &acct, 20).await;
        persist::save_all(&cfg.state_dir, &regs).await.unwrap();
    }

    let regs = persist::recover(cfg, RecoverMode::Full, 100);
    let nodes = regs.nodes.read().await;
    let per_node: Vec<u32> = (0..3).map(|i| nodes.get(i).run_job_cnt).collect();
    assert_eq!(per_node, vec![1, 1, 1]);
    // Exclusive partition: every allocation is no-share.
    assert!((0..3).all(|i| nodes.get(i).no_share_job_cnt == 1));
}
