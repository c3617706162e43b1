//! Cluster configuration.
//!
//! One JSON document shared by every role, found through `--config` or the
//! `QUARRY_CONF` environment variable. The controller is the only writer of
//! derived state; the file itself is read-only at runtime and re-read on
//! reconfigure.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use quarry_proto::AuthKey;

pub const CONF_ENV: &str = "QUARRY_CONF";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// `host:port` of the node daemon.
    pub addr: String,
    #[serde(default = "one_u16")]
    pub cpus: u16,
    #[serde(default = "one_u16")]
    pub sockets: u16,
    #[serde(default = "one_u16")]
    pub cores: u16,
    #[serde(default = "one_u16")]
    pub threads: u16,
    #[serde(default)]
    pub real_mem_mb: u32,
    #[serde(default)]
    pub tmp_disk_mb: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

fn one_u16() -> u16 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharePolicy {
    /// Whole nodes per job.
    Exclusive,
    /// Sharing allowed when the job asks for it.
    Yes,
    /// Sharing imposed regardless of the request.
    Force,
}

impl SharePolicy {
    pub fn as_wire(self) -> u16 {
        match self {
            SharePolicy::Exclusive => 0,
            SharePolicy::Yes => 1,
            SharePolicy::Force => 2,
        }
    }

    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            0 => Some(SharePolicy::Exclusive),
            1 => Some(SharePolicy::Yes),
            2 => Some(SharePolicy::Force),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    /// Host pattern, e.g. `"n[0-7]"`.
    pub nodes: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub root_only: bool,
    #[serde(default = "default_true")]
    pub up: bool,
    /// Minutes; absent means unlimited.
    #[serde(default)]
    pub max_time_min: Option<u32>,
    #[serde(default = "one_u32")]
    pub min_nodes_per_job: u32,
    #[serde(default)]
    pub max_nodes_per_job: Option<u32>,
    #[serde(default = "default_shared")]
    pub shared: SharePolicy,
    /// Empty means every group.
    #[serde(default)]
    pub allow_gids: Vec<u32>,
}

fn default_true() -> bool {
    true
}

fn one_u32() -> u32 {
    1
}

fn default_shared() -> SharePolicy {
    SharePolicy::Exclusive
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    /// `host:port` the controller listens on.
    pub control_addr: String,
    /// Hex-encoded cluster signing key.
    pub auth_key: String,
    pub nodes: Vec<NodeConfig>,
    pub partitions: Vec<PartitionConfig>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// JSON-lines accounting file; absent discards records.
    #[serde(default)]
    pub acct_file: Option<PathBuf>,
    #[serde(default = "default_fanout")]
    pub fanout: u16,
    #[serde(default = "default_msg_timeout_ms")]
    pub msg_timeout_ms: u32,
    /// Seconds without a ping before a node is flagged not-responding.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_sec: u32,
    /// Seconds without a ping before a node is marked down.
    #[serde(default = "default_down_timeout")]
    pub down_timeout_sec: u32,
    /// Seconds a finished job lingers before it is purged.
    #[serde(default = "default_min_job_age")]
    pub min_job_age_sec: u32,
    #[serde(default = "default_save_interval")]
    pub save_interval_sec: u32,
    /// Uid allowed operator actions besides root.
    #[serde(default)]
    pub operator_uid: u32,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/spool/quarry/state")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/quarry")
}

fn default_fanout() -> u16 {
    8
}

fn default_msg_timeout_ms() -> u32 {
    10_000
}

fn default_ping_timeout() -> u32 {
    60
}

fn default_down_timeout() -> u32 {
    300
}

fn default_min_job_age() -> u32 {
    300
}

fn default_save_interval() -> u32 {
    60
}

impl ClusterConfig {
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(
                std::env::var_os(CONF_ENV)
                    .with_context(|| format!("no --config given and {CONF_ENV} not set"))?,
            ),
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("config defines no nodes");
        }
        self.auth_key()?;
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                anyhow::bail!("duplicate node name {:?}", node.name);
            }
        }
        for part in &self.partitions {
            quarry_core::hostlist::expand(&part.nodes)
                .with_context(|| format!("partition {:?} node pattern", part.name))?;
        }
        Ok(())
    }

    pub fn auth_key(&self) -> anyhow::Result<AuthKey> {
        AuthKey::from_hex(self.auth_key.trim()).context("auth_key is not valid hex")
    }

    pub fn node_addr(&self, name: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.addr.as_str())
    }

    pub fn msg_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.msg_timeout_ms as u64)
    }
}

#[cfg(test)]
pub(crate) fn test_config(nodes: usize) -> ClusterConfig {
    ClusterConfig {
        cluster_name: "testcluster".into(),
        control_addr: "127.0.0.1:16817".into(),
        auth_key: "30313233343536373839616263646566".into(),
        nodes: (0..nodes)
            .map(|i| NodeConfig {
                name: format!("n{i}"),
                addr: format!("127.0.0.1:{}", 17000 + i),
                cpus: 4,
                sockets: 1,
                cores: 4,
                threads: 1,
                real_mem_mb: 8192,
                tmp_disk_mb: 1024,
                features: if i % 2 == 0 { vec!["even".into()] } else { vec![] },
            })
            .collect(),
        partitions: vec![PartitionConfig {
            name: "batch".into(),
            nodes: if nodes > 1 {
                format!("n[0-{}]", nodes - 1)
            } else {
                "n0".into()
            },
            default: true,
            hidden: false,
            root_only: false,
            up: true,
            max_time_min: Some(600),
            min_nodes_per_job: 1,
            max_nodes_per_job: None,
            shared: SharePolicy::Exclusive,
            allow_gids: Vec::new(),
        }],
        state_dir: std::env::temp_dir().join("quarry-test-state"),
        spool_dir: std::env::temp_dir().join("quarry-test-spool"),
        acct_file: None,
        fanout: 2,
        msg_timeout_ms: 2000,
        ping_timeout_sec: 60,
        down_timeout_sec: 300,
        min_job_age_sec: 300,
        save_interval_sec: 60,
        operator_uid: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let cfg = test_config(4);
        let raw = serde_json::to_string_pretty(&cfg).unwrap();
        let back: ClusterConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.nodes.len(), 4);
        assert_eq!(back.partitions[0].name, "batch");
        back.validate().unwrap();
    }

    #[test]
    fn bad_key_rejected() {
        let mut cfg = test_config(1);
        cfg.auth_key = "not-hex".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_partition_pattern_rejected() {
        let mut cfg = test_config(1);
        cfg.partitions[0].nodes = "n[".into();
        assert!(cfg.validate().is_err());
    }
}
