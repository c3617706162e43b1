//! Controller state registries.
//!
//! All mutable cluster state lives behind one context value handed to every
//! RPC handler. Lock order when more than one registry is needed:
//! config → partition → job → node. Never acquire in any other order.

pub mod job;
pub mod node;
pub mod part;

use tokio::sync::RwLock;

use crate::config::ClusterConfig;

pub use job::{JobRecord, JobRegistry, JobState, PendReason, StepRecord};
pub use node::{BaseState, NodeRecord, NodeRegistry, NODE_COMPLETING, NODE_DRAINING, NODE_NOT_RESPONDING};
pub use part::{PartRegistry, Partition};

pub struct Registries {
    pub config: RwLock<ClusterConfig>,
    pub parts: RwLock<PartRegistry>,
    pub jobs: RwLock<JobRegistry>,
    pub nodes: RwLock<NodeRegistry>,
}

impl Registries {
    pub fn from_config(cfg: ClusterConfig) -> Self {
        let nodes = NodeRegistry::from_config(&cfg);
        let parts = PartRegistry::from_config(&cfg, &nodes);
        Self {
            config: RwLock::new(cfg),
            parts: RwLock::new(parts),
            jobs: RwLock::new(JobRegistry::new()),
            nodes: RwLock::new(nodes),
        }
    }
}
