//! Partition registry.
//!
//! A partition is a named pool of nodes plus policy. The bitmap over the
//! node table is canonical; the host pattern is its serialization and the
//! totals are recomputed whenever membership changes.

use quarry_core::{hostlist, Bitmap};

use crate::config::{ClusterConfig, PartitionConfig, SharePolicy};
use crate::registry::node::NodeRegistry;

#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub node_pattern: String,
    pub node_bitmap: Bitmap,
    pub default: bool,
    pub hidden: bool,
    pub root_only: bool,
    pub up: bool,
    pub max_time_min: Option<u32>,
    pub min_nodes_per_job: u32,
    pub max_nodes_per_job: Option<u32>,
    pub shared: SharePolicy,
    pub allow_gids: Vec<u32>,
    pub total_nodes: u32,
    pub total_cpus: u32,
}

impl Partition {
    fn build(cfg: &PartitionConfig, nodes: &NodeRegistry) -> Self {
        let mut bitmap = Bitmap::new(nodes.len());
        let mut total_cpus = 0u32;
        if let Ok(names) = hostlist::expand(&cfg.nodes) {
            for name in names {
                if let Some(idx) = nodes.idx(&name) {
                    bitmap.set(idx);
                    total_cpus += nodes.get(idx).cpus as u32;
                }
            }
        }
        Self {
            name: cfg.name.clone(),
            node_pattern: cfg.nodes.clone(),
            total_nodes: bitmap.count() as u32,
            node_bitmap: bitmap,
            default: cfg.default,
            hidden: cfg.hidden,
            root_only: cfg.root_only,
            up: cfg.up,
            max_time_min: cfg.max_time_min,
            min_nodes_per_job: cfg.min_nodes_per_job,
            max_nodes_per_job: cfg.max_nodes_per_job,
            shared: cfg.shared,
            allow_gids: cfg.allow_gids.clone(),
            total_cpus,
        }
    }

    pub fn allows_gid(&self, gid: u32) -> bool {
        self.allow_gids.is_empty() || self.allow_gids.contains(&gid)
    }
}

#[derive(Debug)]
pub struct PartRegistry {
    parts: Vec<Partition>,
}

impl PartRegistry {
    pub fn from_config(cfg: &ClusterConfig, nodes: &NodeRegistry) -> Self {
        Self {
            parts: cfg
                .partitions
                .iter()
                .map(|p| Partition::build(p, nodes))
                .collect(),
        }
    }

    /// Recompute membership bitmaps after the node table changed shape.
    pub fn rebuild(&mut self, cfg: &ClusterConfig, nodes: &NodeRegistry) {
        *self = Self::from_config(cfg, nodes);
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.parts.iter().find(|p| p.name == name)
    }

    pub fn default_part(&self) -> Option<&Partition> {
        self.parts.iter().find(|p| p.default).or(self.parts.first())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.parts.iter()
    }

    pub fn set_up(&mut self, name: &str, up: bool) -> bool {
        match self.parts.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                p.up = up;
                true
            }
            None => false,
        }
    }

    /// Recovery: only the dynamic up/down flag survives a restart; the
    /// configuration stays canonical for membership and policy.
    pub fn restore_up_flags(&mut self, up_by_name: &std::collections::HashMap<String, bool>) {
        for part in &mut self.parts {
            if let Some(up) = up_by_name.get(&part.name) {
                part.up = *up;
            }
        }
    }
}
