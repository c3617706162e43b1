//! Node registry.
//!
//! One record per configured compute host. Exactly one base state at a time;
//! flags qualify it. The counters tie node release to job lifecycle: a node
//! returns to idle only when both its running and completing job counts hit
//! zero.

use std::collections::HashMap;

use quarry_core::Bitmap;

use crate::config::{ClusterConfig, NodeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseState {
    Unknown,
    Idle,
    Allocated,
    Down,
}

impl BaseState {
    pub fn as_wire(self) -> u16 {
        match self {
            BaseState::Unknown => 0,
            BaseState::Idle => 1,
            BaseState::Allocated => 2,
            BaseState::Down => 3,
        }
    }

    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            0 => Some(BaseState::Unknown),
            1 => Some(BaseState::Idle),
            2 => Some(BaseState::Allocated),
            3 => Some(BaseState::Down),
            _ => None,
        }
    }
}

pub const NODE_DRAINING: u16 = 0x0001;
pub const NODE_NOT_RESPONDING: u16 = 0x0002;
pub const NODE_COMPLETING: u16 = 0x0004;

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub addr: String,
    pub cpus: u16,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub real_mem_mb: u32,
    pub tmp_disk_mb: u32,
    pub features: Vec<String>,
    pub base: BaseState,
    pub flags: u16,
    pub last_response: i64,
    pub reason: Option<String>,
    pub run_job_cnt: u32,
    pub comp_job_cnt: u32,
    pub no_share_job_cnt: u32,
}

impl NodeRecord {
    fn fresh(cfg: &NodeConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            addr: cfg.addr.clone(),
            cpus: cfg.cpus,
            sockets: cfg.sockets,
            cores: cfg.cores,
            threads: cfg.threads,
            real_mem_mb: cfg.real_mem_mb,
            tmp_disk_mb: cfg.tmp_disk_mb,
            features: cfg.features.clone(),
            base: BaseState::Unknown,
            flags: 0,
            last_response: 0,
            reason: None,
            run_job_cnt: 0,
            comp_job_cnt: 0,
            no_share_job_cnt: 0,
        }
    }

    /// Adopt new static attributes while keeping dynamic state.
    fn adopt_config(&mut self, cfg: &NodeConfig) {
        self.addr = cfg.addr.clone();
        self.cpus = cfg.cpus;
        self.sockets = cfg.sockets;
        self.cores = cfg.cores;
        self.threads = cfg.threads;
        self.real_mem_mb = cfg.real_mem_mb;
        self.tmp_disk_mb = cfg.tmp_disk_mb;
        self.features = cfg.features.clone();
    }

    pub fn usable(&self) -> bool {
        matches!(self.base, BaseState::Idle | BaseState::Allocated)
            && self.flags & (NODE_DRAINING | NODE_NOT_RESPONDING) == 0
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug)]
pub struct NodeRegistry {
    records: Vec<NodeRecord>,
    by_name: HashMap<String, usize>,
}

impl NodeRegistry {
    pub fn from_config(cfg: &ClusterConfig) -> Self {
        let records: Vec<NodeRecord> = cfg.nodes.iter().map(NodeRecord::fresh).collect();
        let by_name = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        Self { records, by_name }
    }

    /// Reconcile against a freshly loaded configuration: configured nodes
    /// missing from the registry start fresh, registry nodes missing from
    /// the configuration are dropped, survivors adopt the new attributes.
    /// Indices shift; partition bitmaps must be rebuilt afterwards.
    pub fn reconcile(&mut self, cfg: &ClusterConfig) {
        let mut records = Vec::with_capacity(cfg.nodes.len());
        for nc in &cfg.nodes {
            match self.by_name.get(&nc.name) {
                Some(old_idx) => {
                    let mut rec = self.records[*old_idx].clone();
                    rec.adopt_config(nc);
                    records.push(rec);
                }
                None => records.push(NodeRecord::fresh(nc)),
            }
        }
        self.records = records;
        self.by_name = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn idx(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, idx: usize) -> &NodeRecord {
        &self.records[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut NodeRecord {
        &mut self.records[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeRecord> {
        self.records.iter_mut()
    }

    pub fn names_for(&self, bitmap: &Bitmap) -> Vec<String> {
        bitmap.iter_set().map(|i| self.records[i].name.clone()).collect()
    }

    pub fn addr_map(&self) -> HashMap<String, String> {
        self.records
            .iter()
            .map(|r| (r.name.clone(), r.addr.clone()))
            .collect()
    }

    /// Nodes a scheduler pass may consider.
    pub fn usable_bitmap(&self) -> Bitmap {
        let mut bm = Bitmap::new(self.records.len());
        for (i, rec) in self.records.iter().enumerate() {
            if rec.usable() {
                bm.set(i);
            }
        }
        bm
    }

    pub fn register(&mut self, info: &quarry_proto::message::NodeRegInfo, now: i64) -> bool {
        let Some(idx) = self.idx(&info.node_name) else {
            return false;
        };
        let rec = &mut self.records[idx];
        rec.addr = info.addr.clone();
        rec.cpus = info.cpus;
        rec.sockets = info.sockets;
        rec.cores = info.cores;
        rec.threads = info.threads;
        rec.real_mem_mb = info.real_mem_mb;
        rec.tmp_disk_mb = info.tmp_disk_mb;
        if !info.features.is_empty() {
            rec.features = info.features.clone();
        }
        rec.last_response = now;
        rec.flags &= !NODE_NOT_RESPONDING;
        if matches!(rec.base, BaseState::Unknown | BaseState::Down) {
            rec.base = BaseState::Idle;
            rec.reason = None;
        }
        true
    }

    pub fn ping(&mut self, name: &str, now: i64) -> bool {
        let Some(idx) = self.idx(name) else {
            return false;
        };
        let rec = &mut self.records[idx];
        rec.last_response = now;
        rec.flags &= !NODE_NOT_RESPONDING;
        true
    }

    /// Flag silent nodes, then down them. Returns indices that went down on
    /// this sweep.
    pub fn sweep_responses(&mut self, now: i64, ping_to: i64, down_to: i64) -> Vec<usize> {
        let mut newly_down = Vec::new();
        for (idx, rec) in self.records.iter_mut().enumerate() {
            if rec.base == BaseState::Down || rec.last_response == 0 {
                continue;
            }
            let silent = now - rec.last_response;
            if silent > down_to {
                rec.base = BaseState::Down;
                rec.reason = Some("not responding".to_string());
                newly_down.push(idx);
            } else if silent > ping_to {
                rec.flags |= NODE_NOT_RESPONDING;
            }
        }
        newly_down
    }

    pub fn set_down(&mut self, idx: usize, reason: &str) {
        let rec = &mut self.records[idx];
        rec.base = BaseState::Down;
        rec.reason = Some(reason.to_string());
    }

    pub fn allocate_job(&mut self, bitmap: &Bitmap, no_share: bool) {
        for idx in bitmap.iter_set() {
            let rec = &mut self.records[idx];
            rec.base = BaseState::Allocated;
            rec.run_job_cnt += 1;
            if no_share {
                rec.no_share_job_cnt += 1;
            }
        }
    }

    /// A job left running state; its nodes begin draining.
    pub fn job_completing(&mut self, bitmap: &Bitmap, no_share: bool) {
        for idx in bitmap.iter_set() {
            let rec = &mut self.records[idx];
            rec.run_job_cnt = rec.run_job_cnt.saturating_sub(1);
            rec.comp_job_cnt += 1;
            rec.flags |= NODE_COMPLETING;
            if no_share {
                rec.no_share_job_cnt = rec.no_share_job_cnt.saturating_sub(1);
            }
        }
    }

    /// The job's resources are fully drained.
    pub fn job_done(&mut self, bitmap: &Bitmap) {
        for idx in bitmap.iter_set() {
            let rec = &mut self.records[idx];
            rec.comp_job_cnt = rec.comp_job_cnt.saturating_sub(1);
            if rec.comp_job_cnt == 0 {
                rec.flags &= !NODE_COMPLETING;
            }
            if rec.run_job_cnt == 0
                && rec.comp_job_cnt == 0
                && rec.base == BaseState::Allocated
            {
                rec.base = BaseState::Idle;
            }
        }
    }

    /// Zero the job counters and recompute them from the given running /
    /// completing allocations (recovery resync).
    pub fn resync_counters<'a, I, J>(&mut self, running: I, completing: J)
    where
        I: Iterator<Item = (&'a Bitmap, bool)>,
        J: Iterator<Item = &'a Bitmap>,
    {
        for rec in &mut self.records {
            rec.run_job_cnt = 0;
            rec.comp_job_cnt = 0;
            rec.no_share_job_cnt = 0;
            rec.flags &= !NODE_COMPLETING;
            if rec.base == BaseState::Allocated {
                rec.base = BaseState::Idle;
            }
        }
        for (bm, no_share) in running {
            for idx in bm.iter_set() {
                if idx >= self.records.len() {
                    continue;
                }
                let rec = &mut self.records[idx];
                rec.run_job_cnt += 1;
                if no_share {
                    rec.no_share_job_cnt += 1;
                }
                if rec.base == BaseState::Idle {
                    rec.base = BaseState::Allocated;
                }
            }
        }
        for bm in completing {
            for idx in bm.iter_set() {
                if idx >= self.records.len() {
                    continue;
                }
                let rec = &mut self.records[idx];
                rec.comp_job_cnt += 1;
                rec.flags |= NODE_COMPLETING;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn fresh_nodes_are_unknown() {
        let reg = NodeRegistry::from_config(&test_config(3));
        assert_eq!(reg.len(), 3);
        assert!(reg.iter().all(|r| r.base == BaseState::Unknown));
        assert!(reg.usable_bitmap().is_empty());
    }

    #[test]
    fn register_brings_node_up() {
        let mut reg = NodeRegistry::from_config(&test_config(2));
        let info = quarry_proto::message::NodeRegInfo {
            node_name: "n0".into(),
            addr: "127.0.0.1:9999".into(),
            cpus: 8,
            sockets: 2,
            cores: 4,
            threads: 1,
            real_mem_mb: 16384,
            tmp_disk_mb: 2048,
            features: vec![],
        };
        assert!(reg.register(&info, 100));
        let rec = reg.get(reg.idx("n0").unwrap());
        assert_eq!(rec.base, BaseState::Idle);
        assert_eq!(rec.cpus, 8);
        assert_eq!(rec.addr, "127.0.0.1:9999");
        assert_eq!(reg.usable_bitmap().count(), 1);
    }

    #[test]
    fn allocation_counters() {
        let mut reg = NodeRegistry::from_config(&test_config(3));
        for name in ["n0", "n1", "n2"] {
            reg.ping(name, 1);
            let i = reg.idx(name).unwrap();
            reg.get_mut(i).base = BaseState::Idle;
        }
        let mut bm = Bitmap::new(3);
        bm.set(0);
        bm.set(1);
        reg.allocate_job(&bm, true);
        assert_eq!(reg.get(0).base, BaseState::Allocated);
        assert_eq!(reg.get(0).run_job_cnt, 1);
        assert_eq!(reg.get(0).no_share_job_cnt, 1);
        assert_eq!(reg.get(2).run_job_cnt, 0);

        reg.job_completing(&bm, true);
        assert_eq!(reg.get(0).run_job_cnt, 0);
        assert_eq!(reg.get(0).comp_job_cnt, 1);
        assert!(reg.get(0).has_flag(NODE_COMPLETING));

        reg.job_done(&bm);
        assert_eq!(reg.get(0).comp_job_cnt, 0);
        assert_eq!(reg.get(0).base, BaseState::Idle);
        assert!(!reg.get(0).has_flag(NODE_COMPLETING));
    }

    #[test]
    fn response_sweep_escalates() {
        let mut reg = NodeRegistry::from_config(&test_config(1));
        reg.ping("n0", 100);
        reg.get_mut(0).base = BaseState::Idle;

        assert!(reg.sweep_responses(150, 60, 300).is_empty());
        assert!(!reg.get(0).has_flag(NODE_NOT_RESPONDING));

        assert!(reg.sweep_responses(200, 60, 300).is_empty());
        assert!(reg.get(0).has_flag(NODE_NOT_RESPONDING));

        let down = reg.sweep_responses(500, 60, 300);
        assert_eq!(down, vec![0]);
        assert_eq!(reg.get(0).base, BaseState::Down);
        assert_eq!(reg.get(0).reason.as_deref(), Some("not responding"));
    }

    #[test]
    fn reconcile_drops_and_adds() {
        let mut cfg = test_config(2);
        let mut reg = NodeRegistry::from_config(&cfg);
        reg.ping("n1", 50);
        reg.get_mut(1).base = BaseState::Idle;

        cfg.nodes.remove(0); // drop n0
        cfg.nodes.push(crate::config::NodeConfig {
            name: "n9".into(),
            addr: "127.0.0.1:17999".into(),
            cpus: 2,
            sockets: 1,
            cores: 2,
            threads: 1,
            real_mem_mb: 1024,
            tmp_disk_mb: 0,
            features: vec![],
        });
        reg.reconcile(&cfg);

        assert_eq!(reg.len(), 2);
        assert!(reg.idx("n0").is_none());
        assert_eq!(reg.get(reg.idx("n1").unwrap()).base, BaseState::Idle);
        assert_eq!(reg.get(reg.idx("n9").unwrap()).base, BaseState::Unknown);
    }

    #[test]
    fn counter_resync() {
        let mut reg = NodeRegistry::from_config(&test_config(3));
        for i in 0..3 {
            reg.get_mut(i).base = BaseState::Idle;
        }
        let mut run_bm = Bitmap::new(3);
        run_bm.set(0);
        run_bm.set(1);
        let mut comp_bm = Bitmap::new(3);
        comp_bm.set(2);
        reg.resync_counters(
            std::iter::once((&run_bm, true)),
            std::iter::once(&comp_bm),
        );
        assert_eq!(reg.get(0).run_job_cnt, 1);
        assert_eq!(reg.get(0).no_share_job_cnt, 1);
        assert_eq!(reg.get(0).base, BaseState::Allocated);
        assert_eq!(reg.get(2).comp_job_cnt, 1);
        assert!(reg.get(2).has_flag(NODE_COMPLETING));
    }
}
