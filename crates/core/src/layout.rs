//! Step layout and task distribution.
//!
//! A layout fixes, for one step, the ordered node list, the per-node task
//! counts, and the global task id matrix `tids[node][slot]`. The controller
//! computes per-node counts when it creates the step; the client fills in
//! global ids under the requested distribution policy before launching.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributionError {
    #[error("step has zero tasks")]
    ZeroTasks,
    #[error("step has zero nodes")]
    ZeroNodes,
    #[error("plane size must be nonzero")]
    ZeroPlane,
    #[error("task counts sum to {got}, expected {want}")]
    CountMismatch { got: u32, want: u32 },
}

/// Task-to-node distribution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDistribution {
    /// Fill each node's slots before moving to the next.
    Block,
    /// Deal ids round-robin across nodes in layers.
    Cyclic,
    /// Blocks of `plane_size` per node in turn, repeating until placed.
    Plane(u16),
}

impl TaskDistribution {
    pub fn as_wire(self) -> (u16, u16) {
        match self {
            TaskDistribution::Block => (0, 0),
            TaskDistribution::Cyclic => (1, 0),
            TaskDistribution::Plane(size) => (2, size),
        }
    }

    pub fn from_wire(kind: u16, plane: u16) -> Option<Self> {
        match kind {
            0 => Some(TaskDistribution::Block),
            1 => Some(TaskDistribution::Cyclic),
            2 => Some(TaskDistribution::Plane(plane)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLayout {
    pub node_names: Vec<String>,
    /// Task count per node, same order as `node_names`.
    pub tasks: Vec<u32>,
    /// Global task ids per node, `tids[i].len() == tasks[i]`.
    pub tids: Vec<Vec<u32>>,
    pub task_cnt: u32,
}

impl StepLayout {
    /// Build a layout by distributing `task_cnt` global ids over nodes with
    /// the given per-node counts.
    pub fn build(
        node_names: Vec<String>,
        tasks: Vec<u32>,
        dist: TaskDistribution,
    ) -> Result<Self, DistributionError> {
        if node_names.is_empty() {
            return Err(DistributionError::ZeroNodes);
        }
        let task_cnt: u32 = tasks.iter().sum();
        if task_cnt == 0 {
            return Err(DistributionError::ZeroTasks);
        }
        debug_assert_eq!(node_names.len(), tasks.len());

        let tids = match dist {
            TaskDistribution::Block => distribute_block(&tasks),
            TaskDistribution::Cyclic => distribute_cyclic(&tasks),
            TaskDistribution::Plane(0) => return Err(DistributionError::ZeroPlane),
            TaskDistribution::Plane(size) => distribute_plane(&tasks, size as u32),
        };

        let layout = Self {
            node_names,
            tasks,
            tids,
            task_cnt,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn node_cnt(&self) -> usize {
        self.node_names.len()
    }

    /// Node index owning a global task id.
    pub fn host_of(&self, gtid: u32) -> Option<usize> {
        self.tids
            .iter()
            .position(|node_tids| node_tids.contains(&gtid))
    }

    /// Local slot of a global task id on its node.
    pub fn local_id(&self, gtid: u32) -> Option<(usize, usize)> {
        for (node, node_tids) in self.tids.iter().enumerate() {
            if let Some(slot) = node_tids.iter().position(|t| *t == gtid) {
                return Some((node, slot));
            }
        }
        None
    }

    fn validate(&self) -> Result<(), DistributionError> {
        let placed: u32 = self.tids.iter().map(|t| t.len() as u32).sum();
        if placed != self.task_cnt {
            return Err(DistributionError::CountMismatch {
                got: placed,
                want: self.task_cnt,
            });
        }
        for (node_tids, count) in self.tids.iter().zip(&self.tasks) {
            if node_tids.len() as u32 != *count {
                return Err(DistributionError::CountMismatch {
                    got: node_tids.len() as u32,
                    want: *count,
                });
            }
        }
        Ok(())
    }
}

fn distribute_block(tasks: &[u32]) -> Vec<Vec<u32>> {
    let mut tid = 0;
    tasks
        .iter()
        .map(|count| {
            let node_tids: Vec<u32> = (tid..tid + count).collect();
            tid += count;
            node_tids
        })
        .collect()
}

fn distribute_cyclic(tasks: &[u32]) -> Vec<Vec<u32>> {
    let mut tids: Vec<Vec<u32>> = tasks.iter().map(|c| Vec::with_capacity(*c as usize)).collect();
    let total: u32 = tasks.iter().sum();
    let mut tid = 0;
    let mut layer = 0;
    while tid < total {
        for (i, count) in tasks.iter().enumerate() {
            // A node drops out of the rotation once its slots are filled.
            if *count > layer {
                tids[i].push(tid);
                tid += 1;
            }
        }
        layer += 1;
    }
    tids
}

fn distribute_plane(tasks: &[u32], plane: u32) -> Vec<Vec<u32>> {
    let mut tids: Vec<Vec<u32>> = tasks.iter().map(|c| Vec::with_capacity(*c as usize)).collect();
    let total: u32 = tasks.iter().sum();
    let mut tid = 0;
    while tid < total {
        for (i, count) in tasks.iter().enumerate() {
            let mut placed = 0;
            while placed < plane && (tids[i].len() as u32) < *count && tid < total {
                tids[i].push(tid);
                tid += 1;
                placed += 1;
            }
        }
    }
    tids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("n{i}")).collect()
    }

    fn assert_exactly_once(layout: &StepLayout) {
        let mut seen = vec![false; layout.task_cnt as usize];
        for node_tids in &layout.tids {
            for tid in node_tids {
                assert!(!seen[*tid as usize], "tid {tid} placed twice");
                seen[*tid as usize] = true;
            }
        }
        assert!(seen.iter().all(|s| *s), "some tid never placed");
    }

    #[test]
    fn block_two_nodes_four_tasks() {
        let layout =
            StepLayout::build(names(2), vec![2, 2], TaskDistribution::Block).unwrap();
        assert_eq!(layout.tids, vec![vec![0, 1], vec![2, 3]]);
        assert_exactly_once(&layout);
    }

    #[test]
    fn cyclic_even() {
        let layout =
            StepLayout::build(names(2), vec![2, 2], TaskDistribution::Cyclic).unwrap();
        assert_eq!(layout.tids, vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn cyclic_uneven_skips_exhausted_nodes() {
        // Layer 2 must skip node 1 (only 1 slot); no tid is dropped.
        let layout =
            StepLayout::build(names(3), vec![3, 1, 2], TaskDistribution::Cyclic).unwrap();
        assert_eq!(layout.tids, vec![vec![0, 3, 5], vec![1], vec![2, 4]]);
        assert_exactly_once(&layout);
    }

    #[test]
    fn plane_fills_in_blocks() {
        let layout =
            StepLayout::build(names(2), vec![4, 2], TaskDistribution::Plane(2)).unwrap();
        assert_eq!(layout.tids, vec![vec![0, 1, 4, 5], vec![2, 3]]);
        assert_exactly_once(&layout);
    }

    #[test]
    fn plane_one_is_cyclic() {
        let a = StepLayout::build(names(3), vec![2, 2, 2], TaskDistribution::Plane(1)).unwrap();
        let b = StepLayout::build(names(3), vec![2, 2, 2], TaskDistribution::Cyclic).unwrap();
        assert_eq!(a.tids, b.tids);
    }

    #[test]
    fn single_task_many_nodes() {
        for dist in [TaskDistribution::Block, TaskDistribution::Cyclic] {
            let layout =
                StepLayout::build(names(4), vec![1, 0, 0, 0], dist).unwrap();
            assert_eq!(layout.tids[0], vec![0]);
            assert!(layout.tids[1..].iter().all(|t| t.is_empty()));
        }
    }

    #[test]
    fn zero_tasks_rejected() {
        assert_eq!(
            StepLayout::build(names(2), vec![0, 0], TaskDistribution::Block),
            Err(DistributionError::ZeroTasks)
        );
    }

    #[test]
    fn zero_plane_rejected() {
        assert_eq!(
            StepLayout::build(names(1), vec![1], TaskDistribution::Plane(0)),
            Err(DistributionError::ZeroPlane)
        );
    }

    #[test]
    fn host_of_inverse() {
        let layout =
            StepLayout::build(names(3), vec![2, 1, 2], TaskDistribution::Cyclic).unwrap();
        for gtid in 0..layout.task_cnt {
            let node = layout.host_of(gtid).unwrap();
            assert!(layout.tids[node].contains(&gtid));
        }
        assert_eq!(layout.host_of(99), None);
    }
}
