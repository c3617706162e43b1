//! Node selection capability.
//!
//! The scheduler treats placement as pluggable: it hands a candidate bitmap
//! to the capability and stores whatever opaque payload comes back alongside
//! the job. The payload is identity-prefixed on the wire so a different
//! allocator can coexist with the default first-fit one.

use quarry_core::Bitmap;
use quarry_proto::codec::{PackBuf, UnpackBuf, UnpackError, NO_VAL};
use quarry_proto::ErrorCode;

use crate::config::SharePolicy;
use crate::registry::job::JobRecord;
use crate::registry::node::NodeRegistry;

#[derive(Debug, Clone)]
pub struct Placement {
    pub bitmap: Bitmap,
    pub jobinfo: Vec<u8>,
}

pub trait SelectCapability: Send + Sync {
    fn identity(&self) -> &'static str;

    /// Find a node set for `job` inside `candidates`. `test_only` asks
    /// whether a placement could ever exist without committing anything.
    fn job_test(
        &self,
        job: &JobRecord,
        candidates: &Bitmap,
        nodes: &NodeRegistry,
        share: SharePolicy,
        test_only: bool,
    ) -> Result<Placement, ErrorCode>;

    fn job_begin(&self, _job: &JobRecord) {}

    /// Whether the allocated nodes are ready for the job to start.
    fn job_ready(&self, _job: &JobRecord) -> bool {
        true
    }

    fn job_fini(&self, _job: &JobRecord) {}

    fn job_suspend(&self, _job: &JobRecord) {}

    fn job_resume(&self, _job: &JobRecord) {}

    fn sprint_jobinfo(&self, jobinfo: &[u8]) -> String;

    fn pack_node_info(&self, nodes: &NodeRegistry, p: &mut PackBuf);

    fn unpack_node_info(&self, u: &mut UnpackBuf<'_>) -> Result<(), UnpackError>;

    /// Geometry-aware capabilities may inflate a requested node count.
    fn alter_node_cnt(&self, count: u32) -> u32 {
        count
    }
}

/// First-fit allocator over the plain node table.
pub struct LinearSelect;

const LINEAR_IDENTITY: &str = "select/linear";

impl LinearSelect {
    fn node_fits(job: &JobRecord, nodes: &NodeRegistry, idx: usize, share: SharePolicy) -> bool {
        let rec = nodes.get(idx);
        if (rec.cpus as u32) < job.min_cpus_per_node
            || rec.real_mem_mb < job.min_mem_mb
            || rec.tmp_disk_mb < job.min_tmp_mb
        {
            return false;
        }
        for feature in &job.features {
            if !rec.features.contains(feature) {
                return false;
            }
        }
        // Sharing: exclusive partitions and no-share peers keep one job per
        // node; `force` packs regardless of the job's request.
        let wants_exclusive = match share {
            SharePolicy::Exclusive => true,
            SharePolicy::Force => false,
            SharePolicy::Yes => job.shared_req == 0,
        };
        if rec.no_share_job_cnt > 0 {
            return false;
        }
        if wants_exclusive && (rec.run_job_cnt > 0 || rec.comp_job_cnt > 0) {
            return false;
        }
        true
    }

    fn pick(job: &JobRecord, eligible: &Bitmap, want: usize) -> Option<Bitmap> {
        let indices: Vec<usize> = eligible.iter_set().collect();
        if indices.len() < want {
            return None;
        }
        if job.contiguous {
            // First contiguous index run of the right length.
            let mut run: Vec<usize> = Vec::new();
            for &idx in &indices {
                if let Some(&prev) = run.last() {
                    if idx != prev + 1 {
                        run.clear();
                    }
                }
                run.push(idx);
                if run.len() == want {
                    let mut bm = Bitmap::new(eligible.len());
                    for &i in &run {
                        bm.set(i);
                    }
                    return Some(bm);
                }
            }
            None
        } else {
            let mut bm = Bitmap::new(eligible.len());
            for &i in indices.iter().take(want) {
                bm.set(i);
            }
            Some(bm)
        }
    }
}

impl SelectCapability for LinearSelect {
    fn identity(&self) -> &'static str {
        LINEAR_IDENTITY
    }

    fn job_test(
        &self,
        job: &JobRecord,
        candidates: &Bitmap,
        nodes: &NodeRegistry,
        share: SharePolicy,
        _test_only: bool,
    ) -> Result<Placement, ErrorCode> {
        let mut eligible = candidates.clone();

        if let Some(pattern) = &job.exc_pattern {
            let excluded =
                quarry_core::hostlist::expand(pattern).map_err(|_| ErrorCode::InvalidNodeName)?;
            for name in excluded {
                if let Some(idx) = nodes.idx(&name) {
                    eligible.clear(idx);
                }
            }
        }

        let mut required = Bitmap::new(candidates.len());
        if let Some(pattern) = &job.req_pattern {
            let names =
                quarry_core::hostlist::expand(pattern).map_err(|_| ErrorCode::InvalidNodeName)?;
            for name in names {
                let idx = nodes.idx(&name).ok_or(ErrorCode::InvalidNodeName)?;
                required.set(idx);
            }
        }

        for idx in candidates.iter_set() {
            if !Self::node_fits(job, nodes, idx, share) {
                eligible.clear(idx);
            }
        }

        // Every required node must have survived the filters.
        if !required.is_subset_of(&eligible) {
            return Err(ErrorCode::PlacementInfeasible);
        }

        let want = (job.min_nodes as usize).max(required.count());
        if job.max_nodes != NO_VAL && want > job.max_nodes as usize {
            return Err(ErrorCode::PlacementInfeasible);
        }

        let bitmap = if required.count() == want && (!job.contiguous || required.is_contiguous()) {
            required
        } else {
            let mut chosen = Self::pick(job, &eligible, want).ok_or(ErrorCode::InsufficientNodes)?;
            if !required.is_empty() && !required.is_subset_of(&chosen) {
                // Re-pick around the required set: union and trim optionals.
                chosen.union_with(&required);
                while chosen.count() > want {
                    let victim = chosen
                        .iter_set()
                        .find(|i| !required.test(*i))
                        .ok_or(ErrorCode::PlacementInfeasible)?;
                    chosen.clear(victim);
                }
                if job.contiguous && !chosen.is_contiguous() {
                    return Err(ErrorCode::PlacementInfeasible);
                }
                chosen
            } else {
                chosen
            }
        };

        let mut p = PackBuf::new();
        p.pack_str(LINEAR_IDENTITY);
        p.pack_u32(bitmap.count() as u32);
        Ok(Placement {
            bitmap,
            jobinfo: p.into_inner(),
        })
    }

    fn sprint_jobinfo(&self, jobinfo: &[u8]) -> String {
        let mut u = UnpackBuf::new(jobinfo);
        match (u.unpack_str(), u.unpack_u32()) {
            (Ok(id), Ok(n)) if id == LINEAR_IDENTITY => format!("{LINEAR_IDENTITY}: {n} nodes"),
            _ => format!("{LINEAR_IDENTITY}: <unparsed>"),
        }
    }

    fn pack_node_info(&self, nodes: &NodeRegistry, p: &mut PackBuf) {
        p.pack_str(LINEAR_IDENTITY);
        p.pack_u32(nodes.len() as u32);
    }

    fn unpack_node_info(&self, u: &mut UnpackBuf<'_>) -> Result<(), UnpackError> {
        let id = u.unpack_str()?;
        if id != LINEAR_IDENTITY {
            return Err(UnpackError::BadValue("select identity"));
        }
        let _count = u.unpack_u32()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::registry::job::JobRegistry;
    use crate::registry::node::BaseState;
    use quarry_proto::message::JobDescriptor;

    fn setup(n: usize) -> (NodeRegistry, JobRegistry) {
        let cfg = test_config(n);
        let mut nodes = NodeRegistry::from_config(&cfg);
        for i in 0..n {
            nodes.get_mut(i).base = BaseState::Idle;
        }
        (nodes, JobRegistry::new())
    }

    fn descriptor(min_nodes: u32) -> JobDescriptor {
        JobDescriptor {
            name: None,
            partition: None,
            uid: 0,
            gid: 0,
            min_nodes,
            max_nodes: NO_VAL,
            min_cpus_per_node: 1,
            min_mem_mb: 0,
            min_tmp_mb: 0,
            req_nodes: None,
            exc_nodes: None,
            features: vec![],
            contiguous: false,
            shared: u16::MAX,
            priority: 1,
            time_limit_min: 10,
            immediate: false,
            account: None,
            dependency: None,
            work_dir: None,
            script: None,
        }
    }

    #[test]
    fn first_fit_picks_lowest_indices() {
        let (nodes, mut jobs) = setup(4);
        let job = jobs.submit(&descriptor(2), "batch".into(), 1);
        let placement = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Exclusive, false)
            .unwrap();
        assert_eq!(placement.bitmap.iter_set().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn busy_nodes_skipped_under_exclusive() {
        let (mut nodes, mut jobs) = setup(4);
        nodes.get_mut(0).run_job_cnt = 1;
        let job = jobs.submit(&descriptor(2), "batch".into(), 1);
        let placement = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Exclusive, false)
            .unwrap();
        assert_eq!(placement.bitmap.iter_set().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn force_sharing_packs_busy_nodes() {
        let (mut nodes, mut jobs) = setup(2);
        nodes.get_mut(0).run_job_cnt = 1;
        let job = jobs.submit(&descriptor(2), "batch".into(), 1);
        let placement = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Force, false)
            .unwrap();
        assert_eq!(placement.bitmap.count(), 2);
    }

    #[test]
    fn no_share_peer_blocks_everyone() {
        let (mut nodes, mut jobs) = setup(1);
        nodes.get_mut(0).no_share_job_cnt = 1;
        let job = jobs.submit(&descriptor(1), "batch".into(), 1);
        let err = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Force, false)
            .unwrap_err();
        assert_eq!(err, ErrorCode::InsufficientNodes);
    }

    #[test]
    fn required_and_excluded_nodes() {
        let (nodes, mut jobs) = setup(4);
        let mut d = descriptor(2);
        d.req_nodes = Some("n2".into());
        d.exc_nodes = Some("n0".into());
        let job = jobs.submit(&d, "batch".into(), 1);
        let placement = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Exclusive, false)
            .unwrap();
        assert!(placement.bitmap.test(2));
        assert!(!placement.bitmap.test(0));
        assert_eq!(placement.bitmap.count(), 2);
    }

    #[test]
    fn contiguous_placement() {
        let (mut nodes, mut jobs) = setup(5);
        // Hole at n1 forces the run to start at n2.
        nodes.get_mut(1).run_job_cnt = 1;
        let mut d = descriptor(3);
        d.contiguous = true;
        let job = jobs.submit(&d, "batch".into(), 1);
        let placement = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Exclusive, false)
            .unwrap();
        assert_eq!(
            placement.bitmap.iter_set().collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn feature_filter() {
        let (nodes, mut jobs) = setup(4);
        let mut d = descriptor(2);
        d.features = vec!["even".into()];
        let job = jobs.submit(&d, "batch".into(), 1);
        let placement = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Exclusive, false)
            .unwrap();
        assert_eq!(placement.bitmap.iter_set().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn infeasible_when_too_few_nodes() {
        let (nodes, mut jobs) = setup(2);
        let job = jobs.submit(&descriptor(3), "batch".into(), 1);
        let err = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Exclusive, false)
            .unwrap_err();
        assert_eq!(err, ErrorCode::InsufficientNodes);
    }

    #[test]
    fn jobinfo_is_identity_prefixed() {
        let (nodes, mut jobs) = setup(2);
        let job = jobs.submit(&descriptor(1), "batch".into(), 1);
        let placement = LinearSelect
            .job_test(job, &nodes.usable_bitmap(), &nodes, SharePolicy::Exclusive, false)
            .unwrap();
        let printed = LinearSelect.sprint_jobinfo(&placement.jobinfo);
        assert_eq!(printed, "select/linear: 1 nodes");
    }
}
