//! Step-complete aggregation tree.
//!
//! The step's nodes, ordered by layout rank, form a tree rooted at rank 0.
//! Each manager covers a contiguous inclusive rank range: itself plus its
//! descendants. Child completions set bits; when the local range fills the
//! manager forwards exactly one range-encoded record upward, and never a
//! second one. Ranges are inclusive on both ends throughout.

use quarry_core::Bitmap;
use quarry_proto::message::AcctSnapshot;

/// Child rank ranges under a head covering `start..=end` (inclusive).
fn children(start: u32, end: u32, fanout: u16) -> Vec<(u32, u32)> {
    let tail_len = end - start;
    if tail_len == 0 {
        return Vec::new();
    }
    let nchunks = (fanout as u32).max(1).min(tail_len);
    let base = tail_len / nchunks;
    let extra = tail_len % nchunks;
    let mut out = Vec::with_capacity(nchunks as usize);
    let mut cstart = start + 1;
    for i in 0..nchunks {
        let size = base + u32::from(i < extra);
        out.push((cstart, cstart + size - 1));
        cstart += size;
    }
    out
}

/// Inclusive rank range covered by `rank` in a step of `n` nodes.
pub fn subtree(rank: u32, n: u32, fanout: u16) -> (u32, u32) {
    let mut range = (0, n.saturating_sub(1));
    loop {
        if rank == range.0 {
            return range;
        }
        let next = children(range.0, range.1, fanout)
            .into_iter()
            .find(|(lo, hi)| (*lo..=*hi).contains(&rank))
            .expect("rank inside parent range");
        range = next;
    }
}

/// Rank this manager forwards its completion to; `None` for the root.
pub fn parent(rank: u32, n: u32, fanout: u16) -> Option<u32> {
    if rank == 0 {
        return None;
    }
    let mut head = 0;
    let mut range = (0, n.saturating_sub(1));
    loop {
        let child = children(range.0, range.1, fanout)
            .into_iter()
            .find(|(lo, hi)| (*lo..=*hi).contains(&rank))
            .expect("rank inside parent range");
        if child.0 == rank {
            return Some(head);
        }
        head = child.0;
        range = child;
    }
}

#[derive(Debug)]
pub struct CompleteTree {
    start: u32,
    end: u32,
    bitmap: Bitmap,
    step_rc: u32,
    acct: AcctSnapshot,
    forwarded: bool,
}

impl CompleteTree {
    pub fn new(rank: u32, n: u32, fanout: u16) -> Self {
        let (start, end) = subtree(rank, n, fanout);
        Self {
            start,
            end,
            bitmap: Bitmap::new((end - start + 1) as usize),
            step_rc: 0,
            acct: AcctSnapshot::default(),
            forwarded: false,
        }
    }

    pub fn range(&self) -> (u32, u32) {
        (self.start, self.end)
    }

    pub fn step_rc(&self) -> u32 {
        self.step_rc
    }

    pub fn acct(&self) -> AcctSnapshot {
        self.acct
    }

    pub fn is_full(&self) -> bool {
        self.bitmap.is_full()
    }

    /// Merge an inclusive global rank range. Out-of-range bits are ignored,
    /// repeated bits change nothing. Returns true exactly once: on the
    /// transition to a full subtree.
    pub fn record(&mut self, first: u32, last: u32, rc: u32, acct: &AcctSnapshot) -> bool {
        let lo = first.max(self.start);
        let hi = last.min(self.end);
        if lo <= hi {
            self.bitmap
                .set_range((lo - self.start) as usize, (hi - self.start) as usize);
        }
        self.step_rc = self.step_rc.max(rc);
        self.acct.merge_max(acct);
        if self.bitmap.is_full() && !self.forwarded {
            self.forwarded = true;
            return true;
        }
        false
    }

    /// Contiguous globally-ranked completed ranges, for the fallback path
    /// when a descendant never reports.
    pub fn completed_ranges(&self) -> Vec<(u32, u32)> {
        let mut out: Vec<(u32, u32)> = Vec::new();
        for bit in self.bitmap.iter_set() {
            let rank = self.start + bit as u32;
            match out.last_mut() {
                Some((_, hi)) if *hi + 1 == rank => *hi = rank,
                _ => out.push((rank, rank)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rank_has_one_parent_and_ranges_nest() {
        for n in 1..20u32 {
            for fanout in 1..5u16 {
                let mut covered = vec![0u32; n as usize];
                for rank in 0..n {
                    let (lo, hi) = subtree(rank, n, fanout);
                    assert!(lo <= rank && rank <= hi);
                    covered[rank as usize] += 1;
                    if let Some(p) = parent(rank, n, fanout) {
                        let (plo, phi) = subtree(p, n, fanout);
                        assert!(plo <= lo && hi <= phi, "child range escapes parent");
                        assert!(p < rank);
                    } else {
                        assert_eq!(rank, 0);
                    }
                }
                assert!(covered.iter().all(|c| *c == 1));
            }
        }
    }

    #[test]
    fn eight_nodes_fanout_two_shape() {
        let n = 8;
        assert_eq!(subtree(0, n, 2), (0, 7));
        // Rank 0's children head the two tail chunks.
        assert_eq!(parent(1, n, 2), Some(0));
        assert_eq!(parent(5, n, 2), Some(0));
        assert_eq!(parent(6, n, 2), Some(5));
        assert_eq!(parent(7, n, 2), Some(5));
    }

    #[test]
    fn root_forwards_exactly_once_with_full_range() {
        let n = 8;
        let mut root = CompleteTree::new(0, n, 2);
        // Root's own node done.
        assert!(!root.record(0, 0, 0, &AcctSnapshot::default()));
        // Child subtrees report their ranges.
        let (lo1, hi1) = subtree(1, n, 2);
        let (lo5, hi5) = subtree(5, n, 2);
        assert!(!root.record(lo1, hi1, 3, &AcctSnapshot::default()));
        let full = root.record(lo5, hi5, 139, &AcctSnapshot::default());
        assert!(full);
        assert_eq!(root.range(), (0, 7));
        assert_eq!(root.step_rc(), 139);
        // A duplicate never re-forwards.
        assert!(!root.record(0, 7, 139, &AcctSnapshot::default()));
    }

    #[test]
    fn leaf_completes_immediately() {
        let n = 8;
        let leaf_rank = 7;
        let mut leaf = CompleteTree::new(leaf_rank, n, 2);
        assert_eq!(leaf.range(), (7, 7));
        assert!(leaf.record(7, 7, 0, &AcctSnapshot::default()));
    }

    #[test]
    fn overlapping_ranges_are_idempotent() {
        let mut tree = CompleteTree::new(0, 4, 2);
        assert!(!tree.record(0, 2, 0, &AcctSnapshot::default()));
        assert!(!tree.record(1, 2, 0, &AcctSnapshot::default()));
        assert_eq!(tree.completed_ranges(), vec![(0, 2)]);
        assert!(tree.record(3, 3, 0, &AcctSnapshot::default()));
    }

    #[test]
    fn completed_ranges_reports_gaps() {
        let mut tree = CompleteTree::new(0, 6, 2);
        tree.record(0, 1, 0, &AcctSnapshot::default());
        tree.record(4, 4, 0, &AcctSnapshot::default());
        assert_eq!(tree.completed_ranges(), vec![(0, 1), (4, 4)]);
    }

    #[test]
    fn acct_merges_maxima() {
        let mut tree = CompleteTree::new(0, 2, 2);
        tree.record(
            0,
            0,
            0,
            &AcctSnapshot {
                user_sec: 5,
                sys_sec: 1,
                max_rss_kb: 100,
            },
        );
        tree.record(
            1,
            1,
            0,
            &AcctSnapshot {
                user_sec: 2,
                sys_sec: 4,
                max_rss_kb: 50,
            },
        );
        let acct = tree.acct();
        assert_eq!(acct.user_sec, 5);
        assert_eq!(acct.sys_sec, 4);
        assert_eq!(acct.max_rss_kb, 100);
    }
}
