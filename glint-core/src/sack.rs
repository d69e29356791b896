//! Selective-acknowledgment range tracker: sorted, disjoint, merged
//! inclusive ranges of received packet numbers.

/// One contiguous block of acknowledged packet numbers, inclusive on both
/// ends. Invariant: `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub start: u64,
    pub end: u64,
}

impl AckRange {
    pub fn single(pn: u64) -> Self {
        AckRange { start: pn, end: pn }
    }
}

/// A received-set: sorted ascending, disjoint, and non-adjacent (any two
/// ranges are separated by at least one unacknowledged number). The
/// invariant is maintained by construction; external code cannot produce a
/// degenerate set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckRanges {
    ranges: Vec<AckRange>,
}

impl AckRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from ranges that are already sorted, disjoint, and
    /// non-adjacent. Returns `None` if the invariant does not hold; used
    /// to validate decoded wire input without normalizing it.
    pub fn from_sorted(ranges: &[AckRange]) -> Option<Self> {
        let mut prev: Option<AckRange> = None;
        for r in ranges {
            if r.start > r.end {
                return None;
            }
            if let Some(p) = prev {
                if r.start <= p.end.saturating_add(1) {
                    return None;
                }
            }
            prev = Some(*r);
        }
        Some(Self {
            ranges: ranges.to_vec(),
        })
    }

    /// Insert one packet number, merging with an adjacent or overlapping
    /// range on either side in a single ascending pass. Idempotent.
    pub fn insert(&mut self, pn: u64) {
        let ranges = &mut self.ranges;
        let mut i = 0;
        while i < ranges.len() && ranges[i].end.saturating_add(1) < pn {
            i += 1;
        }
        if i == ranges.len() {
            ranges.push(AckRange::single(pn));
            return;
        }
        let r = ranges[i];
        if r.start <= pn && pn <= r.end {
            return; // already covered
        }
        if pn.saturating_add(1) == r.start {
            ranges[i].start = pn;
        } else if pn < r.start {
            ranges.insert(i, AckRange::single(pn));
        } else {
            // pn == r.end + 1: extend right, then merge with the next
            // range if the gap closed.
            ranges[i].end = pn;
            if i + 1 < ranges.len() && ranges[i + 1].start == pn.saturating_add(1) {
                ranges[i].end = ranges[i + 1].end;
                ranges.remove(i + 1);
            }
        }
    }

    /// True iff some range covers `pn`. Single ascending scan with early
    /// exit: once a range starts past `pn`, no later range can cover it.
    pub fn contains(&self, pn: u64) -> bool {
        for r in &self.ranges {
            if r.start > pn {
                return false;
            }
            if pn <= r.end {
                return true;
            }
        }
        false
    }

    /// The highest acknowledged number, or `None` for an empty set.
    pub fn highest(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.end)
    }

    /// Every number strictly inside a gap between the first range's start
    /// and the last range's end. Diagnostic only; delivery order is not
    /// guaranteed, so gaps are normal in flight.
    pub fn missing(&self) -> Vec<u64> {
        let mut out = Vec::new();
        for pair in self.ranges.windows(2) {
            for pn in pair[0].end + 1..pair[1].start {
                out.push(pn);
            }
        }
        out
    }

    pub fn ranges(&self) -> &[AckRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> AckRange {
        AckRange { start, end }
    }

    #[test]
    fn insert_builds_sorted_disjoint_ranges() {
        let mut acks = AckRanges::new();
        for pn in [5, 1, 9, 3, 7] {
            acks.insert(pn);
        }
        assert_eq!(
            acks.ranges(),
            &[r(1, 1), r(3, 3), r(5, 5), r(7, 7), r(9, 9)]
        );
    }

    #[test]
    fn insert_merges_adjacent_left_and_right() {
        let mut acks = AckRanges::new();
        acks.insert(5);
        acks.insert(6); // extends right edge
        assert_eq!(acks.ranges(), &[r(5, 6)]);
        acks.insert(4); // extends left edge
        assert_eq!(acks.ranges(), &[r(4, 6)]);
    }

    #[test]
    fn insert_closes_gap_between_two_ranges() {
        let mut acks = AckRanges::new();
        acks.insert(3);
        acks.insert(5);
        assert_eq!(acks.ranges().len(), 2);
        acks.insert(4);
        assert_eq!(acks.ranges(), &[r(3, 5)]);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut acks = AckRanges::new();
        for pn in [2, 3, 7] {
            acks.insert(pn);
        }
        let snapshot = acks.clone();
        acks.insert(3);
        acks.insert(7);
        assert_eq!(acks, snapshot);
    }

    #[test]
    fn contains_early_exits_on_sorted_ranges() {
        let mut acks = AckRanges::new();
        for pn in [1, 2, 3, 10, 11] {
            acks.insert(pn);
        }
        assert!(acks.contains(1));
        assert!(acks.contains(3));
        assert!(acks.contains(11));
        assert!(!acks.contains(0));
        assert!(!acks.contains(4));
        assert!(!acks.contains(12));
    }

    #[test]
    fn highest_and_empty() {
        let mut acks = AckRanges::new();
        assert_eq!(acks.highest(), None);
        acks.insert(4);
        acks.insert(9);
        assert_eq!(acks.highest(), Some(9));
    }

    #[test]
    fn missing_enumerates_interior_gaps() {
        let mut acks = AckRanges::new();
        for pn in [1, 2, 5, 8] {
            acks.insert(pn);
        }
        assert_eq!(acks.missing(), vec![3, 4, 6, 7]);
    }

    #[test]
    fn from_sorted_validates() {
        assert!(AckRanges::from_sorted(&[r(1, 3), r(5, 6)]).is_some());
        assert!(AckRanges::from_sorted(&[]).is_some());
        // inverted range
        assert!(AckRanges::from_sorted(&[r(3, 1)]).is_none());
        // out of order
        assert!(AckRanges::from_sorted(&[r(5, 6), r(1, 3)]).is_none());
        // adjacent (should have been merged by the sender)
        assert!(AckRanges::from_sorted(&[r(1, 3), r(4, 6)]).is_none());
        // overlapping
        assert!(AckRanges::from_sorted(&[r(1, 5), r(4, 6)]).is_none());
    }

    #[test]
    fn insert_at_zero_and_max() {
        let mut acks = AckRanges::new();
        acks.insert(0);
        acks.insert(1);
        assert_eq!(acks.ranges(), &[r(0, 1)]);
        acks.insert(u64::MAX);
        acks.insert(u64::MAX);
        assert_eq!(acks.ranges(), &[r(0, 1), r(u64::MAX, u64::MAX)]);
    }
}
