//! Ordered set of written byte ranges, keyed by offset in a balanced map.
//! Inserting coalesces abutting and overlapping ranges, so the tree stays
//! minimal: one entry per maximal contiguous run.

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct ExtentTree {
    // start offset -> end offset (exclusive)
    runs: BTreeMap<u64, u64>,
}

impl ExtentTree {
    pub fn new() -> ExtentTree {
        ExtentTree::default()
    }

    /// Record `[start, end)` as written, merging with any runs it touches.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut start = start;
        let mut end = end;

        // A run beginning at or before `start` may reach into the new range.
        if let Some((&s, &e)) = self.runs.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.runs.remove(&s);
            }
        }

        // Absorb every run the (possibly widened) range now touches.
        let touched: Vec<u64> = self
            .runs
            .range(start..=end)
            .map(|(&s, _)| s)
            .collect();
        for s in touched {
            let e = self.runs.remove(&s).unwrap();
            end = end.max(e);
        }

        self.runs.insert(start, end);
    }

    /// True when `[start, end)` lies entirely inside recorded runs.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        match self.runs.range(..=start).next_back() {
            Some((_, &e)) => e >= end,
            None => false,
        }
    }

    /// Largest end offset of any run; 0 when empty.
    pub fn max_end(&self) -> u64 {
        self.runs.values().copied().max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    /// The coalesced runs in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.runs.iter().map(|(&s, &e)| (s, e))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    #[test]
    fn abutting_ranges_coalesce() {
        let mut tree = ExtentTree::new();
        tree.insert(0, 4096);
        tree.insert(4096, 8192);
        assert_eq!(tree.iter().collect::<Vec<_>>(), vec![(0, 8192)]);
    }

    #[test]
    fn overlapping_and_contained_ranges_coalesce() {
        let mut tree = ExtentTree::new();
        tree.insert(100, 200);
        tree.insert(150, 300);
        tree.insert(120, 130);
        assert_eq!(tree.iter().collect::<Vec<_>>(), vec![(100, 300)]);
    }

    #[test]
    fn disjoint_ranges_stay_apart() {
        let mut tree = ExtentTree::new();
        tree.insert(0, 10);
        tree.insert(20, 30);
        assert_eq!(tree.len(), 2);
        assert!(tree.covers(0, 10));
        assert!(!tree.covers(5, 25));
        assert!(tree.covers(25, 30));
        assert!(!tree.covers(30, 31));
    }

    #[test]
    fn bridge_insert_merges_neighbors() {
        let mut tree = ExtentTree::new();
        tree.insert(0, 10);
        tree.insert(20, 30);
        tree.insert(10, 20);
        assert_eq!(tree.iter().collect::<Vec<_>>(), vec![(0, 30)]);
        assert_eq!(tree.max_end(), 30);
    }

    #[test]
    fn random_inserts_match_a_bitmap_model() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut tree = ExtentTree::new();
        let mut model = [false; 512];

        for _ in 0..200 {
            let start = rng.gen_range(0..500u64);
            let end = start + rng.gen_range(1..12u64);
            tree.insert(start, end);
            for i in start..end {
                model[i as usize] = true;
            }
        }

        // Coverage agrees everywhere with the bitmap.
        for start in 0..500u64 {
            for len in 1..8u64 {
                let end = start + len;
                let expect = (start..end).all(|i| model[i as usize]);
                assert_eq!(tree.covers(start, end), expect, "range [{start}, {end})");
            }
        }

        // And the runs really are maximal: no two adjacent.
        let runs: Vec<_> = tree.iter().collect();
        for pair in runs.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }
}
