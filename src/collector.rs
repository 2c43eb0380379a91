use crate::block::{BlockLayout, BlockPair, Boundary, GlobalKey, LabelVolume, LocalLabel, BACKGROUND};
use crate::error::MergeError;
use crate::store::{BlockStore, BoundarySlices};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Co-occurrence counts of `(label in a, label in b)` over a boundary.
pub type PairCounts = FxHashMap<(LocalLabel, LocalLabel), u64>;

/// Which co-occurring label pairs count as the same object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    /// Minimum shared voxels for a pair to be merged.
    pub min_overlap_voxels: u64,
    /// Share of label A's boundary voxels the overlap must cover. 0 disables.
    pub min_fraction_a: f64,
    /// Same for label B. With both sides enabled, passing either one is enough.
    pub min_fraction_b: f64,
    /// Keep only the strongest match when both labels are already taken.
    pub one_to_one: bool,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            min_overlap_voxels: 1,
            min_fraction_a: 0.0,
            min_fraction_b: 0.0,
            one_to_one: false,
        }
    }
}

/// Two keys believed to be one object, and the evidence for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Correspondence {
    pub a: GlobalKey,
    pub b: GlobalKey,
    pub overlap: u64,
    pub boundary: Boundary,
}

/// Count non-background label co-occurrences voxel by voxel.
pub fn tally(a: &LabelVolume, b: &LabelVolume) -> Result<PairCounts, MergeError> {
    if a.shape() != b.shape() {
        return Err(MergeError::Input(format!(
            "boundary slices differ in shape: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let mut counts = PairCounts::default();
    for (&la, &lb) in a.data().iter().zip(b.data()) {
        if la == BACKGROUND || lb == BACKGROUND {
            continue;
        }
        *counts.entry((la, lb)).or_insert(0) += 1;
    }
    Ok(counts)
}

#[derive(Clone, Debug, Default)]
pub struct OverlapCollector {
    policy: SelectionPolicy,
    force_overlap: bool,
}

impl OverlapCollector {
    pub fn new(policy: SelectionPolicy, force_overlap: bool) -> Self {
        Self { policy, force_overlap }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Apply the selection policy, returning accepted pairs sorted by labels.
    pub fn select(&self, counts: &PairCounts) -> Vec<((LocalLabel, LocalLabel), u64)> {
        let mut candidates: Vec<_> = counts
            .iter()
            .filter(|((la, lb), c)| *la != BACKGROUND && *lb != BACKGROUND && **c > 0)
            .map(|(&k, &c)| (k, c))
            .collect();

        if !self.force_overlap {
            let mut total_a: FxHashMap<LocalLabel, u64> = FxHashMap::default();
            let mut total_b: FxHashMap<LocalLabel, u64> = FxHashMap::default();
            for &((la, lb), c) in &candidates {
                *total_a.entry(la).or_insert(0) += c;
                *total_b.entry(lb).or_insert(0) += c;
            }

            let min_voxels = self.policy.min_overlap_voxels;
            let (min_a, min_b) = (self.policy.min_fraction_a, self.policy.min_fraction_b);
            candidates.retain(|&((la, lb), c)| {
                if c < min_voxels {
                    return false;
                }
                if min_a > 0.0 || min_b > 0.0 {
                    let passes_a = min_a > 0.0 && c as f64 / total_a[&la] as f64 >= min_a;
                    let passes_b = min_b > 0.0 && c as f64 / total_b[&lb] as f64 >= min_b;
                    if !passes_a && !passes_b {
                        return false;
                    }
                }
                true
            });

            if self.policy.one_to_one {
                candidates.sort_by(|x, y| y.1.cmp(&x.1).then(x.0.cmp(&y.0)));
                let mut used_a = FxHashSet::default();
                let mut used_b = FxHashSet::default();
                candidates.retain(|&((la, lb), _)| {
                    if used_a.contains(&la) && used_b.contains(&lb) {
                        return false;
                    }
                    used_a.insert(la);
                    used_b.insert(lb);
                    true
                });
            }
        }

        candidates.sort_unstable_by_key(|&(k, _)| k);
        candidates
    }

    /// Turn one pair's boundary slices into correspondences.
    pub fn collect(
        &self,
        layout: &BlockLayout,
        pair: &BlockPair,
        slices: &BoundarySlices,
    ) -> Result<Vec<Correspondence>, MergeError> {
        let max_a = layout
            .get(pair.a)
            .map(|e| e.max_label)
            .ok_or_else(|| MergeError::Input(format!("unknown block {}", pair.a)))?;
        let max_b = layout
            .get(pair.b)
            .map(|e| e.max_label)
            .ok_or_else(|| MergeError::Input(format!("unknown block {}", pair.b)))?;

        let counts = tally(&slices.a, &slices.b)?;
        for &(la, lb) in counts.keys() {
            if la > max_a {
                return Err(MergeError::Input(format!(
                    "label {} in block {} exceeds its max_id {}",
                    la, pair.a, max_a
                )));
            }
            if lb > max_b {
                return Err(MergeError::Input(format!(
                    "label {} in block {} exceeds its max_id {}",
                    lb, pair.b, max_b
                )));
            }
        }

        let selected = self.select(&counts);
        debug!(
            pair = %pair,
            co_occurring = counts.len(),
            selected = selected.len(),
            "collected overlap evidence"
        );
        Ok(selected
            .into_iter()
            .map(|((la, lb), overlap)| Correspondence {
                a: GlobalKey::new(pair.a, la),
                b: GlobalKey::new(pair.b, lb),
                overlap,
                boundary: slices.boundary,
            })
            .collect())
    }

    /// Read the pair's boundary from the store and collect it.
    pub fn collect_pair<S>(&self, store: &S, pair: &BlockPair) -> Result<Vec<Correspondence>, MergeError>
    where
        S: BlockStore + ?Sized,
    {
        let slices = store.read_boundary(pair.a, pair.b)?;
        self.collect(store.layout(), pair, &slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockBox, LayoutEntry};
    use crate::store::MemoryBlockStore;

    fn counts(entries: &[((u32, u32), u64)]) -> PairCounts {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_tally_skips_background() {
        let a = LabelVolume::new([1, 1, 4], vec![0, 3, 3, 5]).unwrap();
        let b = LabelVolume::new([1, 1, 4], vec![2, 0, 4, 4]).unwrap();
        let c = tally(&a, &b).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c[&(3, 4)], 1);
        assert_eq!(c[&(5, 4)], 1);
    }

    #[test]
    fn test_tally_rejects_shape_mismatch() {
        let a = LabelVolume::zeros([1, 1, 4]);
        let b = LabelVolume::zeros([1, 2, 2]);
        assert!(tally(&a, &b).is_err());
    }

    #[test]
    fn test_below_threshold_is_not_selected() {
        let policy = SelectionPolicy { min_overlap_voxels: 10, ..SelectionPolicy::default() };
        let collector = OverlapCollector::new(policy, false);
        let selected = collector.select(&counts(&[((7, 9), 4), ((3, 5), 12)]));
        assert_eq!(selected, vec![((3, 5), 12)]);
    }

    #[test]
    fn test_force_overlap_bypasses_threshold() {
        let policy = SelectionPolicy { min_overlap_voxels: 10, one_to_one: true, ..SelectionPolicy::default() };
        let collector = OverlapCollector::new(policy, true);
        let selected = collector.select(&counts(&[((7, 9), 1), ((7, 8), 1)]));
        assert_eq!(selected, vec![((7, 8), 1), ((7, 9), 1)]);
    }

    #[test]
    fn test_ambiguous_matches_are_all_kept_by_default() {
        let collector = OverlapCollector::default();
        let selected = collector.select(&counts(&[((1, 2), 5), ((1, 3), 4), ((4, 3), 2)]));
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_one_to_one_drops_doubly_used_pairs() {
        let policy = SelectionPolicy { one_to_one: true, ..SelectionPolicy::default() };
        let collector = OverlapCollector::new(policy, false);
        // (1,2) wins; (1,3) still adds 3; (4,2) adds 4; (4,3) has both taken.
        let selected = collector.select(&counts(&[((1, 2), 9), ((1, 3), 5), ((4, 2), 4), ((4, 3), 1)]));
        let keys: Vec<_> = selected.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(1, 2), (1, 3), (4, 2)]);
    }

    #[test]
    fn test_fraction_rule_needs_one_side() {
        let policy = SelectionPolicy { min_fraction_a: 0.7, min_fraction_b: 0.7, ..SelectionPolicy::default() };
        let collector = OverlapCollector::new(policy, false);
        // Label 1 is split evenly over 2 and 3, but each of those is mostly label 1.
        // Label 4 touches 5 only a little on both sides.
        let selected = collector.select(&counts(&[((1, 2), 5), ((1, 3), 5), ((4, 5), 1), ((4, 6), 9), ((8, 5), 9)]));
        let keys: Vec<_> = selected.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(1, 2), (1, 3), (4, 6), (8, 5)]);
    }

    #[test]
    fn test_fraction_sides_are_independent() {
        let evidence = counts(&[((1, 2), 5), ((1, 3), 5), ((4, 5), 1), ((4, 6), 9), ((8, 5), 9)]);

        let only_a = SelectionPolicy { min_fraction_a: 0.7, ..SelectionPolicy::default() };
        let selected = OverlapCollector::new(only_a, false).select(&evidence);
        let keys: Vec<_> = selected.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(4, 6), (8, 5)]);

        let only_b = SelectionPolicy { min_fraction_b: 0.95, ..SelectionPolicy::default() };
        let selected = OverlapCollector::new(only_b, false).select(&evidence);
        let keys: Vec<_> = selected.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(1, 2), (1, 3), (4, 6)]);
    }

    #[test]
    fn test_collect_pair_builds_global_keys() {
        let left = BlockBox::from_coords([0, 1, 0, 2, 0, 2]);
        let right = BlockBox::from_coords([0, 1, 0, 2, 2, 4]);
        let layout = BlockLayout::new(vec![
            LayoutEntry { block: 0, bbox: left, max_label: 3 },
            LayoutEntry { block: 1, bbox: right, max_label: 5 },
        ])
        .unwrap();
        let pair = layout.pairs()[0];
        let mut store = MemoryBlockStore::new(layout);
        store.insert(0, LabelVolume::new([1, 2, 2], vec![0, 3, 0, 3]).unwrap());
        store.insert(1, LabelVolume::new([1, 2, 2], vec![5, 0, 5, 0]).unwrap());

        let found = OverlapCollector::default().collect_pair(&store, &pair).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].a, GlobalKey::new(0, 3));
        assert_eq!(found[0].b, GlobalKey::new(1, 5));
        assert_eq!(found[0].overlap, 2);
    }

    #[test]
    fn test_label_beyond_max_id_is_input_error() {
        let left = BlockBox::from_coords([0, 1, 0, 1, 0, 1]);
        let right = BlockBox::from_coords([0, 1, 0, 1, 1, 2]);
        let layout = BlockLayout::new(vec![
            LayoutEntry { block: 0, bbox: left, max_label: 1 },
            LayoutEntry { block: 1, bbox: right, max_label: 1 },
        ])
        .unwrap();
        let pair = layout.pairs()[0];
        let mut store = MemoryBlockStore::new(layout);
        store.insert(0, LabelVolume::new([1, 1, 1], vec![4]).unwrap());
        store.insert(1, LabelVolume::new([1, 1, 1], vec![1]).unwrap());
        let err = OverlapCollector::default().collect_pair(&store, &pair).unwrap_err();
        assert!(matches!(err, MergeError::Input(_)));
    }
}
