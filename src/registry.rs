//! Disjoint-set registry over every `(block, local label)` key.
//!
//! Keys are laid out densely: each block owns the index range
//! `offset .. offset + max_label`, offsets being the prefix sums of the
//! blocks' `max_label` in ascending block order. Background is never a key.

use crate::block::{BlockId, BlockLayout, GlobalKey, GlobalLabel, LocalLabel, BACKGROUND};
use crate::codec;
use crate::collector::Correspondence;
use crate::error::MergeError;
use bincode::{Decode, Encode};
use tracing::warn;

/// Index range owned by one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct KeySpan {
    pub block: BlockId,
    pub offset: u32,
    pub max_label: LocalLabel,
}

pub fn key_spans(layout: &BlockLayout) -> Result<Vec<KeySpan>, MergeError> {
    let mut spans = Vec::with_capacity(layout.len());
    let mut offset: u64 = 0;
    for entry in layout.entries() {
        spans.push(KeySpan {
            block: entry.block,
            offset: offset as u32,
            max_label: entry.max_label,
        });
        offset += entry.max_label as u64;
        if offset > u32::MAX as u64 {
            return Err(MergeError::Input(format!(
                "{} labels across blocks exceed the registry's capacity",
                layout.total_labels()
            )));
        }
    }
    Ok(spans)
}

fn locate(spans: &[KeySpan], key: GlobalKey) -> Option<u32> {
    let i = spans.binary_search_by_key(&key.block, |s| s.block).ok()?;
    let span = spans[i];
    if key.label == BACKGROUND || key.label > span.max_label {
        return None;
    }
    Some(span.offset + key.label - 1)
}

fn key_at(spans: &[KeySpan], index: u32) -> GlobalKey {
    let i = spans.partition_point(|s| s.offset + s.max_label <= index);
    let span = spans[i];
    GlobalKey::new(span.block, index - span.offset + 1)
}

/// Persisted form of the forest.
#[derive(Clone, Debug, PartialEq, Eq, Encode)]
pub struct RegistrySnapshot {
    pub spans: Vec<KeySpan>,
    pub parent: Vec<u32>,
    pub rank: Vec<u8>,
    pub frozen: bool,
    pub unions: u64,
}

impl<Context> Decode<Context> for RegistrySnapshot {
    fn decode<D: bincode::de::Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, bincode::error::DecodeError> {
        Ok(RegistrySnapshot {
            spans: codec::decode_seq(decoder)?,
            parent: codec::decode_seq(decoder)?,
            rank: codec::decode_seq(decoder)?,
            frozen: bool::decode(decoder)?,
            unions: u64::decode(decoder)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    spans: Vec<KeySpan>,
    parent: Vec<u32>,
    rank: Vec<u8>,
    frozen: bool,
    unions: u64,
}

impl Registry {
    /// Every key of every block in its own class.
    pub fn new(layout: &BlockLayout) -> Result<Self, MergeError> {
        let spans = key_spans(layout)?;
        let n = layout.total_labels() as usize;
        Ok(Self {
            spans,
            parent: (0..n as u32).collect(),
            rank: vec![0; n],
            frozen: false,
            unions: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Unions that actually joined two classes.
    pub fn unions(&self) -> u64 {
        self.unions
    }

    fn index_of(&self, key: GlobalKey) -> Result<u32, MergeError> {
        locate(&self.spans, key).ok_or(MergeError::InvalidKey(key))
    }

    fn find_index(&mut self, x: u32) -> u32 {
        let mut root = x;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = x;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    fn union_indices(&mut self, a: u32, b: u32) -> bool {
        let ra = self.find_index(a);
        let rb = self.find_index(b);
        if ra == rb {
            return false;
        }
        let (ra_idx, rb_idx) = (ra as usize, rb as usize);
        if self.rank[ra_idx] < self.rank[rb_idx] {
            self.parent[ra_idx] = rb;
        } else if self.rank[ra_idx] > self.rank[rb_idx] {
            self.parent[rb_idx] = ra;
        } else {
            self.parent[rb_idx] = ra;
            self.rank[ra_idx] = self.rank[ra_idx].saturating_add(1);
        }
        self.unions += 1;
        true
    }

    fn checked_pair(&self, a: GlobalKey, b: GlobalKey) -> Result<(u32, u32), MergeError> {
        if a.is_background() || b.is_background() {
            warn!(%a, %b, "rejected union with background");
            return Err(MergeError::BackgroundUnion(a, b));
        }
        Ok((self.index_of(a)?, self.index_of(b)?))
    }

    /// Representative key of `key`'s class.
    pub fn find(&mut self, key: GlobalKey) -> Result<GlobalKey, MergeError> {
        let idx = self.index_of(key)?;
        let root = self.find_index(idx);
        Ok(key_at(&self.spans, root))
    }

    /// Join the classes of `a` and `b`. Returns `false` when they were already one.
    pub fn union(&mut self, a: GlobalKey, b: GlobalKey) -> Result<bool, MergeError> {
        if self.frozen {
            return Err(MergeError::RegistryFrozen);
        }
        let (ia, ib) = self.checked_pair(a, b)?;
        Ok(self.union_indices(ia, ib))
    }

    /// Merge one pair's evidence. Every key is validated before any union, so
    /// the batch applies completely or not at all.
    pub fn union_all(&mut self, evidence: &[Correspondence]) -> Result<usize, MergeError> {
        if self.frozen {
            return Err(MergeError::RegistryFrozen);
        }
        let indices = evidence
            .iter()
            .map(|c| self.checked_pair(c.a, c.b))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(indices
            .into_iter()
            .filter(|&(ia, ib)| self.union_indices(ia, ib))
            .count())
    }

    pub fn same_class(&mut self, a: GlobalKey, b: GlobalKey) -> Result<bool, MergeError> {
        let ia = self.index_of(a)?;
        let ib = self.index_of(b)?;
        Ok(self.find_index(ia) == self.find_index(ib))
    }

    pub fn class_count(&self) -> usize {
        self.parent
            .iter()
            .enumerate()
            .filter(|&(i, &p)| i as u32 == p)
            .count()
    }

    /// Number every class densely from 1, in order of each class's smallest
    /// key (ascending block, then label). Freezes the registry.
    pub fn assign_labels(&mut self) -> LabelMap {
        let n = self.parent.len();
        let mut label_of_root = vec![0 as GlobalLabel; n];
        let mut labels = Vec::with_capacity(n);
        let mut next: GlobalLabel = 1;
        for i in 0..n as u32 {
            let root = self.find_index(i) as usize;
            if label_of_root[root] == 0 {
                label_of_root[root] = next;
                next += 1;
            }
            labels.push(label_of_root[root]);
        }
        self.frozen = true;
        LabelMap {
            spans: self.spans.clone(),
            labels,
            classes: next - 1,
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            spans: self.spans.clone(),
            parent: self.parent.clone(),
            rank: self.rank.clone(),
            frozen: self.frozen,
            unions: self.unions,
        }
    }

    pub fn restore(snapshot: RegistrySnapshot, layout: &BlockLayout) -> Result<Self, MergeError> {
        if snapshot.spans != key_spans(layout)? {
            return Err(MergeError::CheckpointMismatch(
                "registry key ranges differ from the block layout".to_string(),
            ));
        }
        let n = layout.total_labels() as usize;
        if snapshot.parent.len() != n || snapshot.rank.len() != n {
            return Err(MergeError::CorruptCheckpoint(format!(
                "registry arrays hold {}/{} entries, expected {}",
                snapshot.parent.len(),
                snapshot.rank.len(),
                n
            )));
        }
        if snapshot.parent.iter().any(|&p| p as usize >= n) {
            return Err(MergeError::CorruptCheckpoint("registry parent out of range".to_string()));
        }
        Ok(Self {
            spans: snapshot.spans,
            parent: snapshot.parent,
            rank: snapshot.rank,
            frozen: snapshot.frozen,
            unions: snapshot.unions,
        })
    }
}

/// Frozen key → global label mapping. Read-only, shared by all apply workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMap {
    spans: Vec<KeySpan>,
    labels: Vec<GlobalLabel>,
    classes: u32,
}

impl LabelMap {
    pub fn from_parts(spans: Vec<KeySpan>, labels: Vec<GlobalLabel>) -> Result<Self, MergeError> {
        let total: u64 = spans.iter().map(|s| s.max_label as u64).sum();
        if labels.len() as u64 != total {
            return Err(MergeError::CorruptCheckpoint(format!(
                "label table holds {} entries, expected {}",
                labels.len(),
                total
            )));
        }
        if labels.contains(&BACKGROUND) {
            return Err(MergeError::CorruptCheckpoint("label table maps a key to background".to_string()));
        }
        let classes = labels.iter().copied().max().unwrap_or(0);
        Ok(Self { spans, labels, classes })
    }

    /// Background maps to background; unknown keys map to nothing.
    pub fn lookup(&self, key: GlobalKey) -> Option<GlobalLabel> {
        if key.is_background() {
            return Some(BACKGROUND);
        }
        locate(&self.spans, key).map(|i| self.labels[i as usize])
    }

    /// Global labels of one block's keys; entry `l - 1` is local label `l`.
    pub fn block_table(&self, block: BlockId) -> Option<&[GlobalLabel]> {
        let i = self.spans.binary_search_by_key(&block, |s| s.block).ok()?;
        let span = self.spans[i];
        let start = span.offset as usize;
        Some(&self.labels[start..start + span.max_label as usize])
    }

    pub fn class_count(&self) -> u32 {
        self.classes
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn spans(&self) -> &[KeySpan] {
        &self.spans
    }

    pub fn labels(&self) -> &[GlobalLabel] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockBox, Boundary, LayoutEntry};

    fn layout(max_labels: &[u32]) -> BlockLayout {
        let entries = max_labels
            .iter()
            .enumerate()
            .map(|(i, &m)| LayoutEntry {
                block: i as BlockId,
                bbox: BlockBox::from_coords([0, 1, 0, 1, i as u32, i as u32 + 1]),
                max_label: m,
            })
            .collect();
        BlockLayout::new(entries).unwrap()
    }

    fn key(block: BlockId, label: LocalLabel) -> GlobalKey {
        GlobalKey::new(block, label)
    }

    fn evidence(a: GlobalKey, b: GlobalKey) -> Correspondence {
        let bbox = BlockBox::from_coords([0, 1, 0, 1, 0, 1]);
        Correspondence { a, b, overlap: 1, boundary: Boundary { region_a: bbox, region_b: bbox } }
    }

    #[test]
    fn test_chain_across_three_blocks() {
        let mut reg = Registry::new(&layout(&[4, 6, 3])).unwrap();
        assert!(reg.union(key(0, 3), key(1, 5)).unwrap());
        assert!(reg.union(key(1, 5), key(2, 2)).unwrap());
        assert!(reg.same_class(key(0, 3), key(2, 2)).unwrap());

        let map = reg.assign_labels();
        let merged = map.lookup(key(0, 3)).unwrap();
        assert_eq!(map.lookup(key(1, 5)), Some(merged));
        assert_eq!(map.lookup(key(2, 2)), Some(merged));
        let others: Vec<_> = [1, 2, 4].iter().map(|&l| map.lookup(key(0, l)).unwrap()).collect();
        assert!(others.iter().all(|&g| g != merged));
        assert_eq!(map.class_count() as usize, 13 - 2);
    }

    #[test]
    fn test_union_is_idempotent() {
        let mut reg = Registry::new(&layout(&[2, 2])).unwrap();
        assert!(reg.union(key(0, 1), key(1, 2)).unwrap());
        assert!(!reg.union(key(1, 2), key(0, 1)).unwrap());
        assert_eq!(reg.unions(), 1);
        assert_eq!(reg.class_count(), 3);
    }

    #[test]
    fn test_merge_order_does_not_change_labels() {
        let edges = [
            (key(0, 1), key(1, 1)),
            (key(1, 2), key(2, 3)),
            (key(2, 3), key(0, 4)),
            (key(1, 1), key(2, 1)),
            (key(0, 2), key(0, 3)),
        ];
        let mut reference = Registry::new(&layout(&[4, 3, 3])).unwrap();
        for &(a, b) in &edges {
            reference.union(a, b).unwrap();
        }
        let expected = reference.assign_labels();

        // Every rotation and its reversal.
        for shift in 0..edges.len() {
            let mut order: Vec<_> = edges.iter().cycle().skip(shift).take(edges.len()).copied().collect();
            for reversed in [false, true] {
                if reversed {
                    order.reverse();
                }
                let mut reg = Registry::new(&layout(&[4, 3, 3])).unwrap();
                for &(a, b) in &order {
                    reg.union(b, a).unwrap();
                }
                assert_eq!(reg.assign_labels(), expected);
            }
        }
    }

    #[test]
    fn test_find_returns_one_representative_per_class() {
        let mut reg = Registry::new(&layout(&[3, 3])).unwrap();
        reg.union(key(0, 1), key(1, 3)).unwrap();
        reg.union(key(0, 2), key(1, 3)).unwrap();
        let rep = reg.find(key(0, 1)).unwrap();
        assert_eq!(reg.find(key(0, 2)).unwrap(), rep);
        assert_eq!(reg.find(key(1, 3)).unwrap(), rep);
        assert_eq!(reg.find(key(0, 3)).unwrap(), key(0, 3));
    }

    #[test]
    fn test_background_is_rejected_and_maps_to_zero() {
        let mut reg = Registry::new(&layout(&[2, 2])).unwrap();
        let err = reg.union(key(0, 0), key(1, 1)).unwrap_err();
        assert!(matches!(err, MergeError::BackgroundUnion(..)));
        assert_eq!(reg.unions(), 0);
        let map = reg.assign_labels();
        assert_eq!(map.lookup(key(0, 0)), Some(0));
        assert_eq!(map.lookup(key(1, 0)), Some(0));
        assert!(map.labels().iter().all(|&g| g != 0));
    }

    #[test]
    fn test_out_of_range_keys_fail_fast() {
        let mut reg = Registry::new(&layout(&[2, 2])).unwrap();
        assert!(matches!(reg.union(key(0, 3), key(1, 1)), Err(MergeError::InvalidKey(_))));
        assert!(matches!(reg.union(key(9, 1), key(1, 1)), Err(MergeError::InvalidKey(_))));
        assert!(matches!(reg.find(key(5, 1)), Err(MergeError::InvalidKey(_))));
    }

    #[test]
    fn test_union_all_is_all_or_nothing() {
        let mut reg = Registry::new(&layout(&[2, 2])).unwrap();
        let batch = [evidence(key(0, 1), key(1, 1)), evidence(key(0, 2), key(1, 7))];
        assert!(reg.union_all(&batch).is_err());
        assert!(!reg.same_class(key(0, 1), key(1, 1)).unwrap());

        let merged = reg.union_all(&batch[..1]).unwrap();
        assert_eq!(merged, 1);
        assert!(reg.same_class(key(0, 1), key(1, 1)).unwrap());
    }

    #[test]
    fn test_assign_twice_is_identical_and_freezes() {
        let mut reg = Registry::new(&layout(&[3, 3])).unwrap();
        reg.union(key(0, 3), key(1, 1)).unwrap();
        let first = reg.assign_labels();
        let second = reg.assign_labels();
        assert_eq!(first, second);
        assert!(reg.is_frozen());
        assert!(matches!(reg.union(key(0, 1), key(1, 2)), Err(MergeError::RegistryFrozen)));
    }

    #[test]
    fn test_labels_follow_key_order() {
        let mut reg = Registry::new(&layout(&[2, 2])).unwrap();
        reg.union(key(1, 2), key(0, 2)).unwrap();
        let map = reg.assign_labels();
        assert_eq!(map.block_table(0).unwrap(), &[1, 2]);
        assert_eq!(map.block_table(1).unwrap(), &[3, 2]);
    }

    #[test]
    fn test_snapshot_restore() {
        let l = layout(&[3, 2]);
        let mut reg = Registry::new(&l).unwrap();
        reg.union(key(0, 1), key(1, 2)).unwrap();
        let restored = Registry::restore(reg.snapshot(), &l).unwrap();
        let mut restored = restored;
        assert!(restored.same_class(key(0, 1), key(1, 2)).unwrap());
        assert_eq!(restored.unions(), 1);

        let other = layout(&[3, 3]);
        assert!(matches!(
            Registry::restore(reg.snapshot(), &other),
            Err(MergeError::CheckpointMismatch(_))
        ));

        let mut broken = reg.snapshot();
        broken.parent[0] = 99;
        assert!(matches!(Registry::restore(broken, &l), Err(MergeError::CorruptCheckpoint(_))));
    }

    #[test]
    fn test_blocks_without_labels() {
        let mut reg = Registry::new(&layout(&[0, 2, 0])).unwrap();
        assert_eq!(reg.len(), 2);
        let map = reg.assign_labels();
        assert_eq!(map.block_table(0).unwrap(), &[] as &[u32]);
        assert_eq!(map.lookup(key(1, 2)), Some(2));
        assert_eq!(map.lookup(key(2, 1)), None);
    }
}
