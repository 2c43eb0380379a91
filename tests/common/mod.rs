#![allow(dead_code)]

use blockmerge::block::{generate_blocks, BlockBox, BlockId, BlockLayout, LabelVolume, LayoutEntry};
use blockmerge::executor::CancelToken;
use blockmerge::metadata::{BlockIndex, BlockMeta};
use blockmerge::store::{write_label_volume, BlockStore, MemoryBlockStore};
use blockmerge::MergeError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const VOLUME: [u32; 3] = [1, 12, 12];

/// Object id of a voxel in the whole volume: a 3x3 grid of rectangles
/// separated by background lines.
pub fn ground_truth(y: u32, x: u32) -> u32 {
    if y % 4 == 3 || x % 5 == 4 {
        0
    } else {
        1 + (y / 4) * 10 + x / 5
    }
}

/// 3x3 blocks of 5x5 voxels, neighbours sharing one voxel.
pub fn grid_boxes() -> Vec<BlockBox> {
    generate_blocks(VOLUME, [1, 5, 5], [0, 1, 1])
}

/// What the segmentation stage would produce for `bbox`: ground-truth objects
/// renumbered from 1 in order of first appearance.
pub fn local_volume(bbox: &BlockBox) -> (LabelVolume, u32) {
    let mut ids: HashMap<u32, u32> = HashMap::new();
    let mut data = Vec::with_capacity(bbox.voxels() as usize);
    for _z in bbox.start[0]..bbox.end[0] {
        for y in bbox.start[1]..bbox.end[1] {
            for x in bbox.start[2]..bbox.end[2] {
                let g = ground_truth(y, x);
                if g == 0 {
                    data.push(0);
                    continue;
                }
                let next = ids.len() as u32 + 1;
                data.push(*ids.entry(g).or_insert(next));
            }
        }
    }
    (LabelVolume::new(bbox.shape(), data).unwrap(), ids.len() as u32)
}

pub fn grid_store() -> MemoryBlockStore {
    let boxes = grid_boxes();
    let volumes: Vec<_> = boxes.iter().map(local_volume).collect();
    let layout = BlockLayout::new(
        boxes
            .iter()
            .zip(&volumes)
            .enumerate()
            .map(|(i, (bbox, (_, max)))| LayoutEntry { block: i as BlockId, bbox: *bbox, max_label: *max })
            .collect(),
    )
    .unwrap();
    let mut store = MemoryBlockStore::new(layout);
    for (i, (volume, _)) in volumes.into_iter().enumerate() {
        store.insert(i as BlockId, volume);
    }
    store
}

/// Write the grid as a metadata directory: `index.json` plus one volume per block.
pub fn write_grid(metadata_dir: &Path) -> Vec<BlockBox> {
    let boxes = grid_boxes();
    let mut index = BlockIndex::default();
    for (i, bbox) in boxes.iter().enumerate() {
        let (volume, max_id) = local_volume(bbox);
        let path = format!("labels/block_{:04}.bin", i);
        write_label_volume(&metadata_dir.join(&path), &volume).unwrap();
        index.upsert(BlockMeta {
            index: i as BlockId,
            coords: bbox.coords(),
            path,
            done: true,
            max_id,
        });
    }
    index.save(metadata_dir).unwrap();
    boxes
}

/// Every ground-truth object must carry one global label everywhere, and no
/// global label may cover two objects. Returns the number of objects seen.
pub fn assert_consistent<F>(boxes: &[BlockBox], output: F) -> usize
where
    F: Fn(BlockId) -> LabelVolume,
{
    let mut to_global: HashMap<u32, u32> = HashMap::new();
    let mut to_object: HashMap<u32, u32> = HashMap::new();
    for (i, bbox) in boxes.iter().enumerate() {
        let volume = output(i as BlockId);
        assert_eq!(volume.shape(), bbox.shape());
        for z in bbox.start[0]..bbox.end[0] {
            for y in bbox.start[1]..bbox.end[1] {
                for x in bbox.start[2]..bbox.end[2] {
                    let g = ground_truth(y, x);
                    let label = volume.get(z - bbox.start[0], y - bbox.start[1], x - bbox.start[2]);
                    if g == 0 {
                        assert_eq!(label, 0, "background relabeled at ({}, {}, {})", z, y, x);
                        continue;
                    }
                    assert_ne!(label, 0);
                    assert_eq!(*to_global.entry(g).or_insert(label), label, "object {} split", g);
                    assert_eq!(*to_object.entry(label).or_insert(g), g, "label {} joins two objects", label);
                }
            }
        }
    }
    to_global.len()
}

/// Wraps a store and fires the cancel token on the n-th block read, the way
/// a signal arriving mid-unit would.
pub struct InterruptingStore<S> {
    pub inner: S,
    reads: AtomicUsize,
    cancel_after: usize,
    cancel: CancelToken,
}

impl<S: BlockStore> InterruptingStore<S> {
    pub fn new(inner: S, cancel_after: usize, cancel: CancelToken) -> Self {
        Self { inner, reads: AtomicUsize::new(0), cancel_after, cancel }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl<S: BlockStore> BlockStore for InterruptingStore<S> {
    fn layout(&self) -> &BlockLayout {
        self.inner.layout()
    }

    fn read_block_labels(&self, block: BlockId) -> Result<LabelVolume, MergeError> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.cancel_after {
            self.cancel.cancel();
        }
        self.inner.read_block_labels(block)
    }
}

/// No `.tmp` leftovers anywhere under `dir`.
pub fn assert_no_temp_files(dir: &Path) {
    if !dir.exists() {
        return;
    }
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            assert_no_temp_files(&path);
        } else {
            assert!(
                !path.to_string_lossy().ends_with(".tmp"),
                "temp file left behind: {}",
                path.display()
            );
        }
    }
}
