use crate::codec;
use crate::error::MergeError;
use bincode::{Decode, Encode};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

pub type BlockId = u32;
pub type LocalLabel = u32;
pub type GlobalLabel = u32;

/// Reserved "no object" label, both locally and globally.
pub const BACKGROUND: LocalLabel = 0;

/// One local label, made unique across the volume by its block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize, Deserialize)]
pub struct GlobalKey {
    pub block: BlockId,
    pub label: LocalLabel,
}

impl GlobalKey {
    pub const fn new(block: BlockId, label: LocalLabel) -> Self {
        Self { block, label }
    }

    pub fn is_background(&self) -> bool {
        self.label == BACKGROUND
    }
}

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.label)
    }
}

/// Half-open voxel box in global (z, y, x) coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct BlockBox {
    pub start: [u32; 3],
    pub end: [u32; 3],
}

impl BlockBox {
    pub fn new(start: [u32; 3], end: [u32; 3]) -> Self {
        Self { start, end }
    }

    /// Build from the `[z1, z2, y1, y2, x1, x2]` layout used by block metadata.
    pub fn from_coords(c: [u32; 6]) -> Self {
        Self {
            start: [c[0], c[2], c[4]],
            end: [c[1], c[3], c[5]],
        }
    }

    pub fn coords(&self) -> [u32; 6] {
        [self.start[0], self.end[0], self.start[1], self.end[1], self.start[2], self.end[2]]
    }

    pub fn shape(&self) -> [u32; 3] {
        [
            self.end[0].saturating_sub(self.start[0]),
            self.end[1].saturating_sub(self.start[1]),
            self.end[2].saturating_sub(self.start[2]),
        ]
    }

    pub fn voxels(&self) -> u64 {
        self.shape().iter().map(|&d| d as u64).product()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels() == 0
    }

    pub fn intersect(&self, other: &BlockBox) -> Option<BlockBox> {
        let mut start = [0; 3];
        let mut end = [0; 3];
        for axis in 0..3 {
            start[axis] = self.start[axis].max(other.start[axis]);
            end[axis] = self.end[axis].min(other.end[axis]);
            if end[axis] <= start[axis] {
                return None;
            }
        }
        Some(BlockBox { start, end })
    }

    pub fn contains(&self, other: &BlockBox) -> bool {
        (0..3).all(|axis| self.start[axis] <= other.start[axis] && other.end[axis] <= self.end[axis])
    }

    /// Express this box in the local frame of `origin` (which must contain it).
    pub fn relative_to(&self, origin: &BlockBox) -> BlockBox {
        let mut start = [0; 3];
        let mut end = [0; 3];
        for axis in 0..3 {
            start[axis] = self.start[axis] - origin.start[axis];
            end[axis] = self.end[axis] - origin.start[axis];
        }
        BlockBox { start, end }
    }
}

impl fmt::Display for BlockBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.coords();
        write!(f, "z[{}..{}) y[{}..{}) x[{}..{})", c[0], c[1], c[2], c[3], c[4], c[5])
    }
}

/// The two global regions read from each side of an adjacent pair.
/// Both regions always have the same shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Boundary {
    pub region_a: BlockBox,
    pub region_b: BlockBox,
}

/// Shared boundary of two blocks: their intersection when they overlap, or the
/// two facing planes when they abut on exactly one axis. Edge and corner
/// contacts are not adjacent.
pub fn boundary(a: &BlockBox, b: &BlockBox) -> Option<Boundary> {
    if let Some(shared) = a.intersect(b) {
        return Some(Boundary { region_a: shared, region_b: shared });
    }

    let mut touching = None;
    let mut start = [0; 3];
    let mut end = [0; 3];
    for axis in 0..3 {
        let lo = a.start[axis].max(b.start[axis]);
        let hi = a.end[axis].min(b.end[axis]);
        if lo < hi {
            start[axis] = lo;
            end[axis] = hi;
            continue;
        }
        let abuts = a.end[axis] == b.start[axis] || b.end[axis] == a.start[axis];
        if lo == hi && abuts && touching.is_none() {
            touching = Some(axis);
            continue;
        }
        return None;
    }

    let axis = touching?;
    let mut region_a = BlockBox { start, end };
    let mut region_b = BlockBox { start, end };
    if a.end[axis] == b.start[axis] {
        region_a.start[axis] = a.end[axis] - 1;
        region_a.end[axis] = a.end[axis];
        region_b.start[axis] = b.start[axis];
        region_b.end[axis] = b.start[axis] + 1;
    } else {
        region_a.start[axis] = a.start[axis];
        region_a.end[axis] = a.start[axis] + 1;
        region_b.start[axis] = b.end[axis] - 1;
        region_b.end[axis] = b.end[axis];
    }
    Some(Boundary { region_a, region_b })
}

/// Tile a volume into blocks of `block` voxels, consecutive blocks sharing
/// `overlap` voxels along each axis.
pub fn generate_blocks(volume: [u32; 3], block: [u32; 3], overlap: [u32; 3]) -> Vec<BlockBox> {
    let step = [
        block[0].saturating_sub(overlap[0]).max(1),
        block[1].saturating_sub(overlap[1]).max(1),
        block[2].saturating_sub(overlap[2]).max(1),
    ];
    let mut blocks = Vec::new();
    for z in (0..volume[0]).step_by(step[0] as usize) {
        for y in (0..volume[1]).step_by(step[1] as usize) {
            for x in (0..volume[2]).step_by(step[2] as usize) {
                blocks.push(BlockBox::new(
                    [z, y, x],
                    [
                        (z + block[0]).min(volume[0]),
                        (y + block[1]).min(volume[1]),
                        (x + block[2]).min(volume[2]),
                    ],
                ));
            }
        }
    }
    blocks
}

/// Dense z-major label array of one block (or a region of one).
#[derive(Clone, Debug, PartialEq, Eq, Encode)]
pub struct LabelVolume {
    shape: [u32; 3],
    data: Vec<u32>,
}

impl<Context> Decode<Context> for LabelVolume {
    fn decode<D: bincode::de::Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, bincode::error::DecodeError> {
        let shape = <[u32; 3]>::decode(decoder)?;
        let data = codec::decode_seq(decoder)?;
        Ok(LabelVolume { shape, data })
    }
}

impl LabelVolume {
    pub fn new(shape: [u32; 3], data: Vec<u32>) -> Result<Self, MergeError> {
        let volume = Self { shape, data };
        volume.check()?;
        Ok(volume)
    }

    /// Shape and voxel count agree. Decoded volumes must pass this before use.
    pub fn check(&self) -> Result<(), MergeError> {
        let expected = self.shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d as usize));
        if expected != Some(self.data.len()) {
            return Err(MergeError::Input(format!(
                "label volume of shape {:?} does not hold {} voxels",
                self.shape,
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn zeros(shape: [u32; 3]) -> Self {
        let len: usize = shape.iter().map(|&d| d as usize).product();
        Self { shape, data: vec![BACKGROUND; len] }
    }

    pub fn shape(&self) -> [u32; 3] {
        self.shape
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn index(&self, z: u32, y: u32, x: u32) -> usize {
        (z as usize * self.shape[1] as usize + y as usize) * self.shape[2] as usize + x as usize
    }

    pub fn get(&self, z: u32, y: u32, x: u32) -> u32 {
        self.data[self.index(z, y, x)]
    }

    pub fn set(&mut self, z: u32, y: u32, x: u32, label: u32) {
        let idx = self.index(z, y, x);
        self.data[idx] = label;
    }

    /// Paint `label` over a local-frame region.
    pub fn fill(&mut self, region: &BlockBox, label: u32) {
        for z in region.start[0]..region.end[0].min(self.shape[0]) {
            for y in region.start[1]..region.end[1].min(self.shape[1]) {
                let row = self.index(z, y, 0);
                let x0 = region.start[2].min(self.shape[2]) as usize;
                let x1 = region.end[2].min(self.shape[2]) as usize;
                self.data[row + x0..row + x1].fill(label);
            }
        }
    }

    pub fn max_label(&self) -> u32 {
        self.data.iter().copied().max().unwrap_or(BACKGROUND)
    }

    /// Copy out a local-frame region.
    pub fn crop(&self, region: &BlockBox) -> Result<LabelVolume, MergeError> {
        let bounds = BlockBox::new([0; 3], self.shape);
        if !bounds.contains(region) {
            return Err(MergeError::Input(format!(
                "region {} exceeds volume shape {:?}",
                region, self.shape
            )));
        }
        let shape = region.shape();
        let mut data = Vec::with_capacity(region.voxels() as usize);
        for z in region.start[0]..region.end[0] {
            for y in region.start[1]..region.end[1] {
                let row = self.index(z, y, 0);
                data.extend_from_slice(&self.data[row + region.start[2] as usize..row + region.end[2] as usize]);
            }
        }
        Ok(LabelVolume { shape, data })
    }

    /// Same shape, every voxel passed through `f`.
    pub fn map_labels<F>(&self, mut f: F) -> Result<LabelVolume, MergeError>
    where
        F: FnMut(u32) -> Result<u32, MergeError>,
    {
        let data = self.data.iter().map(|&v| f(v)).collect::<Result<Vec<_>, _>>()?;
        Ok(LabelVolume { shape: self.shape, data })
    }
}

/// A participating block: where it sits and how many local labels it holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct LayoutEntry {
    pub block: BlockId,
    pub bbox: BlockBox,
    pub max_label: LocalLabel,
}

/// An adjacent pair of blocks, `a < b`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlockPair {
    pub a: BlockId,
    pub b: BlockId,
    pub boundary: Boundary,
}

impl fmt::Display for BlockPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.a, self.b)
    }
}

/// The blocks taking part in a merge, ordered by id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockLayout {
    entries: Vec<LayoutEntry>,
}

impl BlockLayout {
    pub fn new(mut entries: Vec<LayoutEntry>) -> Result<Self, MergeError> {
        entries.sort_by_key(|e| e.block);
        if let Some((x, _)) = entries.iter().tuple_windows().find(|(x, y)| x.block == y.block) {
            return Err(MergeError::Input(format!("block {} listed twice", x.block)));
        }
        if let Some(e) = entries.iter().find(|e| e.bbox.is_empty()) {
            return Err(MergeError::Input(format!("block {} has an empty box {}", e.block, e.bbox)));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, block: BlockId) -> Option<&LayoutEntry> {
        self.entries
            .binary_search_by_key(&block, |e| e.block)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.entries.iter().map(|e| e.block)
    }

    pub fn total_labels(&self) -> u64 {
        self.entries.iter().map(|e| e.max_label as u64).sum()
    }

    /// Every adjacent pair, in ascending `(a, b)` order.
    pub fn pairs(&self) -> Vec<BlockPair> {
        self.entries
            .iter()
            .tuple_combinations()
            .filter_map(|(x, y)| {
                boundary(&x.bbox, &y.bbox).map(|boundary| BlockPair { a: x.block, b: y.block, boundary })
            })
            .collect()
    }

    pub fn neighbors(&self, block: BlockId) -> SmallVec<[BlockId; 6]> {
        let Some(me) = self.get(block) else {
            return SmallVec::new();
        };
        self.entries
            .iter()
            .filter(|e| e.block != block && boundary(&me.bbox, &e.bbox).is_some())
            .map(|e| e.block)
            .collect()
    }
}
