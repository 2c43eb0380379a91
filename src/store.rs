use crate::block::{self, BlockBox, BlockId, BlockLayout, Boundary, LabelVolume};
use crate::error::MergeError;
use crate::metadata::BlockIndex;
use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Both sides of a pair's shared boundary, same shape.
#[derive(Debug, Clone)]
pub struct BoundarySlices {
    pub boundary: Boundary,
    pub a: LabelVolume,
    pub b: LabelVolume,
}

/// Read-only access to the segmentation stage's per-block label volumes.
/// Implementations must be safe to read from many workers at once.
pub trait BlockStore: Sync {
    fn layout(&self) -> &BlockLayout;

    fn read_block_labels(&self, block: BlockId) -> Result<LabelVolume, MergeError>;

    /// Read a global-frame region of one block.
    fn read_region(&self, block: BlockId, region: &BlockBox) -> Result<LabelVolume, MergeError> {
        let entry = self
            .layout()
            .get(block)
            .ok_or_else(|| MergeError::Input(format!("unknown block {}", block)))?;
        if !entry.bbox.contains(region) {
            return Err(MergeError::Input(format!(
                "region {} is outside block {} ({})",
                region, block, entry.bbox
            )));
        }
        let volume = self.read_block_labels(block)?;
        if volume.shape() != entry.bbox.shape() {
            return Err(MergeError::Input(format!(
                "block {} volume has shape {:?}, layout says {:?}",
                block,
                volume.shape(),
                entry.bbox.shape()
            )));
        }
        volume.crop(&region.relative_to(&entry.bbox))
    }

    fn read_boundary(&self, a: BlockId, b: BlockId) -> Result<BoundarySlices, MergeError> {
        let layout = self.layout();
        let (ea, eb) = match (layout.get(a), layout.get(b)) {
            (Some(ea), Some(eb)) => (ea, eb),
            _ => return Err(MergeError::Input(format!("unknown block in pair {}-{}", a, b))),
        };
        let boundary = block::boundary(&ea.bbox, &eb.bbox)
            .ok_or_else(|| MergeError::Input(format!("blocks {} and {} are not adjacent", a, b)))?;
        Ok(BoundarySlices {
            a: self.read_region(a, &boundary.region_a)?,
            b: self.read_region(b, &boundary.region_b)?,
            boundary,
        })
    }
}

/// Destination for relabeled blocks.
pub trait BlockOutput: Sync {
    /// Must never leave a partially written block observable.
    fn write_block_labels(&self, block: BlockId, volume: &LabelVolume) -> Result<(), MergeError>;

    fn has_output(&self, block: BlockId) -> bool;

    /// Drop every produced block.
    fn clear(&self) -> Result<(), MergeError>;
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a volume through a temp file and rename it into place.
pub fn write_label_volume(path: &Path, volume: &LabelVolume) -> Result<(), MergeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = bincode::encode_to_vec(volume, bincode::config::standard())?;
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_label_volume(path: &Path) -> Result<LabelVolume, MergeError> {
    let bytes = fs::read(path).map_err(|e| MergeError::Input(format!("{}: {}", path.display(), e)))?;
    let (volume, _): (LabelVolume, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| MergeError::Input(format!("{}: {}", path.display(), e)))?;
    volume.check()?;
    Ok(volume)
}

/// Blocks listed in a metadata directory's `index.json`.
pub struct FsBlockStore {
    layout: BlockLayout,
    paths: FxHashMap<BlockId, PathBuf>,
}

impl FsBlockStore {
    pub fn open(metadata_dir: &Path) -> Result<Self, MergeError> {
        let index = BlockIndex::load(metadata_dir)?;
        Self::from_index(metadata_dir, &index)
    }

    pub fn from_index(metadata_dir: &Path, index: &BlockIndex) -> Result<Self, MergeError> {
        let layout = index.layout()?;
        let paths = index
            .done_blocks()
            .into_iter()
            .map(|b| {
                let p = PathBuf::from(&b.path);
                let p = if p.is_absolute() { p } else { metadata_dir.join(p) };
                (b.index, p)
            })
            .collect();
        Ok(Self { layout, paths })
    }

    pub fn block_path(&self, block: BlockId) -> Option<&Path> {
        self.paths.get(&block).map(|p| p.as_path())
    }
}

impl BlockStore for FsBlockStore {
    fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    fn read_block_labels(&self, block: BlockId) -> Result<LabelVolume, MergeError> {
        let path = self
            .block_path(block)
            .ok_or_else(|| MergeError::Input(format!("unknown block {}", block)))?;
        read_label_volume(path)
    }
}

/// One `block_NNNN.bin` file per relabeled block.
pub struct FsBlockOutput {
    dir: PathBuf,
}

impl FsBlockOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_path(&self, block: BlockId) -> PathBuf {
        self.dir.join(format!("block_{:04}.bin", block))
    }

    pub fn read_block_output(&self, block: BlockId) -> Result<LabelVolume, MergeError> {
        read_label_volume(&self.block_path(block))
    }
}

impl BlockOutput for FsBlockOutput {
    fn write_block_labels(&self, block: BlockId, volume: &LabelVolume) -> Result<(), MergeError> {
        write_label_volume(&self.block_path(block), volume)
    }

    fn has_output(&self, block: BlockId) -> bool {
        self.block_path(block).is_file()
    }

    /// Removes only `block_NNNN.bin` files and their temp files. The
    /// directory itself goes only if nothing else is left in it.
    fn clear(&self) -> Result<(), MergeError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if entry.file_type()?.is_file() && name.to_str().is_some_and(is_output_file_name) {
                fs::remove_file(entry.path())?;
            }
        }
        if fs::read_dir(&self.dir)?.next().is_none() {
            fs::remove_dir(&self.dir)?;
        }
        Ok(())
    }
}

fn is_output_file_name(name: &str) -> bool {
    let stem = name.strip_suffix(".tmp").unwrap_or(name);
    stem.strip_prefix("block_")
        .and_then(|rest| rest.strip_suffix(".bin"))
        .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

/// In-memory store, mainly for tests and embedding.
pub struct MemoryBlockStore {
    layout: BlockLayout,
    volumes: FxHashMap<BlockId, LabelVolume>,
}

impl MemoryBlockStore {
    pub fn new(layout: BlockLayout) -> Self {
        Self { layout, volumes: FxHashMap::default() }
    }

    pub fn insert(&mut self, block: BlockId, volume: LabelVolume) {
        self.volumes.insert(block, volume);
    }

    pub fn remove(&mut self, block: BlockId) -> Option<LabelVolume> {
        self.volumes.remove(&block)
    }
}

impl BlockStore for MemoryBlockStore {
    fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    fn read_block_labels(&self, block: BlockId) -> Result<LabelVolume, MergeError> {
        self.volumes
            .get(&block)
            .cloned()
            .ok_or_else(|| MergeError::Input(format!("no label volume for block {}", block)))
    }
}

#[derive(Default)]
pub struct MemoryBlockOutput {
    blocks: Mutex<FxHashMap<BlockId, LabelVolume>>,
}

impl MemoryBlockOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, block: BlockId) -> Option<LabelVolume> {
        self.blocks.lock().ok().and_then(|b| b.get(&block).cloned())
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockOutput for MemoryBlockOutput {
    fn write_block_labels(&self, block: BlockId, volume: &LabelVolume) -> Result<(), MergeError> {
        let mut blocks = self
            .blocks
            .lock()
            .map_err(|_| MergeError::Other("output lock poisoned".to_string()))?;
        blocks.insert(block, volume.clone());
        Ok(())
    }

    fn has_output(&self, block: BlockId) -> bool {
        self.blocks.lock().map(|b| b.contains_key(&block)).unwrap_or(false)
    }

    fn clear(&self) -> Result<(), MergeError> {
        self.blocks
            .lock()
            .map_err(|_| MergeError::Other("output lock poisoned".to_string()))?
            .clear();
        Ok(())
    }
}
