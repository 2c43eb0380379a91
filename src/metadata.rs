use crate::block::{BlockBox, BlockId, BlockLayout, LayoutEntry, LocalLabel};
use crate::error::MergeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "index.json";

/// What the segmentation stage records about one block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub index: BlockId,
    /// `[z1, z2, y1, y2, x1, x2]`, half-open.
    pub coords: [u32; 6],
    /// Label volume file, relative to the metadata directory unless absolute.
    pub path: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub max_id: LocalLabel,
}

impl BlockMeta {
    pub fn bbox(&self) -> BlockBox {
        BlockBox::from_coords(self.coords)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    #[serde(default)]
    pub blocks: Vec<BlockMeta>,
}

pub fn index_path(metadata_dir: &Path) -> PathBuf {
    metadata_dir.join(INDEX_FILE)
}

impl BlockIndex {
    /// Read `index.json`; a missing file is an empty index.
    pub fn load(metadata_dir: &Path) -> Result<Self, MergeError> {
        let path = index_path(metadata_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| MergeError::Input(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, metadata_dir: &Path) -> Result<(), MergeError> {
        fs::create_dir_all(metadata_dir)?;
        let path = index_path(metadata_dir);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Replace the entry with the same index, or append.
    pub fn upsert(&mut self, meta: BlockMeta) {
        match self.blocks.iter_mut().find(|b| b.index == meta.index) {
            Some(existing) => *existing = meta,
            None => self.blocks.push(meta),
        }
    }

    /// Finished blocks, ascending by index.
    pub fn done_blocks(&self) -> Vec<&BlockMeta> {
        let mut done: Vec<_> = self.blocks.iter().filter(|b| b.done).collect();
        done.sort_by_key(|b| b.index);
        done
    }

    pub fn layout(&self) -> Result<BlockLayout, MergeError> {
        BlockLayout::new(
            self.done_blocks()
                .into_iter()
                .map(|b| LayoutEntry { block: b.index, bbox: b.bbox(), max_label: b.max_id })
                .collect(),
        )
    }
}
