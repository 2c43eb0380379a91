use crate::block::{BlockId, LabelVolume, BACKGROUND};
use crate::error::MergeError;
use crate::registry::LabelMap;
use crate::store::{BlockOutput, BlockStore};
use serde::Serialize;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ApplyOutcome {
    Written,
    /// Output already present and reapply not requested.
    Skipped,
}

/// Rewrites blocks through a frozen label map. Holds no mutable state, so one
/// applier is shared by every worker.
pub struct PoolApplier<'a> {
    map: &'a LabelMap,
}

impl<'a> PoolApplier<'a> {
    pub fn new(map: &'a LabelMap) -> Self {
        Self { map }
    }

    /// Substitute global labels into one block's local volume.
    pub fn relabel(&self, block: BlockId, volume: &LabelVolume) -> Result<LabelVolume, MergeError> {
        let table = self
            .map
            .block_table(block)
            .ok_or_else(|| MergeError::Input(format!("block {} is not in the label map", block)))?;
        volume.map_labels(|label| {
            if label == BACKGROUND {
                return Ok(BACKGROUND);
            }
            table
                .get(label as usize - 1)
                .copied()
                .ok_or(MergeError::MissingMapping { block, label })
        })
    }

    pub fn apply_block<S, O>(&self, store: &S, output: &O, block: BlockId, reapply: bool) -> Result<ApplyOutcome, MergeError>
    where
        S: BlockStore + ?Sized,
        O: BlockOutput + ?Sized,
    {
        if !reapply && output.has_output(block) {
            debug!(block, "output present, skipping");
            return Ok(ApplyOutcome::Skipped);
        }
        let local = store.read_block_labels(block)?;
        if let Some(entry) = store.layout().get(block) {
            if local.shape() != entry.bbox.shape() {
                return Err(MergeError::Input(format!(
                    "block {} volume has shape {:?}, layout says {:?}",
                    block,
                    local.shape(),
                    entry.bbox.shape()
                )));
            }
        }
        let merged = self.relabel(block, &local)?;
        output.write_block_labels(block, &merged)?;
        debug!(block, voxels = merged.len(), "block relabeled");
        Ok(ApplyOutcome::Written)
    }
}
