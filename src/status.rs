use crate::block::BlockId;
use crate::checkpoint::CheckpointPhase;
use crate::checkpoint_manager::CheckpointManager;
use crate::store::{BlockOutput, BlockStore};
use serde::Serialize;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub phase: CheckpointPhase,
    pub saved_at: String,
    pub pairs_total: usize,
    pub pairs_done: usize,
    pub pairs_pending: usize,
    pub pairs_failed: usize,
    pub classes: Option<u32>,
    /// False when the block index changed since the checkpoint was written.
    pub layout_matches: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CheckpointStatus {
    Missing,
    Present(CheckpointSummary),
    Unreadable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockStatus {
    pub block: BlockId,
    pub output_written: bool,
    /// Blocks it shares a boundary with.
    pub neighbors: Vec<BlockId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub checkpoint: CheckpointStatus,
    pub blocks: Vec<BlockStatus>,
}

impl StatusReport {
    pub fn outputs_written(&self) -> usize {
        self.blocks.iter().filter(|b| b.output_written).count()
    }
}

/// Read-only snapshot of a merge directory. Never fails: an unreadable
/// checkpoint is reported as such.
pub fn status<S, O>(store: &S, output: &O, checkpoints: &CheckpointManager) -> StatusReport
where
    S: BlockStore + ?Sized,
    O: BlockOutput + ?Sized,
{
    let layout = store.layout();
    let checkpoint = match checkpoints.load() {
        Ok(None) => CheckpointStatus::Missing,
        Ok(Some(record)) => {
            let pairs = layout.pairs();
            CheckpointStatus::Present(CheckpointSummary {
                phase: record.phase,
                saved_at: record.timestamp.clone(),
                pairs_total: record.progress.len(),
                pairs_done: record.progress.done_count(),
                pairs_pending: record.progress.pending_count(),
                pairs_failed: record.progress.failed_count(),
                classes: record.labels.as_ref().map(|l| l.iter().copied().max().unwrap_or(0)),
                layout_matches: record.verify_layout(layout, &pairs).is_ok(),
            })
        }
        Err(e) => CheckpointStatus::Unreadable { reason: e.to_string() },
    };
    let blocks = layout
        .block_ids()
        .map(|block| BlockStatus {
            block,
            output_written: output.has_output(block),
            neighbors: layout.neighbors(block).to_vec(),
        })
        .collect();
    StatusReport { checkpoint, blocks }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.checkpoint {
            CheckpointStatus::Missing => writeln!(f, "checkpoint: none")?,
            CheckpointStatus::Unreadable { reason } => writeln!(f, "checkpoint: unreadable ({})", reason)?,
            CheckpointStatus::Present(c) => {
                writeln!(f, "checkpoint: {} (saved {})", c.phase, c.saved_at)?;
                writeln!(
                    f,
                    "  pairs: {} done, {} pending, {} failed of {}",
                    c.pairs_done, c.pairs_pending, c.pairs_failed, c.pairs_total
                )?;
                if let Some(classes) = c.classes {
                    writeln!(f, "  global labels: {}", classes)?;
                }
                if !c.layout_matches {
                    writeln!(f, "  block index changed since this checkpoint; rerun with --restart")?;
                }
            }
        }
        writeln!(f, "outputs: {}/{} blocks", self.outputs_written(), self.blocks.len())?;
        for b in &self.blocks {
            writeln!(f, "  block {:>4}  {}", b.block, if b.output_written { "written" } else { "pending" })?;
        }
        Ok(())
    }
}
