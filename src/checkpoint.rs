use crate::block::{BlockId, BlockLayout, BlockPair, GlobalLabel, LayoutEntry};
use crate::codec;
use crate::error::MergeError;
use crate::registry::{LabelMap, Registry, RegistrySnapshot};
use bincode::{Decode, Encode};
use fixedbitset::FixedBitSet;
use serde::Serialize;
use std::fmt;

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"BLKMERGE";
pub const FORMAT_VERSION: u32 = 1;

/// How far a persisted run got.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode, Serialize)]
pub enum CheckpointPhase {
    /// Some pairs may still be pending.
    Collecting,
    /// Labels assigned; the registry is frozen.
    Assigned,
    /// Every block has been written.
    Applied,
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointPhase::Collecting => write!(f, "collecting"),
            CheckpointPhase::Assigned => write!(f, "assigned"),
            CheckpointPhase::Applied => write!(f, "applied"),
        }
    }
}

/// Done / failed state of every block pair, indexed by position in the pair list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairProgress {
    pairs: Vec<(BlockId, BlockId)>,
    done: FixedBitSet,
    failed: FixedBitSet,
}

impl PairProgress {
    /// All pairs pending.
    pub fn new(pairs: &[BlockPair]) -> Self {
        let n = pairs.len();
        Self {
            pairs: pairs.iter().map(|p| (p.a, p.b)).collect(),
            done: FixedBitSet::with_capacity(n),
            failed: FixedBitSet::with_capacity(n),
        }
    }

    fn from_parts(pairs: Vec<(BlockId, BlockId)>, done: &[u32], failed: &[u32]) -> Option<Self> {
        let n = pairs.len();
        let mut progress = Self {
            pairs,
            done: FixedBitSet::with_capacity(n),
            failed: FixedBitSet::with_capacity(n),
        };
        for &i in done {
            if i as usize >= n {
                return None;
            }
            progress.done.insert(i as usize);
        }
        for &i in failed {
            if i as usize >= n {
                return None;
            }
            progress.failed.insert(i as usize);
        }
        Some(progress)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pair(&self, i: usize) -> (BlockId, BlockId) {
        self.pairs[i]
    }

    /// Same pairs in the same order.
    pub fn matches(&self, pairs: &[BlockPair]) -> bool {
        self.pairs.len() == pairs.len() && self.pairs.iter().zip(pairs).all(|(&(a, b), p)| a == p.a && b == p.b)
    }

    pub fn is_done(&self, i: usize) -> bool {
        self.done.contains(i)
    }

    pub fn is_failed(&self, i: usize) -> bool {
        self.failed.contains(i)
    }

    pub fn mark_done(&mut self, i: usize) {
        self.done.insert(i);
        self.failed.set(i, false);
    }

    /// Failed pairs stay pending.
    pub fn mark_failed(&mut self, i: usize) {
        self.failed.insert(i);
    }

    /// Forget last attempt's failures before retrying.
    pub fn clear_failures(&mut self) {
        self.failed.clear();
    }

    pub fn pending(&self) -> Vec<usize> {
        (0..self.pairs.len()).filter(|&i| !self.done.contains(i)).collect()
    }

    pub fn failed(&self) -> Vec<usize> {
        self.failed.ones().collect()
    }

    pub fn done_count(&self) -> usize {
        self.done.count_ones(..)
    }

    pub fn failed_count(&self) -> usize {
        self.failed.count_ones(..)
    }

    pub fn pending_count(&self) -> usize {
        self.pairs.len() - self.done_count()
    }

    pub fn all_done(&self) -> bool {
        self.pending_count() == 0
    }
}

/// Everything needed to resume a run in a later process.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointRecord {
    pub version: u32,
    pub phase: CheckpointPhase,
    /// Layout the run was started with; a resume against a different one is refused.
    pub layout: Vec<LayoutEntry>,
    pub progress: PairProgress,
    pub registry: RegistrySnapshot,
    /// Frozen label table, present once labels are assigned.
    pub labels: Option<Vec<GlobalLabel>>,
    pub timestamp: String,
}

// Bitsets are stored as sorted index lists.
impl Encode for CheckpointRecord {
    fn encode<E: bincode::enc::Encoder>(&self, encoder: &mut E) -> Result<(), bincode::error::EncodeError> {
        self.version.encode(encoder)?;
        self.phase.encode(encoder)?;
        self.layout.encode(encoder)?;
        self.progress.pairs.encode(encoder)?;
        let done: Vec<u32> = self.progress.done.ones().map(|i| i as u32).collect();
        done.encode(encoder)?;
        let failed: Vec<u32> = self.progress.failed.ones().map(|i| i as u32).collect();
        failed.encode(encoder)?;
        self.registry.encode(encoder)?;
        self.labels.encode(encoder)?;
        self.timestamp.encode(encoder)?;
        Ok(())
    }
}

impl<Context> Decode<Context> for CheckpointRecord {
    fn decode<D: bincode::de::Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, bincode::error::DecodeError> {
        let version = u32::decode(decoder)?;
        let phase = CheckpointPhase::decode(decoder)?;
        let layout: Vec<LayoutEntry> = codec::decode_seq(decoder)?;
        let pairs: Vec<(BlockId, BlockId)> = codec::decode_seq(decoder)?;
        let done: Vec<u32> = codec::decode_seq(decoder)?;
        let failed: Vec<u32> = codec::decode_seq(decoder)?;
        let progress = PairProgress::from_parts(pairs, &done, &failed)
            .ok_or_else(|| bincode::error::DecodeError::OtherString("pair index out of range".to_string()))?;
        let registry = RegistrySnapshot::decode(decoder)?;
        let labels: Option<Vec<GlobalLabel>> = codec::decode_opt_seq(decoder)?;
        let timestamp = codec::decode_string(decoder)?;

        Ok(CheckpointRecord {
            version,
            phase,
            layout,
            progress,
            registry,
            labels,
            timestamp,
        })
    }
}

impl CheckpointRecord {
    pub fn new(
        phase: CheckpointPhase,
        layout: &BlockLayout,
        progress: &PairProgress,
        registry: &Registry,
        labels: Option<&LabelMap>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            phase,
            layout: layout.entries().to_vec(),
            progress: progress.clone(),
            registry: registry.snapshot(),
            labels: labels.map(|m| m.labels().to_vec()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MergeError> {
        let mut bytes = CHECKPOINT_MAGIC.to_vec();
        bytes.extend(bincode::encode_to_vec(self, bincode::config::standard())?);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MergeError> {
        let body = bytes
            .strip_prefix(CHECKPOINT_MAGIC.as_slice())
            .ok_or_else(|| MergeError::CorruptCheckpoint("bad magic".to_string()))?;
        let (record, read): (CheckpointRecord, usize) =
            bincode::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| MergeError::CorruptCheckpoint(e.to_string()))?;
        if read != body.len() {
            return Err(MergeError::CorruptCheckpoint(format!(
                "{} trailing bytes",
                body.len() - read
            )));
        }
        if record.version != FORMAT_VERSION {
            return Err(MergeError::CorruptCheckpoint(format!(
                "format version {} (expected {})",
                record.version, FORMAT_VERSION
            )));
        }
        Ok(record)
    }

    /// Check the record was written for this layout and its pairs.
    pub fn verify_layout(&self, layout: &BlockLayout, pairs: &[BlockPair]) -> Result<(), MergeError> {
        if self.layout.as_slice() != layout.entries() {
            return Err(MergeError::CheckpointMismatch(format!(
                "checkpoint covers {} blocks, index lists {} (or their boxes/max ids differ)",
                self.layout.len(),
                layout.len()
            )));
        }
        if !self.progress.matches(pairs) {
            return Err(MergeError::CheckpointMismatch("block pair list differs".to_string()));
        }
        Ok(())
    }

    pub fn restore_registry(&self, layout: &BlockLayout) -> Result<Registry, MergeError> {
        Registry::restore(self.registry.clone(), layout)
    }

    pub fn label_map(&self) -> Result<Option<LabelMap>, MergeError> {
        match &self.labels {
            Some(labels) => LabelMap::from_parts(self.registry.spans.clone(), labels.clone()).map(Some),
            None => Ok(None),
        }
    }
}
