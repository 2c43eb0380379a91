use crate::checkpoint::CheckpointRecord;
use crate::error::MergeError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

pub const CHECKPOINT_FILE: &str = "merge_state.bin";

/// Owns the checkpoint file of one merge directory. Saves are serialized and
/// go through a temp file, so the previous good checkpoint survives a failed write.
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    checkpoint_file: PathBuf,
    temp_file: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        let checkpoint_dir = checkpoint_dir.into();
        Self {
            checkpoint_file: checkpoint_dir.join(CHECKPOINT_FILE),
            temp_file: checkpoint_dir.join(format!("{}.tmp", CHECKPOINT_FILE)),
            checkpoint_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn path(&self) -> &Path {
        &self.checkpoint_file
    }

    pub fn checkpoint_exists(&self) -> bool {
        self.checkpoint_file.is_file()
    }

    pub fn save(&self, record: &CheckpointRecord) -> Result<(), MergeError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| MergeError::Other("checkpoint lock poisoned".to_string()))?;

        fs::create_dir_all(&self.checkpoint_dir)?;
        let bytes = record.to_bytes()?;
        {
            // A stale temp file from a crashed writer is simply overwritten.
            let mut file = File::create(&self.temp_file)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&self.temp_file, &self.checkpoint_file)?;

        info!(
            phase = %record.phase,
            done = record.progress.done_count(),
            pending = record.progress.pending_count(),
            bytes = bytes.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// `Ok(None)` when no checkpoint has been written yet.
    pub fn load(&self) -> Result<Option<CheckpointRecord>, MergeError> {
        if !self.checkpoint_exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.checkpoint_file)?;
        let record = CheckpointRecord::from_bytes(&bytes)?;
        info!(
            phase = %record.phase,
            saved_at = %record.timestamp,
            done = record.progress.done_count(),
            pending = record.progress.pending_count(),
            "loaded checkpoint"
        );
        Ok(Some(record))
    }

    /// Remove the checkpoint and any temp file, and the directory once empty.
    pub fn clear(&self) -> Result<(), MergeError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| MergeError::Other("checkpoint lock poisoned".to_string()))?;
        for path in [&self.checkpoint_file, &self.temp_file] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        if self.checkpoint_dir.is_dir() && fs::read_dir(&self.checkpoint_dir)?.next().is_none() {
            fs::remove_dir(&self.checkpoint_dir)?;
        }
        Ok(())
    }
}
