use crate::collector::SelectionPolicy;
use crate::controller::RunOptions;
use crate::error::MergeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Settings for a merge, read from a JSON file. Every field has a default, so
/// a file only needs the values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Directory holding the segmentation stage's `index.json`.
    pub metadata_dir: PathBuf,
    pub output_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub workers: usize,
    pub checkpoint_every: usize,
    pub restart: bool,
    pub force_overlap: bool,
    pub reapply: bool,
    pub selection: SelectionPolicy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from("./local_metadata"),
            output_dir: PathBuf::from("./merged_blocks"),
            checkpoint_dir: PathBuf::from("./merge_state"),
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            checkpoint_every: 1,
            restart: false,
            force_overlap: false,
            reapply: false,
            selection: SelectionPolicy::default(),
        }
    }
}

impl MergeConfig {
    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let bytes = fs::read(path).map_err(|e| MergeError::Config(format!("{}: {}", path.display(), e)))?;
        let config: MergeConfig = serde_json::from_slice(&bytes)
            .map_err(|e| MergeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MergeError> {
        if self.workers == 0 {
            return Err(MergeError::Config("workers must be at least 1".to_string()));
        }
        if self.checkpoint_every == 0 {
            return Err(MergeError::Config("checkpoint_every must be at least 1".to_string()));
        }
        for (name, fraction) in [
            ("min_fraction_a", self.selection.min_fraction_a),
            ("min_fraction_b", self.selection.min_fraction_b),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(MergeError::Config(format!("{} {} is outside [0, 1]", name, fraction)));
            }
        }
        self.check_dirs_disjoint()
    }

    /// Output is cleared on every new assignment, so it must not share a tree
    /// with the inputs or the checkpoint.
    fn check_dirs_disjoint(&self) -> Result<(), MergeError> {
        let output = normalize(&self.output_dir);
        for (name, dir) in [("metadata_dir", &self.metadata_dir), ("checkpoint_dir", &self.checkpoint_dir)] {
            let other = normalize(dir);
            if output.starts_with(&other) || other.starts_with(&output) {
                return Err(MergeError::Config(format!(
                    "output_dir {} overlaps {} {}",
                    self.output_dir.display(),
                    name,
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            selection: self.selection.clone(),
            force_overlap: self.force_overlap,
            checkpoint_every: self.checkpoint_every,
            restart: self.restart,
            reapply: self.reapply,
        }
    }
}

/// Absolute, lexically cleaned path, with its longest existing prefix
/// resolved through symlinks.
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    };
    let mut clean = PathBuf::new();
    for part in absolute.components() {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other),
        }
    }

    let mut existing = clean.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(real) = fs::canonicalize(existing) {
            return rest.iter().rev().fold(real, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    clean
}
