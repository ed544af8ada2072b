//! Checkpoint files
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! ckpt-00000100.safetensors   numbered, retained up to `keep_last`
//! ckpt-00000100.json          metadata sibling
//! latest.json                 pointer to the newest crash-recovery state
//! latest-00000120.safetensors weights named by latest.json
//! samples/                    preview audio, never rotated
//! ```
//!
//! Every file is written under a temporary name and renamed into place.
//! `latest.json` is the only file ever replaced; a reader that races a
//! writer retries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::error::{Result, TtsError};
use super::backend::{SchedulerState, TrainingSnapshot};

pub const LATEST_POINTER: &str = "latest.json";
pub const SAMPLES_DIR: &str = "samples";
const FORMAT_VERSION: u32 = 1;
const READ_ATTEMPTS: usize = 3;
const READ_BACKOFF: Duration = Duration::from_millis(25);
const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";

/// Sibling metadata of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    /// Update sequence number
    pub sequence: u64,
    pub epoch: u64,
    /// Updates completed within `epoch`
    pub step_in_epoch: u64,
    pub updates_per_epoch: u64,
    pub global_step: u64,
    pub best_metric: Option<f64>,
    pub last_loss: Option<f64>,
    pub scheduler: SchedulerState,
    /// Weights file name, relative to the checkpoint directory
    pub weights_file: String,
    pub created_at: DateTime<Utc>,
}

impl CheckpointMeta {
    /// Epoch and in-epoch step of the first update after this checkpoint
    pub fn next_position(&self, updates_per_epoch: u64) -> (u64, u64) {
        if self.step_in_epoch >= updates_per_epoch {
            (self.epoch + 1, 0)
        } else {
            (self.epoch, self.step_in_epoch)
        }
    }
}

/// Position and metrics stamped into a new checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointPosition {
    pub sequence: u64,
    pub epoch: u64,
    pub step_in_epoch: u64,
    pub updates_per_epoch: u64,
    pub best_metric: Option<f64>,
    pub last_loss: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Numbered,
    Latest,
}

/// A checkpoint on disk
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub kind: CheckpointKind,
    pub meta: CheckpointMeta,
    pub weights_path: PathBuf,
    pub meta_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    keep_last: usize,
}

fn io_error(path: &Path, action: &str, e: impl std::fmt::Display) -> TtsError {
    TtsError::Io {
        message: format!("Failed to {}: {}", action, e),
        path: Some(path.to_path_buf()),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, "write", e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_error(path, "rename", e))
}

fn save_tensors(path: &Path, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let tmp = tmp_path(path);
    candle_core::safetensors::save(tensors, &tmp).map_err(|e| io_error(&tmp, "write weights", e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_error(path, "rename", e))
}

impl CheckpointStore {
    pub fn open(dir: impl Into<PathBuf>, keep_last: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(SAMPLES_DIR))
            .map_err(|e| io_error(&dir, "create checkpoint directory", e))?;
        let store = Self {
            dir,
            keep_last: keep_last.max(1),
        };

        let swept = store.sweep_orphans()?;
        if !swept.is_empty() {
            warn!("Removed {} partial checkpoint file(s) from an interrupted write", swept.len());
        }
        match std::fs::read(store.dir.join(LATEST_POINTER)) {
            Ok(bytes) => {
                if let Ok(meta) = serde_json::from_slice::<CheckpointMeta>(&bytes) {
                    store.remove_stale_latest(&meta.weights_file);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => store.remove_stale_latest(""),
            Err(_) => {}
        }
        Ok(store)
    }

    /// Delete `*.tmp` files and numbered weights without a metadata sibling.
    ///
    /// Both are left only by a write that never finished; a finished write
    /// renames its weights before its metadata.
    fn sweep_orphans(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, "list checkpoints", e))? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let orphan = name.ends_with(".tmp")
                || name
                    .strip_suffix(".safetensors")
                    .filter(|stem| stem.starts_with("ckpt-"))
                    .is_some_and(|stem| !self.dir.join(format!("{}.json", stem)).exists());
            if !orphan {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed orphan {}", path.display());
                    removed.push(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, "remove orphan", e)),
            }
        }
        Ok(removed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.dir.join(SAMPLES_DIR)
    }

    fn numbered_stem(sequence: u64) -> String {
        format!("ckpt-{:08}", sequence)
    }

    fn parse_numbered(name: &str) -> Option<u64> {
        name.strip_prefix("ckpt-")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    /// Write a checkpoint of `kind` for `snapshot`
    pub fn write(
        &self,
        kind: CheckpointKind,
        snapshot: &TrainingSnapshot,
        position: &CheckpointPosition,
    ) -> Result<CheckpointRecord> {
        let (weights_file, meta_path) = match kind {
            CheckpointKind::Numbered => {
                let stem = Self::numbered_stem(position.sequence);
                (format!("{}.safetensors", stem), self.dir.join(format!("{}.json", stem)))
            }
            CheckpointKind::Latest => (
                format!("latest-{:08}.safetensors", position.sequence),
                self.dir.join(LATEST_POINTER),
            ),
        };
        let weights_path = self.dir.join(&weights_file);

        let mut tensors = HashMap::new();
        for (prefix, map) in [(MODEL_PREFIX, &snapshot.weights), (OPTIM_PREFIX, &snapshot.optimizer)] {
            for (name, tensor) in map {
                tensors.insert(format!("{}{}", prefix, name), tensor.to_device(&Device::Cpu)?);
            }
        }
        save_tensors(&weights_path, &tensors)?;

        let meta = CheckpointMeta {
            format_version: FORMAT_VERSION,
            sequence: position.sequence,
            epoch: position.epoch,
            step_in_epoch: position.step_in_epoch,
            updates_per_epoch: position.updates_per_epoch,
            global_step: snapshot.global_step,
            best_metric: position.best_metric,
            last_loss: position.last_loss,
            scheduler: snapshot.scheduler.clone(),
            weights_file,
            created_at: Utc::now(),
        };
        write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)?;

        if kind == CheckpointKind::Latest {
            self.remove_stale_latest(&meta.weights_file);
        }

        debug!("Wrote {:?} checkpoint {} to {}", kind, meta.sequence, weights_path.display());
        Ok(CheckpointRecord {
            kind,
            meta,
            weights_path,
            meta_path,
        })
    }

    fn remove_stale_latest(&self, current: &str) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("latest-") && name.ends_with(".safetensors") && name != current {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("Failed to remove stale {}: {}", name, e);
                }
            }
        }
    }

    /// Numbered sequences on disk, ascending
    pub fn numbered(&self) -> Result<Vec<u64>> {
        let mut sequences = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, "list checkpoints", e))? {
            let entry = entry?;
            if let Some(seq) = Self::parse_numbered(&entry.file_name().to_string_lossy()) {
                sequences.push(seq);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    /// Delete the oldest numbered checkpoints beyond `keep_last`, along
    /// with any partial files an interrupted write left behind
    pub fn prune(&self) -> Result<Vec<u64>> {
        self.sweep_orphans()?;
        let sequences = self.numbered()?;
        let excess = sequences.len().saturating_sub(self.keep_last);
        let mut removed = Vec::new();

        for &seq in &sequences[..excess] {
            let stem = Self::numbered_stem(seq);
            for ext in ["safetensors", "json"] {
                let path = self.dir.join(format!("{}.{}", stem, ext));
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(&path, "prune checkpoint", e)),
                }
            }
            removed.push(seq);
        }

        if !removed.is_empty() {
            info!("Pruned checkpoints {:?} (keeping {})", removed, self.keep_last);
        }
        Ok(removed)
    }

    fn read_meta(path: &Path) -> Result<CheckpointMeta> {
        let content = std::fs::read_to_string(path).map_err(|e| TtsError::corrupt(path, e))?;
        let meta: CheckpointMeta =
            serde_json::from_str(&content).map_err(|e| TtsError::corrupt(path, e))?;
        if meta.format_version != FORMAT_VERSION {
            return Err(TtsError::corrupt(
                path,
                format!("unsupported format version {}", meta.format_version),
            ));
        }
        Ok(meta)
    }

    fn record(&self, kind: CheckpointKind, meta_path: PathBuf) -> Result<CheckpointRecord> {
        let meta = Self::read_meta(&meta_path)?;
        let weights_path = self.dir.join(&meta.weights_file);
        if !weights_path.is_file() {
            return Err(TtsError::corrupt(&weights_path, "weights file missing"));
        }
        Ok(CheckpointRecord {
            kind,
            meta,
            weights_path,
            meta_path,
        })
    }

    pub fn numbered_record(&self, sequence: u64) -> Result<CheckpointRecord> {
        let path = self
            .dir
            .join(format!("{}.json", Self::numbered_stem(sequence)));
        let record = self.record(CheckpointKind::Numbered, path)?;
        if record.meta.sequence != sequence {
            return Err(TtsError::corrupt(
                &record.meta_path,
                format!("file is named for update {} but records {}", sequence, record.meta.sequence),
            ));
        }
        Ok(record)
    }

    /// The `latest` checkpoint, retrying reads that race a writer.
    ///
    /// Sleeps between attempts; async callers run it on the blocking pool.
    pub fn latest(&self) -> Result<Option<CheckpointRecord>> {
        let path = self.dir.join(LATEST_POINTER);
        let mut last_error = None;

        for attempt in 0..READ_ATTEMPTS {
            if !path.exists() {
                return Ok(None);
            }
            match self.record(CheckpointKind::Latest, path.clone()) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    debug!("Reading latest checkpoint failed (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                    std::thread::sleep(READ_BACKOFF);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TtsError::corrupt(&path, "unreadable")))
    }

    /// Highest-sequence checkpoint among numbered and latest
    pub fn find_resume_point(&self) -> Result<Option<CheckpointRecord>> {
        let numbered = match self.numbered()?.last() {
            Some(&seq) => Some(self.numbered_record(seq)?),
            None => None,
        };
        let latest = self.latest()?;

        Ok(match (numbered, latest) {
            (Some(n), Some(l)) if l.meta.sequence > n.meta.sequence => Some(l),
            (Some(n), _) => Some(n),
            (None, l) => l,
        })
    }

    /// Read tensors back into a snapshot
    pub fn load(&self, record: &CheckpointRecord) -> Result<TrainingSnapshot> {
        let path = &record.weights_path;
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| TtsError::corrupt(path, e))?;

        let mut weights = HashMap::new();
        let mut optimizer = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(key) = name.strip_prefix(MODEL_PREFIX) {
                weights.insert(key.to_string(), tensor);
            } else if let Some(key) = name.strip_prefix(OPTIM_PREFIX) {
                optimizer.insert(key.to_string(), tensor);
            } else {
                return Err(TtsError::corrupt(path, format!("unexpected tensor '{}'", name)));
            }
        }
        if weights.is_empty() {
            return Err(TtsError::corrupt(path, "no model tensors"));
        }

        Ok(TrainingSnapshot {
            weights,
            optimizer,
            scheduler: record.meta.scheduler.clone(),
            global_step: record.meta.global_step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(step: u64) -> TrainingSnapshot {
        let mut weights = HashMap::new();
        weights.insert(
            "gpt".to_string(),
            Tensor::from_vec(vec![step as f32; 4], 4, &Device::Cpu).unwrap(),
        );
        let mut optimizer = HashMap::new();
        optimizer.insert(
            "gpt".to_string(),
            Tensor::from_vec(vec![0.5f32; 4], 4, &Device::Cpu).unwrap(),
        );
        TrainingSnapshot {
            weights,
            optimizer,
            scheduler: SchedulerState {
                learning_rate: 0.01,
                step,
                extra: BTreeMap::new(),
            },
            global_step: step,
        }
    }

    fn position(sequence: u64) -> CheckpointPosition {
        CheckpointPosition {
            sequence,
            epoch: sequence / 10,
            step_in_epoch: sequence % 10,
            updates_per_epoch: 10,
            best_metric: Some(0.25),
            last_loss: Some(0.3),
        }
    }

    #[test]
    fn test_numbered_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();
        let record = store
            .write(CheckpointKind::Numbered, &snapshot(7), &position(7))
            .unwrap();

        assert!(dir.path().join("ckpt-00000007.safetensors").is_file());
        assert!(dir.path().join("ckpt-00000007.json").is_file());
        assert!(dir.path().join(SAMPLES_DIR).is_dir());

        let loaded = store.load(&record).unwrap();
        assert_eq!(loaded.host_values().unwrap(), snapshot(7).host_values().unwrap());
        assert_eq!(loaded.scheduler.step, 7);
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 2).unwrap();
        for seq in [10, 20, 30, 40] {
            store
                .write(CheckpointKind::Numbered, &snapshot(seq), &position(seq))
                .unwrap();
        }
        assert_eq!(store.prune().unwrap(), vec![10, 20]);
        assert_eq!(store.numbered().unwrap(), vec![30, 40]);
        assert!(!dir.path().join("ckpt-00000010.safetensors").exists());
    }

    #[test]
    fn test_latest_replaces_previous_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 2).unwrap();
        store.write(CheckpointKind::Latest, &snapshot(5), &position(5)).unwrap();
        store.write(CheckpointKind::Latest, &snapshot(6), &position(6)).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.meta.sequence, 6);
        assert!(!dir.path().join("latest-00000005.safetensors").exists());
        assert!(store.numbered().unwrap().is_empty());
    }

    #[test]
    fn test_resume_point_prefers_highest_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 2).unwrap();
        assert!(store.find_resume_point().unwrap().is_none());

        store.write(CheckpointKind::Numbered, &snapshot(10), &position(10)).unwrap();
        store.write(CheckpointKind::Latest, &snapshot(14), &position(14)).unwrap();
        let resume = store.find_resume_point().unwrap().unwrap();
        assert_eq!(resume.kind, CheckpointKind::Latest);
        assert_eq!(resume.meta.sequence, 14);

        store.write(CheckpointKind::Numbered, &snapshot(20), &position(20)).unwrap();
        let resume = store.find_resume_point().unwrap().unwrap();
        assert_eq!(resume.kind, CheckpointKind::Numbered);
        assert_eq!(resume.meta.sequence, 20);
    }

    #[test]
    fn test_corrupt_metadata_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 2).unwrap();
        store.write(CheckpointKind::Numbered, &snapshot(3), &position(3)).unwrap();
        std::fs::write(dir.path().join("ckpt-00000003.json"), b"{ not json").unwrap();

        let err = store.find_resume_point().unwrap_err();
        assert!(matches!(err, TtsError::CheckpointCorrupt { .. }));
    }

    #[test]
    fn test_truncated_weights_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 2).unwrap();
        let record = store
            .write(CheckpointKind::Numbered, &snapshot(3), &position(3))
            .unwrap();
        std::fs::write(&record.weights_path, b"garbage").unwrap();

        let err = store.load(&record).unwrap_err();
        assert!(matches!(err, TtsError::CheckpointCorrupt { .. }));
    }

    #[test]
    fn test_interrupted_writes_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CheckpointStore::open(dir.path(), 2).unwrap();
            store.write(CheckpointKind::Numbered, &snapshot(5), &position(5)).unwrap();
            store.write(CheckpointKind::Latest, &snapshot(6), &position(6)).unwrap();
        }
        // weights renamed but the metadata never followed
        std::fs::copy(
            dir.path().join("ckpt-00000005.safetensors"),
            dir.path().join("ckpt-00000010.safetensors"),
        )
        .unwrap();
        std::fs::write(dir.path().join("ckpt-00000010.json.tmp"), b"{").unwrap();
        std::fs::write(dir.path().join("latest-00000009.safetensors"), b"partial").unwrap();

        let store = CheckpointStore::open(dir.path(), 2).unwrap();
        assert!(!dir.path().join("ckpt-00000010.safetensors").exists());
        assert!(!dir.path().join("ckpt-00000010.json.tmp").exists());
        assert!(!dir.path().join("latest-00000009.safetensors").exists());
        assert!(dir.path().join("ckpt-00000005.safetensors").exists());
        assert_eq!(store.latest().unwrap().unwrap().meta.sequence, 6);

        std::fs::write(dir.path().join("ckpt-00000011.safetensors"), b"partial").unwrap();
        store.write(CheckpointKind::Numbered, &snapshot(12), &position(12)).unwrap();
        assert!(store.prune().unwrap().is_empty());
        assert!(!dir.path().join("ckpt-00000011.safetensors").exists());
        assert_eq!(store.numbered().unwrap(), vec![5, 12]);
    }

    #[test]
    fn test_next_position_rolls_epoch() {
        let mut meta = store_meta();
        meta.epoch = 2;
        meta.step_in_epoch = 10;
        assert_eq!(meta.next_position(10), (3, 0));
        meta.step_in_epoch = 4;
        assert_eq!(meta.next_position(10), (2, 4));
    }

    fn store_meta() -> CheckpointMeta {
        CheckpointMeta {
            format_version: FORMAT_VERSION,
            sequence: 0,
            epoch: 0,
            step_in_epoch: 0,
            updates_per_epoch: 10,
            global_step: 0,
            best_metric: None,
            last_loss: None,
            scheduler: SchedulerState {
                learning_rate: 0.01,
                step: 0,
                extra: BTreeMap::new(),
            },
            weights_file: String::new(),
            created_at: Utc::now(),
        }
    }
}
