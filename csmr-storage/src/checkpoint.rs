//! Checkpoint storage.
//!
//! Layout under the store directory:
//!
//! ```text
//! index.json                      instance id -> retained checkpoints, oldest first
//! <instance-key>/<generation>.ckpt
//! ```
//!
//! Every file is written to a temporary name, synced and renamed into place,
//! so a crash leaves either the old or the new version, never a torn one.

use crate::error::StorageError;
use csmr_core::Checkpoint;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Checkpoints kept per instance unless configured otherwise.
pub const DEFAULT_RETAIN: usize = 3;

const INDEX_FILE: &str = "index.json";

/// Metadata stored in the index for each checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    pub instance_id: String,
    /// Per-instance write counter; also the file name.
    pub generation: u64,
    pub model_version: String,
    pub last_processed_sequence_number: u64,
    pub taken_at: i64,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Store for instance checkpoints.
pub struct CheckpointStore {
    dir: PathBuf,
    retain: usize,
    index: RwLock<BTreeMap<String, Vec<CheckpointMeta>>>,
}

impl CheckpointStore {
    /// Opens or creates a checkpoint store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            retain: DEFAULT_RETAIN,
            index: RwLock::new(BTreeMap::new()),
        };
        store.load_index()?;
        Ok(store)
    }

    /// Sets how many checkpoints are kept per instance (at least one).
    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_index(&self) -> Result<(), StorageError> {
        let index_path = self.dir.join(INDEX_FILE);
        if !index_path.exists() {
            return Ok(());
        }
        let data = fs::read(&index_path)?;
        let index: BTreeMap<String, Vec<CheckpointMeta>> = serde_json::from_slice(&data)?;
        *self.index.write() = index;
        Ok(())
    }

    fn save_index(&self, index: &BTreeMap<String, Vec<CheckpointMeta>>) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.dir.join(INDEX_FILE), &data)
    }

    /// Persists a checkpoint and prunes the oldest ones beyond the retention.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointMeta, StorageError> {
        let data = serde_json::to_vec(checkpoint)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&data));

        let mut index = self.index.write();
        let generation = index
            .get(&checkpoint.instance_id)
            .and_then(|metas| metas.last())
            .map(|meta| meta.generation + 1)
            .unwrap_or(1);

        let instance_dir = self.instance_dir(&checkpoint.instance_id);
        fs::create_dir_all(&instance_dir)?;
        write_atomic(&checkpoint_path(&instance_dir, generation), &data)?;

        let meta = CheckpointMeta {
            instance_id: checkpoint.instance_id.clone(),
            generation,
            model_version: checkpoint.model_version.clone(),
            last_processed_sequence_number: checkpoint.last_processed_sequence_number,
            taken_at: checkpoint.taken_at,
            size_bytes: data.len() as u64,
            checksum,
        };

        let metas = index.entry(checkpoint.instance_id.clone()).or_default();
        metas.push(meta.clone());
        let excess = metas.len().saturating_sub(self.retain);
        let pruned: Vec<CheckpointMeta> = metas.drain(..excess).collect();
        self.save_index(&index)?;
        drop(index);

        for old in pruned {
            let path = checkpoint_path(&instance_dir, old.generation);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("failed to prune checkpoint {}: {}", path.display(), e);
            }
        }

        tracing::debug!(
            "saved checkpoint {} of {} (seq {})",
            generation,
            checkpoint.instance_id,
            checkpoint.last_processed_sequence_number
        );
        Ok(meta)
    }

    /// Loads one checkpoint and verifies its checksum.
    pub fn load(&self, instance_id: &str, generation: u64) -> Result<Checkpoint, StorageError> {
        let meta = self
            .list(instance_id)
            .into_iter()
            .find(|m| m.generation == generation)
            .ok_or_else(|| StorageError::CheckpointNotFound(format!("{}#{}", instance_id, generation)))?;

        let path = checkpoint_path(&self.instance_dir(instance_id), generation);
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;

        let actual = format!("{:08x}", crc32c::crc32c(&data));
        if actual != meta.checksum {
            return Err(StorageError::Corruption(format!(
                "checkpoint {}#{} checksum mismatch",
                instance_id, generation
            )));
        }
        Ok(serde_json::from_slice(&data)?)
    }

    /// Returns the newest readable checkpoint of an instance.
    ///
    /// A corrupted or missing newest file falls back to the previous one.
    pub fn load_latest(&self, instance_id: &str) -> Result<Option<Checkpoint>, StorageError> {
        let metas = self.list(instance_id);
        let mut last_error = None;
        for meta in metas.iter().rev() {
            match self.load(instance_id, meta.generation) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => {
                    tracing::warn!(
                        "checkpoint {}#{} unreadable, trying older: {}",
                        instance_id,
                        meta.generation,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Retained checkpoints of an instance, oldest first.
    pub fn list(&self, instance_id: &str) -> Vec<CheckpointMeta> {
        self.index.read().get(instance_id).cloned().unwrap_or_default()
    }

    pub fn latest_meta(&self, instance_id: &str) -> Option<CheckpointMeta> {
        self.index
            .read()
            .get(instance_id)
            .and_then(|metas| metas.last().cloned())
    }

    /// Instances with at least one checkpoint.
    pub fn instances(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    /// Deletes every checkpoint of an instance.
    pub fn delete(&self, instance_id: &str) -> Result<(), StorageError> {
        let mut index = self.index.write();
        if index.remove(instance_id).is_none() {
            return Ok(());
        }
        self.save_index(&index)?;
        drop(index);

        let instance_dir = self.instance_dir(instance_id);
        if instance_dir.exists() {
            fs::remove_dir_all(&instance_dir)?;
        }
        Ok(())
    }

    fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.dir.join(instance_key(instance_id))
    }
}

/// File-system safe, collision-free directory name for an instance id.
fn instance_key(instance_id: &str) -> String {
    let safe: String = instance_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{:08x}", safe, crc32c::crc32c(instance_id.as_bytes()))
}

fn checkpoint_path(instance_dir: &Path, generation: u64) -> PathBuf {
    instance_dir.join(format!("{:020}.ckpt", generation))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
