//! On-disk lifecycle records
//!
//! One JSON file per cluster under the state directory:
//!
//! ```text
//! {"format": 1, "checksum": "<sha256>", "record": { ... }}
//! ```
//!
//! Writes go to a temporary sibling that is fsynced and renamed over the old
//! file, so a crash leaves either the previous or the new snapshot. The checksum
//! covers the canonical JSON of `record`; any mismatch is reported as corruption
//! and never repaired.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::LifecycleRecord;

/// Envelope format written by this build
pub const RECORD_FORMAT: u32 = 1;

const RECORD_EXT: &str = "json";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Lifecycle record {path} is corrupt: {reason}. It will not be repaired automatically; inspect it and move it aside to continue")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to serialize lifecycle record: {0}")]
    Serialize(String),
}

impl StateError {
    fn io(path: &Path, source: io::Error) -> Self {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        StateError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, StateError::Corrupt { .. })
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: u32,
    checksum: String,
    record: serde_json::Value,
}

fn checksum(value: &serde_json::Value) -> Result<String, StateError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

// ============================================================================
// SBIO: Pure encode/decode (no I/O)
// ============================================================================

/// Serialize a record into its checksummed envelope
pub fn encode_record(record: &LifecycleRecord) -> Result<Vec<u8>, StateError> {
    let value = serde_json::to_value(record).map_err(|e| StateError::Serialize(e.to_string()))?;
    let envelope = Envelope {
        format: RECORD_FORMAT,
        checksum: checksum(&value)?,
        record: value,
    };
    serde_json::to_vec_pretty(&envelope).map_err(|e| StateError::Serialize(e.to_string()))
}

/// Decode and verify an envelope read from `path`
pub fn decode_record(bytes: &[u8], path: &Path) -> Result<LifecycleRecord, StateError> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| StateError::corrupt(path, format!("unreadable JSON ({})", e)))?;
    if envelope.format != RECORD_FORMAT {
        return Err(StateError::corrupt(
            path,
            format!("unknown record format {}", envelope.format),
        ));
    }
    let expected = checksum(&envelope.record)?;
    if expected != envelope.checksum {
        return Err(StateError::corrupt(path, "checksum mismatch"));
    }
    let record: LifecycleRecord = serde_json::from_value(envelope.record)
        .map_err(|e| StateError::corrupt(path, format!("invalid record ({})", e)))?;
    record
        .check_consistency()
        .map_err(|reason| StateError::corrupt(path, reason))?;
    Ok(record)
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Directory of lifecycle records
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, cluster: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", cluster, RECORD_EXT))
    }

    fn tmp_path_for(&self, cluster: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.tmp", cluster, RECORD_EXT))
    }

    /// Load a cluster's record; `None` if it was never created
    pub fn load(&self, cluster: &str) -> Result<Option<LifecycleRecord>, StateError> {
        let path = self.path_for(cluster);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(&path, e)),
        };
        let record = decode_record(&bytes, &path)?;
        if record.cluster != cluster {
            return Err(StateError::corrupt(
                &path,
                format!("file holds cluster '{}'", record.cluster),
            ));
        }
        Ok(Some(record))
    }

    /// Atomically replace a cluster's record
    pub fn save(&self, record: &LifecycleRecord) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir).map_err(|e| StateError::io(&self.dir, e))?;
        let bytes = encode_record(record)?;
        let tmp = self.tmp_path_for(&record.cluster);
        let path = self.path_for(&record.cluster);

        {
            let mut file = File::create(&tmp).map_err(|e| StateError::io(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| StateError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StateError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StateError::io(&path, e))?;
        // Persist the rename itself
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        debug!(cluster = %record.cluster, resources = record.resources.len(), "Committed lifecycle record");
        Ok(())
    }

    /// Delete a cluster's record; returns whether one existed
    pub fn remove(&self, cluster: &str) -> Result<bool, StateError> {
        let path = self.path_for(cluster);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    /// Names of all clusters with a record, sorted
    pub fn list_clusters(&self) -> Result<Vec<String>, StateError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&self.dir, e)),
        };

        let mut clusters = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                clusters.push(stem.to_string());
            }
        }
        clusters.sort();
        Ok(clusters)
    }

    /// Every record in the store; fails on the first corrupt one
    pub fn load_all(&self) -> Result<Vec<LifecycleRecord>, StateError> {
        let mut records = Vec::new();
        for cluster in self.list_clusters()? {
            if let Some(record) = self.load(&cluster)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
