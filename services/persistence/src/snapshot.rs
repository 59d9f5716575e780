//! Snapshot Store: depth snapshots with integrity and compression
//!
//! Features:
//! - One file per snapshot, named by its last update id
//! - SHA-256 integrity hash over the serialized snapshot
//! - Optional zstd compression
//! - Format versioning for forward compatibility
//! - Atomic writes (tmp file, fsync, rename)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use types::depth::DepthSnapshot;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    IntegrityFailure {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    #[error("Compression error: {0}")]
    Compression(String),
}

// ── Snapshot Record ─────────────────────────────────────────────────

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk envelope around a [`DepthSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub version: u32,
    pub snapshot: DepthSnapshot,
    /// Hex SHA-256 of the bincode-serialized snapshot
    pub checksum: String,
}

impl SnapshotRecord {
    pub fn new(snapshot: DepthSnapshot) -> Result<Self, SnapshotError> {
        let checksum = compute_hash(&snapshot)?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            snapshot,
            checksum,
        })
    }

    pub fn verify_integrity(&self) -> Result<bool, SnapshotError> {
        Ok(compute_hash(&self.snapshot)? == self.checksum)
    }
}

fn compute_hash(snapshot: &DepthSnapshot) -> Result<String, SnapshotError> {
    let bytes =
        bincode::serialize(snapshot).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

// ── Snapshot Writer ─────────────────────────────────────────────────

/// Writes snapshots to disk with optional zstd compression.
pub struct SnapshotWriter {
    dir: PathBuf,
    compress: bool,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            compress,
        }
    }

    /// Write a snapshot atomically: serialize → compress → write tmp → rename.
    ///
    /// Writing the same update id twice replaces the earlier file.
    pub fn write(&self, snapshot: &DepthSnapshot) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.dir)?;

        let record = SnapshotRecord::new(snapshot.clone())?;
        let data =
            bincode::serialize(&record).map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let (final_data, ext) = if self.compress {
            let compressed = zstd::encode_all(data.as_slice(), 3)
                .map_err(|e| SnapshotError::Compression(e.to_string()))?;
            (compressed, "snap.zst")
        } else {
            (data, "snap")
        };

        let filename = format!("snapshot-{:020}.{}", snapshot.last_update_id, ext);
        let path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!("{}.tmp", filename));

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&final_data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        Ok(path)
    }
}

// ── Snapshot Loader ─────────────────────────────────────────────────

/// Loads snapshots from disk, verifying version and integrity.
pub struct SnapshotLoader {
    dir: PathBuf,
}

impl SnapshotLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load a specific snapshot file.
    pub fn load(&self, path: &Path) -> Result<DepthSnapshot, SnapshotError> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let is_compressed = path.extension().map(|e| e == "zst").unwrap_or(false);
        let decompressed = if is_compressed {
            zstd::decode_all(data.as_slice())
                .map_err(|e| SnapshotError::Compression(e.to_string()))?
        } else {
            data
        };

        let record: SnapshotRecord = bincode::deserialize(&decompressed)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        if record.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(record.version));
        }

        let actual = compute_hash(&record.snapshot)?;
        if actual != record.checksum {
            return Err(SnapshotError::IntegrityFailure {
                path: path.display().to_string(),
                expected: record.checksum,
                actual,
            });
        }

        Ok(record.snapshot)
    }

    /// Load the first snapshot whose last update id is `>= update_id`.
    pub fn load_at_or_after(&self, update_id: u64) -> Result<Option<DepthSnapshot>, SnapshotError> {
        let found = self
            .list_snapshots()?
            .into_iter()
            .find(|(id, _)| *id >= update_id);
        match found {
            Some((_, path)) => self.load(&path).map(Some),
            None => Ok(None),
        }
    }

    /// All snapshot update ids, ascending.
    pub fn list_update_ids(&self) -> Result<Vec<u64>, SnapshotError> {
        Ok(self.list_snapshots()?.into_iter().map(|(id, _)| id).collect())
    }

    /// List all snapshots as (update id, path) pairs, ascending.
    pub fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>, SnapshotError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = Self::parse_update_id(&name) {
                results.push((id, entry.path()));
            }
        }
        results.sort_by_key(|(id, _)| *id);
        results.dedup_by_key(|(id, _)| *id);
        Ok(results)
    }

    fn parse_update_id(filename: &str) -> Option<u64> {
        let stem = filename.strip_prefix("snapshot-")?;
        let digits = stem
            .strip_suffix(".snap.zst")
            .or_else(|| stem.strip_suffix(".snap"))?;
        digits.parse::<u64>().ok()
    }
}

// ── Tests ───────────────────────────────────────────────────────────
