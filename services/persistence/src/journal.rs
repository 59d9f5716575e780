//! Diff Journal Writer: append-only per-symbol diff log with checksums
//!
//! One journal directory per symbol. Entries are appended in upstream update
//! id order and never rewritten.
//!
//! # Binary Format (per entry)
//! ```text
//! [body_len:        u32]
//! [first_update_id: u64]
//! [final_update_id: u64]
//! [timestamp:       i64]
//! [payload_len:     u32][payload: bytes]   // bincode(DiffPayload)
//! [checksum:        u32]                   // CRC32C over ids+timestamp+payload
//! ```

use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use types::depth::{DiffEvent, PriceLevel};
use types::ids::Symbol;

/// Fixed part of an entry body: ids, timestamp, payload length and checksum.
const MIN_BODY_LEN: usize = 8 + 8 + 8 + 4 + 4;

/// Anything larger than this is treated as a corrupted length prefix.
pub(crate) const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Non-monotonic append: last persisted update id {last}, got diff starting at {got}")]
    NonMonotonic { last: u64, got: u64 },

    #[error("Inverted update id range: first {first} > final {last}")]
    InvertedRange { first: u64, last: u64 },
}

// ── Journal Entry ───────────────────────────────────────────────────

/// Level changes of one diff; the symbol is implied by the journal directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffPayload {
    pub bid_updates: Vec<PriceLevel>,
    pub ask_updates: Vec<PriceLevel>,
}

/// A single persisted diff.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub first_update_id: u64,
    pub final_update_id: u64,
    /// Upstream event time, Unix nanoseconds
    pub timestamp: i64,
    /// Bincode-serialized [`DiffPayload`]
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl JournalEntry {
    /// Create a new entry, computing the CRC32C checksum automatically.
    pub fn new(first_update_id: u64, final_update_id: u64, timestamp: i64, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(first_update_id, final_update_id, timestamp, &payload);
        Self {
            first_update_id,
            final_update_id,
            timestamp,
            payload,
            checksum,
        }
    }

    /// Encode a diff event.
    pub fn from_diff(diff: &DiffEvent) -> Result<Self, JournalError> {
        let payload = DiffPayload {
            bid_updates: diff.bid_updates.clone(),
            ask_updates: diff.ask_updates.clone(),
        };
        let bytes = bincode::serialize(&payload)
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        Ok(Self::new(
            diff.first_update_id,
            diff.final_update_id,
            diff.timestamp,
            bytes,
        ))
    }

    /// Decode back into a diff event for `symbol`.
    pub fn to_diff(&self, symbol: &Symbol) -> Result<DiffEvent, JournalError> {
        let payload: DiffPayload = bincode::deserialize(&self.payload)
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        Ok(DiffEvent {
            symbol: symbol.clone(),
            first_update_id: self.first_update_id,
            final_update_id: self.final_update_id,
            timestamp: self.timestamp,
            bid_updates: payload.bid_updates,
            ask_updates: payload.ask_updates,
        })
    }

    pub fn compute_checksum(first: u64, last: u64, timestamp: i64, payload: &[u8]) -> u32 {
        let mut buf = Vec::with_capacity(24 + payload.len());
        buf.extend_from_slice(&first.to_le_bytes());
        buf.extend_from_slice(&last.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum
            == Self::compute_checksum(
                self.first_update_id,
                self.final_update_id,
                self.timestamp,
                &self.payload,
            )
    }

    /// Serialize entry to the binary wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_len = self.payload.len() as u32;
        let body_len = (MIN_BODY_LEN + self.payload.len()) as u32;

        let mut buf = Vec::with_capacity(4 + body_len as usize);
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.extend_from_slice(&self.first_update_id.to_le_bytes());
        buf.extend_from_slice(&self.final_update_id.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserialize entry from the binary wire format.
    ///
    /// Returns `(entry, bytes_consumed)`. The checksum is parsed but not
    /// verified here; readers decide what to do with a mismatch.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), JournalError> {
        let body_len = u32::from_le_bytes(field::<4>(data, 0, "length prefix")?) as usize;

        if body_len > MAX_BODY_LEN {
            return Err(JournalError::Serialization(format!(
                "Implausible body length: {} (likely corruption)",
                body_len
            )));
        }
        if body_len < MIN_BODY_LEN {
            return Err(JournalError::Serialization(format!(
                "Body too small: {} bytes, minimum is {}",
                body_len, MIN_BODY_LEN
            )));
        }

        let total = 4 + body_len;
        if data.len() < total {
            return Err(JournalError::Serialization(format!(
                "Incomplete entry: need {} bytes, have {}",
                total,
                data.len()
            )));
        }

        let body = &data[4..total];
        let first_update_id = u64::from_le_bytes(field::<8>(body, 0, "first_update_id")?);
        let final_update_id = u64::from_le_bytes(field::<8>(body, 8, "final_update_id")?);
        let timestamp = i64::from_le_bytes(field::<8>(body, 16, "timestamp")?);
        let payload_len = u32::from_le_bytes(field::<4>(body, 24, "payload length")?) as usize;

        if MIN_BODY_LEN + payload_len != body_len {
            return Err(JournalError::Serialization(format!(
                "payload_len {} inconsistent with body length {}",
                payload_len, body_len
            )));
        }
        let payload = body[28..28 + payload_len].to_vec();
        let checksum = u32::from_le_bytes(field::<4>(body, 28 + payload_len, "checksum")?);

        let entry = Self {
            first_update_id,
            final_update_id,
            timestamp,
            payload,
            checksum,
        };
        Ok((entry, total))
    }
}

fn field<const N: usize>(data: &[u8], pos: usize, name: &str) -> Result<[u8; N], JournalError> {
    data.get(pos..pos + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| JournalError::Serialization(format!("Not enough data for {}", name)))
}

/// Where an entry lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub file_index: u64,
    pub offset: u64,
    pub len: u64,
}

// ── Flush / Fsync Policies ──────────────────────────────────────────

/// Controls when buffered data is flushed to OS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlushPolicy {
    EveryWrite,
    EveryN(usize),
}

/// Controls when `fsync` (durable write) is called.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FsyncPolicy {
    EveryWrite,
    EveryN(usize),
    /// Fsync only on file rotation and explicit sync.
    OnRotation,
}

// ── Journal Writer Configuration ────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub dir: PathBuf,
    /// Maximum file size in bytes before rotation (default 64 MiB).
    pub max_file_size: u64,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: 64 * 1024 * 1024,
            flush_policy: FlushPolicy::EveryWrite,
            fsync_policy: FsyncPolicy::OnRotation,
        }
    }
}

/// End of the valid data in an existing journal, found by a reader scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalTail {
    pub file_index: u64,
    pub valid_len: u64,
    pub last_final_update_id: Option<u64>,
}

// ── Journal Writer ──────────────────────────────────────────────────

/// Append-only diff journal writer with checksums and size-based rotation.
///
/// Every appended diff must start after the last persisted one ends, so the
/// files are always sorted by update id and ranges never overlap.
pub struct JournalWriter {
    config: JournalConfig,
    writer: BufWriter<File>,
    current_file: PathBuf,
    current_file_size: u64,
    file_index: u64,
    last_final_update_id: Option<u64>,
    writes_since_flush: usize,
    writes_since_fsync: usize,
}

impl JournalWriter {
    /// Open a writer on an empty or fresh journal directory.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        Self::open_at(config, JournalTail::default())
    }

    /// Open a writer that continues after `tail`.
    ///
    /// Bytes past `tail.valid_len` in the tail file (a torn final write) are
    /// truncated away before appending.
    pub fn open_at(config: JournalConfig, tail: JournalTail) -> Result<Self, JournalError> {
        fs::create_dir_all(&config.dir)?;

        let current_file = Self::journal_path(&config.dir, tail.file_index);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&current_file)?;
        if file.metadata()?.len() > tail.valid_len {
            debug!(
                path = %current_file.display(),
                valid_len = tail.valid_len,
                "Truncating torn journal tail"
            );
            file.set_len(tail.valid_len)?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&current_file)?;

        Ok(Self {
            config,
            writer: BufWriter::new(file),
            current_file,
            current_file_size: tail.valid_len,
            file_index: tail.file_index,
            last_final_update_id: tail.last_final_update_id,
            writes_since_flush: 0,
            writes_since_fsync: 0,
        })
    }

    pub fn last_final_update_id(&self) -> Option<u64> {
        self.last_final_update_id
    }

    pub fn current_file_path(&self) -> &Path {
        &self.current_file
    }

    /// Append an entry, returning where it was written.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<EntryLocation, JournalError> {
        if entry.first_update_id > entry.final_update_id {
            return Err(JournalError::InvertedRange {
                first: entry.first_update_id,
                last: entry.final_update_id,
            });
        }
        if let Some(last) = self.last_final_update_id {
            if entry.first_update_id <= last {
                return Err(JournalError::NonMonotonic {
                    last,
                    got: entry.first_update_id,
                });
            }
        }

        if self.current_file_size >= self.config.max_file_size {
            self.rotate()?;
        }

        let bytes = entry.to_bytes();
        self.writer.write_all(&bytes)?;

        let location = EntryLocation {
            file_index: self.file_index,
            offset: self.current_file_size,
            len: bytes.len() as u64,
        };
        self.current_file_size += location.len;
        self.last_final_update_id = Some(entry.final_update_id);
        self.writes_since_flush += 1;
        self.writes_since_fsync += 1;

        self.apply_flush_policy()?;
        self.apply_fsync_policy()?;

        Ok(location)
    }

    /// Encode and append a diff event.
    pub fn write_diff(&mut self, diff: &DiffEvent) -> Result<(JournalEntry, EntryLocation), JournalError> {
        let entry = JournalEntry::from_diff(diff)?;
        let location = self.append(&entry)?;
        Ok((entry, location))
    }

    /// Flush buffered bytes to the OS without fsync.
    pub fn flush(&mut self) -> Result<(), JournalError> {
        self.writer.flush()?;
        self.writes_since_flush = 0;
        Ok(())
    }

    /// Force flush + fsync (used before shutdown / rotation).
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_flush = 0;
        self.writes_since_fsync = 0;
        Ok(())
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn apply_flush_policy(&mut self) -> Result<(), JournalError> {
        let should_flush = match self.config.flush_policy {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::EveryN(n) => self.writes_since_flush >= n,
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn apply_fsync_policy(&mut self) -> Result<(), JournalError> {
        let should_fsync = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => self.writes_since_fsync >= n,
            FsyncPolicy::OnRotation => false,
        };
        if should_fsync {
            self.sync()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.sync()?;

        self.file_index += 1;
        self.current_file = Self::journal_path(&self.config.dir, self.file_index);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.current_file)?;

        debug!(path = %self.current_file.display(), "Rotated diff journal");
        self.writer = BufWriter::new(file);
        self.current_file_size = 0;
        Ok(())
    }

    pub(crate) fn journal_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("journal-{:06}.bin", index))
    }

    pub(crate) fn parse_index(file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix("journal-")?
            .strip_suffix(".bin")?
            .parse::<u64>()
            .ok()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_diff(first: u64, last: u64) -> DiffEvent {
        DiffEvent {
            symbol: Symbol::spot("BTCUSDT"),
            first_update_id: first,
            final_update_id: last,
            timestamp: 1_708_123_456_789_000_000 + first as i64,
            bid_updates: vec![PriceLevel::parse("27000.10", "1.5").unwrap()],
            ask_updates: vec![PriceLevel::parse("27000.20", "0").unwrap()],
        }
    }

    fn sample_entry(first: u64, last: u64) -> JournalEntry {
        JournalEntry::from_diff(&sample_diff(first, last)).unwrap()
    }

    #[test]
    fn test_entry_checksum_detects_tamper() {
        let mut entry = sample_entry(1, 3);
        assert!(entry.verify_checksum());
        entry.payload[0] ^= 0xff;
        assert!(!entry.verify_checksum());
    }

    #[test]
    fn test_entry_decodes_to_same_diff() {
        let diff = sample_diff(101, 103);
        let entry = JournalEntry::from_diff(&diff).unwrap();
        let (decoded, consumed) = JournalEntry::from_bytes(&entry.to_bytes()).unwrap();
        assert_eq!(consumed, entry.to_bytes().len());
        assert_eq!(decoded.to_diff(&diff.symbol).unwrap(), diff);
    }

    #[test]
    fn test_from_bytes_rejects_truncated() {
        let bytes = sample_entry(1, 1).to_bytes();
        assert!(JournalEntry::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(JournalEntry::from_bytes(&bytes[..3]).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_implausible_length() {
        let mut bytes = sample_entry(1, 1).to_bytes();
        bytes[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(JournalEntry::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_append_reports_locations() {
        let tmp = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(JournalConfig::new(tmp.path())).unwrap();

        let first = writer.append(&sample_entry(1, 3)).unwrap();
        let second = writer.append(&sample_entry(4, 4)).unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.len);
        assert_eq!(writer.last_final_update_id(), Some(4));
    }

    #[test]
    fn test_non_monotonic_append_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(JournalConfig::new(tmp.path())).unwrap();

        writer.append(&sample_entry(10, 20)).unwrap();
        match writer.append(&sample_entry(15, 25)).unwrap_err() {
            JournalError::NonMonotonic { last, got } => {
                assert_eq!(last, 20);
                assert_eq!(got, 15);
            }
            other => panic!("Unexpected error: {:?}", other),
        }
        // Gaps are allowed; replay detects them
        writer.append(&sample_entry(30, 31)).unwrap();
    }

    #[test]
    fn test_inverted_range_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(JournalConfig::new(tmp.path())).unwrap();
        let entry = JournalEntry::new(9, 5, 0, vec![]);
        assert!(matches!(
            writer.append(&entry),
            Err(JournalError::InvertedRange { first: 9, last: 5 })
        ));
    }

    #[test]
    fn test_file_rotation_on_size_limit() {
        let tmp = TempDir::new().unwrap();
        let config = JournalConfig {
            max_file_size: 100,
            ..JournalConfig::new(tmp.path())
        };
        let mut writer = JournalWriter::open(config).unwrap();

        let mut last = None;
        for id in 1..=20 {
            last = Some(writer.append(&sample_entry(id, id)).unwrap());
        }
        assert!(last.unwrap().file_index > 0, "Expected rotation");

        let files = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("journal-"))
            .count();
        assert!(files > 1);
    }

    #[test]
    fn test_open_at_truncates_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let valid_len;
        {
            let mut writer = JournalWriter::open(JournalConfig::new(tmp.path())).unwrap();
            let loc = writer.append(&sample_entry(1, 2)).unwrap();
            valid_len = loc.len;
            writer.sync().unwrap();
        }
        let path = JournalWriter::journal_path(tmp.path(), 0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[7, 7, 7]).unwrap();
        drop(file);

        let tail = JournalTail {
            file_index: 0,
            valid_len,
            last_final_update_id: Some(2),
        };
        let mut writer = JournalWriter::open_at(JournalConfig::new(tmp.path()), tail).unwrap();
        let loc = writer.append(&sample_entry(3, 3)).unwrap();
        assert_eq!(loc.offset, valid_len);
        writer.sync().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), valid_len + loc.len);
    }

    #[test]
    fn test_journal_file_naming() {
        let path = JournalWriter::journal_path(Path::new("/tmp"), 42);
        assert_eq!(path, PathBuf::from("/tmp/journal-000042.bin"));
        assert_eq!(JournalWriter::parse_index("journal-000042.bin"), Some(42));
        assert_eq!(JournalWriter::parse_index("journal-x.bin"), None);
    }

    #[test]
    fn test_flush_every_n_buffers_until_sync() {
        let tmp = TempDir::new().unwrap();
        let config = JournalConfig {
            flush_policy: FlushPolicy::EveryN(1000),
            ..JournalConfig::new(tmp.path())
        };
        let mut writer = JournalWriter::open(config).unwrap();
        writer.append(&sample_entry(1, 1)).unwrap();
        assert_eq!(fs::metadata(writer.current_file_path()).unwrap().len(), 0);

        writer.sync().unwrap();
        assert!(fs::metadata(writer.current_file_path()).unwrap().len() > 0);
    }
}
