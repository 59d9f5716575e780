//! Event Archive: the persistence interface consumed by recording and replay
//!
//! Layout on disk, one directory per symbol:
//! ```text
//! <root>/<SYMBOL>/diffs/journal-NNNNNN.bin
//! <root>/<SYMBOL>/snapshots/snapshot-<lastUpdateId>.snap.zst
//! ```
//!
//! [`FileArchive`] keeps an in-memory index of every persisted diff range so
//! block reads are a binary search plus one positional read per journal file.
//! [`MemoryArchive`] implements the same traits for tests.

use crate::journal::{EntryLocation, JournalConfig, JournalError, JournalTail, JournalWriter};
use crate::reader::{read_entries_at, JournalReader, ReaderError};
use crate::snapshot::{SnapshotError, SnapshotLoader, SnapshotWriter};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use types::depth::{DepthSnapshot, DiffEvent};
use types::ids::Symbol;

pub use crate::journal::{FlushPolicy, FsyncPolicy};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Journal read error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("block size must be positive")]
    InvalidBlockSize,
}

// ── Traits ──────────────────────────────────────────────────────────

/// Sink for raw events captured in live mode.
pub trait ArchiveWriter {
    fn write_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<(), ArchiveError>;

    /// Append a diff. Diffs for one symbol must arrive with strictly
    /// increasing, non-overlapping update id ranges.
    fn write_diff(&mut self, diff: &DiffEvent) -> Result<(), ArchiveError>;

    /// Make everything written so far visible to readers.
    fn flush(&mut self) -> Result<(), ArchiveError>;

    /// Make everything written so far durable.
    fn sync(&mut self) -> Result<(), ArchiveError> {
        self.flush()
    }
}

/// Read access used by replay and archive inspection.
pub trait ArchiveReader {
    fn list_symbols(&self) -> Result<Vec<Symbol>, ArchiveError>;

    /// Update ids of every persisted snapshot for `symbol`, ascending.
    fn list_snapshot_update_ids(&self, symbol: &Symbol) -> Result<Vec<u64>, ArchiveError>;

    /// Up to `block_size` diffs with `final_update_id > after_update_id`,
    /// ascending. An empty block means there is nothing further.
    fn read_diff_block(
        &self,
        symbol: &Symbol,
        after_update_id: u64,
        block_size: usize,
    ) -> Result<Vec<DiffEvent>, ArchiveError>;

    /// The first snapshot with `last_update_id >= update_id`.
    fn read_snapshot_at_or_after(
        &self,
        symbol: &Symbol,
        update_id: u64,
    ) -> Result<Option<DepthSnapshot>, ArchiveError>;
}

impl<R: ArchiveReader + ?Sized> ArchiveReader for &R {
    fn list_symbols(&self) -> Result<Vec<Symbol>, ArchiveError> {
        (**self).list_symbols()
    }

    fn list_snapshot_update_ids(&self, symbol: &Symbol) -> Result<Vec<u64>, ArchiveError> {
        (**self).list_snapshot_update_ids(symbol)
    }

    fn read_diff_block(
        &self,
        symbol: &Symbol,
        after_update_id: u64,
        block_size: usize,
    ) -> Result<Vec<DiffEvent>, ArchiveError> {
        (**self).read_diff_block(symbol, after_update_id, block_size)
    }

    fn read_snapshot_at_or_after(
        &self,
        symbol: &Symbol,
        update_id: u64,
    ) -> Result<Option<DepthSnapshot>, ArchiveError> {
        (**self).read_snapshot_at_or_after(symbol, update_id)
    }
}

// ── File Archive ────────────────────────────────────────────────────

/// Tuning for the file-backed archive.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub max_journal_file_size: u64,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
    pub compress_snapshots: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            max_journal_file_size: 64 * 1024 * 1024,
            flush_policy: FlushPolicy::EveryN(1000),
            fsync_policy: FsyncPolicy::OnRotation,
            compress_snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    final_update_id: u64,
    location: EntryLocation,
}

struct SymbolJournal {
    diff_dir: PathBuf,
    snapshot_dir: PathBuf,
    index: Vec<IndexEntry>,
    tail: JournalTail,
    writer: Option<JournalWriter>,
}

impl SymbolJournal {
    fn new(symbol_dir: &Path) -> Self {
        Self {
            diff_dir: symbol_dir.join("diffs"),
            snapshot_dir: symbol_dir.join("snapshots"),
            index: Vec::new(),
            tail: JournalTail::default(),
            writer: None,
        }
    }

    /// Rebuild the index from the journal files on disk.
    fn scan(symbol_dir: &Path) -> Result<Self, ArchiveError> {
        let mut journal = Self::new(symbol_dir);
        let mut reader = JournalReader::open(&journal.diff_dir)?;
        let entries = reader.read_all()?;

        let mut last_final: Option<u64> = None;
        for located in &entries {
            let entry = &located.entry;
            // Only keep a strictly increasing chain; anything else is damage.
            if let Some(last) = last_final {
                if entry.first_update_id <= last {
                    warn!(
                        dir = %journal.diff_dir.display(),
                        last_final_update_id = last,
                        first_update_id = entry.first_update_id,
                        "Dropping out-of-order journal entry from index"
                    );
                    continue;
                }
            }
            last_final = Some(entry.final_update_id);
            journal.index.push(IndexEntry {
                final_update_id: entry.final_update_id,
                location: located.location,
            });
        }

        let last_file = reader.last_file_index().unwrap_or(0);
        let valid_len = entries
            .iter()
            .rev()
            .find(|e| e.location.file_index == last_file)
            .map(|e| e.location.offset + e.location.len)
            .unwrap_or(0);
        journal.tail = JournalTail {
            file_index: last_file,
            valid_len,
            last_final_update_id: last_final,
        };

        if !reader.corruption_log().is_empty() {
            warn!(
                dir = %journal.diff_dir.display(),
                records = reader.corruption_log().len(),
                "Journal corruption detected during index scan"
            );
        }
        Ok(journal)
    }
}

/// File-backed archive rooted at one directory.
pub struct FileArchive {
    root: PathBuf,
    options: ArchiveOptions,
    symbols: BTreeMap<Symbol, SymbolJournal>,
}

impl FileArchive {
    /// Open (or create) an archive, indexing every symbol already in it.
    pub fn open(root: impl Into<PathBuf>, options: ArchiveOptions) -> Result<Self, ArchiveError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut symbols = BTreeMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.join("diffs").is_dir() && !path.join("snapshots").is_dir() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_string();
            let symbol = match Symbol::from_storage_key(&key) {
                Ok(symbol) => symbol,
                Err(e) => {
                    debug!(dir = %key, error = %e, "Skipping non-symbol directory");
                    continue;
                }
            };
            let journal = SymbolJournal::scan(&path)?;
            debug!(
                symbol = %symbol,
                diffs = journal.index.len(),
                "Indexed archived diffs"
            );
            symbols.insert(symbol, journal);
        }

        info!(root = %root.display(), symbols = symbols.len(), "Archive opened");
        Ok(Self {
            root,
            options,
            symbols,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Flush and fsync every open journal.
    pub fn sync(&mut self) -> Result<(), ArchiveError> {
        for journal in self.symbols.values_mut() {
            if let Some(writer) = journal.writer.as_mut() {
                writer.sync()?;
            }
        }
        Ok(())
    }

    fn journal_mut(&mut self, symbol: &Symbol) -> &mut SymbolJournal {
        let root = &self.root;
        self.symbols
            .entry(symbol.clone())
            .or_insert_with(|| SymbolJournal::new(&root.join(symbol.storage_key())))
    }
}

impl ArchiveWriter for FileArchive {
    fn write_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<(), ArchiveError> {
        let compress = self.options.compress_snapshots;
        let journal = self.journal_mut(&snapshot.symbol);
        let path = SnapshotWriter::new(&journal.snapshot_dir, compress).write(snapshot)?;
        debug!(
            symbol = %snapshot.symbol,
            last_update_id = snapshot.last_update_id,
            path = %path.display(),
            "Snapshot persisted"
        );
        Ok(())
    }

    fn write_diff(&mut self, diff: &DiffEvent) -> Result<(), ArchiveError> {
        let options = self.options.clone();
        let journal = self.journal_mut(&diff.symbol);

        if journal.writer.is_none() {
            let config = JournalConfig {
                max_file_size: options.max_journal_file_size,
                flush_policy: options.flush_policy,
                fsync_policy: options.fsync_policy,
                ..JournalConfig::new(&journal.diff_dir)
            };
            journal.writer = Some(JournalWriter::open_at(config, journal.tail)?);
        }

        if let Some(writer) = journal.writer.as_mut() {
            let (_, location) = writer.write_diff(diff)?;
            journal.index.push(IndexEntry {
                final_update_id: diff.final_update_id,
                location,
            });
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ArchiveError> {
        for journal in self.symbols.values_mut() {
            if let Some(writer) = journal.writer.as_mut() {
                writer.flush()?;
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), ArchiveError> {
        FileArchive::sync(self)
    }
}

impl ArchiveReader for FileArchive {
    fn list_symbols(&self) -> Result<Vec<Symbol>, ArchiveError> {
        Ok(self.symbols.keys().cloned().collect())
    }

    fn list_snapshot_update_ids(&self, symbol: &Symbol) -> Result<Vec<u64>, ArchiveError> {
        let dir = self.root.join(symbol.storage_key()).join("snapshots");
        Ok(SnapshotLoader::new(dir).list_update_ids()?)
    }

    fn read_diff_block(
        &self,
        symbol: &Symbol,
        after_update_id: u64,
        block_size: usize,
    ) -> Result<Vec<DiffEvent>, ArchiveError> {
        if block_size == 0 {
            return Err(ArchiveError::InvalidBlockSize);
        }
        let journal = match self.symbols.get(symbol) {
            Some(journal) => journal,
            None => return Ok(Vec::new()),
        };

        let start = journal
            .index
            .partition_point(|e| e.final_update_id <= after_update_id);
        let end = start.saturating_add(block_size).min(journal.index.len());
        let locations: Vec<EntryLocation> =
            journal.index[start..end].iter().map(|e| e.location).collect();

        read_entries_at(&journal.diff_dir, &locations)?
            .iter()
            .map(|entry| entry.to_diff(symbol).map_err(ArchiveError::from))
            .collect()
    }

    fn read_snapshot_at_or_after(
        &self,
        symbol: &Symbol,
        update_id: u64,
    ) -> Result<Option<DepthSnapshot>, ArchiveError> {
        let dir = self.root.join(symbol.storage_key()).join("snapshots");
        Ok(SnapshotLoader::new(dir).load_at_or_after(update_id)?)
    }
}

// ── Memory Archive ──────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct MemoryLog {
    snapshots: BTreeMap<u64, DepthSnapshot>,
    diffs: Vec<DiffEvent>,
}

/// In-memory archive with the same ordering rules as [`FileArchive`].
#[derive(Debug, Default, Clone)]
pub struct MemoryArchive {
    logs: BTreeMap<Symbol, MemoryLog>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diff_count(&self, symbol: &Symbol) -> usize {
        self.logs.get(symbol).map(|l| l.diffs.len()).unwrap_or(0)
    }
}

impl ArchiveWriter for MemoryArchive {
    fn write_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<(), ArchiveError> {
        self.logs
            .entry(snapshot.symbol.clone())
            .or_default()
            .snapshots
            .insert(snapshot.last_update_id, snapshot.clone());
        Ok(())
    }

    fn write_diff(&mut self, diff: &DiffEvent) -> Result<(), ArchiveError> {
        if diff.first_update_id > diff.final_update_id {
            return Err(JournalError::InvertedRange {
                first: diff.first_update_id,
                last: diff.final_update_id,
            }
            .into());
        }
        let log = self.logs.entry(diff.symbol.clone()).or_default();
        if let Some(last) = log.diffs.last() {
            if diff.first_update_id <= last.final_update_id {
                return Err(JournalError::NonMonotonic {
                    last: last.final_update_id,
                    got: diff.first_update_id,
                }
                .into());
            }
        }
        log.diffs.push(diff.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ArchiveError> {
        Ok(())
    }
}

impl ArchiveReader for MemoryArchive {
    fn list_symbols(&self) -> Result<Vec<Symbol>, ArchiveError> {
        Ok(self.logs.keys().cloned().collect())
    }

    fn list_snapshot_update_ids(&self, symbol: &Symbol) -> Result<Vec<u64>, ArchiveError> {
        Ok(self
            .logs
            .get(symbol)
            .map(|l| l.snapshots.keys().copied().collect())
            .unwrap_or_default())
    }

    fn read_diff_block(
        &self,
        symbol: &Symbol,
        after_update_id: u64,
        block_size: usize,
    ) -> Result<Vec<DiffEvent>, ArchiveError> {
        if block_size == 0 {
            return Err(ArchiveError::InvalidBlockSize);
        }
        let diffs = match self.logs.get(symbol) {
            Some(log) => &log.diffs,
            None => return Ok(Vec::new()),
        };
        let start = diffs.partition_point(|d| d.final_update_id <= after_update_id);
        Ok(diffs[start..].iter().take(block_size).cloned().collect())
    }

    fn read_snapshot_at_or_after(
        &self,
        symbol: &Symbol,
        update_id: u64,
    ) -> Result<Option<DepthSnapshot>, ArchiveError> {
        Ok(self
            .logs
            .get(symbol)
            .and_then(|l| l.snapshots.range(update_id..).next())
            .map(|(_, s)| s.clone()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
