//! Journal Reader: sequential and positional reads with corruption detection
//!
//! Features:
//! - Sequential entry reading across rotated journal files
//! - CRC32C checksum validation on every read
//! - Corruption log with file and byte-offset reporting
//! - Torn-tail tolerance: an unparseable remainder ends that file
//! - Positional reads of indexed entries for block-wise replay

use crate::journal::{EntryLocation, JournalEntry, JournalError, JournalWriter, MAX_BODY_LEN};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Checksum mismatch in file {file_index} at byte offset {offset}: diff [{first_update_id}, ..]")]
    ChecksumMismatch {
        file_index: u64,
        offset: u64,
        first_update_id: u64,
    },

    #[error("Corruption detected in file {file_index} at byte offset {offset}: {detail}")]
    Corruption {
        file_index: u64,
        offset: u64,
        detail: String,
    },
}

// ── Corruption Log Entry ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CorruptionRecord {
    pub file_index: u64,
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    TruncatedEntry,
}

/// An entry together with where it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedEntry {
    pub location: EntryLocation,
    pub entry: JournalEntry,
}

// ── Journal Reader ──────────────────────────────────────────────────

/// Sequential journal reader with checksum validation and corruption detection.
pub struct JournalReader {
    /// Journal files as (index, path), sorted by index.
    files: Vec<(u64, PathBuf)>,
    current: usize,
    data: Vec<u8>,
    pos: usize,
    corruption_log: Vec<CorruptionRecord>,
}

impl JournalReader {
    /// Open a reader over all journal files in the given directory.
    pub fn open(dir: &Path) -> Result<Self, ReaderError> {
        let files = discover_files(dir)?;
        let mut reader = Self {
            files,
            current: 0,
            data: Vec::new(),
            pos: 0,
            corruption_log: Vec::new(),
        };
        reader.load_current_file()?;
        Ok(reader)
    }

    /// Index of the last journal file, if any exist.
    pub fn last_file_index(&self) -> Option<u64> {
        self.files.last().map(|(idx, _)| *idx)
    }

    /// Read the next entry, validating its checksum.
    ///
    /// A checksum mismatch is returned as an error after the reader has moved
    /// past the bad entry, so callers may log it and keep reading.
    /// Returns `None` when all files have been read.
    pub fn next_entry(&mut self) -> Result<Option<LocatedEntry>, ReaderError> {
        loop {
            if self.pos >= self.data.len() && !self.advance_file()? {
                return Ok(None);
            }

            let file_index = self.files[self.current].0;
            let offset = self.pos as u64;
            match JournalEntry::from_bytes(&self.data[self.pos..]) {
                Ok((entry, consumed)) => {
                    self.pos += consumed;

                    if !entry.verify_checksum() {
                        self.corruption_log.push(CorruptionRecord {
                            file_index,
                            byte_offset: offset,
                            kind: CorruptionKind::ChecksumMismatch,
                            detail: format!(
                                "CRC32C mismatch for diff [{}, {}], stored={:#010x}",
                                entry.first_update_id, entry.final_update_id, entry.checksum
                            ),
                        });
                        return Err(ReaderError::ChecksumMismatch {
                            file_index,
                            offset,
                            first_update_id: entry.first_update_id,
                        });
                    }

                    let location = EntryLocation {
                        file_index,
                        offset,
                        len: consumed as u64,
                    };
                    return Ok(Some(LocatedEntry { location, entry }));
                }
                Err(err) => {
                    let remaining = self.data.len() - self.pos;
                    warn!(
                        file_index,
                        offset,
                        remaining,
                        error = %err,
                        "Unreadable journal tail, skipping rest of file"
                    );
                    self.corruption_log.push(CorruptionRecord {
                        file_index,
                        byte_offset: offset,
                        kind: CorruptionKind::TruncatedEntry,
                        detail: format!("{} bytes remaining, cannot parse: {}", remaining, err),
                    });
                    self.pos = self.data.len();
                }
            }
        }
    }

    /// Read every valid entry, skipping checksum failures.
    pub fn read_all(&mut self) -> Result<Vec<LocatedEntry>, ReaderError> {
        let mut entries = Vec::new();
        loop {
            match self.next_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(ReaderError::ChecksumMismatch {
                    file_index,
                    offset,
                    first_update_id,
                }) => {
                    warn!(file_index, offset, first_update_id, "Skipping corrupted journal entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    pub fn corruption_log(&self) -> &[CorruptionRecord] {
        &self.corruption_log
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn load_current_file(&mut self) -> Result<(), ReaderError> {
        self.data.clear();
        self.pos = 0;
        if let Some((_, path)) = self.files.get(self.current) {
            File::open(path)?.read_to_end(&mut self.data)?;
        }
        Ok(())
    }

    fn advance_file(&mut self) -> Result<bool, ReaderError> {
        if self.current + 1 >= self.files.len() {
            self.current = self.files.len().saturating_sub(1);
            self.pos = self.data.len();
            return Ok(false);
        }
        self.current += 1;
        self.load_current_file()?;
        Ok(true)
    }
}

/// Read the entries at `locations`, which must be sorted by file and offset.
///
/// Consecutive entries of one file are fetched with a single read.
pub fn read_entries_at(dir: &Path, locations: &[EntryLocation]) -> Result<Vec<JournalEntry>, ReaderError> {
    let mut out = Vec::with_capacity(locations.len());
    let mut start = 0;

    while start < locations.len() {
        let file_index = locations[start].file_index;
        let mut end = start + 1;
        while end < locations.len()
            && locations[end].file_index == file_index
            && locations[end].offset == locations[end - 1].offset + locations[end - 1].len
        {
            end += 1;
        }

        let run = &locations[start..end];
        let span_start = run[0].offset;
        let span_len = run.iter().map(|l| l.len).sum::<u64>();
        if span_len > (MAX_BODY_LEN as u64) * run.len() as u64 {
            return Err(ReaderError::Corruption {
                file_index,
                offset: span_start,
                detail: format!("implausible span length {}", span_len),
            });
        }

        let mut file = File::open(JournalWriter::journal_path(dir, file_index))?;
        file.seek(SeekFrom::Start(span_start))?;
        let mut buf = vec![0u8; span_len as usize];
        file.read_exact(&mut buf)?;

        let mut pos = 0usize;
        for location in run {
            let (entry, consumed) = JournalEntry::from_bytes(&buf[pos..]).map_err(|e| {
                ReaderError::Corruption {
                    file_index,
                    offset: location.offset,
                    detail: e.to_string(),
                }
            })?;
            if !entry.verify_checksum() {
                return Err(ReaderError::ChecksumMismatch {
                    file_index,
                    offset: location.offset,
                    first_update_id: entry.first_update_id,
                });
            }
            pos += consumed;
            out.push(entry);
        }
        start = end;
    }
    Ok(out)
}

fn discover_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, ReaderError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            JournalWriter::parse_index(&name).map(|idx| (idx, e.path()))
        })
        .collect();

    files.sort_by_key(|(idx, _)| *idx);
    Ok(files)
}

// ── Tests ───────────────────────────────────────────────────────────
