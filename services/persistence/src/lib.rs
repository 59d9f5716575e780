//! Depth Event Archive
//!
//! Durable storage for captured depth snapshots and diff streams, and the
//! read interface that historical replay is built on.
//!
//! # Modules
//! - `journal`: append-only, CRC32C-checked diff journal with rotation
//! - `reader`: sequential and positional journal reads, corruption log
//! - `snapshot`: zstd-compressed, SHA-256-verified snapshot files
//! - `archive`: `ArchiveWriter` / `ArchiveReader` traits, file and memory backends

pub mod archive;
pub mod journal;
pub mod reader;
pub mod snapshot;

pub use archive::{
    ArchiveError, ArchiveOptions, ArchiveReader, ArchiveWriter, FileArchive, MemoryArchive,
};
