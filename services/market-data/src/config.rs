//! Recorder configuration (`config.json`)
//!
//! Everything except `symbols` has a default. Validation runs once at
//! startup; an invalid file is fatal before any task starts.

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use persistence::archive::{ArchiveOptions, FlushPolicy};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use types::errors::MalformedEvent;
use types::ids::Symbol;

use crate::reconcile::{EngineConfig, OverflowPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no symbols configured")]
    NoSymbols,

    #[error("bad symbol {raw:?}: {source}")]
    BadSymbol {
        raw: String,
        #[source]
        source: MalformedEvent,
    },

    #[error("{key} = {value} is out of range ({expected})")]
    OutOfRange {
        key: &'static str,
        value: u64,
        expected: &'static str,
    },

    #[error("archive_dir must not be empty")]
    EmptyArchiveDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecorderConfig {
    /// `BTCUSDT`, `spot:BTCUSDT` or `futures:BTCUSDT`
    pub symbols: Vec<String>,
    /// Seconds between scheduled snapshot fetches
    #[serde(default = "default_full_fetch_interval")]
    pub full_fetch_interval: u64,
    /// Levels per side requested for each snapshot
    #[serde(default = "default_full_fetch_limit")]
    pub full_fetch_limit: u32,
    /// Stream update speed in ms
    #[serde(default = "default_stream_interval")]
    pub stream_interval: u32,
    /// Archive writes between flushes
    #[serde(default = "default_dispatcher_buffer_size")]
    pub dispatcher_buffer_size: usize,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default = "default_log_to_console")]
    pub log_to_console: bool,

    // Credentials and database name from older recorder configs. Accepted so
    // those files still load; the values are never read or kept.
    #[serde(default, skip_serializing)]
    api_key: Option<Legacy>,
    #[serde(default, skip_serializing)]
    api_secret: Option<Legacy>,
    #[serde(default, skip_serializing)]
    db_name: Option<Legacy>,
}

/// A key that is recognized and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Legacy;

impl<'de> Deserialize<'de> for Legacy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer).map(|_| Legacy)
    }
}

fn default_full_fetch_interval() -> u64 {
    3600
}

fn default_full_fetch_limit() -> u32 {
    1000
}

fn default_stream_interval() -> u32 {
    100
}

fn default_dispatcher_buffer_size() -> usize {
    1000
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("archive")
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_log_to_console() -> bool {
    true
}

impl RecorderConfig {
    /// Defaults for everything but the symbol list.
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            symbols,
            full_fetch_interval: default_full_fetch_interval(),
            full_fetch_limit: default_full_fetch_limit(),
            stream_interval: default_stream_interval(),
            dispatcher_buffer_size: default_dispatcher_buffer_size(),
            archive_dir: default_archive_dir(),
            buffer_capacity: default_buffer_capacity(),
            overflow_policy: OverflowPolicy::default(),
            log_to_console: default_log_to_console(),
            api_key: None,
            api_secret: None,
            db_name: None,
        }
    }

    /// Read and parse `path`. Does not validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field and parse the symbol list.
    pub fn validate(&self) -> Result<Vec<Symbol>, ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        check_range(
            "full_fetch_interval",
            self.full_fetch_interval,
            1..=86_400,
            "1..=86400 seconds",
        )?;
        check_range(
            "full_fetch_limit",
            self.full_fetch_limit as u64,
            1..=5000,
            "1..=5000",
        )?;
        if !matches!(self.stream_interval, 100 | 1000) {
            return Err(ConfigError::OutOfRange {
                key: "stream_interval",
                value: self.stream_interval as u64,
                expected: "100 or 1000",
            });
        }
        check_range(
            "dispatcher_buffer_size",
            self.dispatcher_buffer_size as u64,
            1..=u64::MAX,
            "positive",
        )?;
        check_range(
            "buffer_capacity",
            self.buffer_capacity as u64,
            1..=u64::MAX,
            "positive",
        )?;
        if self.archive_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyArchiveDir);
        }

        let mut symbols: Vec<Symbol> = Vec::with_capacity(self.symbols.len());
        for raw in &self.symbols {
            let symbol = Symbol::parse(raw).map_err(|source| ConfigError::BadSymbol {
                raw: raw.clone(),
                source,
            })?;
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        Ok(symbols)
    }

    pub fn full_fetch_period(&self) -> Duration {
        Duration::from_secs(self.full_fetch_interval)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer_capacity: self.buffer_capacity,
            overflow_policy: self.overflow_policy,
        }
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            flush_policy: FlushPolicy::EveryN(self.dispatcher_buffer_size),
            ..ArchiveOptions::default()
        }
    }

    /// Keys present in the file that are accepted but ignored.
    pub fn ignored_keys(&self) -> Vec<&'static str> {
        [
            ("api_key", self.api_key.is_some()),
            ("api_secret", self.api_secret.is_some()),
            ("db_name", self.db_name.is_some()),
        ]
        .into_iter()
        .filter_map(|(key, present)| present.then_some(key))
        .collect()
    }

    /// Log file used when console logging is off.
    pub fn log_file(&self) -> PathBuf {
        self.archive_dir.join("recorder.log")
    }
}

fn check_range(
    key: &'static str,
    value: u64,
    range: RangeInclusive<u64>,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if !range.contains(&value) {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            expected,
        });
    }
    Ok(())
}
