//! Snapshot / diff reconciliation
//!
//! Merges an independently arriving snapshot stream and diff stream into one
//! continuity-checked book. The engine is sans-IO: it never fetches
//! anything, it only reports what it needs next. The live recorder and the
//! replay generator drive the same engine.
//!
//! Phases:
//! - `Buffering`: no usable book. Diffs are queued until a snapshot arrives.
//! - `Synced`: the book is live and every diff goes through the admission
//!   rule in [`OrderBookState::apply_diff`].
//!
//! A gap drops the book and returns to `Buffering`. The diff that revealed
//! it stays buffered, since it is still valid input for the next snapshot.
//!
//! Snapshots that arrive while synced become a pending checkpoint. When a
//! later diff straddles `checkpoint + 1` the book is rebuilt from the
//! checkpoint before that diff is applied, which also prunes deep levels the
//! diff stream never clears.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use types::depth::{DepthSnapshot, DiffEvent};
use types::ids::Symbol;

use crate::order_book::{ApplyOutcome, Gap, OrderBookState};

/// What to do when the pre-snapshot buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered diff to make room.
    #[default]
    DropOldest,
    /// Discard the whole buffer and ask for a fresh snapshot.
    Reset,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of diffs held while waiting for a snapshot.
    pub buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Buffering,
    Synced,
}

/// Result of feeding one diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Queued until a snapshot arrives.
    Buffered,
    /// Queued, but the buffer was full. `resnapshot` is set when the
    /// overflow policy threw away the whole buffer.
    BufferOverflow { dropped: usize, resnapshot: bool },
    Applied,
    /// The book was rebuilt from the pending checkpoint, then the diff applied.
    Resynced,
    Stale,
    /// Continuity broke. The book is gone; a fresh snapshot is needed.
    Gap(Gap),
}

/// Result of feeding one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The book is live at `last_update_id` after replaying the buffer.
    Synced {
        applied: usize,
        discarded: usize,
        last_update_id: u64,
    },
    /// The buffered diffs do not connect to this snapshot.
    Gap(Gap),
    /// Held as a checkpoint until the diff stream reaches it.
    Deferred,
    /// Older than the live book.
    Ignored,
}

/// Running counters, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub diffs_applied: u64,
    pub diffs_buffered: u64,
    pub diffs_stale: u64,
    pub diffs_dropped: u64,
    pub gaps: u64,
    pub snapshots_applied: u64,
    pub snapshots_ignored: u64,
    pub resyncs: u64,
}

pub struct ReconciliationEngine {
    symbol: Symbol,
    config: EngineConfig,
    phase: Phase,
    book: OrderBookState,
    buffer: VecDeque<DiffEvent>,
    checkpoint: Option<DepthSnapshot>,
    stats: EngineStats,
}

impl ReconciliationEngine {
    pub fn new(symbol: Symbol, config: EngineConfig) -> Self {
        debug!(
            symbol = %symbol,
            buffer_capacity = config.buffer_capacity,
            overflow_policy = ?config.overflow_policy,
            "ReconciliationEngine initialized"
        );
        Self {
            book: OrderBookState::new(symbol.clone()),
            symbol,
            buffer: VecDeque::with_capacity(config.buffer_capacity.min(1024)),
            config,
            phase: Phase::Buffering,
            checkpoint: None,
            stats: EngineStats::default(),
        }
    }

    pub fn with_defaults(symbol: Symbol) -> Self {
        Self::new(symbol, EngineConfig::default())
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the caller should obtain a snapshot.
    pub fn needs_snapshot(&self) -> bool {
        self.phase == Phase::Buffering
    }

    /// The live book, only while synced.
    pub fn state(&self) -> Option<&OrderBookState> {
        match self.phase {
            Phase::Synced => Some(&self.book),
            Phase::Buffering => None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Drop the book, the buffer and any checkpoint.
    pub fn reset(&mut self) {
        self.phase = Phase::Buffering;
        self.buffer.clear();
        self.checkpoint = None;
        self.book = OrderBookState::new(self.symbol.clone());
    }

    pub fn on_diff(&mut self, diff: DiffEvent) -> DiffOutcome {
        match self.phase {
            Phase::Buffering => self.buffer_diff(diff),
            Phase::Synced => self.apply_live(diff),
        }
    }

    pub fn on_snapshot(&mut self, snapshot: DepthSnapshot) -> SnapshotOutcome {
        match self.phase {
            Phase::Buffering => self.sync_from(snapshot),
            Phase::Synced => self.hold_checkpoint(snapshot),
        }
    }

    // ── Buffering ───────────────────────────────────────────────────

    fn buffer_diff(&mut self, diff: DiffEvent) -> DiffOutcome {
        let mut outcome = DiffOutcome::Buffered;

        if self.buffer.len() >= self.config.buffer_capacity {
            match self.config.overflow_policy {
                OverflowPolicy::DropOldest => {
                    let dropped = self.buffer.pop_front().map_or(0, |_| 1);
                    outcome = DiffOutcome::BufferOverflow {
                        dropped,
                        resnapshot: false,
                    };
                }
                OverflowPolicy::Reset => {
                    let dropped = self.buffer.len();
                    self.buffer.clear();
                    self.stats.gaps += 1;
                    outcome = DiffOutcome::BufferOverflow {
                        dropped,
                        resnapshot: true,
                    };
                }
            }
            if let DiffOutcome::BufferOverflow { dropped, .. } = outcome {
                self.stats.diffs_dropped += dropped as u64;
                warn!(
                    symbol = %self.symbol,
                    capacity = self.config.buffer_capacity,
                    dropped,
                    "Diff buffer overflow while awaiting snapshot"
                );
            }
        }

        self.stats.diffs_buffered += 1;
        self.buffer.push_back(diff);
        outcome
    }

    fn sync_from(&mut self, snapshot: DepthSnapshot) -> SnapshotOutcome {
        let snapshot_id = snapshot.last_update_id;
        self.book.initialize_from_snapshot(&snapshot);
        self.checkpoint = None;

        let before = self.buffer.len();
        let mut pending: Vec<DiffEvent> = self
            .buffer
            .drain(..)
            .filter(|d| d.final_update_id > snapshot_id)
            .collect();
        let mut discarded = before - pending.len();

        // Ascending by first id; for equal starts the widest range wins and
        // the narrower ones fall out as stale.
        pending.sort_by(|a, b| {
            a.first_update_id
                .cmp(&b.first_update_id)
                .then(b.final_update_id.cmp(&a.final_update_id))
        });

        let mut applied = 0;
        let mut remaining = pending.into_iter();
        while let Some(diff) = remaining.next() {
            match self.book.apply_diff(&diff) {
                Ok(ApplyOutcome::Applied) => applied += 1,
                Ok(ApplyOutcome::Stale) => discarded += 1,
                Err(gap) => {
                    self.buffer.push_back(diff);
                    self.buffer.extend(remaining);
                    self.stats.gaps += 1;
                    self.stats.diffs_applied += applied as u64;
                    self.stats.diffs_stale += discarded as u64;
                    self.book = OrderBookState::new(self.symbol.clone());
                    warn!(
                        symbol = %self.symbol,
                        snapshot_update_id = snapshot_id,
                        expected = gap.expected,
                        actual = gap.actual,
                        gap_size = gap.gap_size(),
                        "Buffered diffs do not connect to snapshot"
                    );
                    return SnapshotOutcome::Gap(gap);
                }
            }
        }

        self.phase = Phase::Synced;
        self.stats.diffs_applied += applied as u64;
        self.stats.diffs_stale += discarded as u64;
        self.stats.snapshots_applied += 1;
        info!(
            symbol = %self.symbol,
            snapshot_update_id = snapshot_id,
            applied,
            discarded,
            last_update_id = self.book.last_update_id(),
            "Book synced from snapshot"
        );
        SnapshotOutcome::Synced {
            applied,
            discarded,
            last_update_id: self.book.last_update_id(),
        }
    }

    // ── Synced ──────────────────────────────────────────────────────

    fn hold_checkpoint(&mut self, snapshot: DepthSnapshot) -> SnapshotOutcome {
        if snapshot.last_update_id < self.book.last_update_id() {
            self.stats.snapshots_ignored += 1;
            debug!(
                symbol = %self.symbol,
                snapshot_update_id = snapshot.last_update_id,
                last_update_id = self.book.last_update_id(),
                "Ignoring snapshot behind live book"
            );
            return SnapshotOutcome::Ignored;
        }
        if let Some(held) = &self.checkpoint {
            if held.last_update_id >= snapshot.last_update_id {
                self.stats.snapshots_ignored += 1;
                return SnapshotOutcome::Ignored;
            }
        }
        self.checkpoint = Some(snapshot);
        SnapshotOutcome::Deferred
    }

    fn apply_live(&mut self, diff: DiffEvent) -> DiffOutcome {
        // A checkpoint never papers over a hole in the stream.
        let expected = self.book.last_update_id() + 1;
        if diff.first_update_id > expected {
            let gap = Gap {
                expected,
                actual: diff.first_update_id,
            };
            return self.enter_gap(diff, gap);
        }

        if let Some(checkpoint) = self.checkpoint.take() {
            let resume_at = checkpoint.last_update_id + 1;
            if diff.covers(resume_at) {
                self.book.initialize_from_snapshot(&checkpoint);
                self.stats.resyncs += 1;
                self.stats.snapshots_applied += 1;
                return match self.book.apply_diff(&diff) {
                    Ok(_) => {
                        self.stats.diffs_applied += 1;
                        debug!(
                            symbol = %self.symbol,
                            checkpoint_update_id = checkpoint.last_update_id,
                            last_update_id = self.book.last_update_id(),
                            "Book rebuilt from checkpoint"
                        );
                        DiffOutcome::Resynced
                    }
                    Err(gap) => self.enter_gap(diff, gap),
                };
            }
            if diff.first_update_id <= resume_at {
                // Stream has not reached the checkpoint yet.
                self.checkpoint = Some(checkpoint);
            } else {
                self.stats.snapshots_ignored += 1;
                debug!(
                    symbol = %self.symbol,
                    checkpoint_update_id = checkpoint.last_update_id,
                    first_update_id = diff.first_update_id,
                    "Diff stream passed checkpoint, dropping it"
                );
            }
        }

        match self.book.apply_diff(&diff) {
            Ok(ApplyOutcome::Applied) => {
                self.stats.diffs_applied += 1;
                DiffOutcome::Applied
            }
            Ok(ApplyOutcome::Stale) => {
                self.stats.diffs_stale += 1;
                DiffOutcome::Stale
            }
            Err(gap) => self.enter_gap(diff, gap),
        }
    }

    fn enter_gap(&mut self, diff: DiffEvent, gap: Gap) -> DiffOutcome {
        warn!(
            symbol = %self.symbol,
            expected = gap.expected,
            actual = gap.actual,
            gap_size = gap.gap_size(),
            "Sequence gap detected, resnapshot needed"
        );
        self.stats.gaps += 1;
        self.phase = Phase::Buffering;
        self.checkpoint = None;
        self.book = OrderBookState::new(self.symbol.clone());
        self.buffer.clear();
        self.buffer.push_back(diff);
        DiffOutcome::Gap(gap)
    }
}
