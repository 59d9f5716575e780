//! Offline order book reconstruction from the event archive
//!
//! [`ReplayGenerator`] drives the same [`ReconciliationEngine`] the live
//! recorder uses, fed from persisted snapshots and diffs instead of the
//! network. It is pull-based: nothing is read until the first call to
//! [`ReplayGenerator::advance`], and diffs are fetched `block_size` at a time.
//!
//! Sequence for a starting cursor `c`:
//! 1. the first snapshot with `last_update_id > c` (none: empty sequence)
//! 2. one state per diff that moves the book forward
//! 3. stop at the first gap or when the archive runs out
//!
//! Resuming with [`ReplayGenerator::resume_cursor`] starts from the next
//! snapshot strictly after the last emitted state, so nothing is emitted twice.

use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::time::{Duration, Instant};

use persistence::archive::{ArchiveError, ArchiveReader};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};
use types::depth::{DiffEvent, PriceLevel};
use types::ids::Symbol;

use crate::order_book::{Gap, OrderBookState};
use crate::reconcile::{DiffOutcome, EngineConfig, ReconciliationEngine, SnapshotOutcome};

/// Default number of diffs fetched per archive read.
pub const DEFAULT_BLOCK_SIZE: usize = 5_000;

/// Errors during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("block size must be positive")]
    InvalidBlockSize,

    #[error("snapshot {update_id} is listed but could not be loaded")]
    MissingSnapshot { update_id: u64 },
}

/// Why a replay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No snapshot after the starting cursor.
    NoSnapshot,
    /// The persisted diffs break continuity.
    Gap(Gap),
    /// Every persisted diff was consumed.
    Exhausted,
    /// A storage error was returned to the caller.
    Failed,
}

/// Metrics collected during replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayMetrics {
    /// States handed to the caller.
    pub states_emitted: u64,
    /// Diffs read from the archive.
    pub diffs_read: u64,
    /// Archive block reads.
    pub blocks_read: u64,
    /// Intermediate snapshots fed to the engine.
    pub checkpoints_loaded: u64,
    /// Wall time from the first advance to termination.
    pub elapsed: Duration,
}

/// Lazy, finite, non-restartable stream of reconstructed books.
pub struct ReplayGenerator<R> {
    archive: R,
    symbol: Symbol,
    start_cursor: u64,
    block_size: usize,
    engine: ReconciliationEngine,
    started_at: Option<Instant>,
    block: VecDeque<DiffEvent>,
    /// Final update id of the last diff read from the archive.
    read_cursor: u64,
    /// Snapshot ids after the initial one, not yet reached.
    checkpoints: VecDeque<u64>,
    termination: Option<Termination>,
    last_emitted: Option<u64>,
    metrics: ReplayMetrics,
}

impl<R: ArchiveReader> ReplayGenerator<R> {
    /// Set up a replay. No I/O happens here.
    pub fn new(
        archive: R,
        symbol: Symbol,
        last_update_id: u64,
        block_size: usize,
    ) -> Result<Self, ReplayError> {
        if block_size == 0 {
            return Err(ReplayError::InvalidBlockSize);
        }
        let engine = ReconciliationEngine::new(symbol.clone(), EngineConfig::default());
        Ok(Self {
            archive,
            symbol,
            start_cursor: last_update_id,
            block_size,
            engine,
            started_at: None,
            block: VecDeque::new(),
            read_cursor: last_update_id,
            checkpoints: VecDeque::new(),
            termination: None,
            last_emitted: None,
            metrics: ReplayMetrics::default(),
        })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Set once the sequence has ended.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Update id of the last emitted state.
    pub fn last_update_id(&self) -> Option<u64> {
        self.last_emitted
    }

    /// Cursor to hand to a new generator to continue where this one stopped.
    pub fn resume_cursor(&self) -> u64 {
        self.last_emitted.unwrap_or(self.start_cursor)
    }

    pub fn metrics(&self) -> &ReplayMetrics {
        &self.metrics
    }

    /// Advance to the next state and borrow it.
    ///
    /// A storage error is returned once, after which the sequence is over.
    pub fn advance(&mut self) -> Option<Result<&OrderBookState, ReplayError>> {
        if self.termination.is_some() {
            return None;
        }
        match self.step() {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "Replay aborted");
                self.finish(Termination::Failed);
                return Some(Err(err));
            }
        }
        self.engine.state().map(Ok)
    }

    /// Returns `true` when a new state is available.
    fn step(&mut self) -> Result<bool, ReplayError> {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
            return self.start();
        }

        loop {
            let Some(diff) = self.next_diff()? else {
                self.finish(Termination::Exhausted);
                return Ok(false);
            };
            self.offer_checkpoint(&diff)?;

            match self.engine.on_diff(diff) {
                DiffOutcome::Applied | DiffOutcome::Resynced => {
                    self.emitted();
                    return Ok(true);
                }
                DiffOutcome::Stale => continue,
                DiffOutcome::Gap(gap) => {
                    self.finish(Termination::Gap(gap));
                    return Ok(false);
                }
                // Only reachable before sync, which `start` rules out.
                DiffOutcome::Buffered | DiffOutcome::BufferOverflow { .. } => continue,
            }
        }
    }

    fn start(&mut self) -> Result<bool, ReplayError> {
        let from = self.start_cursor.saturating_add(1);
        let Some(snapshot) = self.archive.read_snapshot_at_or_after(&self.symbol, from)? else {
            info!(symbol = %self.symbol, after = self.start_cursor, "No snapshot to replay from");
            self.finish(Termination::NoSnapshot);
            return Ok(false);
        };

        let snapshot_id = snapshot.last_update_id;
        self.checkpoints = self
            .archive
            .list_snapshot_update_ids(&self.symbol)?
            .into_iter()
            .filter(|id| *id > snapshot_id)
            .collect();
        self.read_cursor = snapshot_id;

        info!(
            symbol = %self.symbol,
            snapshot_update_id = snapshot_id,
            checkpoints = self.checkpoints.len(),
            block_size = self.block_size,
            "Starting replay"
        );

        match self.engine.on_snapshot(snapshot) {
            SnapshotOutcome::Synced { .. } => {
                self.emitted();
                Ok(true)
            }
            other => {
                // A fresh engine has nothing buffered, so this is not expected.
                warn!(symbol = %self.symbol, outcome = ?other, "Initial snapshot did not sync");
                self.finish(Termination::NoSnapshot);
                Ok(false)
            }
        }
    }

    fn next_diff(&mut self) -> Result<Option<DiffEvent>, ReplayError> {
        if self.block.is_empty() {
            let block =
                self.archive
                    .read_diff_block(&self.symbol, self.read_cursor, self.block_size)?;
            self.metrics.blocks_read += 1;
            if let Some(last) = block.last() {
                self.read_cursor = last.final_update_id;
            }
            debug!(
                symbol = %self.symbol,
                diffs = block.len(),
                read_cursor = self.read_cursor,
                "Read diff block"
            );
            self.block.extend(block);
        }
        let diff = self.block.pop_front();
        if diff.is_some() {
            self.metrics.diffs_read += 1;
        }
        Ok(diff)
    }

    /// Hand the engine the newest checkpoint this diff reaches, if any.
    fn offer_checkpoint(&mut self, diff: &DiffEvent) -> Result<(), ReplayError> {
        let mut reached = None;
        while let Some(&id) = self.checkpoints.front() {
            let resume_at = id.saturating_add(1);
            if resume_at > diff.final_update_id {
                break;
            }
            self.checkpoints.pop_front();
            if resume_at >= diff.first_update_id {
                reached = Some(id);
            }
        }

        let Some(id) = reached else {
            return Ok(());
        };
        let snapshot = self
            .archive
            .read_snapshot_at_or_after(&self.symbol, id)?
            .filter(|s| s.last_update_id == id)
            .ok_or(ReplayError::MissingSnapshot { update_id: id })?;
        self.metrics.checkpoints_loaded += 1;
        let outcome = self.engine.on_snapshot(snapshot);
        debug!(symbol = %self.symbol, checkpoint_update_id = id, outcome = ?outcome, "Checkpoint offered");
        Ok(())
    }

    fn emitted(&mut self) {
        self.metrics.states_emitted += 1;
        self.last_emitted = self.engine.state().map(|s| s.last_update_id());
    }

    fn finish(&mut self, termination: Termination) {
        self.termination = Some(termination);
        self.block.clear();
        self.metrics.elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();

        let secs = self.metrics.elapsed.as_secs_f64();
        let diffs_per_second = if secs > 0.0 {
            self.metrics.diffs_read as f64 / secs
        } else {
            self.metrics.diffs_read as f64
        };
        info!(
            symbol = %self.symbol,
            termination = ?termination,
            states_emitted = self.metrics.states_emitted,
            diffs_read = self.metrics.diffs_read,
            checkpoints_loaded = self.metrics.checkpoints_loaded,
            resume_cursor = self.resume_cursor(),
            duration_ms = self.metrics.elapsed.as_millis() as u64,
            dps = %format!("{:.0}", diffs_per_second),
            "Replay finished"
        );
    }
}

impl<R: ArchiveReader> Iterator for ReplayGenerator<R> {
    type Item = Result<OrderBookState, ReplayError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().map(|r| r.map(OrderBookState::clone))
    }
}

impl<R: ArchiveReader> FusedIterator for ReplayGenerator<R> {}

// ── Partial books ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideFilter {
    #[default]
    Both,
    Bids,
    Asks,
}

/// Which part of each reconstructed book to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Projection {
    pub side: SideFilter,
    /// Levels per side, best first. `None` keeps every level.
    pub depth: Option<usize>,
}

impl Projection {
    /// `n` levels of both sides.
    pub fn top(n: usize) -> Self {
        Self {
            side: SideFilter::Both,
            depth: Some(n),
        }
    }

    pub fn with_side(mut self, side: SideFilter) -> Self {
        self.side = side;
        self
    }

    pub fn apply(&self, book: &OrderBookState) -> PartialBook {
        let take = self.depth.unwrap_or(usize::MAX);
        let bids = match self.side {
            SideFilter::Both | SideFilter::Bids => book.bids().top(take),
            SideFilter::Asks => Vec::new(),
        };
        let asks = match self.side {
            SideFilter::Both | SideFilter::Asks => book.asks().top(take),
            SideFilter::Bids => Vec::new(),
        };
        PartialBook {
            symbol: book.symbol().clone(),
            last_update_id: book.last_update_id(),
            timestamp: book.timestamp(),
            depth: self.depth,
            bids,
            asks,
        }
    }
}

/// A projected view of one reconstructed book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialBook {
    pub symbol: Symbol,
    pub last_update_id: u64,
    pub timestamp: i64,
    pub depth: Option<usize>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl PartialBook {
    /// Flat row `[ask1_p, ask1_q, bid1_p, bid1_q, ask2_p, ...]`.
    ///
    /// As many rows as the deeper side holds, never more than `depth`. The
    /// shallower side is padded with zeros.
    pub fn interleaved(&self) -> Vec<Decimal> {
        let deeper = self.bids.len().max(self.asks.len());
        let rows = self.depth.map_or(deeper, |depth| depth.min(deeper));
        let mut out = Vec::with_capacity(rows.saturating_mul(4));
        for i in 0..rows {
            for level in [self.asks.get(i), self.bids.get(i)] {
                match level {
                    Some(l) => {
                        out.push(l.price.as_decimal());
                        out.push(l.quantity.as_decimal());
                    }
                    None => {
                        out.push(Decimal::ZERO);
                        out.push(Decimal::ZERO);
                    }
                }
            }
        }
        out
    }
}

/// [`ReplayGenerator`] projected through a [`Projection`].
pub struct PartialReplay<R> {
    inner: ReplayGenerator<R>,
    projection: Projection,
}

impl<R: ArchiveReader> PartialReplay<R> {
    pub fn new(inner: ReplayGenerator<R>, projection: Projection) -> Self {
        Self { inner, projection }
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    pub fn termination(&self) -> Option<Termination> {
        self.inner.termination()
    }

    pub fn resume_cursor(&self) -> u64 {
        self.inner.resume_cursor()
    }

    pub fn into_inner(self) -> ReplayGenerator<R> {
        self.inner
    }
}

impl<R: ArchiveReader> Iterator for PartialReplay<R> {
    type Item = Result<PartialBook, ReplayError>;

    fn next(&mut self) -> Option<Self::Item> {
        let projection = self.projection;
        self.inner
            .advance()
            .map(|r| r.map(|book| projection.apply(book)))
    }
}

impl<R: ArchiveReader> FusedIterator for PartialReplay<R> {}

// ── Entry points ────────────────────────────────────────────────────

/// Update ids of every archived snapshot for `symbol`, ascending.
pub fn list_snapshot_update_ids<R: ArchiveReader>(
    archive: &R,
    symbol: &Symbol,
) -> Result<Vec<u64>, ReplayError> {
    Ok(archive.list_snapshot_update_ids(symbol)?)
}

/// Replay full books for `symbol` starting after `last_update_id`.
pub fn reconstruct<R: ArchiveReader>(
    archive: R,
    symbol: &Symbol,
    last_update_id: u64,
    block_size: usize,
) -> Result<ReplayGenerator<R>, ReplayError> {
    ReplayGenerator::new(archive, symbol.clone(), last_update_id, block_size)
}

/// Replay projected books for `symbol` starting after `last_update_id`.
pub fn reconstruct_partial<R: ArchiveReader>(
    archive: R,
    symbol: &Symbol,
    last_update_id: u64,
    block_size: usize,
    projection: Projection,
) -> Result<PartialReplay<R>, ReplayError> {
    let inner = ReplayGenerator::new(archive, symbol.clone(), last_update_id, block_size)?;
    Ok(PartialReplay::new(inner, projection))
}
