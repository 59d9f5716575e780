//! Live recording: upstream sources → engine + archive
//!
//! Per symbol three tasks run independently:
//!
//! ```text
//!  DiffSource ──diffs──▶ ┌────────────┐ ──commands──▶ archive worker
//!                        │ reconciler │               (spawn_blocking)
//!  SnapshotSource ─────▶ │  (engine)  │ ──BookTop──▶ watch channel
//!        ▲               └─────┬──────┘
//!        └──── snapshot request┘
//! ```
//!
//! The reconciler is the single owner of its symbol's engine. Every raw
//! event is archived before the engine sees it, so the archive always holds
//! what replay needs to reproduce the live book. All symbols share one
//! archive worker, which keeps per-symbol write order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use persistence::archive::{ArchiveError, ArchiveWriter};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::depth::{DepthSnapshot, DiffEvent, PriceLevel};
use types::ids::Symbol;

use crate::config::RecorderConfig;
use crate::order_book::OrderBookState;
use crate::reconcile::{
    DiffOutcome, EngineConfig, EngineStats, ReconciliationEngine, SnapshotOutcome,
};
use crate::sources::{backoff_sleep, DiffSource, SnapshotSource, INITIAL_BACKOFF};

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub symbols: Vec<Symbol>,
    pub full_fetch_interval: Duration,
    pub full_fetch_limit: u32,
    pub engine: EngineConfig,
    /// Capacity of every per-symbol channel
    pub channel_capacity: usize,
    /// Archive writes between flushes
    pub flush_every: usize,
}

impl LiveOptions {
    pub fn from_config(config: &RecorderConfig, symbols: Vec<Symbol>) -> Self {
        Self {
            symbols,
            full_fetch_interval: config.full_fetch_period(),
            full_fetch_limit: config.full_fetch_limit,
            engine: config.engine_config(),
            channel_capacity: config.dispatcher_buffer_size.max(16),
            flush_every: config.dispatcher_buffer_size,
        }
    }
}

/// Top of book published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookTop {
    pub symbol: Symbol,
    pub last_update_id: u64,
    pub timestamp: i64,
    pub best_bid: Option<PriceLevel>,
    pub best_ask: Option<PriceLevel>,
}

impl BookTop {
    fn of(book: &OrderBookState) -> Self {
        Self {
            symbol: book.symbol().clone(),
            last_update_id: book.last_update_id(),
            timestamp: book.timestamp(),
            best_bid: book.best_bid(),
            best_ask: book.best_ask(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub diffs_written: u64,
    pub snapshots_written: u64,
    pub write_errors: u64,
    pub flushes: u64,
}

/// What a finished recorder hands back.
#[derive(Debug)]
pub struct RecorderReport<W> {
    pub writer: W,
    pub archive: ArchiveStats,
    pub engines: BTreeMap<Symbol, EngineStats>,
}

enum ArchiveCommand {
    Snapshot(DepthSnapshot),
    Diff(DiffEvent),
}

struct SymbolTasks {
    diffs: JoinHandle<()>,
    snapshots: JoinHandle<()>,
    reconciler: JoinHandle<EngineStats>,
}

/// Running recorder for a set of symbols.
pub struct LiveRecorder<W> {
    tasks: BTreeMap<Symbol, SymbolTasks>,
    tops: BTreeMap<Symbol, watch::Receiver<Option<BookTop>>>,
    archive: JoinHandle<Result<(W, ArchiveStats), ArchiveError>>,
    cancel: CancellationToken,
}

impl<W> LiveRecorder<W>
where
    W: ArchiveWriter + Send + 'static,
{
    /// Start every task. Must be called inside a tokio runtime.
    pub fn spawn<S, D>(
        snapshots: Arc<S>,
        diffs: Arc<D>,
        writer: W,
        options: LiveOptions,
        cancel: CancellationToken,
    ) -> Self
    where
        S: SnapshotSource,
        D: DiffSource,
    {
        let capacity = options.channel_capacity.max(1);
        let (archive_tx, archive_rx) = mpsc::channel(capacity);
        let flush_every = options.flush_every.max(1);
        let archive =
            tokio::task::spawn_blocking(move || archive_worker(writer, archive_rx, flush_every));

        let mut tasks = BTreeMap::new();
        let mut tops = BTreeMap::new();

        for symbol in &options.symbols {
            let (diff_tx, diff_rx) = mpsc::channel(capacity);
            let (snapshot_tx, snapshot_rx) = mpsc::channel(4);
            let (request_tx, request_rx) = mpsc::channel(1);
            let (top_tx, top_rx) = watch::channel(None);

            let diff_task = {
                let source = Arc::clone(&diffs);
                let symbol = symbol.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = source.stream_diffs(symbol.clone(), diff_tx, cancel).await {
                        warn!(symbol = %symbol, error = %err, "Diff source stopped");
                    }
                })
            };

            let snapshot_task = tokio::spawn(snapshot_loop(
                Arc::clone(&snapshots),
                symbol.clone(),
                options.full_fetch_limit,
                options.full_fetch_interval,
                snapshot_tx,
                request_rx,
                cancel.clone(),
            ));

            let reconciler = Reconciler {
                engine: ReconciliationEngine::new(symbol.clone(), options.engine.clone()),
                archive: archive_tx.clone(),
                requests: request_tx,
                tops: top_tx,
            };
            let reconciler_task =
                tokio::spawn(reconciler.run(diff_rx, snapshot_rx, cancel.clone()));

            tasks.insert(
                symbol.clone(),
                SymbolTasks {
                    diffs: diff_task,
                    snapshots: snapshot_task,
                    reconciler: reconciler_task,
                },
            );
            tops.insert(symbol.clone(), top_rx);
        }

        info!(symbols = options.symbols.len(), "Live recorder started");
        Self {
            tasks,
            tops,
            archive,
            cancel,
        }
    }

    /// Watch the top of book for `symbol`.
    pub fn book_top(&self, symbol: &Symbol) -> Option<watch::Receiver<Option<BookTop>>> {
        self.tops.get(symbol).cloned()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for every task to stop (cancel the token first), then drain
    /// and sync the archive.
    pub async fn join(self) -> Result<RecorderReport<W>, LiveError> {
        let mut engines = BTreeMap::new();
        for (symbol, tasks) in self.tasks {
            let stats = tasks.reconciler.await?;
            tasks.diffs.await?;
            tasks.snapshots.await?;
            info!(
                symbol = %symbol,
                diffs_applied = stats.diffs_applied,
                diffs_stale = stats.diffs_stale,
                diffs_dropped = stats.diffs_dropped,
                gaps = stats.gaps,
                snapshots_applied = stats.snapshots_applied,
                resyncs = stats.resyncs,
                "Symbol stopped"
            );
            engines.insert(symbol, stats);
        }

        let (writer, archive) = self.archive.await??;
        info!(
            diffs_written = archive.diffs_written,
            snapshots_written = archive.snapshots_written,
            write_errors = archive.write_errors,
            "Live recorder stopped"
        );
        Ok(RecorderReport {
            writer,
            archive,
            engines,
        })
    }
}

// ── Reconciler task ─────────────────────────────────────────────────

struct Reconciler {
    engine: ReconciliationEngine,
    archive: mpsc::Sender<ArchiveCommand>,
    requests: mpsc::Sender<()>,
    tops: watch::Sender<Option<BookTop>>,
}

impl Reconciler {
    async fn run(
        mut self,
        mut diffs: mpsc::Receiver<DiffEvent>,
        mut snapshots: mpsc::Receiver<DepthSnapshot>,
        cancel: CancellationToken,
    ) -> EngineStats {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(snapshot) = snapshots.recv() => self.on_snapshot(snapshot).await,
                diff = diffs.recv() => match diff {
                    Some(diff) => self.on_diff(diff).await,
                    None => break,
                },
            }
        }

        // Whatever already arrived still belongs in the archive.
        diffs.close();
        while let Ok(diff) = diffs.try_recv() {
            self.on_diff(diff).await;
        }
        debug!(symbol = %self.engine.symbol(), "Reconciler stopped");
        self.engine.stats()
    }

    async fn on_diff(&mut self, diff: DiffEvent) {
        self.archive(ArchiveCommand::Diff(diff.clone())).await;
        match self.engine.on_diff(diff) {
            DiffOutcome::Applied | DiffOutcome::Resynced => self.publish(),
            DiffOutcome::Gap(_) => {
                self.tops.send_replace(None);
                self.request_snapshot();
            }
            DiffOutcome::BufferOverflow {
                resnapshot: true, ..
            } => self.request_snapshot(),
            DiffOutcome::Buffered | DiffOutcome::BufferOverflow { .. } | DiffOutcome::Stale => {}
        }
    }

    async fn on_snapshot(&mut self, snapshot: DepthSnapshot) {
        self.archive(ArchiveCommand::Snapshot(snapshot.clone())).await;
        match self.engine.on_snapshot(snapshot) {
            SnapshotOutcome::Synced { .. } => self.publish(),
            SnapshotOutcome::Gap(_) => self.request_snapshot(),
            SnapshotOutcome::Deferred | SnapshotOutcome::Ignored => {}
        }
    }

    async fn archive(&self, command: ArchiveCommand) {
        if self.archive.send(command).await.is_err() {
            error!(symbol = %self.engine.symbol(), "Archive worker gone, event not persisted");
        }
    }

    fn request_snapshot(&self) {
        // A full channel means a fetch is already queued.
        let _ = self.requests.try_send(());
    }

    fn publish(&self) {
        if let Some(book) = self.engine.state() {
            self.tops.send_replace(Some(BookTop::of(book)));
        }
    }
}

// ── Snapshot task ───────────────────────────────────────────────────

async fn snapshot_loop<S: SnapshotSource>(
    source: Arc<S>,
    symbol: Symbol,
    limit: u32,
    period: Duration,
    snapshots: mpsc::Sender<DepthSnapshot>,
    mut requests: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    // First tick fires immediately: the initial sync.
    let mut schedule = tokio::time::interval(period);
    schedule.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let requested = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = schedule.tick() => false,
            Some(()) = requests.recv() => true,
        };
        debug!(symbol = %symbol, requested, "Fetching depth snapshot");

        // Requested fetches are retried until they land; the engine is
        // blocked without one. Scheduled ones just wait for the next tick.
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return,
                fetched = source.fetch_snapshot(&symbol, limit) => fetched,
            };
            match fetched {
                Ok(snapshot) => {
                    if snapshots.send(snapshot).await.is_err() {
                        return;
                    }
                    break;
                }
                Err(err) => {
                    error!(symbol = %symbol, error = %err, "Depth snapshot unavailable");
                    if !requested || !backoff_sleep(&mut backoff, &cancel).await {
                        break;
                    }
                }
            }
        }
    }
}

// ── Archive worker ──────────────────────────────────────────────────

fn archive_worker<W: ArchiveWriter>(
    mut writer: W,
    mut commands: mpsc::Receiver<ArchiveCommand>,
    flush_every: usize,
) -> Result<(W, ArchiveStats), ArchiveError> {
    let mut stats = ArchiveStats::default();
    let mut since_flush = 0usize;

    while let Some(command) = commands.blocking_recv() {
        let result = match &command {
            ArchiveCommand::Diff(diff) => writer.write_diff(diff),
            ArchiveCommand::Snapshot(snapshot) => writer.write_snapshot(snapshot),
        };
        match (result, command) {
            (Ok(()), ArchiveCommand::Diff(_)) => stats.diffs_written += 1,
            (Ok(()), ArchiveCommand::Snapshot(_)) => stats.snapshots_written += 1,
            (Err(err), ArchiveCommand::Diff(diff)) => {
                stats.write_errors += 1;
                warn!(
                    symbol = %diff.symbol,
                    first_update_id = diff.first_update_id,
                    final_update_id = diff.final_update_id,
                    error = %err,
                    "Diff not archived"
                );
            }
            (Err(err), ArchiveCommand::Snapshot(snapshot)) => {
                stats.write_errors += 1;
                warn!(
                    symbol = %snapshot.symbol,
                    last_update_id = snapshot.last_update_id,
                    error = %err,
                    "Snapshot not archived"
                );
            }
        }

        since_flush += 1;
        if since_flush >= flush_every {
            writer.flush()?;
            stats.flushes += 1;
            since_flush = 0;
        }
    }

    writer.sync()?;
    stats.flushes += 1;
    Ok((writer, stats))
}
