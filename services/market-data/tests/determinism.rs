//! Determinism tests for order book reconstruction
//!
//! The live engine and the archive replay must agree state for state, and
//! no result may depend on the order diffs happened to arrive in.
//!
//! Tests include:
//! - Live vs replay comparison through the file archive
//! - Dual replay comparison
//! - Buffer arrival order independence
//! - Partial replay agreeing with full replay

use market_data::order_book::OrderBookState;
use market_data::reconcile::{DiffOutcome, ReconciliationEngine, SnapshotOutcome};
use market_data::replay::{reconstruct, reconstruct_partial, Projection, Termination};
use persistence::archive::{ArchiveOptions, ArchiveWriter, FileArchive};
use proptest::prelude::*;
use tempfile::TempDir;
use types::depth::{DepthSnapshot, DiffEvent, PriceLevel};
use types::ids::Symbol;
use types::numeric::{Price, Quantity};

const SNAPSHOT_ID: u64 = 100;
const DIFF_COUNT: u64 = 40;
/// Diff index whose final update id equals the checkpoint id
const CHECKPOINT_AFTER: u64 = 9;
const DEEP_BID: u64 = 500;

fn sym() -> Symbol {
    Symbol::spot("BTCUSDT")
}

fn level(price: u64, qty: u64) -> PriceLevel {
    PriceLevel::new(Price::from_u64(price), Quantity::from_u64(qty))
}

fn initial_snapshot() -> DepthSnapshot {
    let mut bids: Vec<_> = (980..=1000).map(|p| level(p, 1)).collect();
    bids.push(level(DEEP_BID, 1));
    DepthSnapshot {
        symbol: sym(),
        last_update_id: SNAPSHOT_ID,
        timestamp: 1_708_123_456_789_000_000,
        bids,
        asks: (1001..=1020).map(|p| level(p, 1)).collect(),
    }
}

/// Diff `i` covers three update ids and touches one level per side.
/// Some quantities are zero, so levels come and go.
fn diff_at(i: u64) -> DiffEvent {
    let first = SNAPSHOT_ID + 1 + 3 * i;
    DiffEvent {
        symbol: sym(),
        first_update_id: first,
        final_update_id: first + 2,
        timestamp: 1_708_123_456_789_000_000 + (i as i64 + 1) * 100_000_000,
        bid_updates: vec![level(1000 - (i * 7) % 20, (i * 13) % 5)],
        ask_updates: vec![level(1001 + (i * 11) % 20, (i * 3) % 4)],
    }
}

fn stale_diffs() -> Vec<DiffEvent> {
    vec![
        DiffEvent {
            first_update_id: 95,
            final_update_id: 97,
            ..diff_at(0)
        },
        DiffEvent {
            first_update_id: 98,
            final_update_id: 100,
            ..diff_at(1)
        },
    ]
}

/// The book right after diff `CHECKPOINT_AFTER`, minus the deep bid the
/// diff stream never clears.
fn checkpoint() -> DepthSnapshot {
    let mut book = OrderBookState::from_snapshot(&initial_snapshot());
    for i in 0..=CHECKPOINT_AFTER {
        book.apply_diff(&diff_at(i)).unwrap();
    }
    let mut snapshot = book.to_snapshot();
    snapshot
        .bids
        .retain(|l| l.price != Price::from_u64(DEEP_BID));
    snapshot
}

fn write_archive(dir: &TempDir) -> FileArchive {
    let options = ArchiveOptions {
        max_journal_file_size: 512,
        ..ArchiveOptions::default()
    };
    let mut archive = FileArchive::open(dir.path(), options).unwrap();
    for diff in stale_diffs() {
        archive.write_diff(&diff).unwrap();
    }
    archive.write_snapshot(&initial_snapshot()).unwrap();
    for i in 0..DIFF_COUNT {
        archive.write_diff(&diff_at(i)).unwrap();
        if i == CHECKPOINT_AFTER {
            archive.write_snapshot(&checkpoint()).unwrap();
        }
    }
    archive.sync().unwrap();
    archive
}

/// Drive the engine the way the live recorder would, recording a checksum
/// for every state it publishes.
fn live_checksums() -> Vec<String> {
    let mut engine = ReconciliationEngine::with_defaults(sym());
    let mut checksums = Vec::new();

    for diff in stale_diffs() {
        assert_eq!(engine.on_diff(diff), DiffOutcome::Buffered);
    }
    let outcome = engine.on_snapshot(initial_snapshot());
    assert!(matches!(outcome, SnapshotOutcome::Synced { applied: 0, discarded: 2, .. }));
    checksums.push(engine.state().unwrap().checksum());

    for i in 0..DIFF_COUNT {
        match engine.on_diff(diff_at(i)) {
            DiffOutcome::Applied | DiffOutcome::Resynced => {
                checksums.push(engine.state().unwrap().checksum())
            }
            other => panic!("unexpected outcome for diff {}: {:?}", i, other),
        }
        if i == CHECKPOINT_AFTER {
            assert_eq!(engine.on_snapshot(checkpoint()), SnapshotOutcome::Deferred);
        }
    }
    assert_eq!(engine.stats().resyncs, 1);
    checksums
}

/// Test 1: Live reconciliation and archive replay emit identical states.
#[test]
fn test_live_and_replay_produce_identical_states() {
    let dir = TempDir::new().unwrap();
    let archive = write_archive(&dir);

    let mut replay = reconstruct(&archive, &sym(), 0, 4).unwrap();
    let replayed: Vec<String> = replay
        .by_ref()
        .map(|state| state.unwrap().checksum())
        .collect();

    assert_eq!(replayed.len() as u64, DIFF_COUNT + 1);
    assert_eq!(
        replayed,
        live_checksums(),
        "Replay must reproduce the live book at every step"
    );
    assert_eq!(replay.termination(), Some(Termination::Exhausted));
    assert_eq!(replay.metrics().checkpoints_loaded, 1);
}

/// Test 2: The checkpoint prunes the deep level, in replay as in live.
#[test]
fn test_checkpoint_prunes_untouched_level() {
    let dir = TempDir::new().unwrap();
    let archive = write_archive(&dir);
    let deep = Price::from_u64(DEEP_BID);

    let states: Vec<OrderBookState> = reconstruct(&archive, &sym(), 0, 16)
        .unwrap()
        .map(Result::unwrap)
        .collect();

    let checkpoint_id = checkpoint().last_update_id;
    for state in &states {
        let has_deep = state.bids().get(&deep).is_some();
        assert_eq!(
            has_deep,
            state.last_update_id() <= checkpoint_id,
            "deep bid presence wrong at {}",
            state.last_update_id()
        );
    }
}

/// Test 3: Two replays of the same archive are identical, whatever the
/// block size.
#[test]
fn test_dual_replay_identical() {
    let dir = TempDir::new().unwrap();
    let archive = write_archive(&dir);

    let run = |block_size: usize| -> Vec<String> {
        reconstruct(&archive, &sym(), 0, block_size)
            .unwrap()
            .map(|s| s.unwrap().checksum())
            .collect()
    };
    assert_eq!(run(1), run(1000));

    // A cold reopen of the same directory changes nothing
    drop(archive);
    let reopened = FileArchive::open(dir.path(), ArchiveOptions::default()).unwrap();
    let cold: Vec<String> = reconstruct(&reopened, &sym(), 0, 7)
        .unwrap()
        .map(|s| s.unwrap().checksum())
        .collect();
    assert_eq!(cold, live_checksums());
}

/// Test 4: The partial view is the full book cut to size.
#[test]
fn test_partial_replay_matches_full_replay() {
    let dir = TempDir::new().unwrap();
    let archive = write_archive(&dir);

    let full: Vec<OrderBookState> = reconstruct(&archive, &sym(), 0, 8)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    let partial: Vec<_> = reconstruct_partial(&archive, &sym(), 0, 8, Projection::top(5))
        .unwrap()
        .map(Result::unwrap)
        .collect();

    assert_eq!(full.len(), partial.len());
    for (book, view) in full.iter().zip(&partial) {
        assert_eq!(view.last_update_id, book.last_update_id());
        let (bids, asks) = book.depth(5);
        assert_eq!(view.bids, bids);
        assert_eq!(view.asks, asks);
        assert_eq!(view.interleaved().len(), 20);
    }
}

fn sync_with_buffer(buffer: Vec<DiffEvent>) -> String {
    let mut engine = ReconciliationEngine::with_defaults(sym());
    for diff in buffer {
        engine.on_diff(diff);
    }
    engine.on_snapshot(initial_snapshot());
    engine.state().unwrap().checksum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Test 5: Diffs buffered before the snapshot apply in update id
    /// order, not arrival order.
    #[test]
    fn prop_buffer_arrival_order_irrelevant(
        shuffled in Just(
            stale_diffs()
                .into_iter()
                .chain((0..12).map(diff_at))
                .collect::<Vec<_>>()
        ).prop_shuffle()
    ) {
        let mut ordered = stale_diffs();
        ordered.extend((0..12).map(diff_at));
        prop_assert_eq!(sync_with_buffer(shuffled), sync_with_buffer(ordered));
    }
}
