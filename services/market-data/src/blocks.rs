//! Data blocks: maximal contiguous runs of archived diffs
//!
//! A block ends where the next diff does not start at `final + 1`. Replay
//! can only run inside one block, so this is the map of what is
//! reconstructable and from which snapshots.

use persistence::archive::ArchiveReader;
use serde::Serialize;
use tracing::debug;
use types::ids::Symbol;

use crate::replay::ReplayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataBlock {
    pub symbol: Symbol,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub diff_count: u64,
    /// Snapshots a replay can start from inside this block
    pub snapshot_update_ids: Vec<u64>,
}

impl DataBlock {
    fn open(symbol: &Symbol, first: u64, last: u64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.clone(),
            first_update_id: first,
            last_update_id: last,
            first_timestamp: timestamp,
            last_timestamp: timestamp,
            diff_count: 1,
            snapshot_update_ids: Vec::new(),
        }
    }

    /// Whether a snapshot at `update_id` can seed a replay in this block.
    pub fn accepts_snapshot(&self, update_id: u64) -> bool {
        let next = update_id.saturating_add(1);
        self.first_update_id <= next && next <= self.last_update_id
    }

    /// Cursor that makes a replay start at this block's first usable
    /// snapshot.
    pub fn replay_cursor(&self) -> Option<u64> {
        self.snapshot_update_ids
            .first()
            .map(|id| id.saturating_sub(1))
    }

    /// Wall-clock span in nanoseconds.
    pub fn duration_nanos(&self) -> i64 {
        self.last_timestamp.saturating_sub(self.first_timestamp)
    }
}

/// Split the diffs after `after_update_id` into contiguous blocks.
pub fn list_data_blocks<R: ArchiveReader>(
    archive: &R,
    symbol: &Symbol,
    after_update_id: u64,
    block_size: usize,
) -> Result<Vec<DataBlock>, ReplayError> {
    if block_size == 0 {
        return Err(ReplayError::InvalidBlockSize);
    }

    let mut blocks: Vec<DataBlock> = Vec::new();
    let mut cursor = after_update_id;
    loop {
        let page = archive.read_diff_block(symbol, cursor, block_size)?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = last.final_update_id;

        for diff in page {
            match blocks.last_mut() {
                Some(block) if block.last_update_id.saturating_add(1) == diff.first_update_id => {
                    block.last_update_id = diff.final_update_id;
                    block.last_timestamp = diff.timestamp;
                    block.diff_count += 1;
                }
                _ => blocks.push(DataBlock::open(
                    symbol,
                    diff.first_update_id,
                    diff.final_update_id,
                    diff.timestamp,
                )),
            }
        }
    }

    let snapshot_ids = archive.list_snapshot_update_ids(symbol)?;
    for block in &mut blocks {
        block.snapshot_update_ids = snapshot_ids
            .iter()
            .copied()
            .filter(|id| block.accepts_snapshot(*id))
            .collect();
    }

    debug!(symbol = %symbol, blocks = blocks.len(), after = after_update_id, "Listed data blocks");
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::archive::{ArchiveWriter, MemoryArchive};
    use types::depth::{DepthSnapshot, DiffEvent};

    fn sym() -> Symbol {
        Symbol::spot("ETHUSDT")
    }

    fn diff(first: u64, last: u64) -> DiffEvent {
        DiffEvent {
            symbol: sym(),
            first_update_id: first,
            final_update_id: last,
            timestamp: (last * 1_000) as i64,
            bid_updates: vec![],
            ask_updates: vec![],
        }
    }

    fn snapshot(last_update_id: u64) -> DepthSnapshot {
        DepthSnapshot {
            symbol: sym(),
            last_update_id,
            timestamp: 0,
            bids: vec![],
            asks: vec![],
        }
    }

    fn archive() -> MemoryArchive {
        let mut archive = MemoryArchive::new();
        for (first, last) in [(1, 3), (4, 4), (5, 9), (20, 22), (23, 30), (40, 41)] {
            archive.write_diff(&diff(first, last)).unwrap();
        }
        for id in [2, 6, 9, 19, 25, 45] {
            archive.write_snapshot(&snapshot(id)).unwrap();
        }
        archive
    }

    #[test]
    fn test_blocks_split_on_discontinuity() {
        let blocks = list_data_blocks(&archive(), &sym(), 0, 2).unwrap();
        let spans: Vec<_> = blocks
            .iter()
            .map(|b| (b.first_update_id, b.last_update_id, b.diff_count))
            .collect();
        assert_eq!(spans, vec![(1, 9, 3), (20, 30, 2), (40, 41, 1)]);
        assert_eq!(blocks[0].first_timestamp, 3_000);
        assert_eq!(blocks[0].last_timestamp, 9_000);
        assert_eq!(blocks[0].duration_nanos(), 6_000);
    }

    #[test]
    fn test_block_snapshot_membership() {
        let blocks = list_data_blocks(&archive(), &sym(), 0, 100).unwrap();
        // 9 + 1 falls past the end of the first block
        assert_eq!(blocks[0].snapshot_update_ids, vec![2, 6]);
        assert_eq!(blocks[1].snapshot_update_ids, vec![19, 25]);
        assert!(blocks[2].snapshot_update_ids.is_empty());
        assert_eq!(blocks[1].replay_cursor(), Some(18));
        assert_eq!(blocks[2].replay_cursor(), None);
    }

    #[test]
    fn test_blocks_after_cursor() {
        let blocks = list_data_blocks(&archive(), &sym(), 25, 3).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].first_update_id, 23);
    }

    #[test]
    fn test_empty_archive() {
        let archive = MemoryArchive::new();
        assert!(list_data_blocks(&archive, &sym(), 0, 10).unwrap().is_empty());
        assert!(matches!(
            list_data_blocks(&archive, &sym(), 0, 0),
            Err(ReplayError::InvalidBlockSize)
        ));
    }
}
