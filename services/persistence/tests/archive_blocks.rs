//! Block-wise reads against the file archive
//!
//! Whatever the block size and journal rotation threshold, paging through
//! `read_diff_block` must return every persisted diff exactly once, in order.

use persistence::archive::{ArchiveOptions, ArchiveReader, ArchiveWriter, FileArchive, MemoryArchive};
use proptest::prelude::*;
use tempfile::TempDir;
use types::depth::{DiffEvent, PriceLevel};
use types::ids::Symbol;

fn make_diffs(spans: &[(u64, u64)]) -> Vec<DiffEvent> {
    let symbol = Symbol::spot("BTCUSDT");
    let mut next = 1u64;
    spans
        .iter()
        .map(|(skip, len)| {
            let first = next + skip;
            let last = first + len;
            next = last + 1;
            DiffEvent {
                symbol: symbol.clone(),
                first_update_id: first,
                final_update_id: last,
                timestamp: first as i64,
                bid_updates: vec![PriceLevel::parse("100.5", "2").unwrap()],
                ask_updates: vec![PriceLevel::parse("101", "0").unwrap()],
            }
        })
        .collect()
}

fn page_all<A: ArchiveReader>(archive: &A, symbol: &Symbol, block_size: usize) -> Vec<DiffEvent> {
    let mut out = Vec::new();
    let mut cursor = 0;
    loop {
        let block = archive.read_diff_block(symbol, cursor, block_size).unwrap();
        if block.is_empty() {
            return out;
        }
        assert!(block.len() <= block_size);
        cursor = block.last().unwrap().final_update_id;
        out.extend(block);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_paging_returns_every_diff_once(
        spans in prop::collection::vec((0u64..3, 0u64..4), 1..80),
        block_size in 1usize..17,
        max_file_size in 64u64..2048,
    ) {
        let tmp = TempDir::new().unwrap();
        let options = ArchiveOptions { max_journal_file_size: max_file_size, ..ArchiveOptions::default() };
        let diffs = make_diffs(&spans);
        let symbol = Symbol::spot("BTCUSDT");

        {
            let mut archive = FileArchive::open(tmp.path(), options.clone()).unwrap();
            for diff in &diffs {
                archive.write_diff(diff).unwrap();
            }
            archive.sync().unwrap();
            prop_assert_eq!(&page_all(&archive, &symbol, block_size), &diffs);
        }

        // Same answer from a cold index
        let archive = FileArchive::open(tmp.path(), options).unwrap();
        prop_assert_eq!(&page_all(&archive, &symbol, block_size), &diffs);
    }

    #[test]
    fn prop_file_and_memory_archives_agree(
        spans in prop::collection::vec((0u64..3, 0u64..4), 1..40),
        cursor in 0u64..200,
        block_size in 1usize..10,
    ) {
        let tmp = TempDir::new().unwrap();
        let mut file = FileArchive::open(tmp.path(), ArchiveOptions::default()).unwrap();
        let mut memory = MemoryArchive::new();
        let symbol = Symbol::spot("BTCUSDT");

        for diff in make_diffs(&spans) {
            file.write_diff(&diff).unwrap();
            memory.write_diff(&diff).unwrap();
        }
        file.flush().unwrap();

        prop_assert_eq!(
            file.read_diff_block(&symbol, cursor, block_size).unwrap(),
            memory.read_diff_block(&symbol, cursor, block_size).unwrap()
        );
    }
}
