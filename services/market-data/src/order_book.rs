//! Reconstructed order book state for one symbol
//!
//! Wholesale initialization from a snapshot, continuity-checked application
//! of diff events. The admission rule for a diff covering `[first, final]`
//! against a book at `last_update_id`:
//!
//! - `final <= last_update_id`: stale, ignored
//! - `first <= last_update_id + 1 <= final`: applied, book moves to `final`
//! - `first > last_update_id + 1`: gap, book untouched
//!
//! The check runs before any level is touched, so a diff is either fully
//! applied or not at all.

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use types::depth::{DepthSnapshot, DiffEvent, PriceLevel, Side};
use types::ids::Symbol;
use types::numeric::Price;

use crate::price_levels::PriceLevelMap;

/// Continuity break between a book and the next diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sequence gap detected: expected {expected}, got {actual}")]
pub struct Gap {
    /// First update id the book needed next
    pub expected: u64,
    /// First update id that actually arrived
    pub actual: u64,
}

impl Gap {
    /// Number of update ids missing.
    pub fn gap_size(&self) -> u64 {
        self.actual.saturating_sub(self.expected)
    }
}

/// Result of offering a diff to a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookState {
    symbol: Symbol,
    last_update_id: u64,
    /// Time of the last snapshot or diff folded in, Unix nanoseconds
    timestamp: i64,
    bids: PriceLevelMap,
    asks: PriceLevelMap,
}

impl OrderBookState {
    /// Create an empty, uninitialized book.
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            last_update_id: 0,
            timestamp: 0,
            bids: PriceLevelMap::new(Side::Bid),
            asks: PriceLevelMap::new(Side::Ask),
        }
    }

    pub fn from_snapshot(snapshot: &DepthSnapshot) -> Self {
        let mut book = Self::new(snapshot.symbol.clone());
        book.initialize_from_snapshot(snapshot);
        book
    }

    /// Replace the whole book with the snapshot's levels.
    pub fn initialize_from_snapshot(&mut self, snapshot: &DepthSnapshot) {
        self.symbol = snapshot.symbol.clone();
        self.bids.replace_all(&snapshot.bids);
        self.asks.replace_all(&snapshot.asks);
        self.last_update_id = snapshot.last_update_id;
        self.timestamp = snapshot.timestamp;
    }

    /// Offer one diff to the book.
    pub fn apply_diff(&mut self, diff: &DiffEvent) -> Result<ApplyOutcome, Gap> {
        if diff.final_update_id <= self.last_update_id {
            return Ok(ApplyOutcome::Stale);
        }

        let expected = self.last_update_id + 1;
        if diff.first_update_id > expected {
            return Err(Gap {
                expected,
                actual: diff.first_update_id,
            });
        }

        for level in &diff.bid_updates {
            self.bids.set(level.price, level.quantity);
        }
        for level in &diff.ask_updates {
            self.asks.set(level.price, level.quantity);
        }
        self.last_update_id = diff.final_update_id;
        self.timestamp = diff.timestamp;
        Ok(ApplyOutcome::Applied)
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn bids(&self) -> &PriceLevelMap {
        &self.bids
    }

    pub fn asks(&self) -> &PriceLevelMap {
        &self.asks
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.best()
    }

    /// Average of best bid and best ask.
    pub fn mid_price(&self) -> Option<Decimal> {
        let (bid, ask) = self.best_prices()?;
        Some((bid.as_decimal() + ask.as_decimal()) / Decimal::from(2))
    }

    /// Best ask minus best bid. Negative when the book is crossed.
    pub fn spread(&self) -> Option<Decimal> {
        let (bid, ask) = self.best_prices()?;
        Some(ask.as_decimal() - bid.as_decimal())
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// The `n` best levels of each side, `(bids, asks)`.
    pub fn depth(&self, n: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        (self.bids.top(n), self.asks.top(n))
    }

    /// Export the current book as a snapshot record.
    pub fn to_snapshot(&self) -> DepthSnapshot {
        DepthSnapshot {
            symbol: self.symbol.clone(),
            last_update_id: self.last_update_id,
            timestamp: self.timestamp,
            bids: self.bids.iter().collect(),
            asks: self.asks.iter().collect(),
        }
    }

    /// SHA-256 over update id and every level, best-first per side.
    ///
    /// Two books compare equal under this checksum exactly when they hold
    /// the same levels at the same update id.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.symbol.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.last_update_id.to_le_bytes());
        hasher.update(b"|");
        for level in self.bids.iter() {
            hasher.update(level.price.to_string().as_bytes());
            hasher.update(b":");
            hasher.update(level.quantity.to_string().as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"---");
        for level in self.asks.iter() {
            hasher.update(level.price.to_string().as_bytes());
            hasher.update(b":");
            hasher.update(level.quantity.to_string().as_bytes());
            hasher.update(b",");
        }
        format!("{:x}", hasher.finalize())
    }

    fn best_prices(&self) -> Option<(Price, Price)> {
        Some((self.bids.best()?.price, self.asks.best()?.price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;
    use types::numeric::Quantity;

    fn level(price: &str, qty: &str) -> PriceLevel {
        PriceLevel::parse(price, qty).unwrap()
    }

    fn make_snapshot(last_update_id: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthSnapshot {
        DepthSnapshot {
            symbol: Symbol::spot("BTCUSDT"),
            last_update_id,
            timestamp: 1_000,
            bids,
            asks,
        }
    }

    fn make_diff(first: u64, last: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DiffEvent {
        DiffEvent {
            symbol: Symbol::spot("BTCUSDT"),
            first_update_id: first,
            final_update_id: last,
            timestamp: last as i64,
            bid_updates: bids,
            ask_updates: asks,
        }
    }

    fn make_book() -> OrderBookState {
        OrderBookState::from_snapshot(&make_snapshot(
            100,
            vec![level("10.0", "5"), level("9.5", "2")],
            vec![level("10.5", "1"), level("11", "4")],
        ))
    }

    #[test]
    fn test_initialize_from_snapshot() {
        let book = make_book();
        assert_eq!(book.last_update_id(), 100);
        assert_eq!(book.bid_depth(), 2);
        assert_eq!(book.ask_depth(), 2);
        assert_eq!(book.best_bid().unwrap(), level("10", "5"));
        assert_eq!(book.best_ask().unwrap(), level("10.5", "1"));
        assert_eq!(book.spread().unwrap(), Decimal::from_str("0.5").unwrap());
        assert_eq!(book.mid_price().unwrap(), Decimal::from_str("10.25").unwrap());
    }

    #[test]
    fn test_snapshot_replaces_previous_levels() {
        let mut book = make_book();
        book.initialize_from_snapshot(&make_snapshot(50, vec![level("1", "1")], vec![]));
        assert_eq!(book.last_update_id(), 50);
        assert_eq!(book.bid_depth(), 1);
        assert_eq!(book.ask_depth(), 0);
        assert!(book.spread().is_none());
    }

    #[test]
    fn test_straddling_diff_applies() {
        let mut book = make_book();
        let diff = make_diff(101, 103, vec![level("10.0", "3")], vec![]);
        assert_eq!(book.apply_diff(&diff), Ok(ApplyOutcome::Applied));
        assert_eq!(book.last_update_id(), 103);
        assert_eq!(book.bids().get(&Price::from_str("10").unwrap()), Some(Quantity::from_u64(3)));
    }

    #[test]
    fn test_diff_starting_before_snapshot_applies() {
        let mut book = make_book();
        let diff = make_diff(95, 105, vec![], vec![level("10.5", "7")]);
        assert_eq!(book.apply_diff(&diff), Ok(ApplyOutcome::Applied));
        assert_eq!(book.last_update_id(), 105);
        assert_eq!(book.best_ask().unwrap().quantity, Quantity::from_u64(7));
    }

    #[test]
    fn test_stale_diff_is_noop() {
        let mut book = make_book();
        let before = book.clone();
        let diff = make_diff(95, 100, vec![level("10.0", "0")], vec![]);
        assert_eq!(book.apply_diff(&diff), Ok(ApplyOutcome::Stale));
        assert_eq!(book, before);
    }

    #[test]
    fn test_gap_leaves_book_untouched() {
        let mut book = make_book();
        let before = book.clone();
        let diff = make_diff(102, 105, vec![level("10.0", "0")], vec![]);
        let gap = book.apply_diff(&diff).unwrap_err();
        assert_eq!(gap, Gap { expected: 101, actual: 102 });
        assert_eq!(gap.gap_size(), 1);
        assert_eq!(book, before);
    }

    #[test]
    fn test_zero_quantity_removes_level() {
        let mut book = make_book();
        let diff = make_diff(101, 101, vec![level("10.0", "0")], vec![]);
        book.apply_diff(&diff).unwrap();
        assert_eq!(book.bid_depth(), 1);
        assert_eq!(book.best_bid().unwrap().price, Price::from_str("9.5").unwrap());
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = make_book();
        let mut b = make_book();
        assert_eq!(a.checksum(), b.checksum());

        b.apply_diff(&make_diff(101, 101, vec![], vec![])).unwrap();
        assert_ne!(a.checksum(), b.checksum(), "update id is part of the checksum");
    }

    #[test]
    fn test_to_snapshot_round_trip() {
        let book = make_book();
        let rebuilt = OrderBookState::from_snapshot(&book.to_snapshot());
        assert_eq!(rebuilt, book);
    }

    fn arb_levels() -> impl Strategy<Value = Vec<PriceLevel>> {
        prop::collection::vec((90u64..110, 0u64..5), 0..8).prop_map(|v| {
            v.into_iter()
                .map(|(p, q)| PriceLevel::new(Price::from_u64(p), Quantity::from_u64(q)))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_reapplying_a_diff_is_idempotent(
            first_offset in 0u64..3,
            len in 0u64..5,
            bids in arb_levels(),
            asks in arb_levels(),
        ) {
            let mut once = make_book();
            let first = 101 - first_offset;
            let diff = make_diff(first, 101 + len, bids, asks);

            once.apply_diff(&diff).unwrap();
            let mut twice = once.clone();
            let outcome = twice.apply_diff(&diff).unwrap();

            prop_assert_eq!(outcome, ApplyOutcome::Stale);
            prop_assert_eq!(&once, &twice);
        }

        #[test]
        fn prop_continuity_holds(spans in prop::collection::vec((0u64..3, 0u64..4), 1..30)) {
            let mut book = make_book();
            let mut next = 101u64;
            for (skip, len) in spans {
                let first = next + skip;
                let diff = make_diff(first, first + len, vec![], vec![]);
                let before = book.last_update_id();
                match book.apply_diff(&diff) {
                    Ok(ApplyOutcome::Applied) => {
                        prop_assert!(diff.first_update_id <= before + 1);
                        prop_assert_eq!(book.last_update_id(), diff.final_update_id);
                        next = first + len + 1;
                    }
                    Ok(ApplyOutcome::Stale) => prop_assert!(false, "diffs move forward"),
                    Err(gap) => {
                        prop_assert!(skip > 0);
                        prop_assert_eq!(gap.expected, before + 1);
                        prop_assert_eq!(book.last_update_id(), before);
                        break;
                    }
                }
            }
        }
    }
}
