//! Ordered price → quantity map for one side of a book
//!
//! Uses `BTreeMap` so best-price access and iteration are deterministic.
//! The map itself is always stored ascending; the side decides which end is
//! "best": bids read from the top, asks from the bottom.
//!
//! A level with zero quantity is never stored. Setting a zero quantity
//! removes the key.

use std::collections::btree_map;
use std::collections::BTreeMap;

use rust_decimal::Decimal;
use types::depth::{PriceLevel, Side};
use types::numeric::{Price, Quantity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevelMap {
    side: Side,
    levels: BTreeMap<Price, Quantity>,
}

impl PriceLevelMap {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Insert, overwrite or (for zero quantity) remove a level.
    ///
    /// Returns the quantity previously stored at `price`.
    pub fn set(&mut self, price: Price, quantity: Quantity) -> Option<Quantity> {
        if quantity.is_zero() {
            self.levels.remove(&price)
        } else {
            self.levels.insert(price, quantity)
        }
    }

    /// Replace every level with `levels`, skipping zero quantities.
    pub fn replace_all(&mut self, levels: &[PriceLevel]) {
        self.levels.clear();
        for level in levels {
            self.set(level.price, level.quantity);
        }
    }

    pub fn get(&self, price: &Price) -> Option<Quantity> {
        self.levels.get(price).copied()
    }

    pub fn best(&self) -> Option<PriceLevel> {
        let entry = match self.side {
            Side::Bid => self.levels.iter().next_back(),
            Side::Ask => self.levels.iter().next(),
        };
        entry.map(|(p, q)| PriceLevel::new(*p, *q))
    }

    /// Levels best-first: descending for bids, ascending for asks.
    pub fn iter(&self) -> Levels<'_> {
        Levels {
            inner: self.levels.iter(),
            side: self.side,
        }
    }

    /// The `n` best levels.
    pub fn top(&self, n: usize) -> Vec<PriceLevel> {
        self.iter().take(n).collect()
    }

    /// Sum of quantity over all levels.
    pub fn total_quantity(&self) -> Decimal {
        self.levels.values().map(|q| q.as_decimal()).sum()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }
}

/// Best-first iterator over a [`PriceLevelMap`].
pub struct Levels<'a> {
    inner: btree_map::Iter<'a, Price, Quantity>,
    side: Side,
}

impl Iterator for Levels<'_> {
    type Item = PriceLevel;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.side {
            Side::Bid => self.inner.next_back(),
            Side::Ask => self.inner.next(),
        };
        entry.map(|(p, q)| PriceLevel::new(*p, *q))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Levels<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn px(s: &str) -> Price {
        Price::from_str(s).unwrap()
    }

    fn qty(s: &str) -> Quantity {
        Quantity::from_str(s).unwrap()
    }

    #[test]
    fn test_empty_map() {
        let map = PriceLevelMap::new(Side::Bid);
        assert!(map.is_empty());
        assert!(map.best().is_none());
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn test_zero_quantity_removes_level() {
        let mut map = PriceLevelMap::new(Side::Bid);
        map.set(px("10.0"), qty("5"));
        assert_eq!(map.len(), 1);

        let prev = map.set(px("10.00"), qty("0"));
        assert_eq!(prev, Some(qty("5")));
        assert!(map.is_empty());
        assert!(map.get(&px("10")).is_none());
    }

    #[test]
    fn test_zero_quantity_on_missing_level_is_noop() {
        let mut map = PriceLevelMap::new(Side::Ask);
        assert_eq!(map.set(px("1"), qty("0")), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_overwrite_not_accumulate() {
        let mut map = PriceLevelMap::new(Side::Ask);
        map.set(px("10"), qty("5"));
        map.set(px("10"), qty("3"));
        assert_eq!(map.get(&px("10")), Some(qty("3")));
    }

    #[test]
    fn test_bids_iterate_descending() {
        let mut map = PriceLevelMap::new(Side::Bid);
        for p in ["99", "101", "100"] {
            map.set(px(p), qty("1"));
        }
        let prices: Vec<_> = map.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![px("101"), px("100"), px("99")]);
        assert_eq!(map.best().unwrap().price, px("101"));
    }

    #[test]
    fn test_asks_iterate_ascending() {
        let mut map = PriceLevelMap::new(Side::Ask);
        for p in ["99", "101", "100"] {
            map.set(px(p), qty("1"));
        }
        let prices: Vec<_> = map.top(2).into_iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![px("99"), px("100")]);
        assert_eq!(map.best().unwrap().price, px("99"));
    }

    #[test]
    fn test_replace_all_skips_zero() {
        let mut map = PriceLevelMap::new(Side::Bid);
        map.set(px("50"), qty("1"));
        map.replace_all(&[
            PriceLevel::new(px("10"), qty("2")),
            PriceLevel::new(px("11"), qty("0")),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.total_quantity(), Decimal::from(2));
    }
}
