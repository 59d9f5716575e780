//! Depth events: full snapshots and incremental diffs
//!
//! Both carry upstream update ids. A snapshot is tagged with the id of the
//! last update folded into it; a diff covers the inclusive range
//! `[first_update_id, final_update_id]`. Consecutive diffs are contiguous when
//! `prev.final_update_id + 1 == next.first_update_id`.
//!
//! Timestamps are Unix nanoseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::MalformedEvent;
use crate::ids::Symbol;
use crate::numeric::{Price, Quantity};

/// Book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// One (price, quantity) pair as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub quantity: Quantity,
}

impl PriceLevel {
    pub fn new(price: Price, quantity: Quantity) -> Self {
        Self { price, quantity }
    }

    /// Parse a `["price", "qty"]` string pair
    pub fn parse(price: &str, quantity: &str) -> Result<Self, MalformedEvent> {
        Ok(Self {
            price: price.parse()?,
            quantity: quantity.parse()?,
        })
    }
}

/// Full depth capture at a single point in the update stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: Symbol,
    pub last_update_id: u64,
    pub timestamp: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl DepthSnapshot {
    pub fn validate(&self) -> Result<(), MalformedEvent> {
        if self.last_update_id == 0 {
            return Err(MalformedEvent::ZeroUpdateId);
        }
        validate_levels(&self.bids)?;
        validate_levels(&self.asks)
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp)
    }
}

/// Incremental change set covering `[first_update_id, final_update_id]`
///
/// A zero quantity removes the level; any other quantity replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEvent {
    pub symbol: Symbol,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub timestamp: i64,
    pub bid_updates: Vec<PriceLevel>,
    pub ask_updates: Vec<PriceLevel>,
}

impl DiffEvent {
    pub fn validate(&self) -> Result<(), MalformedEvent> {
        if self.first_update_id == 0 {
            return Err(MalformedEvent::ZeroUpdateId);
        }
        if self.first_update_id > self.final_update_id {
            return Err(MalformedEvent::InvertedRange {
                first: self.first_update_id,
                last: self.final_update_id,
            });
        }
        validate_levels(&self.bid_updates)?;
        validate_levels(&self.ask_updates)
    }

    /// Whether `update_id` falls inside this diff's range
    pub fn covers(&self, update_id: u64) -> bool {
        self.first_update_id <= update_id && update_id <= self.final_update_id
    }

    /// Number of level changes carried
    pub fn len(&self) -> usize {
        self.bid_updates.len() + self.ask_updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp)
    }
}

// Values deserialized from storage bypass the constructors, so re-check them.
fn validate_levels(levels: &[PriceLevel]) -> Result<(), MalformedEvent> {
    for level in levels {
        Price::try_new(level.price.as_decimal())?;
        Quantity::try_new(level.quantity.as_decimal())?;
    }
    Ok(())
}
