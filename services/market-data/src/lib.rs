//! Market Data Service
//!
//! Rebuilds exchange order books from two independent inputs: periodic
//! full-depth snapshots and a continuous stream of depth diffs. The same
//! reconciliation runs live (feeding the archive as it goes) and offline
//! (replaying the archive).
//!
//! Continuity is decided purely by update ids, never by arrival time.
//!
//! # Architecture
//!
//! ```text
//!   Binance REST        Binance WS
//!        │                  │
//!   ┌────▼─────┐      ┌─────▼────┐
//!   │Snapshots │      │  Diffs   │   ← sources: validate, retry, reconnect
//!   └────┬─────┘      └─────┬────┘
//!        └───────┬──────────┘
//!          ┌─────▼──────┐
//!          │ Reconcile  │ ──────────▶ Archive (journal + snapshots)
//!          └─────┬──────┘                    │
//!          ┌─────▼──────┐              ┌─────▼─────┐
//!          │ Order Book │ ◀─────────── │  Replay   │
//!          └────────────┘              └───────────┘
//! ```

pub mod binance;
pub mod blocks;
pub mod config;
pub mod live;
pub mod order_book;
pub mod price_levels;
pub mod reconcile;
pub mod replay;
pub mod sources;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
