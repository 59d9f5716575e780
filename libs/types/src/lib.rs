//! Types library for order book reconstruction
//!
//! Core data model shared by the archive and the market-data service.
//!
//! # Modules
//! - `ids`: Instrument identifiers (Symbol, Market)
//! - `numeric`: Decimal newtypes (Price, Quantity)
//! - `depth`: Snapshots, diff events and price levels
//! - `errors`: Boundary validation errors

pub mod depth;
pub mod errors;
pub mod ids;
pub mod numeric;

pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::depth::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::numeric::*;
}
