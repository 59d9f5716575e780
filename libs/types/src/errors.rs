//! Error types shared by every crate in the workspace
//!
//! Only boundary validation lives here. Each service layer defines its own
//! error enum on top (journal, snapshot, replay, source, config).

use thiserror::Error;

/// An inbound event that failed validation at the adapter boundary.
///
/// Malformed events are logged and skipped; they never reach a book.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEvent {
    #[error("empty symbol")]
    EmptySymbol,

    #[error("invalid symbol: {symbol}")]
    InvalidSymbol { symbol: String },

    #[error("unknown market prefix: {prefix}")]
    UnknownMarket { prefix: String },

    #[error("invalid number: {value}")]
    InvalidNumber { value: String },

    #[error("price must be positive, got {price}")]
    NonPositivePrice { price: String },

    #[error("quantity must not be negative, got {quantity}")]
    NegativeQuantity { quantity: String },

    #[error("update id range inverted: first {first} > final {last}")]
    InvertedRange { first: u64, last: u64 },

    #[error("update id must be non-zero")]
    ZeroUpdateId,

    #[error("symbol mismatch: expected {expected}, got {actual}")]
    SymbolMismatch { expected: String, actual: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverted_range_display() {
        let err = MalformedEvent::InvertedRange { first: 10, last: 5 };
        assert_eq!(err.to_string(), "update id range inverted: first 10 > final 5");
    }

    #[test]
    fn test_symbol_mismatch_display() {
        let err = MalformedEvent::SymbolMismatch {
            expected: "BTCUSDT".to_string(),
            actual: "ETHUSDT".to_string(),
        };
        assert!(err.to_string().contains("BTCUSDT"));
        assert!(err.to_string().contains("ETHUSDT"));
    }
}
