//! Fixed-point decimal types for prices and quantities
//!
//! Uses rust_decimal so that level keys compare exactly: `10.0` and `10.00`
//! are the same price. Both types serialize as decimal strings, which is also
//! how the upstream feed encodes them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::MalformedEvent;

/// Price of a level. Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    /// Create a price, rejecting zero and negative values
    pub fn try_new(value: Decimal) -> Result<Self, MalformedEvent> {
        if value <= Decimal::ZERO {
            return Err(MalformedEvent::NonPositivePrice {
                price: value.to_string(),
            });
        }
        Ok(Self(value.normalize()))
    }

    /// Whole-number price, mostly useful in tests
    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value.max(1)))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl FromStr for Price {
    type Err = MalformedEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s).map_err(|_| MalformedEvent::InvalidNumber {
            value: s.to_string(),
        })?;
        Self::try_new(value)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resting quantity at a level.
///
/// Zero is a valid value on the wire: it means "remove this level". It is
/// never stored inside a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    /// Create a quantity, rejecting negative values
    pub fn try_new(value: Decimal) -> Result<Self, MalformedEvent> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MalformedEvent::NegativeQuantity {
                quantity: value.to_string(),
            });
        }
        Ok(Self(value.normalize()))
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl FromStr for Quantity {
    type Err = MalformedEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s).map_err(|_| MalformedEvent::InvalidNumber {
            value: s.to_string(),
        })?;
        Self::try_new(value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
