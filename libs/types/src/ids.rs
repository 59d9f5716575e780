//! Instrument identifiers
//!
//! A configured instrument is written `[market:]SYMBOL`, for example
//! `BTCUSDT`, `spot:ethusdt` or `futures:BTCUSDT`. The market prefix only
//! selects upstream endpoints; reconstruction never looks at it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::MalformedEvent;

/// Venue segment an instrument trades on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    #[default]
    Spot,
    UsdFutures,
}

impl Market {
    pub fn prefix(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::UsdFutures => "futures",
        }
    }
}

/// Trading instrument, normalized to upper case
///
/// Spot symbols print bare (`BTCUSDT`); futures symbols keep their prefix
/// (`futures:BTCUSDT`) so the two never collide in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    market: Market,
    name: String,
}

impl Symbol {
    /// Parse `[market:]SYMBOL`
    pub fn parse(raw: &str) -> Result<Self, MalformedEvent> {
        let raw = raw.trim();
        let (market, name) = match raw.split_once(':') {
            Some((prefix, name)) => {
                let market = match prefix.to_ascii_lowercase().as_str() {
                    "spot" => Market::Spot,
                    "futures" | "usdm" => Market::UsdFutures,
                    _ => {
                        return Err(MalformedEvent::UnknownMarket {
                            prefix: prefix.to_string(),
                        })
                    }
                };
                (market, name)
            }
            None => (Market::Spot, raw),
        };

        if name.is_empty() {
            return Err(MalformedEvent::EmptySymbol);
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MalformedEvent::InvalidSymbol {
                symbol: raw.to_string(),
            });
        }

        Ok(Self {
            market,
            name: name.to_ascii_uppercase(),
        })
    }

    /// Spot symbol from a name known to be valid
    pub fn spot(name: &str) -> Self {
        Self {
            market: Market::Spot,
            name: name.to_ascii_uppercase(),
        }
    }

    pub fn market(&self) -> Market {
        self.market
    }

    /// Exchange-side name without any prefix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable, filesystem-safe key used for archive directories
    pub fn storage_key(&self) -> String {
        match self.market {
            Market::Spot => self.name.clone(),
            Market::UsdFutures => format!("FUTURES_{}", self.name),
        }
    }

    /// Inverse of [`Symbol::storage_key`]
    pub fn from_storage_key(key: &str) -> Result<Self, MalformedEvent> {
        match key.strip_prefix("FUTURES_") {
            Some(name) => Self::parse(&format!("futures:{}", name)),
            None => Self::parse(key),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.market {
            Market::Spot => write!(f, "{}", self.name),
            Market::UsdFutures => write!(f, "futures:{}", self.name),
        }
    }
}

impl FromStr for Symbol {
    type Err = MalformedEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
