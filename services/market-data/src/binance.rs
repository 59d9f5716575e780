//! Binance depth adapters
//!
//! Snapshots come from the REST depth endpoint, diffs from the
//! `<symbol>@depth` WebSocket stream.
//!
//! Stream event (`depthUpdate`):
//! ```text
//! { "e": "depthUpdate", "E": 1672515782136, "s": "BNBBTC",
//!   "U": 157, "u": 160, "b": [["0.0024", "10"]], "a": [["0.0026", "100"]] }
//! ```
//!
//! USD-M futures frames also carry `pu`, the `u` of the previous frame, and
//! their `U` skips ahead between frames. Such a diff is stamped as starting
//! at `pu + 1`, so consecutive frames chain under the same
//! `first == previous final + 1` rule spot uses.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use types::depth::{DepthSnapshot, DiffEvent, PriceLevel};
use types::errors::MalformedEvent;
use types::ids::{Market, Symbol};

use crate::sources::{
    backoff_sleep, DiffSource, SnapshotSource, SourceError, INITIAL_BACKOFF, SNAPSHOT_ATTEMPTS,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Binance REST + WebSocket depth source.
#[derive(Debug, Clone)]
pub struct Binance {
    client: reqwest::Client,
    stream_interval_ms: u32,
}

impl Binance {
    /// `stream_interval_ms` is 100 or 1000; anything else is treated as 100.
    pub fn new(stream_interval_ms: u32) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            stream_interval_ms,
        })
    }

    pub fn depth_url(symbol: &Symbol, limit: u32) -> String {
        let base = match symbol.market() {
            Market::Spot => "https://api.binance.com/api/v3/depth",
            Market::UsdFutures => "https://fapi.binance.com/fapi/v1/depth",
        };
        format!("{}?symbol={}&limit={}", base, symbol.name(), limit)
    }

    pub fn stream_url(symbol: &Symbol, stream_interval_ms: u32) -> String {
        let host = match symbol.market() {
            Market::Spot => "wss://stream.binance.com:9443",
            Market::UsdFutures => "wss://fstream.binance.com",
        };
        let suffix = if stream_interval_ms == 1000 { "" } else { "@100ms" };
        format!(
            "{}/ws/{}@depth{}",
            host,
            symbol.name().to_lowercase(),
            suffix
        )
    }

    async fn fetch_once(&self, url: &str) -> Result<String, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

impl SnapshotSource for Binance {
    async fn fetch_snapshot(&self, symbol: &Symbol, limit: u32) -> Result<DepthSnapshot, SourceError> {
        let url = Self::depth_url(symbol, limit);
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=SNAPSHOT_ATTEMPTS {
            let result = self.fetch_once(&url).await.and_then(|body| {
                parse_snapshot(symbol, &body, now_nanos())
            });
            match result {
                Ok(snapshot) => {
                    info!(
                        symbol = %symbol,
                        last_update_id = snapshot.last_update_id,
                        bids = snapshot.bids.len(),
                        asks = snapshot.asks.len(),
                        "Fetched depth snapshot"
                    );
                    return Ok(snapshot);
                }
                // Bad data will not fix itself on retry.
                Err(err @ SourceError::Malformed(_)) | Err(err @ SourceError::Decode(_)) => {
                    return Err(err)
                }
                Err(err) => {
                    warn!(symbol = %symbol, attempt, error = %err, "Snapshot fetch failed");
                }
            }
            if attempt < SNAPSHOT_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(SourceError::RetriesExhausted {
            symbol: symbol.clone(),
            attempts: SNAPSHOT_ATTEMPTS,
        })
    }
}

impl DiffSource for Binance {
    async fn stream_diffs(
        &self,
        symbol: Symbol,
        sender: mpsc::Sender<DiffEvent>,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        let url = Self::stream_url(&symbol, self.stream_interval_ms);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            info!(symbol = %symbol, %url, "Connecting depth stream");
            match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
                Err(_) => error!(symbol = %symbol, "Depth stream connect timed out"),
                Ok(Err(e)) => error!(symbol = %symbol, error = %e, "Depth stream connect failed"),
                Ok(Ok((ws_stream, _))) => {
                    info!(symbol = %symbol, "Depth stream connected");
                    backoff = INITIAL_BACKOFF;
                    let (_write, mut read) = ws_stream.split();

                    loop {
                        let text = tokio::select! {
                            _ = cancel.cancelled() => {
                                info!(symbol = %symbol, "Depth stream shutting down");
                                return Ok(());
                            }
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(t))) => t,
                                Some(Ok(Message::Close(frame))) => {
                                    warn!(symbol = %symbol, ?frame, "Depth stream closed by server");
                                    break;
                                }
                                Some(Ok(_)) => continue,
                                Some(Err(e)) => {
                                    warn!(symbol = %symbol, error = %e, "Depth stream error");
                                    break;
                                }
                                None => {
                                    warn!(symbol = %symbol, "Depth stream ended");
                                    break;
                                }
                            }
                        };

                        let diff = match parse_diff(&symbol, &text) {
                            Ok(Some(diff)) => diff,
                            Ok(None) => continue,
                            Err(err) => {
                                warn!(
                                    symbol = %symbol,
                                    error = %err,
                                    payload_head = text.get(..200).unwrap_or(&text),
                                    "Skipping malformed depth update"
                                );
                                continue;
                            }
                        };
                        if sender.send(diff).await.is_err() {
                            return Err(SourceError::ChannelClosed);
                        }
                    }
                }
            }

            if !backoff_sleep(&mut backoff, &cancel).await {
                return Ok(());
            }
        }
    }
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RestDepth {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    /// Futures responses carry a message time, spot ones do not
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct WsDepthUpdate {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    /// Futures only
    #[serde(rename = "pu", default)]
    previous_final_update_id: Option<u64>,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, MalformedEvent> {
    raw.iter().map(|[p, q]| PriceLevel::parse(p, q)).collect()
}

fn millis_to_nanos(ms: i64) -> i64 {
    ms.saturating_mul(1_000_000)
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Decode a REST depth response. `received_at` (ns) stamps spot snapshots,
/// which carry no time of their own.
pub fn parse_snapshot(
    symbol: &Symbol,
    body: &str,
    received_at: i64,
) -> Result<DepthSnapshot, SourceError> {
    let raw: RestDepth = serde_json::from_str(body)?;
    let snapshot = DepthSnapshot {
        symbol: symbol.clone(),
        last_update_id: raw.last_update_id,
        timestamp: raw.event_time.map(millis_to_nanos).unwrap_or(received_at),
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    };
    snapshot.validate()?;
    Ok(snapshot)
}

/// Decode one stream frame. Frames that are not depth updates yield `None`.
pub fn parse_diff(symbol: &Symbol, text: &str) -> Result<Option<DiffEvent>, SourceError> {
    let raw: WsDepthUpdate = serde_json::from_str(text)?;
    if raw.event_type != "depthUpdate" {
        return Ok(None);
    }
    if !raw.symbol.eq_ignore_ascii_case(symbol.name()) {
        return Err(MalformedEvent::SymbolMismatch {
            expected: symbol.name().to_string(),
            actual: raw.symbol,
        }
        .into());
    }
    let first_update_id = match raw.previous_final_update_id {
        Some(pu) => raw.first_update_id.min(pu.saturating_add(1)),
        None => raw.first_update_id,
    };
    let diff = DiffEvent {
        symbol: symbol.clone(),
        first_update_id,
        final_update_id: raw.final_update_id,
        timestamp: millis_to_nanos(raw.event_time),
        bid_updates: parse_levels(&raw.bids)?,
        ask_updates: parse_levels(&raw.asks)?,
    };
    diff.validate()?;
    Ok(Some(diff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_book::Gap;
    use crate::reconcile::{DiffOutcome, ReconciliationEngine};
    use std::str::FromStr;
    use types::numeric::{Price, Quantity};

    const DEPTH_UPDATE: &str = r#"{
        "e": "depthUpdate",
        "E": 1672515782136,
        "s": "BNBBTC",
        "U": 157,
        "u": 160,
        "b": [["0.0024", "10"]],
        "a": [["0.0026", "100"], ["0.0027", "0.000"]]
    }"#;

    const REST_DEPTH: &str = r#"{
        "lastUpdateId": 1027024,
        "bids": [["4.00000000", "431.00000000"]],
        "asks": [["4.00000200", "12.00000000"]]
    }"#;

    fn bnb() -> Symbol {
        Symbol::spot("BNBBTC")
    }

    #[test]
    fn test_parse_depth_update() {
        let diff = parse_diff(&bnb(), DEPTH_UPDATE).unwrap().unwrap();
        assert_eq!(diff.first_update_id, 157);
        assert_eq!(diff.final_update_id, 160);
        assert_eq!(diff.timestamp, 1_672_515_782_136_000_000);
        assert_eq!(diff.bid_updates[0].price, Price::from_str("0.0024").unwrap());
        assert!(diff.ask_updates[1].quantity.is_zero());
        assert_eq!(diff.ask_updates[0].quantity, Quantity::from_str("100").unwrap());
    }

    #[test]
    fn test_parse_ignores_other_events() {
        let text = r#"{"e":"trade","E":1,"s":"BNBBTC","U":1,"u":1,"b":[],"a":[]}"#;
        assert!(parse_diff(&bnb(), text).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_symbol_mismatch() {
        let err = parse_diff(&Symbol::spot("ETHBTC"), DEPTH_UPDATE).unwrap_err();
        assert!(matches!(
            err,
            SourceError::Malformed(MalformedEvent::SymbolMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_inverted_range() {
        let text = r#"{"e":"depthUpdate","E":1,"s":"BNBBTC","U":9,"u":3,"b":[],"a":[]}"#;
        let err = parse_diff(&bnb(), text).unwrap_err();
        assert!(matches!(
            err,
            SourceError::Malformed(MalformedEvent::InvertedRange { first: 9, last: 3 })
        ));
    }

    #[test]
    fn test_parse_rejects_negative_quantity() {
        let text = r#"{"e":"depthUpdate","E":1,"s":"BNBBTC","U":1,"u":1,"b":[["1","-2"]],"a":[]}"#;
        assert!(matches!(
            parse_diff(&bnb(), text),
            Err(SourceError::Malformed(MalformedEvent::NegativeQuantity { .. }))
        ));
    }

    #[test]
    fn test_parse_garbage_is_decode_error() {
        assert!(matches!(
            parse_diff(&bnb(), "not json"),
            Err(SourceError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_rest_snapshot() {
        let snapshot = parse_snapshot(&bnb(), REST_DEPTH, 42).unwrap();
        assert_eq!(snapshot.last_update_id, 1_027_024);
        assert_eq!(snapshot.timestamp, 42);
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.asks[0].price, Price::from_str("4.000002").unwrap());
    }

    #[test]
    fn test_parse_futures_snapshot_uses_message_time() {
        let body = r#"{"lastUpdateId": 5, "E": 1000, "T": 999, "bids": [], "asks": []}"#;
        let symbol = Symbol::parse("futures:BTCUSDT").unwrap();
        let snapshot = parse_snapshot(&symbol, body, 42).unwrap();
        assert_eq!(snapshot.timestamp, 1_000_000_000);
    }

    fn futures_frame(first: u64, last: u64, previous: u64, bid_qty: &str) -> String {
        format!(
            r#"{{"e":"depthUpdate","E":1700000000000,"T":1699999999990,"s":"BTCUSDT",
                "U":{},"u":{},"pu":{},"b":[["37000.10","{}"]],"a":[["37000.20","1.5"]]}}"#,
            first, last, previous, bid_qty
        )
    }

    #[test]
    fn test_parse_futures_diff_starts_after_previous_final() {
        let symbol = Symbol::parse("futures:BTCUSDT").unwrap();
        let diff = parse_diff(&symbol, &futures_frame(1010, 1020, 1005, "2"))
            .unwrap()
            .unwrap();
        assert_eq!(diff.first_update_id, 1006);
        assert_eq!(diff.final_update_id, 1020);
        assert_eq!(diff.timestamp, 1_700_000_000_000_000_000);
        assert_eq!(diff.bid_updates[0].price, Price::from_str("37000.10").unwrap());

        // Spot frames have no `pu` and keep their own `U`
        let spot = parse_diff(&bnb(), DEPTH_UPDATE).unwrap().unwrap();
        assert_eq!(spot.first_update_id, 157);
    }

    #[test]
    fn test_consecutive_futures_frames_stay_in_sync() {
        let symbol = Symbol::parse("futures:BTCUSDT").unwrap();
        let mut engine = ReconciliationEngine::with_defaults(symbol.clone());
        engine.on_snapshot(DepthSnapshot {
            symbol: symbol.clone(),
            last_update_id: 999,
            timestamp: 0,
            bids: vec![],
            asks: vec![],
        });

        let frames = [
            futures_frame(1000, 1005, 999, "1"),
            futures_frame(1010, 1020, 1005, "2"),
            futures_frame(1031, 1034, 1020, "3"),
        ];
        for frame in &frames {
            let diff = parse_diff(&symbol, frame).unwrap().unwrap();
            assert_eq!(engine.on_diff(diff), DiffOutcome::Applied);
        }
        let book = engine.state().unwrap();
        assert_eq!(book.last_update_id(), 1034);
        assert_eq!(
            book.best_bid().unwrap().quantity,
            Quantity::from_str("3").unwrap()
        );

        // A frame whose `pu` is not the last `u` means frames were lost
        let skipped = parse_diff(&symbol, &futures_frame(1050, 1060, 1040, "4"))
            .unwrap()
            .unwrap();
        assert_eq!(
            engine.on_diff(skipped),
            DiffOutcome::Gap(Gap {
                expected: 1035,
                actual: 1041
            })
        );
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            Binance::stream_url(&bnb(), 100),
            "wss://stream.binance.com:9443/ws/bnbbtc@depth@100ms"
        );
        assert_eq!(
            Binance::stream_url(&bnb(), 1000),
            "wss://stream.binance.com:9443/ws/bnbbtc@depth"
        );
        let futures = Symbol::parse("futures:btcusdt").unwrap();
        assert_eq!(
            Binance::stream_url(&futures, 100),
            "wss://fstream.binance.com/ws/btcusdt@depth@100ms"
        );
        assert_eq!(
            Binance::depth_url(&futures, 500),
            "https://fapi.binance.com/fapi/v1/depth?symbol=BTCUSDT&limit=500"
        );
    }
}
