//! Upstream snapshot and diff sources
//!
//! The live recorder only sees these two traits, so tests drive it with
//! in-process mocks and production wires in [`crate::binance::Binance`].
//! Adapters validate every event before handing it on; malformed input is
//! logged and skipped, never forwarded.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use types::depth::{DepthSnapshot, DiffEvent};
use types::errors::MalformedEvent;
use types::ids::Symbol;

/// First reconnect delay for streaming sources.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Attempts per snapshot fetch before giving up.
pub const SNAPSHOT_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed event: {0}")]
    Malformed(#[from] MalformedEvent),

    #[error("{symbol}: gave up after {attempts} attempts")]
    RetriesExhausted { symbol: Symbol, attempts: u32 },

    #[error("downstream channel closed")]
    ChannelClosed,
}

/// Point-in-time depth provider.
pub trait SnapshotSource: Send + Sync + 'static {
    /// Fetch one snapshot of at most `limit` levels per side.
    ///
    /// Implementations retry transient failures themselves.
    fn fetch_snapshot(
        &self,
        symbol: &Symbol,
        limit: u32,
    ) -> impl Future<Output = Result<DepthSnapshot, SourceError>> + Send;
}

/// Incremental depth provider.
pub trait DiffSource: Send + Sync + 'static {
    /// Push validated diffs into `sender` in arrival order until `cancel`
    /// fires or the receiver goes away.
    ///
    /// Implementations must reconnect internally. Whatever is lost across a
    /// reconnect shows up downstream as a gap.
    fn stream_diffs(
        &self,
        symbol: Symbol,
        sender: mpsc::Sender<DiffEvent>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;
}

/// Sleep for `backoff`, then double it up to [`MAX_BACKOFF`].
///
/// Returns `false` if cancelled while waiting.
pub async fn backoff_sleep(backoff: &mut Duration, cancel: &CancellationToken) -> bool {
    debug!(delay_ms = backoff.as_millis() as u64, "Backing off");
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = tokio::time::sleep(*backoff) => {}
    }
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
    true
}
