// =============================================================================
// Historical bar providers
// =============================================================================
//
// The stream layer backfills through this trait so tests can substitute a
// scripted provider and never touch the network.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::types::{Bar, Timeframe};

/// Source of closed historical bars, newest last.
#[async_trait]
pub trait BackfillProvider: Send + Sync {
    async fn fetch_bars(&self, symbol: &str, timeframe: Timeframe, limit: usize)
        -> Result<Vec<Bar>>;
}

// ---------------------------------------------------------------------------
// Binance REST
// ---------------------------------------------------------------------------

/// Fetches klines from the public Binance REST endpoint (no signature).
pub struct BinanceBackfill {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceBackfill {
    pub fn new() -> Self {
        Self::with_base_url("https://api.binance.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn parse_str_f64(value: &serde_json::Value) -> Result<f64> {
        value
            .as_str()
            .context("expected string-encoded number")?
            .parse::<f64>()
            .context("failed to parse number")
    }
}

impl Default for BinanceBackfill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackfillProvider for BinanceBackfill {
    /// GET /api/v3/klines.
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ... (remaining fields unused)
    #[instrument(skip(self), name = "binance::klines")]
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;

            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            bars.push(Bar {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
                close_time: arr[6].as_i64().unwrap_or(0),
            });
        }

        debug!(symbol, interval = %timeframe, count = bars.len(), "klines fetched");
        Ok(bars)
    }
}
