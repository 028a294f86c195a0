// =============================================================================
// Shared types used across the Meridian multi-timeframe engine
// =============================================================================

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar for one fixed time bucket `[open_time, close_time)`.
/// Times are UNIX epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Bars must span a non-empty interval.
    pub fn is_well_formed(&self) -> bool {
        self.open_time < self.close_time
    }
}

/// The fixed bar durations the engine subscribes to, fastest to slowest.
///
/// `M5` is the trigger (execution) timeframe; `H4` is the anchor timeframe
/// used only for directional bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M5,
    M15,
    H1,
    H4,
}

impl Timeframe {
    /// All supported timeframes, fastest first.
    pub const ALL: [Timeframe; 4] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
    ];

    /// Expected distance between consecutive bar closes, in milliseconds.
    pub fn step_ms(self) -> i64 {
        match self {
            Self::M5 => 5 * 60_000,
            Self::M15 => 15 * 60_000,
            Self::H1 => 60 * 60_000,
            Self::H4 => 4 * 60 * 60_000,
        }
    }

    /// Exchange-facing interval token (stream names, REST params).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
        }
    }

    /// Parse an interval token. An unsupported interval is a configuration
    /// error, raised immediately rather than mapped to a health state.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        match input.trim() {
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            other => bail!("unsupported interval: {other}"),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-stream data freshness / continuity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeHealth {
    Healthy,
    Warning,
    Broken,
}

impl TimeHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Broken => "broken",
        }
    }
}

impl std::fmt::Display for TimeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directional trend relative to the timeframe's EMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bull,
    Bear,
    Range,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bull => "bull",
            Self::Bear => "bear",
            Self::Range => "range",
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Market structure from the last two swing highs/lows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Structure {
    Up,
    Down,
    Range,
}

impl Structure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Range => "range",
        }
    }
}

impl std::fmt::Display for Structure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    pub fn wanted_trend(self) -> Trend {
        match self {
            Self::Long => Trend::Bull,
            Self::Short => Trend::Bear,
        }
    }

    pub fn opposing_trend(self) -> Trend {
        match self {
            Self::Long => Trend::Bear,
            Self::Short => Trend::Bull,
        }
    }

    pub fn wanted_structure(self) -> Structure {
        match self {
            Self::Long => Structure::Up,
            Self::Short => Structure::Down,
        }
    }

    pub fn opposing_structure(self) -> Structure {
        match self {
            Self::Long => Structure::Down,
            Self::Short => Structure::Up,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Coordinator permission
// ---------------------------------------------------------------------------

/// The coordinator's allow/deny decision, recomputed per trigger event.
/// Ephemeral: never persisted, replaced on every recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Permission {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "ok".to_string(),
            detail: None,
        }
    }

    pub fn deny(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation outcomes
// ---------------------------------------------------------------------------

/// Structured rejection from the gate evaluator. "No trade" is a frequent,
/// expected outcome — modelled as data, never as an error.
#[derive(Debug, Clone, Serialize)]
pub struct RejectReason {
    /// Pipeline stage that short-circuited (e.g. "bias", "gate_volatility").
    pub stage: &'static str,
    /// Machine-readable code within the stage (e.g. "VOL_ATR_TOO_HIGH").
    pub code: String,
    /// Human-readable explanation.
    pub detail: String,
    /// Optional numeric context for reject-statistics consumers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    /// UNIX epoch milliseconds.
    pub at: i64,
}

impl RejectReason {
    pub fn new(
        stage: &'static str,
        code: impl Into<String>,
        detail: impl Into<String>,
        at: i64,
    ) -> Self {
        Self {
            stage,
            code: code.into(),
            detail: detail.into(),
            meta: None,
            at,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Bucket key used by reject-statistics consumers.
    pub fn key(&self) -> String {
        format!("{}:{}", self.stage, self.code)
    }
}

/// A validated trade signal from the gate evaluator.
#[derive(Debug, Clone, Serialize)]
pub struct TradeSignal {
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub price: f64,
    pub confidence: f64,
    pub reason: String,
    /// Serialised multi-timeframe context captured at evaluation time.
    pub context: serde_json::Value,
    /// UNIX epoch milliseconds.
    pub created_at: i64,
}

/// Current wall-clock time in UNIX epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
