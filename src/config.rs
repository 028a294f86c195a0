// =============================================================================
// Engine Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable parameter of the engine lives here: per-timeframe stream and
// analysis settings, connection/resync timing, and the gate thresholds.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "ETHUSDT".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stale_bars() -> u32 {
    2
}

fn default_debounce() -> u32 {
    2
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_heartbeat_poll_ms() -> u64 {
    30_000
}

fn default_resync_cooldown_ms() -> u64 {
    60_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_atr_pct_max() -> f64 {
    0.9
}

fn default_body_ratio_min() -> f64 {
    0.22
}

fn default_wick_ratio_max() -> f64 {
    0.78
}

fn default_volume_spike_mult() -> f64 {
    3.2
}

fn default_leg_ratio_min() -> f64 {
    1.05
}

fn default_anchor_leg_ratio_min() -> f64 {
    1.03
}

fn default_pivot_buffer_pct() -> f64 {
    0.15
}

fn default_pullback_confidence() -> f64 {
    0.72
}

fn default_breakout_confidence() -> f64 {
    0.68
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_top_n() -> usize {
    10
}

fn default_samples_per_key() -> usize {
    2
}

// =============================================================================
// TimeframeParams
// =============================================================================

/// Stream and analysis settings for one timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeParams {
    /// Number of bars fetched per backfill/resync.
    pub backfill_limit: usize,

    /// Cache cap; trimmed from the oldest end.
    pub cache_limit: usize,

    /// Freshness allowance, in multiples of the timeframe step.
    #[serde(default = "default_stale_bars")]
    pub stale_bars: u32,

    /// Whether a `warning` time-health still permits trading at this level.
    #[serde(default)]
    pub allow_warning: bool,

    /// EMA period used for trend classification.
    pub ema_period: usize,

    /// Optional fast EMA for entry-signal detection (trigger timeframe only).
    #[serde(default)]
    pub ema_fast_period: Option<usize>,

    /// Dead-band buffer around the trend EMA, percent of the EMA value.
    /// Wider on slower timeframes to avoid whipsaw at the EMA line.
    pub trend_buffer_pct: f64,

    /// Symmetric swing-detection lookback (bars on each side).
    pub swing_lookback: usize,

    /// Consecutive identical classifications required before a structure
    /// change commits.
    #[serde(default = "default_debounce")]
    pub structure_debounce: u32,

    /// Minimum time since the last committed structure change before the
    /// switch gate lets a trade through.
    pub structure_cooldown_ms: i64,
}

impl TimeframeParams {
    /// Built-in defaults for one timeframe.
    pub fn default_for(tf: Timeframe) -> Self {
        match tf {
            Timeframe::M5 => Self::m5(),
            Timeframe::M15 => Self::m15(),
            Timeframe::H1 => Self::h1(),
            Timeframe::H4 => Self::h4(),
        }
    }

    fn m5() -> Self {
        Self {
            backfill_limit: 200,
            cache_limit: 500,
            stale_bars: default_stale_bars(),
            allow_warning: false,
            ema_period: 21,
            ema_fast_period: Some(9),
            trend_buffer_pct: 0.05,
            swing_lookback: 3,
            structure_debounce: default_debounce(),
            structure_cooldown_ms: 0,
        }
    }

    fn m15() -> Self {
        Self {
            backfill_limit: 100,
            cache_limit: 300,
            stale_bars: default_stale_bars(),
            allow_warning: true,
            ema_period: 21,
            ema_fast_period: None,
            trend_buffer_pct: 0.10,
            swing_lookback: 3,
            structure_debounce: default_debounce(),
            structure_cooldown_ms: 30 * 60_000,
        }
    }

    fn h1() -> Self {
        Self {
            backfill_limit: 100,
            cache_limit: 300,
            stale_bars: default_stale_bars(),
            allow_warning: true,
            ema_period: 34,
            ema_fast_period: None,
            trend_buffer_pct: 0.15,
            swing_lookback: 5,
            structure_debounce: default_debounce(),
            structure_cooldown_ms: 2 * 60 * 60_000,
        }
    }

    fn h4() -> Self {
        Self {
            backfill_limit: 100,
            cache_limit: 200,
            stale_bars: default_stale_bars(),
            allow_warning: true,
            ema_period: 34,
            ema_fast_period: None,
            trend_buffer_pct: 0.25,
            swing_lookback: 5,
            structure_debounce: default_debounce(),
            structure_cooldown_ms: 4 * 60 * 60_000,
        }
    }
}

/// Per-timeframe settings for all four streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeSet {
    #[serde(default = "TimeframeParams::m5")]
    pub m5: TimeframeParams,
    #[serde(default = "TimeframeParams::m15")]
    pub m15: TimeframeParams,
    #[serde(default = "TimeframeParams::h1")]
    pub h1: TimeframeParams,
    #[serde(default = "TimeframeParams::h4")]
    pub h4: TimeframeParams,
}

impl Default for TimeframeSet {
    fn default() -> Self {
        Self {
            m5: TimeframeParams::m5(),
            m15: TimeframeParams::m15(),
            h1: TimeframeParams::h1(),
            h4: TimeframeParams::h4(),
        }
    }
}

impl TimeframeSet {
    pub fn get(&self, tf: Timeframe) -> &TimeframeParams {
        match tf {
            Timeframe::M5 => &self.m5,
            Timeframe::M15 => &self.m15,
            Timeframe::H1 => &self.h1,
            Timeframe::H4 => &self.h4,
        }
    }
}

// =============================================================================
// GateParams
// =============================================================================

/// Thresholds for the veto gates.  Tuning parameters, not structural
/// guarantees — the gate logic degrades to pass when inputs are missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateParams {
    /// Maximum trigger-timeframe ATR as a percent of price.
    #[serde(default = "default_atr_pct_max")]
    pub atr_pct_max: f64,

    /// A bar is wick-dominant when body/range falls below this...
    #[serde(default = "default_body_ratio_min")]
    pub body_ratio_min: f64,

    /// ...and total wick/range exceeds this.
    #[serde(default = "default_wick_ratio_max")]
    pub wick_ratio_max: f64,

    /// Volume spike threshold, as a multiple of the rolling volume SMA.
    #[serde(default = "default_volume_spike_mult")]
    pub volume_spike_mult: f64,

    /// Minimum intermediate-timeframe impulse/pullback leg ratio.
    #[serde(default = "default_leg_ratio_min")]
    pub leg_ratio_min: f64,

    /// Minimum anchor-timeframe impulse/pullback leg ratio.
    #[serde(default = "default_anchor_leg_ratio_min")]
    pub anchor_leg_ratio_min: f64,

    /// Minimum distance from the last structural pivot, percent of price.
    #[serde(default = "default_pivot_buffer_pct")]
    pub pivot_buffer_pct: f64,

    /// Confidence assigned to a pullback entry (higher than breakout).
    #[serde(default = "default_pullback_confidence")]
    pub pullback_confidence: f64,

    /// Confidence assigned to a breakout entry.
    #[serde(default = "default_breakout_confidence")]
    pub breakout_confidence: f64,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            atr_pct_max: default_atr_pct_max(),
            body_ratio_min: default_body_ratio_min(),
            wick_ratio_max: default_wick_ratio_max(),
            volume_spike_mult: default_volume_spike_mult(),
            leg_ratio_min: default_leg_ratio_min(),
            anchor_leg_ratio_min: default_anchor_leg_ratio_min(),
            pivot_buffer_pct: default_pivot_buffer_pct(),
            pullback_confidence: default_pullback_confidence(),
            breakout_confidence: default_breakout_confidence(),
        }
    }
}

// =============================================================================
// RejectStatsParams
// =============================================================================

/// Settings for the reject-statistics consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectStatsParams {
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_samples_per_key")]
    pub samples_per_key: usize,
}

impl Default for RejectStatsParams {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            top_n: default_top_n(),
            samples_per_key: default_samples_per_key(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The single instrument this process watches.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Per-timeframe stream and analysis settings.
    #[serde(default)]
    pub timeframes: TimeframeSet,

    // --- Connection / resync timing -----------------------------------------

    /// Force-close the socket after this long without any message.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// How often the heartbeat/staleness check runs.
    #[serde(default = "default_heartbeat_poll_ms")]
    pub heartbeat_poll_ms: u64,

    /// Minimum spacing between full resyncs of one stream.
    #[serde(default = "default_resync_cooldown_ms")]
    pub resync_cooldown_ms: u64,

    /// Reconnect backoff: initial delay.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Reconnect backoff: cap.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    // --- Coordinator ---------------------------------------------------------

    /// Skip the decision-changed emission when the decision tuple is
    /// unchanged since the previous trigger.
    #[serde(default = "default_true")]
    pub suppress_unchanged_decisions: bool,

    // --- Gates / diagnostics -------------------------------------------------

    #[serde(default)]
    pub gates: GateParams,

    #[serde(default)]
    pub reject_stats: RejectStatsParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframes: TimeframeSet::default(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_poll_ms: default_heartbeat_poll_ms(),
            resync_cooldown_ms: default_resync_cooldown_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            suppress_unchanged_decisions: true,
            gates: GateParams::default(),
            reject_stats: RejectStatsParams::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
