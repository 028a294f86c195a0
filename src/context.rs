// =============================================================================
// Strategy context — the evaluator's complete view of all four timeframes
// =============================================================================

use serde::Serialize;
use serde_json::json;

use crate::coordinator::SnapshotBundle;
use crate::stream::StreamSnapshot;
use crate::types::{now_ms, Timeframe};

/// All four snapshots, present and named by role.  Built fresh per trigger
/// event; the evaluator never reaches back into live state.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyContext {
    pub symbol: String,
    /// 5m — execution timeframe.
    pub trigger: StreamSnapshot,
    /// 15m — mid-frame confirmation.
    pub mid: StreamSnapshot,
    /// 1h — intermediate structure.
    pub intermediate: StreamSnapshot,
    /// 4h — anchor bias.
    pub anchor: StreamSnapshot,
    pub built_at: i64,
}

impl StrategyContext {
    /// Assemble from a coordinator bundle; `None` while any stream has not
    /// produced a snapshot yet.
    pub fn from_bundle(bundle: &SnapshotBundle) -> Option<Self> {
        let trigger = bundle.get(Timeframe::M5)?.clone();
        let mid = bundle.get(Timeframe::M15)?.clone();
        let intermediate = bundle.get(Timeframe::H1)?.clone();
        let anchor = bundle.get(Timeframe::H4)?.clone();

        Some(Self {
            symbol: trigger.symbol.clone(),
            trigger,
            mid,
            intermediate,
            anchor,
            built_at: now_ms(),
        })
    }

    /// Execution price: the trigger timeframe's last close.
    pub fn price(&self) -> f64 {
        self.trigger.last_bar.close
    }

    /// Compact per-timeframe summary attached to emitted signals.
    pub fn summary(&self) -> serde_json::Value {
        let view = |s: &StreamSnapshot| {
            json!({
                "timeframe": s.timeframe.as_str(),
                "close": s.last_bar.close,
                "trend": s.trend.as_str(),
                "structure": s.structure.as_str(),
                "time_health": s.time_health.as_str(),
                "last_closed_at": s.last_closed_at,
            })
        };
        json!({
            "symbol": self.symbol,
            "trigger": view(&self.trigger),
            "mid": view(&self.mid),
            "intermediate": view(&self.intermediate),
            "anchor": view(&self.anchor),
            "built_at": self.built_at,
        })
    }
}
