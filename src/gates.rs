// =============================================================================
// Veto gates — trend switch, trend exhaustion, high volatility
// =============================================================================
//
// Each gate inspects the assembled context for one family of "do not trade
// into this" conditions and returns the first veto it finds, or `None` to
// pass.  Missing optional inputs always degrade to pass: a gate that cannot
// measure must not block (the permission cascade already guarantees the data
// is fresh enough to trust).
// =============================================================================

use serde_json::json;

use crate::config::{GateParams, TimeframeSet};
use crate::context::StrategyContext;
use crate::stream::StreamSnapshot;
use crate::types::{TradeSide, Timeframe};

/// One gate's veto: code + detail in `RejectReason` shape, stage added by
/// the evaluator.
#[derive(Debug, Clone)]
pub struct GateVeto {
    pub code: &'static str,
    pub detail: String,
    pub meta: Option<serde_json::Value>,
}

impl GateVeto {
    fn new(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            meta: None,
        }
    }

    fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

// ---------------------------------------------------------------------------
// Trend / structure switch gate
// ---------------------------------------------------------------------------

/// Veto when the higher timeframes actively point the other way, or when a
/// structure flip is too fresh to trust (per-timeframe cooldown).
pub fn trend_switch_gate(
    ctx: &StrategyContext,
    side: TradeSide,
    timeframes: &TimeframeSet,
    now: i64,
) -> Option<GateVeto> {
    if ctx.intermediate.trend == side.opposing_trend() {
        return Some(GateVeto::new(
            "SWITCH_H1_TREND_OPPOSED",
            format!("1h trend {} opposes {} entry", ctx.intermediate.trend, side),
        ));
    }

    if ctx.mid.structure == side.opposing_structure() {
        return Some(GateVeto::new(
            "SWITCH_M15_STRUCTURE_OPPOSED",
            format!("15m structure {} opposes {} entry", ctx.mid.structure, side),
        ));
    }

    // Recent flips: the new structure exists but has not been alive long
    // enough to lean on.
    for snap in [&ctx.mid, &ctx.intermediate] {
        if let Some(changed_at) = snap.structure_changed_at {
            let cooldown = timeframes.get(snap.timeframe).structure_cooldown_ms;
            let since = now - changed_at;
            if cooldown > 0 && since < cooldown {
                return Some(
                    GateVeto::new(
                        match snap.timeframe {
                            Timeframe::M15 => "SWITCH_M15_RECENT_FLIP",
                            _ => "SWITCH_H1_RECENT_FLIP",
                        },
                        format!(
                            "{} structure changed {}s ago (cooldown {}s)",
                            snap.timeframe,
                            since / 1_000,
                            cooldown / 1_000
                        ),
                    )
                    .with_meta(json!({ "since_ms": since, "cooldown_ms": cooldown })),
                );
            }
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Trend exhaustion gate
// ---------------------------------------------------------------------------

/// Veto when the move looks spent: impulse legs no longer dominate pullback
/// legs, or price is already at/through the last intermediate pivot.
pub fn trend_exhaustion_gate(
    ctx: &StrategyContext,
    side: TradeSide,
    params: &GateParams,
) -> Option<GateVeto> {
    if let Some(ratio) = ctx.intermediate.legs.as_ref().and_then(|l| l.ratio()) {
        if ratio < params.leg_ratio_min {
            return Some(
                GateVeto::new(
                    "EXHAUST_H1_LEG_RATIO",
                    format!(
                        "1h impulse/pullback ratio {ratio:.3} < {:.3}",
                        params.leg_ratio_min
                    ),
                )
                .with_meta(json!({ "ratio": ratio, "min": params.leg_ratio_min })),
            );
        }
    }

    if let Some(ratio) = ctx.anchor.legs.as_ref().and_then(|l| l.ratio()) {
        if ratio < params.anchor_leg_ratio_min {
            return Some(
                GateVeto::new(
                    "EXHAUST_H4_LEG_RATIO",
                    format!(
                        "4h impulse/pullback ratio {ratio:.3} < {:.3}",
                        params.anchor_leg_ratio_min
                    ),
                )
                .with_meta(json!({ "ratio": ratio, "min": params.anchor_leg_ratio_min })),
            );
        }
    }

    pivot_proximity(ctx, side, params)
}

/// Entering long into the last 1h swing high (or short into the swing low)
/// buys the top of the leg.  Veto inside the buffer and beyond the pivot.
fn pivot_proximity(
    ctx: &StrategyContext,
    side: TradeSide,
    params: &GateParams,
) -> Option<GateVeto> {
    let price = ctx.price();
    if price <= 0.0 {
        return None;
    }

    let pivot = match side {
        TradeSide::Long => ctx.intermediate.swings.high,
        TradeSide::Short => ctx.intermediate.swings.low,
    }?;

    let distance_pct = match side {
        TradeSide::Long => (pivot - price) / price * 100.0,
        TradeSide::Short => (price - pivot) / price * 100.0,
    };

    if distance_pct < params.pivot_buffer_pct {
        return Some(
            GateVeto::new(
                "EXHAUST_PIVOT",
                format!(
                    "price {price:.2} within {:.2}% of 1h pivot {pivot:.2}",
                    params.pivot_buffer_pct
                ),
            )
            .with_meta(json!({ "pivot": pivot, "distance_pct": distance_pct })),
        );
    }

    None
}

// ---------------------------------------------------------------------------
// High volatility gate
// ---------------------------------------------------------------------------

/// Veto disorderly trigger-timeframe conditions: ATR% above the cap, a
/// wick-dominant small-body bar, or a volume spike over the rolling SMA.
pub fn high_volatility_gate(trigger: &StreamSnapshot, params: &GateParams) -> Option<GateVeto> {
    if let Some(atr_pct) = trigger.atr_pct {
        if atr_pct > params.atr_pct_max {
            return Some(
                GateVeto::new(
                    "VOL_ATR_TOO_HIGH",
                    format!("atr {atr_pct:.3}% > cap {:.3}%", params.atr_pct_max),
                )
                .with_meta(json!({ "atr_pct": atr_pct, "max": params.atr_pct_max })),
            );
        }
    }

    let bar = &trigger.last_bar;
    let range = bar.high - bar.low;
    if range > 0.0 {
        let body_ratio = (bar.close - bar.open).abs() / range;
        let wick_ratio = 1.0 - body_ratio;
        if body_ratio < params.body_ratio_min && wick_ratio > params.wick_ratio_max {
            return Some(
                GateVeto::new(
                    "VOL_WICK_DOMINANT",
                    format!("body {body_ratio:.2} of range, wick {wick_ratio:.2}"),
                )
                .with_meta(json!({ "body_ratio": body_ratio, "wick_ratio": wick_ratio })),
            );
        }
    }

    if let Some(sma) = trigger.volume_sma {
        if sma > 0.0 && bar.volume > params.volume_spike_mult * sma {
            return Some(
                GateVeto::new(
                    "VOL_SPIKE",
                    format!(
                        "volume {:.1} > {:.1}x sma {:.1}",
                        bar.volume, params.volume_spike_mult, sma
                    ),
                )
                .with_meta(json!({ "volume": bar.volume, "sma": sma })),
            );
        }
    }

    None
}
