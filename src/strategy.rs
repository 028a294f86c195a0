// =============================================================================
// Gate Evaluator — ordered decision pipeline for one trigger event
// =============================================================================
//
// Nine stages, first failure wins:
//
//   1. permission       coordinator verdict
//   2. trigger          event must come from the execution timeframe
//   3. bias             anchor trend picks the side; range means stand down
//   4. structure        intermediate structure must not explicitly oppose
//   5. midframe         mid trend must not explicitly oppose
//   6. gate_switch      higher-timeframe reversal / fresh structure flip
//   7. gate_exhaustion  spent legs, entry into the last pivot
//   8. gate_volatility  disorderly trigger bar
//   9. entry            a concrete setup on the trigger timeframe
//
// Stages 4 and 5 are deliberately asymmetric: only an explicit opposite
// rejects, range confirms nothing and blocks nothing.  The evaluator is
// deterministic — same context and decision, same outcome.
// =============================================================================

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::context::StrategyContext;
use crate::coordinator::Decision;
use crate::gates::{high_volatility_gate, trend_exhaustion_gate, trend_switch_gate, GateVeto};
use crate::indicators::entry::EntryKind;
use crate::types::{RejectReason, TradeSide, TradeSignal, Timeframe, Trend};

/// Outcome of one evaluation: a signal, or the reason there is none.
#[derive(Debug, Clone)]
pub enum Evaluation {
    Signal(TradeSignal),
    Reject(RejectReason),
}

pub struct GateEvaluator {
    config: EngineConfig,
    /// Most recent reject, kept for diagnostics.
    last_reject: RwLock<Option<RejectReason>>,
}

impl GateEvaluator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            last_reject: RwLock::new(None),
        }
    }

    pub fn last_reject(&self) -> Option<RejectReason> {
        self.last_reject.read().clone()
    }

    /// Run the full pipeline for one trigger event.
    pub fn evaluate(&self, ctx: &StrategyContext, decision: &Decision, now: i64) -> Evaluation {
        match self.run_pipeline(ctx, decision, now) {
            Ok(signal) => {
                info!(
                    symbol = %signal.symbol,
                    side = %signal.side,
                    price = signal.price,
                    confidence = signal.confidence,
                    reason = %signal.reason,
                    "trade signal"
                );
                Evaluation::Signal(signal)
            }
            Err(reject) => {
                debug!(
                    stage = reject.stage,
                    code = %reject.code,
                    detail = %reject.detail,
                    "evaluation rejected"
                );
                *self.last_reject.write() = Some(reject.clone());
                Evaluation::Reject(reject)
            }
        }
    }

    fn run_pipeline(
        &self,
        ctx: &StrategyContext,
        decision: &Decision,
        now: i64,
    ) -> Result<TradeSignal, RejectReason> {
        // 1. Permission.
        if !decision.permission.allowed {
            return Err(RejectReason::new(
                "permission",
                decision.permission.reason.to_uppercase(),
                decision
                    .permission
                    .detail
                    .clone()
                    .unwrap_or_else(|| "coordinator denied".to_string()),
                now,
            ));
        }

        // 2. Trigger timeframe.
        if ctx.trigger.timeframe != Timeframe::M5 {
            return Err(RejectReason::new(
                "trigger",
                "WRONG_TIMEFRAME",
                format!("trigger snapshot is {}, expected 5m", ctx.trigger.timeframe),
                now,
            ));
        }

        // 3. Anchor bias.
        let side = match ctx.anchor.trend {
            Trend::Bull => TradeSide::Long,
            Trend::Bear => TradeSide::Short,
            Trend::Range => {
                return Err(RejectReason::new(
                    "bias",
                    "NO_BIAS",
                    "4h trend is range, no directional bias",
                    now,
                ));
            }
        };

        // 4. Intermediate structure (explicit opposite only).
        if ctx.intermediate.structure == side.opposing_structure() {
            return Err(RejectReason::new(
                "structure",
                "H1_STRUCTURE_OPPOSED",
                format!(
                    "1h structure {} opposes {} bias",
                    ctx.intermediate.structure, side
                ),
                now,
            ));
        }

        // 5. Mid-frame trend (same asymmetry).
        if ctx.mid.trend == side.opposing_trend() {
            return Err(RejectReason::new(
                "midframe",
                "M15_TREND_OPPOSED",
                format!("15m trend {} opposes {} bias", ctx.mid.trend, side),
                now,
            ));
        }

        // 6-8. Veto gates.
        if let Some(veto) = trend_switch_gate(ctx, side, &self.config.timeframes, now) {
            return Err(reject_from_veto("gate_switch", veto, now));
        }
        if let Some(veto) = trend_exhaustion_gate(ctx, side, &self.config.gates) {
            return Err(reject_from_veto("gate_exhaustion", veto, now));
        }
        if let Some(veto) = high_volatility_gate(&ctx.trigger, &self.config.gates) {
            return Err(reject_from_veto("gate_volatility", veto, now));
        }

        // 9. Entry detection.
        let entry = ctx.trigger.entry.ok_or_else(|| {
            RejectReason::new("entry", "NO_ENTRY", "no entry setup on 5m", now)
        })?;
        if entry.side != side {
            return Err(RejectReason::new(
                "entry",
                "ENTRY_SIDE_MISMATCH",
                format!("5m {} entry against {} bias", entry.side, side),
                now,
            ));
        }

        let confidence = match entry.kind {
            EntryKind::Pullback => self.config.gates.pullback_confidence,
            EntryKind::Breakout => self.config.gates.breakout_confidence,
        };

        Ok(TradeSignal {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: ctx.symbol.clone(),
            side,
            price: ctx.price(),
            confidence,
            reason: format!("{} {} with 4h {} bias", entry.kind.as_str(), side, ctx.anchor.trend),
            context: ctx.summary(),
            created_at: now,
        })
    }
}

fn reject_from_veto(stage: &'static str, veto: GateVeto, now: i64) -> RejectReason {
    let mut reject = RejectReason::new(stage, veto.code, veto.detail, now);
    if let Some(meta) = veto.meta {
        reject = reject.with_meta(meta);
    }
    reject
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::SnapshotBundle;
    use crate::indicators::entry::EntrySignal;
    use crate::indicators::swing::SwingLevels;
    use crate::stream::StreamSnapshot;
    use crate::types::{Bar, Permission, Structure, TimeHealth};

    const NOW: i64 = 1_700_000_000_000;

    fn snapshot(tf: Timeframe) -> StreamSnapshot {
        StreamSnapshot {
            symbol: "ETHUSDT".to_string(),
            timeframe: tf,
            last_bar: Bar {
                open_time: NOW - tf.step_ms(),
                close_time: NOW - 1,
                open: 100.2,
                high: 101.0,
                low: 99.8,
                close: 100.5,
                volume: 50.0,
            },
            prev_bar: None,
            ema: Some(100.0),
            ema_fast: None,
            trend: Trend::Bull,
            structure: Structure::Up,
            structure_changed_at: None,
            swings: SwingLevels::default(),
            legs: None,
            entry: None,
            atr_pct: Some(0.4),
            volume_sma: Some(50.0),
            last_closed_at: NOW - 1,
            time_health: TimeHealth::Healthy,
            bar_count: 100,
            captured_at: NOW,
        }
    }

    /// Bull-aligned context whose trigger carries a long pullback entry.
    fn bull_ctx() -> StrategyContext {
        let mut m5 = snapshot(Timeframe::M5);
        m5.ema_fast = Some(100.8);
        m5.entry = Some(EntrySignal {
            side: TradeSide::Long,
            kind: EntryKind::Pullback,
        });
        StrategyContext::from_bundle(&SnapshotBundle {
            m5: Some(m5),
            m15: Some(snapshot(Timeframe::M15)),
            h1: Some(snapshot(Timeframe::H1)),
            h4: Some(snapshot(Timeframe::H4)),
        })
        .unwrap()
    }

    fn allowed() -> Decision {
        Decision {
            permission: Permission::allow(),
            trigger_close_time: NOW - 1,
            evaluated_at: NOW,
        }
    }

    fn evaluator() -> GateEvaluator {
        GateEvaluator::new(EngineConfig::default())
    }

    fn expect_reject(e: Evaluation) -> RejectReason {
        match e {
            Evaluation::Reject(r) => r,
            Evaluation::Signal(s) => panic!("expected reject, got signal {s:?}"),
        }
    }

    #[test]
    fn full_pass_emits_long_pullback_signal() {
        let eval = evaluator();
        match eval.evaluate(&bull_ctx(), &allowed(), NOW) {
            Evaluation::Signal(s) => {
                assert_eq!(s.side, TradeSide::Long);
                assert_eq!(s.symbol, "ETHUSDT");
                assert_eq!(s.price, 100.5);
                assert!((s.confidence - 0.72).abs() < 1e-9);
                assert!(s.reason.contains("pullback"));
                assert!(s.context["anchor"]["trend"] == "bull");
                assert!(!s.id.is_empty());
            }
            Evaluation::Reject(r) => panic!("unexpected reject: {r:?}"),
        }
        assert!(eval.last_reject().is_none());
    }

    #[test]
    fn breakout_carries_lower_confidence() {
        let eval = evaluator();
        let mut ctx = bull_ctx();
        ctx.trigger.entry = Some(EntrySignal {
            side: TradeSide::Long,
            kind: EntryKind::Breakout,
        });
        match eval.evaluate(&ctx, &allowed(), NOW) {
            Evaluation::Signal(s) => assert!((s.confidence - 0.68).abs() < 1e-9),
            Evaluation::Reject(r) => panic!("unexpected reject: {r:?}"),
        }
    }

    #[test]
    fn denied_permission_rejects_first() {
        let eval = evaluator();
        let decision = Decision {
            permission: Permission::deny("stale_data", "1h stale"),
            trigger_close_time: NOW - 1,
            evaluated_at: NOW,
        };
        // Even a context that would otherwise signal.
        let r = expect_reject(eval.evaluate(&bull_ctx(), &decision, NOW));
        assert_eq!(r.stage, "permission");
        assert_eq!(r.code, "STALE_DATA");
        assert_eq!(eval.last_reject().unwrap().code, "STALE_DATA");
    }

    #[test]
    fn range_anchor_rejects_no_bias() {
        let eval = evaluator();
        let mut ctx = bull_ctx();
        ctx.anchor.trend = Trend::Range;
        let r = expect_reject(eval.evaluate(&ctx, &allowed(), NOW));
        assert_eq!(r.stage, "bias");
        assert_eq!(r.code, "NO_BIAS");
    }

    #[test]
    fn anchor_bull_intermediate_down_rejects_early() {
        let eval = evaluator();
        let mut ctx = bull_ctx();
        ctx.intermediate.structure = Structure::Down;
        // Make later stages fail too; structure must win.
        ctx.trigger.atr_pct = Some(5.0);
        let r = expect_reject(eval.evaluate(&ctx, &allowed(), NOW));
        assert_eq!(r.stage, "structure");
        assert_eq!(r.code, "H1_STRUCTURE_OPPOSED");
    }

    #[test]
    fn range_structure_confirms_nothing_blocks_nothing() {
        let eval = evaluator();
        let mut ctx = bull_ctx();
        ctx.intermediate.structure = Structure::Range;
        ctx.mid.trend = Trend::Range;
        assert!(matches!(
            eval.evaluate(&ctx, &allowed(), NOW),
            Evaluation::Signal(_)
        ));
    }

    #[test]
    fn opposing_midframe_rejects() {
        let eval = evaluator();
        let mut ctx = bull_ctx();
        ctx.mid.trend = Trend::Bear;
        let r = expect_reject(eval.evaluate(&ctx, &allowed(), NOW));
        assert_eq!(r.stage, "midframe");
        assert_eq!(r.code, "M15_TREND_OPPOSED");
    }

    #[test]
    fn volatility_gate_runs_after_switch_and_exhaustion() {
        let eval = evaluator();
        let mut ctx = bull_ctx();
        ctx.trigger.atr_pct = Some(5.0);
        let r = expect_reject(eval.evaluate(&ctx, &allowed(), NOW));
        assert_eq!(r.stage, "gate_volatility");
        assert_eq!(r.code, "VOL_ATR_TOO_HIGH");
        assert!(r.meta.is_some());
    }

    #[test]
    fn missing_entry_rejects_last() {
        let eval = evaluator();
        let mut ctx = bull_ctx();
        ctx.trigger.entry = None;
        let r = expect_reject(eval.evaluate(&ctx, &allowed(), NOW));
        assert_eq!(r.stage, "entry");
        assert_eq!(r.code, "NO_ENTRY");
    }

    #[test]
    fn entry_against_bias_rejects() {
        let eval = evaluator();
        let mut ctx = bull_ctx();
        ctx.trigger.entry = Some(EntrySignal {
            side: TradeSide::Short,
            kind: EntryKind::Pullback,
        });
        let r = expect_reject(eval.evaluate(&ctx, &allowed(), NOW));
        assert_eq!(r.stage, "entry");
        assert_eq!(r.code, "ENTRY_SIDE_MISMATCH");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let eval = evaluator();
        let ctx = bull_ctx();
        let mut ctx_reject = ctx.clone();
        ctx_reject.anchor.trend = Trend::Range;

        for _ in 0..3 {
            assert!(matches!(
                eval.evaluate(&ctx, &allowed(), NOW),
                Evaluation::Signal(_)
            ));
            let r = expect_reject(eval.evaluate(&ctx_reject, &allowed(), NOW));
            assert_eq!(r.stage, "bias");
            assert_eq!(r.code, "NO_BIAS");
        }
    }
}
