// =============================================================================
// Multi-Timeframe Coordinator — cascading permission and trigger dedup
// =============================================================================
//
// The coordinator turns four independent streams into one gated event source.
// Every closed trigger bar (5m) produces a permission decision computed from
// a snapshot bundle of all four timeframes; auxiliary closes are bookkeeping
// only and never drive evaluation.
//
// The permission cascade is evaluated slowest-first, so the broadest
// structural problem wins the reject reason:
//   readiness -> clock skew -> staleness -> time-health cascade
// =============================================================================

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::stream::StreamSnapshot;
use crate::types::{Permission, TimeHealth, Timeframe};

/// A close older than "now" is expected; a close this far in the *future*
/// means our clock or the exchange clock is wrong.
const CLOCK_SKEW_TOLERANCE_MS: i64 = 5_000;

/// Snapshots of all four timeframes, captured together at trigger time.
#[derive(Debug, Clone, Default)]
pub struct SnapshotBundle {
    pub m5: Option<StreamSnapshot>,
    pub m15: Option<StreamSnapshot>,
    pub h1: Option<StreamSnapshot>,
    pub h4: Option<StreamSnapshot>,
}

impl SnapshotBundle {
    pub fn get(&self, tf: Timeframe) -> Option<&StreamSnapshot> {
        match tf {
            Timeframe::M5 => self.m5.as_ref(),
            Timeframe::M15 => self.m15.as_ref(),
            Timeframe::H1 => self.h1.as_ref(),
            Timeframe::H4 => self.h4.as_ref(),
        }
    }
}

/// One permission decision, tied to the trigger bar that caused it.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub permission: Permission,
    /// close_time of the trigger bar this decision belongs to.
    pub trigger_close_time: i64,
    pub evaluated_at: i64,
}

/// Observable coordinator state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorState {
    pub last_trigger_close: Option<i64>,
    pub last_decision: Option<Decision>,
    pub triggers_evaluated: u64,
    pub triggers_deduped: u64,
    pub decisions_emitted: u64,
    pub decisions_suppressed: u64,
    pub auxiliary_closes: u64,
    /// Newest recorded close_time per non-trigger timeframe.
    pub aux_last_close: BTreeMap<Timeframe, i64>,
}

type TriggerListener = Box<dyn Fn(&SnapshotBundle, &Decision) + Send + Sync>;
type DecisionListener = Box<dyn Fn(&Decision) + Send + Sync>;

struct Inner {
    last_trigger_close: Option<i64>,
    last_decision: Option<Decision>,
    aux_last_close: BTreeMap<Timeframe, i64>,
}

pub struct MultiTimeframeCoordinator {
    config: EngineConfig,
    inner: RwLock<Inner>,

    triggers_evaluated: AtomicU64,
    triggers_deduped: AtomicU64,
    decisions_emitted: AtomicU64,
    decisions_suppressed: AtomicU64,
    auxiliary_closes: AtomicU64,

    trigger_listeners: RwLock<Vec<(u64, TriggerListener)>>,
    decision_listeners: RwLock<Vec<(u64, DecisionListener)>>,
    next_listener_id: AtomicU64,
}

impl MultiTimeframeCoordinator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                last_trigger_close: None,
                last_decision: None,
                aux_last_close: BTreeMap::new(),
            }),
            triggers_evaluated: AtomicU64::new(0),
            triggers_deduped: AtomicU64::new(0),
            decisions_emitted: AtomicU64::new(0),
            decisions_suppressed: AtomicU64::new(0),
            auxiliary_closes: AtomicU64::new(0),
            trigger_listeners: RwLock::new(Vec::new()),
            decision_listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    // -------------------------------------------------------------------------
    // Event intake
    // -------------------------------------------------------------------------

    /// Evaluate one closed trigger bar.  Returns the decision, or `None` when
    /// the same trigger close was already evaluated (duplicate delivery).
    pub fn on_trigger_closed(&self, bundle: &SnapshotBundle, now: i64) -> Option<Decision> {
        let trigger_close = bundle.get(Timeframe::M5).map(|s| s.last_closed_at);

        if let Some(close) = trigger_close {
            let inner = self.inner.read();
            if inner.last_trigger_close == Some(close) {
                drop(inner);
                self.triggers_deduped.fetch_add(1, Ordering::Relaxed);
                debug!(trigger_close = close, "duplicate trigger close, skipped");
                return None;
            }
        }

        self.triggers_evaluated.fetch_add(1, Ordering::Relaxed);
        let permission = self.evaluate_permission(bundle, now);
        let decision = Decision {
            permission,
            trigger_close_time: trigger_close.unwrap_or(0),
            evaluated_at: now,
        };

        let changed = {
            let mut inner = self.inner.write();
            inner.last_trigger_close = trigger_close;
            let changed = match &inner.last_decision {
                Some(prev) => {
                    prev.permission.allowed != decision.permission.allowed
                        || prev.permission.reason != decision.permission.reason
                }
                None => true,
            };
            inner.last_decision = Some(decision.clone());
            changed
        };

        if changed {
            info!(
                allowed = decision.permission.allowed,
                reason = %decision.permission.reason,
                detail = decision.permission.detail.as_deref().unwrap_or(""),
                "permission decision changed"
            );
        }

        if changed || !self.config.suppress_unchanged_decisions {
            self.decisions_emitted.fetch_add(1, Ordering::Relaxed);
            self.notify_decision(&decision);
        } else {
            self.decisions_suppressed.fetch_add(1, Ordering::Relaxed);
        }

        // Trigger events carry the bundle downstream only when trading is
        // permitted; denies are observable through the decision channel.
        if decision.permission.allowed {
            self.notify_trigger(bundle, &decision);
        }
        Some(decision)
    }

    /// Bookkeeping for non-trigger closes.  Records the newest close_time
    /// per timeframe; never evaluates permission.
    pub fn on_auxiliary_closed(&self, timeframe: Timeframe, bar: &crate::types::Bar) {
        debug_assert_ne!(timeframe, Timeframe::M5);
        self.auxiliary_closes.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.write();
            let last = inner.aux_last_close.entry(timeframe).or_insert(0);
            // Duplicate delivery can replay an older close; never regress.
            *last = (*last).max(bar.close_time);
        }
        debug!(
            timeframe = %timeframe,
            close_time = bar.close_time,
            "auxiliary bar closed"
        );
    }

    // -------------------------------------------------------------------------
    // Permission cascade
    // -------------------------------------------------------------------------

    /// Compute the permission for one trigger event.  Pure with respect to
    /// its inputs; the cascade walks slowest-first so the broadest problem
    /// becomes the reject reason.
    pub fn evaluate_permission(&self, bundle: &SnapshotBundle, now: i64) -> Permission {
        let slowest_first = [Timeframe::H4, Timeframe::H1, Timeframe::M15, Timeframe::M5];

        // Readiness: every timeframe must have produced a snapshot.
        let mut snaps = Vec::with_capacity(slowest_first.len());
        for tf in slowest_first {
            match bundle.get(tf) {
                Some(snap) => snaps.push((tf, snap)),
                None => {
                    return Permission::deny("missing_snapshot", format!("{tf} has no snapshot"));
                }
            }
        }

        // Freshness: a bar closing in the future means clock trouble; a bar
        // too far in the past means the stream quietly died.
        for &(tf, snap) in &snaps {
            let age = now - snap.last_closed_at;

            if age < -CLOCK_SKEW_TOLERANCE_MS {
                return Permission::deny(
                    "clock_skew",
                    format!("{tf} close is {}s in the future", -age / 1_000),
                );
            }

            let params = self.config.timeframes.get(tf);
            let max_age = tf.step_ms() * i64::from(params.stale_bars);
            if age > max_age {
                return Permission::deny(
                    "stale_data",
                    format!("{tf} stale: age={}s > max={}s", age / 1_000, max_age / 1_000),
                );
            }
        }

        // Time-health cascade.
        for &(tf, snap) in &snaps {
            let params = self.config.timeframes.get(tf);
            match snap.time_health {
                TimeHealth::Broken => {
                    return Permission::deny("unhealthy", format!("{tf} time-health is broken"));
                }
                TimeHealth::Warning if !params.allow_warning => {
                    return Permission::deny("unhealthy", format!("{tf} time-health is warning"));
                }
                _ => {}
            }
        }

        Permission::allow()
    }

    // -------------------------------------------------------------------------
    // State / listeners
    // -------------------------------------------------------------------------

    pub fn state(&self) -> CoordinatorState {
        let inner = self.inner.read();
        CoordinatorState {
            last_trigger_close: inner.last_trigger_close,
            last_decision: inner.last_decision.clone(),
            triggers_evaluated: self.triggers_evaluated.load(Ordering::Relaxed),
            triggers_deduped: self.triggers_deduped.load(Ordering::Relaxed),
            decisions_emitted: self.decisions_emitted.load(Ordering::Relaxed),
            decisions_suppressed: self.decisions_suppressed.load(Ordering::Relaxed),
            auxiliary_closes: self.auxiliary_closes.load(Ordering::Relaxed),
            aux_last_close: inner.aux_last_close.clone(),
        }
    }

    pub fn subscribe_trigger<F>(&self, listener: F) -> u64
    where
        F: Fn(&SnapshotBundle, &Decision) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.trigger_listeners.write().push((id, Box::new(listener)));
        id
    }

    pub fn subscribe_decision<F>(&self, listener: F) -> u64
    where
        F: Fn(&Decision) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.decision_listeners.write().push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe_trigger(&self, id: u64) -> bool {
        let mut listeners = self.trigger_listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn unsubscribe_decision(&self, id: u64) -> bool {
        let mut listeners = self.decision_listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify_trigger(&self, bundle: &SnapshotBundle, decision: &Decision) {
        for (id, listener) in self.trigger_listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(bundle, decision))).is_err() {
                error!(listener_id = id, "trigger listener panicked");
            }
        }
    }

    fn notify_decision(&self, decision: &Decision) {
        for (id, listener) in self.decision_listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(decision))).is_err() {
                error!(listener_id = id, "decision listener panicked");
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::swing::SwingLevels;
    use crate::types::{Bar, Structure, Trend};
    use std::sync::{Arc, Mutex};

    const NOW: i64 = 1_700_000_000_000;

    fn snapshot(tf: Timeframe, last_closed_at: i64, health: TimeHealth) -> StreamSnapshot {
        let step = tf.step_ms();
        let bar = Bar {
            open_time: last_closed_at - step + 1,
            close_time: last_closed_at,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 50.0,
        };
        StreamSnapshot {
            symbol: "ETHUSDT".to_string(),
            timeframe: tf,
            last_bar: bar,
            prev_bar: None,
            ema: Some(100.0),
            ema_fast: None,
            trend: Trend::Range,
            structure: Structure::Range,
            structure_changed_at: None,
            swings: SwingLevels::default(),
            legs: None,
            entry: None,
            atr_pct: Some(0.5),
            volume_sma: Some(50.0),
            last_closed_at,
            time_health: health,
            bar_count: 100,
            captured_at: last_closed_at,
        }
    }

    /// All four timeframes fresh and healthy as of `NOW`.
    fn healthy_bundle() -> SnapshotBundle {
        SnapshotBundle {
            m5: Some(snapshot(Timeframe::M5, NOW - 1_000, TimeHealth::Healthy)),
            m15: Some(snapshot(Timeframe::M15, NOW - 60_000, TimeHealth::Healthy)),
            h1: Some(snapshot(Timeframe::H1, NOW - 600_000, TimeHealth::Healthy)),
            h4: Some(snapshot(Timeframe::H4, NOW - 3_600_000, TimeHealth::Healthy)),
        }
    }

    fn coordinator() -> MultiTimeframeCoordinator {
        MultiTimeframeCoordinator::new(EngineConfig::default())
    }

    #[test]
    fn healthy_bundle_is_allowed() {
        let c = coordinator();
        let p = c.evaluate_permission(&healthy_bundle(), NOW);
        assert!(p.allowed, "{p:?}");
    }

    #[test]
    fn missing_snapshot_denies_slowest_first() {
        let c = coordinator();
        let mut bundle = healthy_bundle();
        bundle.h4 = None;
        bundle.m15 = None;

        let p = c.evaluate_permission(&bundle, NOW);
        assert!(!p.allowed);
        assert_eq!(p.reason, "missing_snapshot");
        // H4 is reported even though M15 is missing too.
        assert!(p.detail.unwrap().contains("4h"));
    }

    #[test]
    fn future_close_denies_clock_skew() {
        let c = coordinator();
        let mut bundle = healthy_bundle();
        bundle.m5 = Some(snapshot(Timeframe::M5, NOW + 10_000, TimeHealth::Healthy));

        let p = c.evaluate_permission(&bundle, NOW);
        assert!(!p.allowed);
        assert_eq!(p.reason, "clock_skew");
    }

    #[test]
    fn small_future_skew_is_tolerated() {
        let c = coordinator();
        let mut bundle = healthy_bundle();
        bundle.m5 = Some(snapshot(Timeframe::M5, NOW + 3_000, TimeHealth::Healthy));
        assert!(c.evaluate_permission(&bundle, NOW).allowed);
    }

    #[test]
    fn stale_hourly_denies_stale_data() {
        let c = coordinator();
        let mut bundle = healthy_bundle();
        // 1h bar last closed 3 hours ago; the allowance is 2 steps = 2h.
        bundle.h1 = Some(snapshot(
            Timeframe::H1,
            NOW - 3 * 3_600_000,
            TimeHealth::Healthy,
        ));

        let p = c.evaluate_permission(&bundle, NOW);
        assert!(!p.allowed);
        assert_eq!(p.reason, "stale_data");
        let detail = p.detail.unwrap();
        assert!(detail.contains("1h"), "{detail}");
    }

    #[test]
    fn broken_health_denies_at_any_level() {
        let c = coordinator();
        for tf in Timeframe::ALL {
            let mut bundle = healthy_bundle();
            let age = match tf {
                Timeframe::M5 => 1_000,
                Timeframe::M15 => 60_000,
                Timeframe::H1 => 600_000,
                Timeframe::H4 => 3_600_000,
            };
            let snap = snapshot(tf, NOW - age, TimeHealth::Broken);
            match tf {
                Timeframe::M5 => bundle.m5 = Some(snap),
                Timeframe::M15 => bundle.m15 = Some(snap),
                Timeframe::H1 => bundle.h1 = Some(snap),
                Timeframe::H4 => bundle.h4 = Some(snap),
            }
            let p = c.evaluate_permission(&bundle, NOW);
            assert!(!p.allowed, "{tf} broken must deny");
            assert_eq!(p.reason, "unhealthy");
        }
    }

    #[test]
    fn warning_respects_allow_warning_flags() {
        let c = coordinator();

        // Defaults: warnings tolerated on everything but the trigger.
        let mut bundle = healthy_bundle();
        bundle.h1 = Some(snapshot(Timeframe::H1, NOW - 600_000, TimeHealth::Warning));
        assert!(c.evaluate_permission(&bundle, NOW).allowed);

        let mut bundle = healthy_bundle();
        bundle.m5 = Some(snapshot(Timeframe::M5, NOW - 1_000, TimeHealth::Warning));
        let p = c.evaluate_permission(&bundle, NOW);
        assert!(!p.allowed);
        assert_eq!(p.reason, "unhealthy");
        assert!(p.detail.unwrap().contains("5m"));
    }

    #[test]
    fn trigger_dedup_by_close_time() {
        let c = coordinator();
        let bundle = healthy_bundle();

        assert!(c.on_trigger_closed(&bundle, NOW).is_some());
        assert!(c.on_trigger_closed(&bundle, NOW + 1_000).is_none());

        let state = c.state();
        assert_eq!(state.triggers_evaluated, 1);
        assert_eq!(state.triggers_deduped, 1);

        // A new trigger close evaluates again.
        let mut next = healthy_bundle();
        next.m5 = Some(snapshot(
            Timeframe::M5,
            NOW + 300_000 - 1_000,
            TimeHealth::Healthy,
        ));
        assert!(c.on_trigger_closed(&next, NOW + 300_000).is_some());
        assert_eq!(c.state().triggers_evaluated, 2);
    }

    #[test]
    fn unchanged_decisions_suppressed_but_allowed_triggers_fire() {
        let c = coordinator();
        let decisions = Arc::new(Mutex::new(Vec::new()));
        let triggers = Arc::new(AtomicU64::new(0));

        let d2 = decisions.clone();
        c.subscribe_decision(move |d| d2.lock().unwrap().push(d.permission.allowed));
        let t2 = triggers.clone();
        c.subscribe_trigger(move |_, _| {
            t2.fetch_add(1, Ordering::SeqCst);
        });

        // Three consecutive allowed decisions on distinct trigger closes.
        for i in 0..3 {
            let mut bundle = healthy_bundle();
            bundle.m5 = Some(snapshot(
                Timeframe::M5,
                NOW + i * 300_000,
                TimeHealth::Healthy,
            ));
            c.on_trigger_closed(&bundle, NOW + i * 300_000 + 1_000);
        }

        // First decision emits; the identical repeats are suppressed.
        assert_eq!(decisions.lock().unwrap().len(), 1);
        assert_eq!(triggers.load(Ordering::SeqCst), 3);
        let state = c.state();
        assert_eq!(state.decisions_emitted, 1);
        assert_eq!(state.decisions_suppressed, 2);
    }

    #[test]
    fn decision_flip_emits_again() {
        let c = coordinator();
        let count = Arc::new(AtomicU64::new(0));
        let c2 = count.clone();
        c.subscribe_decision(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        c.on_trigger_closed(&healthy_bundle(), NOW); // allow

        let mut bundle = healthy_bundle();
        bundle.m5 = Some(snapshot(Timeframe::M5, NOW + 300_000, TimeHealth::Broken));
        c.on_trigger_closed(&bundle, NOW + 301_000); // deny

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn denied_trigger_fires_no_trigger_event() {
        let c = coordinator();
        let triggers = Arc::new(AtomicU64::new(0));
        let t2 = triggers.clone();
        c.subscribe_trigger(move |_, _| {
            t2.fetch_add(1, Ordering::SeqCst);
        });

        let mut bundle = healthy_bundle();
        bundle.h4 = None;
        let decision = c.on_trigger_closed(&bundle, NOW).unwrap();
        assert!(!decision.permission.allowed);
        assert_eq!(triggers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn auxiliary_closes_recorded_per_timeframe() {
        let c = coordinator();
        let aux_bar = |close_time: i64| Bar {
            open_time: close_time - 3_600_000,
            close_time,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 50.0,
        };
        c.on_auxiliary_closed(Timeframe::H1, &aux_bar(NOW - 1));
        c.on_auxiliary_closed(Timeframe::H4, &aux_bar(NOW - 7_200_000));

        let state = c.state();
        assert_eq!(state.auxiliary_closes, 2);
        assert_eq!(state.aux_last_close.get(&Timeframe::H1), Some(&(NOW - 1)));
        assert_eq!(
            state.aux_last_close.get(&Timeframe::H4),
            Some(&(NOW - 7_200_000))
        );
        assert_eq!(state.triggers_evaluated, 0);
        assert!(state.last_decision.is_none());

        // Replayed older closes never move the recorded time backwards.
        c.on_auxiliary_closed(Timeframe::H1, &aux_bar(NOW - 3_600_000));
        let state = c.state();
        assert_eq!(state.auxiliary_closes, 3);
        assert_eq!(state.aux_last_close.get(&Timeframe::H1), Some(&(NOW - 1)));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let c = coordinator();
        let count = Arc::new(AtomicU64::new(0));
        let c2 = count.clone();
        let id = c.subscribe_trigger(move |_, _| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        c.on_trigger_closed(&healthy_bundle(), NOW);
        assert!(c.unsubscribe_trigger(id));

        let mut next = healthy_bundle();
        next.m5 = Some(snapshot(Timeframe::M5, NOW + 300_000, TimeHealth::Healthy));
        c.on_trigger_closed(&next, NOW + 301_000);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
