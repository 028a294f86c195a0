// =============================================================================
// Per-stream health tracking
// =============================================================================
//
// Lock-free counters and gauges updated from the connection task and read by
// the coordinator and diagnostics.  Counters are monotonically increasing;
// gauges (timestamps, time-health) are last-writer-wins.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use crate::types::TimeHealth;

const HEALTH_HEALTHY: u8 = 0;
const HEALTH_WARNING: u8 = 1;
const HEALTH_BROKEN: u8 = 2;

fn encode(health: TimeHealth) -> u8 {
    match health {
        TimeHealth::Healthy => HEALTH_HEALTHY,
        TimeHealth::Warning => HEALTH_WARNING,
        TimeHealth::Broken => HEALTH_BROKEN,
    }
}

fn decode(raw: u8) -> TimeHealth {
    match raw {
        HEALTH_HEALTHY => TimeHealth::Healthy,
        HEALTH_WARNING => TimeHealth::Warning,
        _ => TimeHealth::Broken,
    }
}

/// Shared health state for one timeframe stream.
#[derive(Debug)]
pub struct HealthTracker {
    time_health: AtomicU8,
    /// Socket currently open.
    alive: AtomicBool,
    messages_received: AtomicU64,
    parse_errors: AtomicU64,
    bars_applied: AtomicU64,
    bars_replaced: AtomicU64,
    gaps_detected: AtomicU64,
    rollbacks: AtomicU64,
    stale_detections: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    resyncs: AtomicU64,
    reconnects: AtomicU64,
    /// Last websocket message, epoch ms.  0 = never.
    last_message_at: AtomicI64,
    /// Last accepted closed bar's close_time, epoch ms.  0 = never.
    last_closed_bar_at: AtomicI64,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            // Broken until the first successful backfill.
            time_health: AtomicU8::new(HEALTH_BROKEN),
            alive: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            bars_applied: AtomicU64::new(0),
            bars_replaced: AtomicU64::new(0),
            gaps_detected: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            stale_detections: AtomicU64::new(0),
            heartbeat_timeouts: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_message_at: AtomicI64::new(0),
            last_closed_bar_at: AtomicI64::new(0),
        }
    }

    pub fn time_health(&self) -> TimeHealth {
        decode(self.time_health.load(Ordering::Relaxed))
    }

    pub fn set_time_health(&self, health: TimeHealth) {
        self.time_health.store(encode(health), Ordering::Relaxed);
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn record_message(&self, at_ms: i64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at.store(at_ms, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bar_applied(&self, close_time: i64, replaced: bool) {
        if replaced {
            self.bars_replaced.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bars_applied.fetch_add(1, Ordering::Relaxed);
        }
        self.last_closed_bar_at.fetch_max(close_time, Ordering::Relaxed);
    }

    pub fn record_gap(&self) {
        self.gaps_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_message_at(&self) -> Option<i64> {
        match self.last_message_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    pub fn last_closed_bar_at(&self) -> Option<i64> {
        match self.last_closed_bar_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            time_health: self.time_health(),
            alive: self.alive(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            bars_applied: self.bars_applied.load(Ordering::Relaxed),
            bars_replaced: self.bars_replaced.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            stale_detections: self.stale_detections.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_message_at: self.last_message_at(),
            last_closed_bar_at: self.last_closed_bar_at(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a stream's health, serialisable for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub time_health: TimeHealth,
    pub alive: bool,
    pub messages_received: u64,
    pub parse_errors: u64,
    pub bars_applied: u64,
    pub bars_replaced: u64,
    pub gaps_detected: u64,
    pub rollbacks: u64,
    pub stale_detections: u64,
    pub heartbeat_timeouts: u64,
    pub resyncs: u64,
    pub reconnects: u64,
    pub last_message_at: Option<i64>,
    pub last_closed_bar_at: Option<i64>,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_broken_with_zero_counters() {
        let t = HealthTracker::new();
        assert_eq!(t.time_health(), TimeHealth::Broken);
        assert!(!t.alive());
        assert!(t.last_message_at().is_none());
        assert!(t.last_closed_bar_at().is_none());

        let snap = t.snapshot();
        assert_eq!(snap.messages_received, 0);
        assert_eq!(snap.rollbacks, 0);
    }

    #[test]
    fn counters_accumulate() {
        let t = HealthTracker::new();
        t.set_alive(true);
        t.record_message(1_000);
        t.record_message(2_000);
        t.record_parse_error();
        t.record_bar_applied(300_000, false);
        t.record_bar_applied(300_000, true);
        t.record_gap();
        t.record_rollback();
        t.record_stale();
        t.record_heartbeat_timeout();
        t.record_resync();
        t.record_reconnect();

        let snap = t.snapshot();
        assert!(snap.alive);
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.bars_applied, 1);
        assert_eq!(snap.bars_replaced, 1);
        assert_eq!(snap.gaps_detected, 1);
        assert_eq!(snap.rollbacks, 1);
        assert_eq!(snap.stale_detections, 1);
        assert_eq!(snap.heartbeat_timeouts, 1);
        assert_eq!(snap.resyncs, 1);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.last_message_at, Some(2_000));
        assert_eq!(snap.last_closed_bar_at, Some(300_000));
    }

    #[test]
    fn last_closed_bar_never_moves_backwards() {
        let t = HealthTracker::new();
        t.record_bar_applied(600_000, false);
        t.record_bar_applied(300_000, true); // late replace of an older bucket
        assert_eq!(t.last_closed_bar_at(), Some(600_000));
    }

    #[test]
    fn time_health_gauge_round_trips() {
        let t = HealthTracker::new();
        for h in [TimeHealth::Healthy, TimeHealth::Warning, TimeHealth::Broken] {
            t.set_time_health(h);
            assert_eq!(t.time_health(), h);
        }
    }
}
