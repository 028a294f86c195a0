// =============================================================================
// Stream Manager — one timeframe's cache, analysis, health, and resync state
// =============================================================================
//
// The manager is the synchronous core of a stream: the connection task in
// `socket.rs` feeds it messages and drives its resync requests, while the
// coordinator reads snapshots and subscribes to closed-bar events.
//
// Resync is single-flight: any code path may *request* one (rollback, stale
// data), but only the connection task performs it, so there is never more
// than one backfill in flight per stream.  A cooldown keeps a flapping feed
// from hammering the REST API; a request that falls inside the cooldown
// stays pending and is served when the window opens.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, TimeframeParams};
use crate::indicators::atr::{atr_pct, volume_sma};
use crate::indicators::ema::{classify_trend, ema_last};
use crate::indicators::entry::{detect_entry, EntrySignal};
use crate::indicators::swing::{
    classify_structure, find_swings, leg_stats, swing_levels, LegStats, StructureDebounce,
    SwingLevels,
};
use crate::providers::BackfillProvider;
use crate::stream::cache::{BarCache, UpsertOutcome};
use crate::stream::health::{HealthSnapshot, HealthTracker};
use crate::types::{now_ms, Bar, Structure, TimeHealth, Timeframe, Trend};

const ATR_PERIOD: usize = 14;
const VOLUME_SMA_PERIOD: usize = 20;

/// Connection and resync timing shared by all four streams.
#[derive(Debug, Clone)]
pub struct StreamTiming {
    pub heartbeat_timeout_ms: u64,
    pub heartbeat_poll_ms: u64,
    pub resync_cooldown_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl From<&EngineConfig> for StreamTiming {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            heartbeat_timeout_ms: cfg.heartbeat_timeout_ms,
            heartbeat_poll_ms: cfg.heartbeat_poll_ms,
            resync_cooldown_ms: cfg.resync_cooldown_ms,
            reconnect_base_ms: cfg.reconnect_base_ms,
            reconnect_max_ms: cfg.reconnect_max_ms,
        }
    }
}

/// Point-in-time view of one timeframe's state and derived analysis.
/// Cheap to clone; recomputed on every accepted closed bar.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub last_bar: Bar,
    pub prev_bar: Option<Bar>,
    /// Trend EMA (the timeframe's configured period).
    pub ema: Option<f64>,
    /// Fast EMA, present only where configured (trigger timeframe).
    pub ema_fast: Option<f64>,
    pub trend: Trend,
    /// Debounced (committed) structure.
    pub structure: Structure,
    pub structure_changed_at: Option<i64>,
    pub swings: SwingLevels,
    pub legs: Option<LegStats>,
    /// Entry setup, only where a fast EMA is configured (trigger timeframe).
    pub entry: Option<EntrySignal>,
    pub atr_pct: Option<f64>,
    pub volume_sma: Option<f64>,
    /// close_time of the newest cached bar, epoch ms.
    pub last_closed_at: i64,
    pub time_health: TimeHealth,
    pub bar_count: usize,
    pub captured_at: i64,
}

type ClosedBarListener = Box<dyn Fn(&Bar, &StreamSnapshot) + Send + Sync>;

/// Analysis state that must survive between recomputes (hysteresis inputs).
struct AnalysisState {
    trend: Trend,
    debounce: StructureDebounce,
    snapshot: Option<StreamSnapshot>,
}

pub struct StreamManager {
    symbol: String,
    timeframe: Timeframe,
    params: TimeframeParams,
    timing: StreamTiming,
    provider: Arc<dyn BackfillProvider>,

    cache: RwLock<BarCache>,
    analysis: RwLock<AnalysisState>,
    health: HealthTracker,

    resync_requested: AtomicBool,
    last_resync_at: AtomicI64,

    listeners: RwLock<Vec<(u64, ClosedBarListener)>>,
    next_listener_id: AtomicU64,

    shutdown: Notify,
    shutdown_flag: AtomicBool,
}

impl StreamManager {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        params: TimeframeParams,
        timing: StreamTiming,
        provider: Arc<dyn BackfillProvider>,
    ) -> Self {
        let cache = BarCache::new(timeframe.step_ms(), params.cache_limit);
        let debounce = StructureDebounce::new(params.structure_debounce);

        Self {
            symbol: symbol.into(),
            timeframe,
            params,
            timing,
            provider,
            cache: RwLock::new(cache),
            analysis: RwLock::new(AnalysisState {
                trend: Trend::Range,
                debounce,
                snapshot: None,
            }),
            health: HealthTracker::new(),
            resync_requested: AtomicBool::new(false),
            last_resync_at: AtomicI64::new(0),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            shutdown: Notify::new(),
            shutdown_flag: AtomicBool::new(false),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn params(&self) -> &TimeframeParams {
        &self.params
    }

    pub fn timing(&self) -> &StreamTiming {
        &self.timing
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Fetch fresh history and rebuild cache + analysis from scratch.  The
    /// connection task runs this before every (re)connect and to serve
    /// resync requests.
    ///
    /// The fetched batch is validated before the cache is touched: a failed
    /// or empty reply must not destroy the history we already hold, and a
    /// rollback block only clears once known-good history replaces it.
    pub(crate) async fn backfill(&self) -> Result<()> {
        let mut bars = self
            .provider
            .fetch_bars(&self.symbol, self.timeframe, self.params.backfill_limit)
            .await
            .with_context(|| {
                format!("backfill failed for {} {}", self.symbol, self.timeframe)
            })?;

        bars.retain(Bar::is_well_formed);
        if bars.is_empty() {
            anyhow::bail!(
                "backfill returned no usable bars for {} {}",
                self.symbol,
                self.timeframe
            );
        }

        self.cache.write().replace_all(bars);

        {
            // History changed wholesale: derived state keyed to the old
            // history is meaningless.
            let mut analysis = self.analysis.write();
            analysis.trend = Trend::Range;
            analysis.debounce.reset();
        }

        if let Some(last) = self.cache.read().last() {
            self.health.record_bar_applied(last.close_time, false);
        }
        self.health.set_time_health(TimeHealth::Healthy);
        self.recompute_analysis();
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn shutdown_notified(&self) {
        if self.is_shutting_down() {
            return;
        }
        self.shutdown.notified().await;
    }

    // -------------------------------------------------------------------------
    // Closed-bar ingestion
    // -------------------------------------------------------------------------

    /// Apply one closed bar from the live feed.
    pub fn handle_closed_bar(&self, bar: Bar) {
        let outcome = self.cache.write().upsert(bar.clone());

        match outcome {
            UpsertOutcome::Applied { replaced } => {
                self.health.record_bar_applied(bar.close_time, replaced);
                if self.health.time_health() != TimeHealth::Broken {
                    self.health.set_time_health(TimeHealth::Healthy);
                }
                self.recompute_analysis();
                self.notify_listeners(&bar);
            }
            UpsertOutcome::Gap { missed } => {
                warn!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    missed,
                    open_time = bar.open_time,
                    "gap in closed-bar sequence"
                );
                self.health.record_gap();
                self.health.record_bar_applied(bar.close_time, false);
                if self.health.time_health() != TimeHealth::Broken {
                    self.health.set_time_health(TimeHealth::Warning);
                }
                self.recompute_analysis();
                self.notify_listeners(&bar);
            }
            UpsertOutcome::Rollback => {
                error!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    open_time = bar.open_time,
                    "out-of-order bar (rollback), stream blocked pending resync"
                );
                self.health.record_rollback();
                self.health.set_time_health(TimeHealth::Broken);
                self.request_resync("rollback");
            }
            UpsertOutcome::Blocked => {
                debug!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    open_time = bar.open_time,
                    "bar discarded: cache blocked"
                );
            }
            UpsertOutcome::Malformed => {
                warn!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    open_time = bar.open_time,
                    close_time = bar.close_time,
                    "malformed bar discarded"
                );
            }
        }
    }

    /// Replay path for tests and offline evaluation: identical semantics to
    /// the live feed, including listener notification.
    pub fn feed_historical_bar(&self, bar: Bar) {
        self.handle_closed_bar(bar);
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    fn recompute_analysis(&self) {
        let (bars, time_health) = {
            let cache = self.cache.read();
            (cache.bars().to_vec(), self.health.time_health())
        };

        let Some(last_bar) = bars.last().cloned() else {
            self.analysis.write().snapshot = None;
            return;
        };
        let prev_bar = bars.len().checked_sub(2).map(|i| bars[i].clone());

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let ema = ema_last(&closes, self.params.ema_period);
        let ema_fast = self
            .params
            .ema_fast_period
            .and_then(|period| ema_last(&closes, period));

        let points = find_swings(&bars, self.params.swing_lookback);
        let swings = swing_levels(&points);
        let raw_structure = classify_structure(&points);

        let mut analysis = self.analysis.write();

        analysis.trend = match ema {
            Some(ema) => classify_trend(
                analysis.trend,
                last_bar.close,
                ema,
                self.params.trend_buffer_pct,
            ),
            None => analysis.trend,
        };

        let structure = analysis.debounce.observe(raw_structure, last_bar.close_time);
        let legs = leg_stats(&points, structure);

        let entry = match (ema_fast, ema) {
            (Some(fast), Some(slow)) => detect_entry(last_bar.close, fast, slow, &swings),
            _ => None,
        };

        analysis.snapshot = Some(StreamSnapshot {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            last_closed_at: last_bar.close_time,
            last_bar,
            prev_bar,
            ema,
            ema_fast,
            trend: analysis.trend,
            structure,
            structure_changed_at: analysis.debounce.last_change_at(),
            swings,
            legs,
            entry,
            atr_pct: atr_pct(&bars, ATR_PERIOD),
            volume_sma: volume_sma(&bars, VOLUME_SMA_PERIOD),
            time_health,
            bar_count: bars.len(),
            captured_at: now_ms(),
        });
    }

    /// Latest derived snapshot; `None` until the first successful backfill.
    pub fn snapshot(&self) -> Option<StreamSnapshot> {
        let mut snap = self.analysis.read().snapshot.clone()?;
        // Health can change between recomputes (staleness checks); report
        // the live value.
        snap.time_health = self.health.time_health();
        Some(snap)
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Register a closed-bar listener; returns an id for `unsubscribe`.
    pub fn subscribe_closed<F>(&self, listener: F) -> u64
    where
        F: Fn(&Bar, &StreamSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify_listeners(&self, bar: &Bar) {
        let Some(snapshot) = self.snapshot() else {
            return;
        };
        let listeners = self.listeners.read();
        for (id, listener) in listeners.iter() {
            // One panicking subscriber must not take down the stream or
            // starve the other subscribers.
            let result = catch_unwind(AssertUnwindSafe(|| listener(bar, &snapshot)));
            if result.is_err() {
                error!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    listener_id = id,
                    "closed-bar listener panicked"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Resync
    // -------------------------------------------------------------------------

    /// Flag the stream for a full resync.  Idempotent; the connection task
    /// drains the flag.
    pub fn request_resync(&self, reason: &str) {
        if !self.resync_requested.swap(true, Ordering::SeqCst) {
            info!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                reason,
                "resync requested"
            );
        }
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_requested.load(Ordering::SeqCst)
    }

    /// Serve a pending resync request if the cooldown window allows it.
    ///
    /// Returns `true` when a resync actually ran, in which case the caller
    /// should drop and reopen its socket.  Inside the cooldown the request
    /// stays pending.
    pub(crate) async fn maybe_resync(&self) -> bool {
        if !self.resync_requested.load(Ordering::SeqCst) {
            return false;
        }

        let now = now_ms();
        let last = self.last_resync_at.load(Ordering::SeqCst);
        if last != 0 && now - last < self.timing.resync_cooldown_ms as i64 {
            debug!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                since_last_ms = now - last,
                "resync pending, inside cooldown"
            );
            return false;
        }

        match self.backfill().await {
            Ok(()) => {
                self.last_resync_at.store(now, Ordering::SeqCst);
                self.resync_requested.store(false, Ordering::SeqCst);
                self.health.record_resync();
                info!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    "resync complete"
                );
                true
            }
            Err(e) => {
                // Keep the request pending; the next heartbeat tick retries.
                warn!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    error = %e,
                    "resync backfill failed"
                );
                false
            }
        }
    }

    /// Heartbeat-driven staleness check: the newest bar should never be
    /// older than `stale_bars` steps.  Crossing that line marks the stream
    /// broken and requests a resync.
    pub(crate) fn check_staleness(&self, now: i64) {
        let Some(last_closed) = self.health.last_closed_bar_at() else {
            return;
        };
        let max_age = self.timeframe.step_ms() * i64::from(self.params.stale_bars);
        let age = now - last_closed;
        if age > max_age && self.health.time_health() != TimeHealth::Broken {
            warn!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                age_ms = age,
                max_age_ms = max_age,
                "stream stale, marking broken"
            );
            self.health.record_stale();
            self.health.set_time_health(TimeHealth::Broken);
            self.request_resync("stale");
        }
    }
}
