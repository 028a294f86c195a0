// =============================================================================
// Meridian — Multi-Timeframe Market Data & Gate Engine
// =============================================================================
//
// Four kline streams (5m / 15m / 1h / 4h) feed per-timeframe caches and
// derived analysis.  Every closed 5m bar flows through the coordinator's
// permission cascade and, when allowed, the gate evaluator pipeline.  The
// engine only observes and emits signals; it never places orders.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod context;
mod coordinator;
mod gates;
mod indicators;
mod providers;
mod reject_stats;
mod strategy;
mod stream;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::context::StrategyContext;
use crate::coordinator::{MultiTimeframeCoordinator, SnapshotBundle};
use crate::providers::BinanceBackfill;
use crate::reject_stats::RejectStats;
use crate::strategy::{Evaluation, GateEvaluator};
use crate::stream::{StreamManager, StreamTiming};
use crate::types::{now_ms, Timeframe};

const CONFIG_PATH: &str = "meridian_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Engine — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = EngineConfig::default();
        if let Err(e) = defaults.save(CONFIG_PATH) {
            warn!(error = %e, "Failed to write default config file");
        }
        defaults
    });

    // Override symbol from env if available.
    if let Ok(symbol) = std::env::var("MERIDIAN_SYMBOL") {
        let symbol = symbol.trim().to_uppercase();
        if !symbol.is_empty() {
            config.symbol = symbol;
        }
    }

    info!(symbol = %config.symbol, "Configured instrument");

    // ── 2. Build streams ─────────────────────────────────────────────────
    let provider = Arc::new(BinanceBackfill::new());
    let timing = StreamTiming::from(&config);

    let managers: Vec<Arc<StreamManager>> = Timeframe::ALL
        .iter()
        .map(|&tf| {
            Arc::new(StreamManager::new(
                config.symbol.clone(),
                tf,
                config.timeframes.get(tf).clone(),
                timing.clone(),
                provider.clone(),
            ))
        })
        .collect();

    let manager_for = |tf: Timeframe| -> Arc<StreamManager> {
        managers
            .iter()
            .find(|m| m.timeframe() == tf)
            .expect("all timeframes constructed")
            .clone()
    };

    // ── 3. Coordinator, evaluator, diagnostics ───────────────────────────
    let coordinator = Arc::new(MultiTimeframeCoordinator::new(config.clone()));
    let evaluator = Arc::new(GateEvaluator::new(config.clone()));
    let reject_stats = Arc::new(RejectStats::new(config.reject_stats.clone()));

    // Coordinator denies feed the stats through the decision channel.
    {
        let stats = reject_stats.clone();
        coordinator.subscribe_decision(move |decision| {
            stats.record_decision(decision);
        });
    }

    // Allowed triggers run the full evaluation pipeline.
    {
        let evaluator = evaluator.clone();
        let stats = reject_stats.clone();
        coordinator.subscribe_trigger(move |bundle, decision| {
            let Some(ctx) = StrategyContext::from_bundle(bundle) else {
                return;
            };
            match evaluator.evaluate(&ctx, decision, now_ms()) {
                Evaluation::Signal(_) => stats.record_signal(),
                Evaluation::Reject(reject) => stats.record_reject(&reject),
            }
        });
    }

    // Every closed trigger bar assembles a fresh bundle from all four
    // streams; auxiliary closes are bookkeeping only.
    {
        let coordinator = coordinator.clone();
        let trigger = manager_for(Timeframe::M5);
        let m5 = trigger.clone();
        let m15 = manager_for(Timeframe::M15);
        let h1 = manager_for(Timeframe::H1);
        let h4 = manager_for(Timeframe::H4);
        trigger.subscribe_closed(move |_, _| {
            let bundle = SnapshotBundle {
                m5: m5.snapshot(),
                m15: m15.snapshot(),
                h1: h1.snapshot(),
                h4: h4.snapshot(),
            };
            coordinator.on_trigger_closed(&bundle, now_ms());
        });
    }
    for tf in [Timeframe::M15, Timeframe::H1, Timeframe::H4] {
        let coordinator = coordinator.clone();
        manager_for(tf).subscribe_closed(move |bar, _| {
            coordinator.on_auxiliary_closed(tf, bar);
        });
    }

    // ── 4. Spawn connection tasks ────────────────────────────────────────
    let mut tasks = Vec::new();
    for manager in &managers {
        let manager = manager.clone();
        info!(timeframe = %manager.timeframe(), "spawning kline stream task");
        tasks.push(tokio::spawn(stream::socket::run(manager)));
    }

    // Periodic reject-statistics flush.
    let flusher = {
        let stats = reject_stats.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(stats.flush_interval_secs()));
            interval.tick().await; // skip the immediate tick
            loop {
                interval.tick().await;
                stats.log_summary();
            }
        })
    };

    info!("Meridian engine running, Ctrl+C to stop");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    for manager in &managers {
        manager.request_shutdown();
    }
    flusher.abort();
    for task in tasks {
        let _ = task.await;
    }

    reject_stats.log_summary();
    info!(state = ?coordinator.state().last_decision.map(|d| d.permission.allowed), "Meridian engine stopped");
    Ok(())
}
