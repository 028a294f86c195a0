// =============================================================================
// Reject statistics — diagnostic consumer of evaluator outcomes
// =============================================================================
//
// Answers "why are we not trading" without scrolling logs: counts every
// evaluation, buckets rejects by `stage:code`, and keeps a bounded number of
// meta samples per bucket.  Purely observational; attaches through the same
// subscribe contracts as any other consumer.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::config::RejectStatsParams;
use crate::coordinator::Decision;
use crate::types::RejectReason;

#[derive(Debug, Clone, Default, Serialize)]
struct Bucket {
    count: u64,
    /// Bounded meta samples, oldest kept.
    samples: Vec<serde_json::Value>,
    last_detail: String,
    last_at: i64,
}

/// Point-in-time stats copy; buckets sorted by count descending, top N only.
#[derive(Debug, Clone, Serialize)]
pub struct RejectStatsSnapshot {
    pub evaluations: u64,
    pub signals: u64,
    pub rejects: u64,
    pub permission_denies: u64,
    pub top: Vec<(String, u64)>,
}

pub struct RejectStats {
    params: RejectStatsParams,
    evaluations: AtomicU64,
    signals: AtomicU64,
    rejects: AtomicU64,
    permission_denies: AtomicU64,
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl RejectStats {
    pub fn new(params: RejectStatsParams) -> Self {
        Self {
            params,
            evaluations: AtomicU64::new(0),
            signals: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
            permission_denies: AtomicU64::new(0),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_signal(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reject(&self, reject: &RejectReason) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.rejects.fetch_add(1, Ordering::Relaxed);
        self.bump(reject.key(), reject);
    }

    /// Coordinator denies never reach the evaluator; count them from the
    /// decision channel under a synthetic `permission:` bucket.
    pub fn record_decision(&self, decision: &Decision) {
        if decision.permission.allowed {
            return;
        }
        self.permission_denies.fetch_add(1, Ordering::Relaxed);
        let reject = RejectReason::new(
            "permission",
            decision.permission.reason.to_uppercase(),
            decision
                .permission
                .detail
                .clone()
                .unwrap_or_default(),
            decision.evaluated_at,
        );
        self.bump(reject.key(), &reject);
    }

    fn bump(&self, key: String, reject: &RejectReason) {
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key).or_default();
        bucket.count += 1;
        bucket.last_detail = reject.detail.clone();
        bucket.last_at = reject.at;
        if bucket.samples.len() < self.params.samples_per_key {
            if let Some(meta) = &reject.meta {
                bucket.samples.push(meta.clone());
            }
        }
    }

    pub fn snapshot(&self) -> RejectStatsSnapshot {
        let buckets = self.buckets.read();
        let mut top: Vec<(String, u64)> = buckets
            .iter()
            .map(|(k, b)| (k.clone(), b.count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(self.params.top_n);

        RejectStatsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            permission_denies: self.permission_denies.load(Ordering::Relaxed),
            top,
        }
    }

    /// Periodic flush target; counters are cumulative, not reset.
    pub fn log_summary(&self) {
        let snap = self.snapshot();
        info!(
            evaluations = snap.evaluations,
            signals = snap.signals,
            rejects = snap.rejects,
            permission_denies = snap.permission_denies,
            top = ?snap.top,
            "reject statistics"
        );
    }

    pub fn flush_interval_secs(&self) -> u64 {
        self.params.flush_interval_secs
    }
}
