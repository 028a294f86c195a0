// =============================================================================
// Closed-bar cache with ordering enforcement
// =============================================================================
//
// The cache is the single source of truth for one timeframe's history.  It
// only ever contains closed bars, strictly ascending by `open_time`, capped
// at a configured limit (trimmed from the oldest end).
//
// The upsert contract is deliberately strict about ordering violations: a bar
// older than the newest cached bar means the upstream feed replayed history,
// and nothing after that point can be trusted.  The cache latches `blocked`
// and discards every subsequent bar until a full `replace_all` (resync)
// clears it.  Classifying the violation is the cache's job; reacting to it
// (health state, resync request) is the stream manager's.
// =============================================================================

use crate::types::Bar;

/// What a single `upsert` did, for the caller to map onto health / resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Appended a new bar (or replaced the bar with the same `open_time`).
    Applied { replaced: bool },
    /// Appended, but one or more bars are missing before it.
    Gap { missed: i64 },
    /// Incoming bar is older than the newest cached bar.  The cache is now
    /// blocked until the next `replace_all`.
    Rollback,
    /// Discarded: the cache is blocked from an earlier rollback.
    Blocked,
    /// Discarded: the bar failed basic validation.
    Malformed,
}

#[derive(Debug)]
pub struct BarCache {
    bars: Vec<Bar>,
    step_ms: i64,
    limit: usize,
    blocked: bool,
}

impl BarCache {
    pub fn new(step_ms: i64, limit: usize) -> Self {
        Self {
            bars: Vec::new(),
            step_ms,
            limit: limit.max(1),
            blocked: false,
        }
    }

    /// Insert or replace one closed bar.
    pub fn upsert(&mut self, bar: Bar) -> UpsertOutcome {
        if self.blocked {
            return UpsertOutcome::Blocked;
        }
        if !bar.is_well_formed() {
            return UpsertOutcome::Malformed;
        }

        // Same bucket delivered again (late correction): replace in place.
        if let Some(existing) = self
            .bars
            .iter_mut()
            .find(|b| b.open_time == bar.open_time)
        {
            *existing = bar;
            return UpsertOutcome::Applied { replaced: true };
        }

        let outcome = match self.bars.last() {
            Some(last) if bar.open_time < last.open_time => {
                self.blocked = true;
                return UpsertOutcome::Rollback;
            }
            Some(last) => {
                let delta = bar.open_time - last.open_time;
                if delta >= 2 * self.step_ms {
                    UpsertOutcome::Gap {
                        missed: delta / self.step_ms - 1,
                    }
                } else {
                    UpsertOutcome::Applied { replaced: false }
                }
            }
            None => UpsertOutcome::Applied { replaced: false },
        };

        self.bars.push(bar);
        self.trim();
        outcome
    }

    /// Replace the entire history (initial backfill or resync).  Clears the
    /// blocked latch: the new history supersedes whatever was poisoned.
    pub fn replace_all(&mut self, mut bars: Vec<Bar>) {
        bars.retain(Bar::is_well_formed);
        bars.sort_by_key(|b| b.open_time);
        bars.dedup_by_key(|b| b.open_time);
        self.bars = bars;
        self.blocked = false;
        self.trim();
    }

    fn trim(&mut self) {
        if self.bars.len() > self.limit {
            let excess = self.bars.len() - self.limit;
            self.bars.drain(..excess);
        }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }
}
