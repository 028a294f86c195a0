// =============================================================================
// Swing detection, structure classification, and leg statistics
// =============================================================================
//
// A swing high/low is a local extremum within a symmetric lookback window
// (± `lookback` bars).  Structure compares the last two swing highs and the
// last two swing lows: both rising => up, both falling => down, else range.
// Commits are debounced through an explicit state machine so one noisy
// classification cannot flip the committed structure.
// =============================================================================

use serde::Serialize;

use crate::types::{Bar, Structure};

/// Which extremum a swing point marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwingKind {
    High,
    Low,
}

/// One detected swing point, positioned by bar index within the scanned slice.
#[derive(Debug, Clone, Copy)]
pub struct SwingPoint {
    pub index: usize,
    pub price: f64,
    pub kind: SwingKind,
}

/// Most recent confirmed swing high/low prices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SwingLevels {
    pub high: Option<f64>,
    pub low: Option<f64>,
}

/// Scan `bars` for swing points using a symmetric ± `lookback` window.
///
/// The trailing `lookback` bars can never confirm a swing (the right side of
/// their window does not exist yet), so the newest swing always lags the
/// newest bar by at least `lookback` bars.
pub fn find_swings(bars: &[Bar], lookback: usize) -> Vec<SwingPoint> {
    let mut points = Vec::new();
    if lookback == 0 || bars.len() < 2 * lookback + 1 {
        return points;
    }

    for i in lookback..bars.len() - lookback {
        let window = &bars[i - lookback..=i + lookback];
        let high = bars[i].high;
        let low = bars[i].low;

        if window.iter().all(|b| high >= b.high) {
            points.push(SwingPoint {
                index: i,
                price: high,
                kind: SwingKind::High,
            });
        }
        if window.iter().all(|b| low <= b.low) {
            points.push(SwingPoint {
                index: i,
                price: low,
                kind: SwingKind::Low,
            });
        }
    }

    points
}

/// Extract the most recent swing high and low prices.
pub fn swing_levels(points: &[SwingPoint]) -> SwingLevels {
    let high = points
        .iter()
        .rev()
        .find(|p| p.kind == SwingKind::High)
        .map(|p| p.price);
    let low = points
        .iter()
        .rev()
        .find(|p| p.kind == SwingKind::Low)
        .map(|p| p.price);
    SwingLevels { high, low }
}

/// Raw (undebounced) structure classification from the last two swing highs
/// and last two swing lows.
pub fn classify_structure(points: &[SwingPoint]) -> Structure {
    let highs: Vec<f64> = points
        .iter()
        .filter(|p| p.kind == SwingKind::High)
        .map(|p| p.price)
        .collect();
    let lows: Vec<f64> = points
        .iter()
        .filter(|p| p.kind == SwingKind::Low)
        .map(|p| p.price)
        .collect();

    if highs.len() < 2 || lows.len() < 2 {
        return Structure::Range;
    }

    let (h1, h2) = (highs[highs.len() - 2], highs[highs.len() - 1]);
    let (l1, l2) = (lows[lows.len() - 2], lows[lows.len() - 1]);

    if h2 > h1 && l2 > l1 {
        Structure::Up
    } else if h2 < h1 && l2 < l1 {
        Structure::Down
    } else {
        Structure::Range
    }
}

// ---------------------------------------------------------------------------
// Structure debounce state machine
// ---------------------------------------------------------------------------

/// Anti-flicker commit rule: a new structure classification only commits
/// after `threshold` consecutive identical observations.  Any differing
/// observation resets the pending run.
#[derive(Debug, Clone)]
pub struct StructureDebounce {
    committed: Structure,
    pending: Option<(Structure, u32)>,
    threshold: u32,
    last_change_at: Option<i64>,
}

impl StructureDebounce {
    pub fn new(threshold: u32) -> Self {
        Self {
            committed: Structure::Range,
            pending: None,
            threshold: threshold.max(1),
            last_change_at: None,
        }
    }

    /// Feed one classification observed at `at_ms`; returns the (possibly
    /// updated) committed structure.
    pub fn observe(&mut self, candidate: Structure, at_ms: i64) -> Structure {
        if candidate == self.committed {
            self.pending = None;
            return self.committed;
        }

        let run = match self.pending {
            Some((pending, count)) if pending == candidate => count + 1,
            _ => 1,
        };

        if run >= self.threshold {
            self.committed = candidate;
            self.pending = None;
            self.last_change_at = Some(at_ms);
        } else {
            self.pending = Some((candidate, run));
        }

        self.committed
    }

    pub fn committed(&self) -> Structure {
        self.committed
    }

    /// When the committed structure last changed, epoch milliseconds.
    pub fn last_change_at(&self) -> Option<i64> {
        self.last_change_at
    }

    /// Full reset, used when a stream discards its cache on resync.
    pub fn reset(&mut self) {
        self.committed = Structure::Range;
        self.pending = None;
        self.last_change_at = None;
    }
}

// ---------------------------------------------------------------------------
// Leg statistics
// ---------------------------------------------------------------------------

/// Average impulse and pullback leg lengths, in price units.  Only defined
/// for a directional structure; in range the exhaustion gate passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LegStats {
    pub impulse_avg: f64,
    pub pullback_avg: f64,
}

impl LegStats {
    pub fn ratio(&self) -> Option<f64> {
        if self.impulse_avg > 0.0 && self.pullback_avg > 0.0 {
            Some(self.impulse_avg / self.pullback_avg)
        } else {
            None
        }
    }
}

/// Compute leg statistics from the chronological pivot sequence.
///
/// A leg is the absolute price move between consecutive pivots.  For an
/// up-structure, upward legs are impulses and downward legs pullbacks;
/// reversed for a down-structure.
pub fn leg_stats(points: &[SwingPoint], structure: Structure) -> Option<LegStats> {
    if structure == Structure::Range || points.len() < 3 {
        return None;
    }

    let mut up_legs = Vec::new();
    let mut down_legs = Vec::new();
    for pair in points.windows(2) {
        let delta = pair[1].price - pair[0].price;
        if delta > 0.0 {
            up_legs.push(delta);
        } else if delta < 0.0 {
            down_legs.push(-delta);
        }
    }

    if up_legs.is_empty() || down_legs.is_empty() {
        return None;
    }

    let up_avg = up_legs.iter().sum::<f64>() / up_legs.len() as f64;
    let down_avg = down_legs.iter().sum::<f64>() / down_legs.len() as f64;

    let (impulse_avg, pullback_avg) = match structure {
        Structure::Up => (up_avg, down_avg),
        Structure::Down => (down_avg, up_avg),
        Structure::Range => unreachable!(),
    };

    Some(LegStats {
        impulse_avg,
        pullback_avg,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Build a bar whose high/low straddle `mid` by 1.0.
    fn bar_at(mid: f64) -> Bar {
        Bar {
            open_time: 0,
            close_time: 300_000,
            open: mid,
            high: mid + 1.0,
            low: mid - 1.0,
            close: mid,
            volume: 100.0,
        }
    }

    /// Zig-zag series visiting each value in `mids` as a local extreme, with
    /// ramps in between so each extreme survives a lookback-2 window.
    fn zigzag(mids: &[f64]) -> Vec<Bar> {
        let mut bars = Vec::new();
        for pair in mids.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            let steps = 4;
            for s in 0..steps {
                let t = s as f64 / steps as f64;
                bars.push(bar_at(from + (to - from) * t));
            }
        }
        bars.push(bar_at(*mids.last().unwrap()));
        bars
    }

    #[test]
    fn no_swings_on_short_input() {
        let bars: Vec<Bar> = (0..4).map(|i| bar_at(100.0 + i as f64)).collect();
        assert!(find_swings(&bars, 2).is_empty());
        assert!(find_swings(&bars, 0).is_empty());
    }

    #[test]
    fn finds_peak_and_trough() {
        // Up to 110, down to 90, back to 100: one swing high, one swing low.
        let bars = zigzag(&[100.0, 110.0, 90.0, 100.0]);
        let points = find_swings(&bars, 2);

        let highs: Vec<_> = points.iter().filter(|p| p.kind == SwingKind::High).collect();
        let lows: Vec<_> = points.iter().filter(|p| p.kind == SwingKind::Low).collect();
        assert!(highs.iter().any(|p| (p.price - 111.0).abs() < 1e-9));
        assert!(lows.iter().any(|p| (p.price - 89.0).abs() < 1e-9));

        let levels = swing_levels(&points);
        assert_eq!(levels.high, Some(111.0));
        assert_eq!(levels.low, Some(89.0));
    }

    #[test]
    fn rising_highs_and_lows_classify_up() {
        // HH/HL sequence: 100 -> 110 -> 105 -> 115 -> 108 -> 118 -> 111.
        let bars = zigzag(&[100.0, 110.0, 105.0, 115.0, 108.0, 118.0, 111.0]);
        let points = find_swings(&bars, 2);
        assert_eq!(classify_structure(&points), Structure::Up);
    }

    #[test]
    fn falling_highs_and_lows_classify_down() {
        let bars = zigzag(&[120.0, 110.0, 115.0, 100.0, 108.0, 92.0, 98.0]);
        let points = find_swings(&bars, 2);
        assert_eq!(classify_structure(&points), Structure::Down);
    }

    #[test]
    fn mixed_swings_classify_range() {
        // Higher high but lower low.
        let bars = zigzag(&[100.0, 110.0, 95.0, 112.0, 90.0, 113.0, 100.0]);
        let points = find_swings(&bars, 2);
        assert_eq!(classify_structure(&points), Structure::Range);
    }

    #[test]
    fn too_few_swings_classify_range() {
        let bars = zigzag(&[100.0, 110.0, 100.0]);
        let points = find_swings(&bars, 2);
        assert_eq!(classify_structure(&points), Structure::Range);
    }

    // ---- debounce --------------------------------------------------------

    #[test]
    fn debounce_commits_after_threshold() {
        let mut d = StructureDebounce::new(2);
        assert_eq!(d.observe(Structure::Up, 1_000), Structure::Range);
        assert_eq!(d.observe(Structure::Up, 2_000), Structure::Up);
        assert_eq!(d.last_change_at(), Some(2_000));
    }

    #[test]
    fn debounce_resets_on_flicker() {
        let mut d = StructureDebounce::new(2);
        d.observe(Structure::Up, 1_000);
        d.observe(Structure::Down, 2_000); // breaks the up run
        assert_eq!(d.committed(), Structure::Range);
        d.observe(Structure::Up, 3_000);
        assert_eq!(d.committed(), Structure::Range); // run restarted at 1
        assert_eq!(d.observe(Structure::Up, 4_000), Structure::Up);
    }

    #[test]
    fn debounce_same_as_committed_clears_pending() {
        let mut d = StructureDebounce::new(3);
        d.observe(Structure::Up, 1_000);
        d.observe(Structure::Up, 2_000);
        // Back to the committed value — the pending up-run must not survive.
        d.observe(Structure::Range, 3_000);
        d.observe(Structure::Up, 4_000);
        d.observe(Structure::Up, 5_000);
        assert_eq!(d.committed(), Structure::Range);
        assert_eq!(d.observe(Structure::Up, 6_000), Structure::Up);
        assert_eq!(d.last_change_at(), Some(6_000));
    }

    #[test]
    fn debounce_threshold_one_commits_immediately() {
        let mut d = StructureDebounce::new(1);
        assert_eq!(d.observe(Structure::Down, 500), Structure::Down);
    }

    #[test]
    fn debounce_reset_clears_everything() {
        let mut d = StructureDebounce::new(1);
        d.observe(Structure::Up, 1_000);
        d.reset();
        assert_eq!(d.committed(), Structure::Range);
        assert_eq!(d.last_change_at(), None);
    }

    // ---- legs ------------------------------------------------------------

    #[test]
    fn leg_stats_up_structure() {
        // Pivots 100 -> 110 -> 105 -> 118: impulses 10 and 13, pullback 5.
        let points = vec![
            SwingPoint { index: 0, price: 100.0, kind: SwingKind::Low },
            SwingPoint { index: 5, price: 110.0, kind: SwingKind::High },
            SwingPoint { index: 10, price: 105.0, kind: SwingKind::Low },
            SwingPoint { index: 15, price: 118.0, kind: SwingKind::High },
        ];
        let legs = leg_stats(&points, Structure::Up).unwrap();
        assert!((legs.impulse_avg - 11.5).abs() < 1e-9);
        assert!((legs.pullback_avg - 5.0).abs() < 1e-9);
        assert!(legs.ratio().unwrap() > 2.0);
    }

    #[test]
    fn leg_stats_down_swaps_roles() {
        let points = vec![
            SwingPoint { index: 0, price: 120.0, kind: SwingKind::High },
            SwingPoint { index: 5, price: 100.0, kind: SwingKind::Low },
            SwingPoint { index: 10, price: 108.0, kind: SwingKind::High },
            SwingPoint { index: 15, price: 90.0, kind: SwingKind::Low },
        ];
        let legs = leg_stats(&points, Structure::Down).unwrap();
        assert!((legs.impulse_avg - 19.0).abs() < 1e-9);
        assert!((legs.pullback_avg - 8.0).abs() < 1e-9);
    }

    #[test]
    fn leg_stats_none_in_range_or_short() {
        let points = vec![
            SwingPoint { index: 0, price: 100.0, kind: SwingKind::Low },
            SwingPoint { index: 5, price: 110.0, kind: SwingKind::High },
        ];
        assert!(leg_stats(&points, Structure::Up).is_none());
        assert!(leg_stats(&points, Structure::Range).is_none());
    }
}
