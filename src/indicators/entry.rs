// =============================================================================
// Trigger-timeframe entry detection
// =============================================================================
//
// Two entry shapes on the execution timeframe, both requiring fast/slow EMA
// bias agreement:
//
//   breakout — close beyond the last confirmed swing extreme in the bias
//              direction
//   pullback — close retraced between the fast and slow EMA while the bias
//              holds
//
// Symmetric for long and short.  Pullbacks carry the higher confidence
// downstream; breakouts chase extended price.
// =============================================================================

use serde::Serialize;

use crate::indicators::swing::SwingLevels;
use crate::types::TradeSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Pullback,
    Breakout,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pullback => "pullback",
            Self::Breakout => "breakout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntrySignal {
    pub side: TradeSide,
    pub kind: EntryKind,
}

/// Detect an entry setup from the trigger timeframe's last close.
///
/// Returns `None` when the EMAs give no bias (equal or non-finite) or the
/// close sits in neither shape.  Pullback wins when both shapes match.
pub fn detect_entry(
    close: f64,
    ema_fast: f64,
    ema_slow: f64,
    swings: &SwingLevels,
) -> Option<EntrySignal> {
    if !close.is_finite() || !ema_fast.is_finite() || !ema_slow.is_finite() {
        return None;
    }

    if ema_fast > ema_slow {
        // Long bias.
        if close <= ema_fast && close >= ema_slow {
            return Some(EntrySignal {
                side: TradeSide::Long,
                kind: EntryKind::Pullback,
            });
        }
        if let Some(high) = swings.high {
            if close > high {
                return Some(EntrySignal {
                    side: TradeSide::Long,
                    kind: EntryKind::Breakout,
                });
            }
        }
    } else if ema_fast < ema_slow {
        // Short bias.
        if close >= ema_fast && close <= ema_slow {
            return Some(EntrySignal {
                side: TradeSide::Short,
                kind: EntryKind::Pullback,
            });
        }
        if let Some(low) = swings.low {
            if close < low {
                return Some(EntrySignal {
                    side: TradeSide::Short,
                    kind: EntryKind::Breakout,
                });
            }
        }
    }

    None
}
