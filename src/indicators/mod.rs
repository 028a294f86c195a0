// =============================================================================
// Derived Indicator Module
// =============================================================================
//
// Pure, side-effect-free building blocks for the per-timeframe analysis that
// runs on every closed bar.  Every public function returns `Option<T>` (or an
// empty Vec) so callers are forced to handle insufficient-data and numerical
// edge cases.

pub mod atr;
pub mod ema;
pub mod entry;
pub mod swing;

pub use entry::{EntryKind, EntrySignal};
pub use swing::{LegStats, StructureDebounce, SwingLevels};
