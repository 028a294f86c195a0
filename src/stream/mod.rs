// =============================================================================
// Per-timeframe market-data streams
// =============================================================================
//
// One `StreamManager` per timeframe owns that timeframe's closed-bar cache,
// derived analysis, health state, and websocket connection lifecycle.

pub mod cache;
pub mod health;
pub mod manager;
pub mod socket;

pub use health::{HealthSnapshot, HealthTracker};
pub use manager::{StreamManager, StreamSnapshot, StreamTiming};
