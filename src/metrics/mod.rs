//! Metrics module
//!
//! Prometheus gauges and counters sampled from the engine.

mod collector;

pub use collector::EngineMetrics;
