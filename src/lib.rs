//! Stripeflow - data placement and garbage collection for a log-structured
//! NVMe array
//!
//! Decides where every written block lands, groups blocks into fixed-size
//! stripes, tracks stripe and segment lifecycle from allocation through
//! flush to free, and reclaims space by moving live blocks out of victim
//! segments.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         StorageEngine                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌────────────────┐   ┌──────────────────┐  │
//! │  │ BlockAllocator │──▶│ WriteBuffer    │──▶│ IoSubmitter      │  │
//! │  │ (tails)        │   │ StripePool     │   │ (flush)          │  │
//! │  └───────┬────────┘   └───────┬────────┘   └──────────────────┘  │
//! │          ▼                    ▼                                  │
//! │  ┌─────────────────────────────────────┐   ┌──────────────────┐  │
//! │  │ AllocationContext (segments, SSD    │◀──│ GarbageCollector │  │
//! │  │ cursor, GC mode, rebuild targets)   │   │ (copier + stages)│  │
//! │  └─────────────────────────────────────┘   └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory implementations of the domain ports
//! - [`address`] - Address types and array geometry
//! - [`allocator`] - Block allocation, stripes and the write buffer pool
//! - [`config`] - YAML configuration
//! - [`domain`] - Ports and engine events
//! - [`engine`] - Composition root and front-end write/read path
//! - [`error`] - Error types
//! - [`gc`] - Garbage collection copier and pipeline
//! - [`metrics`] - Prometheus metrics
//! - [`scheduler`] - Event worker pool

pub mod adapters;
pub mod address;
pub mod allocator;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gc;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use allocator::{Allocation, AllocationContext, BlockAllocator, WriteBufferStripePool};
pub use config::EngineConfig;
pub use engine::{EngineAdapters, StorageEngine};
pub use error::{Error, Result};
pub use gc::GarbageCollector;
pub use metrics::EngineMetrics;
