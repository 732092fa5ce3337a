//! Error types for the stripe placement engine
//!
//! Running out of write-buffer stripes or free segments is not an error
//! here. Those outcomes travel as [`crate::allocator::Allocation`] values.
//! The variants below describe protocol violations by a caller, broken
//! counters, and failures of external collaborators.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the placement engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid geometry
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Config file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Metric registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Addressing Errors
    // =========================================================================
    /// Volume id outside the configured range
    #[error("Volume {volume_id} is out of range (max {max_volumes})")]
    VolumeOutOfRange { volume_id: u32, max_volumes: u32 },

    /// Volume not registered with the engine
    #[error("Volume {0} does not exist")]
    VolumeNotFound(u32),

    /// Volume registered twice
    #[error("Volume {0} already exists")]
    VolumeExists(u32),

    /// RBA outside the volume
    #[error("RBA range {start}+{count} exceeds volume {volume_id} size {size}")]
    RbaOutOfRange {
        volume_id: u32,
        start: u64,
        count: u32,
        size: u64,
    },

    /// Write buffer stripe id outside the pool
    #[error("Write buffer stripe {0} is out of range")]
    WbStripeOutOfRange(u32),

    // =========================================================================
    // Allocation Protocol Errors
    // =========================================================================
    /// Zero-length request
    #[error("Invalid block count {count} for {operation}")]
    InvalidBlockCount { operation: &'static str, count: u32 },

    /// Segment valid-count went below zero
    #[error("Valid block count underflow on segment {segment_id}: {current} - {decrement}")]
    ValidCountUnderflow {
        segment_id: u32,
        current: u32,
        decrement: u32,
    },

    /// Segment valid-count exceeded the segment capacity
    #[error("Valid block count overflow on segment {segment_id}: {current} + {increment} > {capacity}")]
    ValidCountOverflow {
        segment_id: u32,
        current: u32,
        increment: u32,
        capacity: u32,
    },

    /// Segment is in a state that contradicts the request
    #[error("Segment {segment_id} is in state {state} which is inconsistent with {operation}")]
    SegmentStateInconsistent {
        segment_id: u32,
        state: String,
        operation: &'static str,
    },

    // =========================================================================
    // Stripe Lifecycle Errors
    // =========================================================================
    /// Remaining-block counter would go negative
    #[error("Stripe {wb_lsid} remaining underflow: {remaining} - {decrement}")]
    RemainingUnderflow {
        wb_lsid: u32,
        remaining: u32,
        decrement: u32,
    },

    /// Reference count would go negative
    #[error("Stripe {wb_lsid} reference underflow: {refs} - {decrement}")]
    ReferenceUnderflow {
        wb_lsid: u32,
        refs: u32,
        decrement: u32,
    },

    /// Stripe still pinned by readers
    #[error("Stripe {wb_lsid} is still referenced ({refs} outstanding)")]
    StripeReferenced { wb_lsid: u32, refs: u32 },

    /// Write buffer stripe is already free
    #[error("Write buffer stripe {0} is not allocated")]
    WbStripeNotAllocated(u32),

    /// Reverse map offset outside the stripe
    #[error("Reverse map offset {offset} exceeds stripe capacity {capacity}")]
    ReverseMapOffset { offset: u32, capacity: u32 },

    // =========================================================================
    // Rebuild Errors
    // =========================================================================
    /// Nothing to stop
    #[error("No rebuild target segments are registered")]
    NoRebuildTarget,

    /// Replay handed an impossible tail
    #[error("Cannot reconstruct active stripe {vsid}: {reason}")]
    ReconstructFailed { vsid: u32, reason: String },

    // =========================================================================
    // GC Errors
    // =========================================================================
    /// Victim stripe reverse map missing
    #[error("Reverse map of victim stripe {0} is not available")]
    ReverseMapMissing(u32),

    /// GC buffer bookkeeping mismatch
    #[error("GC buffer {buffer_id} for volume {volume_id}: {reason}")]
    GcBuffer {
        buffer_id: u32,
        volume_id: u32,
        reason: String,
    },

    // =========================================================================
    // I/O and Journal Errors
    // =========================================================================
    /// Backend I/O failed
    #[error("I/O submission failed on stripe {lsid}: {reason}")]
    IoFailed { lsid: u32, reason: String },

    /// Journal rejected an entry
    #[error("Journal write failed: {0}")]
    Journal(String),
}
