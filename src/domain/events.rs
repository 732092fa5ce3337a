//! Engine Events
//!
//! Audit records for state transitions an operator cares about. Producers
//! never block on delivery: they push into an [`EventSink`], and the
//! garbage collector's async loop forwards the queue to an
//! [`EventPublisher`](super::ports::EventPublisher).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::address::{SegmentId, VolumeId};

/// A significant allocator or GC occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    // =========================================================================
    // Segment Events
    // =========================================================================
    /// A free segment was opened for writing.
    SegmentAllocated {
        segment_id: SegmentId,
        free_segments: u32,
        timestamp: DateTime<Utc>,
    },

    /// A segment lost its last valid block and returned to the free pool.
    SegmentFreed {
        segment_id: SegmentId,
        free_segments: u32,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Allocation Events
    // =========================================================================
    /// User block allocation was blocked.
    AllocationProhibited { reason: String, timestamp: DateTime<Utc> },

    /// User block allocation resumed.
    AllocationPermitted { timestamp: DateTime<Utc> },

    // =========================================================================
    // Rebuild Events
    // =========================================================================
    /// A rebuild target set was computed.
    RebuildTargetsPrepared {
        segments: usize,
        stale_cleared: usize,
        timestamp: DateTime<Utc>,
    },

    /// The rebuild target set was dropped.
    RebuildStopped { timestamp: DateTime<Utc> },

    // =========================================================================
    // GC Events
    // =========================================================================
    /// GC picked a victim.
    VictimSelected {
        segment_id: SegmentId,
        valid_blocks: u32,
        timestamp: DateTime<Utc>,
    },

    /// Every valid block of a victim was moved.
    VictimReclaimed {
        segment_id: SegmentId,
        copied_blocks: u64,
        timestamp: DateTime<Utc>,
    },

    /// A flush completion gave up waiting politely for block ownership.
    OwnershipEscalated {
        volume_id: VolumeId,
        retries: u32,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Short type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::SegmentAllocated { .. } => "SegmentAllocated",
            EngineEvent::SegmentFreed { .. } => "SegmentFreed",
            EngineEvent::AllocationProhibited { .. } => "AllocationProhibited",
            EngineEvent::AllocationPermitted { .. } => "AllocationPermitted",
            EngineEvent::RebuildTargetsPrepared { .. } => "RebuildTargetsPrepared",
            EngineEvent::RebuildStopped { .. } => "RebuildStopped",
            EngineEvent::VictimSelected { .. } => "VictimSelected",
            EngineEvent::VictimReclaimed { .. } => "VictimReclaimed",
            EngineEvent::OwnershipEscalated { .. } => "OwnershipEscalated",
        }
    }
}

/// Non-blocking producer side of the event queue.
///
/// A sink without a receiver drops everything, which is what unit tests of
/// individual components want.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards events.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the engine is shutting down.
            let _ = tx.send(event);
        }
    }
}
