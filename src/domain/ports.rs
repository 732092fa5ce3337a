//! Domain Ports (Port/Adapter Pattern)
//!
//! The allocator core talks to its collaborators only through these traits.
//! Production adapters and test doubles both implement them, and the engine
//! composition root decides which ones to wire in.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Allocator / GC core                      │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  StripeMap │ BlockMap │ ReverseMapStore │ Journal   │    │
//! │  │  IoSubmitter │ EventScheduler │ EventPublisher      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  In-memory maps │ MemoryDevice │ LoggingPublisher   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything except [`EventPublisher`] is synchronous. These calls are made
//! from scheduler workers and from inside allocation paths, which never await.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::address::{Rba, ReverseMapEntry, StripeAddr, StripeId, VirtualBlkAddr, VolumeId};
use crate::domain::events::EngineEvent;
use crate::error::Result;

// =============================================================================
// Stripe Location Map
// =============================================================================

/// vsid → physical stripe location.
pub trait StripeMap: Send + Sync {
    /// Current location of `vsid`, or `None` if it was never published.
    fn get_lsa(&self, vsid: StripeId) -> Option<StripeAddr>;

    /// Publish a new location for `vsid`.
    fn set_lsa(&self, vsid: StripeId, addr: StripeAddr);

    fn is_in_write_buffer_area(&self, vsid: StripeId) -> bool {
        self.get_lsa(vsid)
            .map(|addr| addr.is_in_write_buffer_area())
            .unwrap_or(false)
    }

    fn is_in_user_data_area(&self, vsid: StripeId) -> bool {
        self.get_lsa(vsid)
            .map(|addr| addr.is_in_user_data_area())
            .unwrap_or(false)
    }
}

// =============================================================================
// Forward Block Map
// =============================================================================

/// One forward-map assignment inside a [`BlockMapUpdateEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapUpdate {
    pub rba: Rba,
    pub vsa: VirtualBlkAddr,
}

/// A journaled batch of forward-map assignments for one volume.
///
/// Entries carry absolute target addresses, so applying one twice leaves the
/// map exactly as applying it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapUpdateEntry {
    pub volume_id: VolumeId,
    pub updates: Vec<BlockMapUpdate>,
}

/// (volume, rba) → virtual block address.
pub trait BlockMap: Send + Sync {
    /// Register a volume of `size_blocks` blocks, all unmapped.
    fn create_volume(&self, volume_id: VolumeId, size_blocks: u64) -> Result<()>;

    /// Drop every mapping of a volume.
    fn delete_volume(&self, volume_id: VolumeId);

    /// Size of a registered volume.
    fn volume_size(&self, volume_id: VolumeId) -> Option<u64>;

    /// Current mapping, [`VirtualBlkAddr::UNMAP`] if none.
    fn get_vsa(&self, volume_id: VolumeId, rba: Rba) -> VirtualBlkAddr;

    /// Overwrite a mapping and return the previous one.
    fn set_vsa(&self, volume_id: VolumeId, rba: Rba, vsa: VirtualBlkAddr) -> VirtualBlkAddr;

    /// Apply a journaled entry (normal path and replay).
    fn apply(&self, entry: &BlockMapUpdateEntry) {
        for update in &entry.updates {
            self.set_vsa(entry.volume_id, update.rba, update.vsa);
        }
    }
}

// =============================================================================
// Reverse Map
// =============================================================================

/// Persistent per-stripe reverse maps, keyed by vsid.
pub trait ReverseMapStore: Send + Sync {
    fn store(&self, vsid: StripeId, entries: Vec<ReverseMapEntry>);

    fn load(&self, vsid: StripeId) -> Option<Vec<ReverseMapEntry>>;
}

// =============================================================================
// Journal
// =============================================================================

/// Invoked once the journal entry is durable.
pub type JournalCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Write-ahead log for block map updates.
pub trait JournalWriter: Send + Sync {
    /// Append `entry`. `on_durable` runs after the entry is persisted, or
    /// with the error if persisting failed.
    fn add_block_map_update(&self, entry: BlockMapUpdateEntry, on_durable: JournalCallback);
}

// =============================================================================
// Async I/O
// =============================================================================

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Target partition of an I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    WriteBuffer,
    UserData,
}

/// A stripe-relative physical I/O.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub direction: IoDirection,
    pub partition: PartitionType,
    pub lsid: StripeId,
    pub block_offset: u32,
    pub block_count: u32,
    /// Payload for writes
    pub data: Option<Bytes>,
}

/// Outcome passed to an [`IoCallback`].
#[derive(Debug, Clone)]
pub struct IoCompletion {
    pub lsid: StripeId,
    /// Payload for successful reads
    pub data: Option<Bytes>,
    pub error: Option<String>,
}

impl IoCompletion {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub type IoCallback = Box<dyn FnOnce(IoCompletion) + Send>;

/// Physical I/O dispatch.
pub trait IoSubmitter: Send + Sync {
    /// Submit `request`. `callback` runs exactly once, possibly inline.
    fn submit_async_io(&self, request: IoRequest, callback: IoCallback);
}

// =============================================================================
// Scheduling
// =============================================================================

/// A re-enqueueable unit of work.
pub trait Event: Send {
    /// Run one step. `false` means "could not make progress, run me again".
    fn execute(&mut self) -> bool;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "event"
    }
}

/// The only way deferred work re-enters execution.
pub trait EventScheduler: Send + Sync {
    fn enqueue(&self, event: Box<dyn Event>);
}

// =============================================================================
// Event Publishing
// =============================================================================

/// Sink for engine audit events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: EngineEvent) -> Result<()>;

    async fn publish_all(&self, events: Vec<EngineEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
