//! Garbage Collection
//!
//! Reclaims segments by moving their live blocks into fresh stripes. The
//! copier picks a victim and feeds a five-stage event pipeline; every stage
//! that cannot make progress goes back to the scheduler.
//!
//! ```text
//!   Copier ── ThresholdCheck ─▶ CopyPrepare ─▶ CopyComplete ─┐
//!     ▲            (victim)      │ read stripe               │
//!     └──────────────────────────┼───────────────────────────┘
//!                                ▼
//!   1 VictimReadCompletion   copy live blocks into GC buffers
//!   2 FlushSubmission        token + destination stripe + write
//!   3 FlushCompletion        publish stripe, take block ownership
//!   4 MapUpdateRequest       journal, then repoint the block map
//!   5 MapUpdateCompletion    release ownership and buffers
//! ```
//!
//! [`GarbageCollector`] owns the copier's shared progress counters and the
//! async loop that forwards engine events and refreshes metrics.

pub mod copier;
pub mod flow_control;
pub mod pipeline;
pub mod rba_state;
pub mod stripe_manager;
pub mod victim;

#[cfg(test)]
mod proptest;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::address::{SegmentId, VolumeId};
use crate::allocator::{AllocationContext, BlockAllocator, GcMode};
use crate::config::GcConfig;
use crate::domain::events::EngineEvent;
use crate::domain::ports::{
    BlockMap, EventPublisher, EventScheduler, IoSubmitter, JournalWriter, ReverseMapStore,
    StripeMap,
};
use crate::metrics::EngineMetrics;

pub use copier::{Copier, CopierState};
pub use flow_control::{FlowControl, FlowControlType};
pub use rba_state::{RbaRange, RbaStateManager};
pub use stripe_manager::{GcBlockInfo, GcStripeManager, GcWriteBuffer};
pub use victim::{ValidBlock, VictimStripe};

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct GcStats {
    pub victims_selected: AtomicU64,
    pub victims_reclaimed: AtomicU64,
    pub copied_blocks: AtomicU64,
    pub overwritten_blocks: AtomicU64,
    pub stripes_flushed: AtomicU64,
    pub flush_failures: AtomicU64,
    pub read_failures: AtomicU64,
    pub ownership_retries: AtomicU64,
    pub ownership_escalations: AtomicU64,
    pub map_update_retries: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStatsSnapshot {
    pub victims_selected: u64,
    pub victims_reclaimed: u64,
    pub copied_blocks: u64,
    pub overwritten_blocks: u64,
    pub stripes_flushed: u64,
    pub flush_failures: u64,
    pub read_failures: u64,
    pub ownership_retries: u64,
    pub ownership_escalations: u64,
    pub map_update_retries: u64,
}

impl GcStats {
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            victims_selected: self.victims_selected.load(Ordering::Relaxed),
            victims_reclaimed: self.victims_reclaimed.load(Ordering::Relaxed),
            copied_blocks: self.copied_blocks.load(Ordering::Relaxed),
            overwritten_blocks: self.overwritten_blocks.load(Ordering::Relaxed),
            stripes_flushed: self.stripes_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            ownership_retries: self.ownership_retries.load(Ordering::Relaxed),
            ownership_escalations: self.ownership_escalations.load(Ordering::Relaxed),
            map_update_retries: self.map_update_retries.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Copier Progress
// =============================================================================

/// Progress shared between the copier and the pipeline stages.
#[derive(Debug, Default)]
pub struct CopierMeta {
    running: AtomicBool,
    paused: AtomicBool,
    stop_requested: AtomicBool,
    victim: Mutex<Option<SegmentId>>,
    /// Victim stripes read but not yet copied into GC buffers
    pending_reads: AtomicU32,
    /// Blocks copied into GC buffers that have not left stage 5
    outstanding_blocks: AtomicU64,
    internal_io: Mutex<HashMap<VolumeId, u32>>,
    internal_io_drained: Condvar,
    stats: GcStats,
}

impl CopierMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn set_stopped(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn victim(&self) -> Option<SegmentId> {
        *self.victim.lock()
    }

    pub(crate) fn set_victim(&self, victim: Option<SegmentId>) {
        *self.victim.lock() = victim;
    }

    pub fn pending_reads(&self) -> u32 {
        self.pending_reads.load(Ordering::Acquire)
    }

    pub(crate) fn read_submitted(&self) {
        self.pending_reads.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn read_done(&self) {
        let _ = self
            .pending_reads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    pub fn outstanding_blocks(&self) -> u64 {
        self.outstanding_blocks.load(Ordering::Acquire)
    }

    pub(crate) fn blocks_buffered(&self, n: u32) {
        self.outstanding_blocks.fetch_add(n as u64, Ordering::AcqRel);
    }

    pub(crate) fn blocks_finished(&self, n: u32) {
        let _ = self
            .outstanding_blocks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                c.checked_sub(n as u64)
            });
    }

    // =========================================================================
    // Internal I/O per Volume
    // =========================================================================

    pub fn pending_internal_io(&self, volume_id: VolumeId) -> u32 {
        self.internal_io
            .lock()
            .get(&volume_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn begin_internal_io(&self, volume_id: VolumeId) {
        *self.internal_io.lock().entry(volume_id).or_insert(0) += 1;
    }

    pub(crate) fn end_internal_io(&self, volume_id: VolumeId) {
        let mut pending = self.internal_io.lock();
        if let Some(count) = pending.get_mut(&volume_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(&volume_id);
                self.internal_io_drained.notify_all();
            }
        }
    }

    /// Block until the volume has no GC stripe in flight. False on timeout.
    pub fn wait_internal_io_drained(&self, volume_id: VolumeId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.internal_io.lock();
        while pending.contains_key(&volume_id) {
            if self
                .internal_io_drained
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return !pending.contains_key(&volume_id);
            }
        }
        true
    }
}

// =============================================================================
// Shared GC Context
// =============================================================================

/// Everything a GC stage touches. Stages hold it by `Arc`.
pub struct GcContext {
    pub config: GcConfig,
    pub allocator: Arc<BlockAllocator>,
    pub stripe_map: Arc<dyn StripeMap>,
    pub block_map: Arc<dyn BlockMap>,
    pub reverse_maps: Arc<dyn ReverseMapStore>,
    pub journal: Arc<dyn JournalWriter>,
    pub io: Arc<dyn IoSubmitter>,
    pub scheduler: Arc<dyn EventScheduler>,
    pub rba_states: Arc<RbaStateManager>,
    pub flow_control: Arc<FlowControl>,
    pub buffers: Arc<GcStripeManager>,
    pub meta: Arc<CopierMeta>,
}

impl GcContext {
    pub fn allocation_context(&self) -> &Arc<AllocationContext> {
        self.allocator.context()
    }
}

// =============================================================================
// Garbage Collector
// =============================================================================

/// Point-in-time view of the collector.
#[derive(Debug, Clone, Serialize)]
pub struct GcStatus {
    pub running: bool,
    pub paused: bool,
    pub mode: GcMode,
    pub free_segments: u32,
    pub victim: Option<SegmentId>,
    pub outstanding_blocks: u64,
    pub buffers_in_use: u32,
    pub stats: GcStatsSnapshot,
}

pub struct GarbageCollector {
    gc: Arc<GcContext>,
    publisher: Arc<dyn EventPublisher>,
    events: Mutex<Option<UnboundedReceiver<EngineEvent>>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl GarbageCollector {
    pub fn new(
        gc: Arc<GcContext>,
        publisher: Arc<dyn EventPublisher>,
        events: UnboundedReceiver<EngineEvent>,
        metrics: Option<Arc<EngineMetrics>>,
    ) -> Self {
        Self {
            gc,
            publisher,
            events: Mutex::new(Some(events)),
            metrics,
        }
    }

    pub fn context(&self) -> &Arc<GcContext> {
        &self.gc
    }

    /// Enqueue the copier. False if it is already running.
    pub fn start(&self) -> bool {
        let meta = &self.gc.meta;
        if meta.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        meta.stop_requested.store(false, Ordering::Release);
        self.gc
            .scheduler
            .enqueue(Box::new(Copier::new(Arc::clone(&self.gc))));
        info!("GC copier started");
        true
    }

    /// Stop picking new victims. The current victim finishes first.
    pub fn pause(&self) {
        if !self.gc.meta.paused.swap(true, Ordering::AcqRel) {
            info!("GC paused");
        }
    }

    pub fn resume(&self) {
        if self.gc.meta.paused.swap(false, Ordering::AcqRel) {
            info!("GC resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.gc.meta.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.gc.meta.is_running()
    }

    /// Ask the copier to end once its in-flight work drains.
    pub fn stop(&self) {
        self.gc.meta.stop_requested.store(true, Ordering::Release);
        info!("GC stop requested");
    }

    pub fn status(&self) -> GcStatus {
        let ctx = self.gc.allocation_context();
        let meta = &self.gc.meta;
        GcStatus {
            running: meta.is_running(),
            paused: meta.is_paused(),
            mode: ctx.gc_mode(),
            free_segments: ctx.free_segment_count(),
            victim: meta.victim(),
            outstanding_blocks: meta.outstanding_blocks(),
            buffers_in_use: self.gc.buffers.buffers_in_use(),
            stats: meta.stats().snapshot(),
        }
    }

    /// Forward engine events to the publisher and refresh metrics until
    /// cancelled.
    #[instrument(skip(self, cancel))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut events) = self.events.lock().take() else {
            warn!("GC event loop is already running");
            return;
        };
        info!(
            "GC event loop started, poll interval {:?}",
            self.gc.config.poll_interval
        );

        let mut tick = interval(self.gc.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("GC event loop shutting down");
                    break;
                }
                Some(event) = events.recv() => {
                    self.publish(event).await;
                }
                _ = tick.tick() => {
                    if let Some(metrics) = &self.metrics {
                        metrics.refresh();
                    }
                    let status = self.status();
                    debug!(
                        "GC mode {} with {} free segments, victim {:?}",
                        status.mode, status.free_segments, status.victim
                    );
                }
            }
        }

        while let Ok(event) = events.try_recv() {
            self.publish(event).await;
        }
    }

    async fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!("Failed to publish engine event: {}", e);
        }
    }
}
