//! GC Pipeline Stages
//!
//! Each stage is an [`Event`]. A stage returning `false` is re-enqueued by
//! the scheduler untouched, so every retry decision lives in the stage's own
//! fields.
//!
//! ```text
//!  VictimRead ──(failed or short: delayed retry)──▶ VictimRead
//!      │ read
//!      ▼
//!  VictimReadCompletion ──(buffer full)──▶ FlushSubmission ──(write)──┐
//!                                                                     ▼
//!  MapUpdateCompletion ◀──(durable)── MapUpdateRequest ◀── FlushCompletion
//!   release ownership                  journal + apply       ownership
//! ```
//!
//! Ownership order: stage 3 takes every block of the destination stripe,
//! stage 4 only touches the block map while holding them, and stage 5
//! gives them back after the journal reported the update durable.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::flow_control::FlowControlType;
use super::rba_state::RbaRange;
use super::stripe_manager::{GcBlockInfo, GcWriteBuffer};
use super::victim::ValidBlock;
use super::GcContext;
use crate::address::{ReverseMapEntry, StripeAddr, StripeId, VirtualBlkAddr, VirtualBlks, VolumeId};
use crate::allocator::{Allocation, Stripe};
use crate::domain::events::EngineEvent;
use crate::domain::ports::{
    BlockMapUpdate, BlockMapUpdateEntry, Event, IoCompletion, IoDirection, IoRequest,
    PartitionType,
};

// =============================================================================
// Victim Read
// =============================================================================

/// Reads one victim stripe. The live blocks stay counted as a pending read
/// until they are copied, so a failed or short read comes back as a delayed
/// retry instead of dropping them.
pub struct VictimRead {
    gc: Arc<GcContext>,
    lsid: StripeId,
    blocks: Vec<ValidBlock>,
    failures: u32,
    retry_after: Option<Instant>,
}

impl VictimRead {
    pub fn new(gc: Arc<GcContext>, lsid: StripeId, blocks: Vec<ValidBlock>) -> Self {
        Self {
            gc,
            lsid,
            blocks,
            failures: 0,
            retry_after: None,
        }
    }

    fn retry(gc: Arc<GcContext>, lsid: StripeId, blocks: Vec<ValidBlock>, failures: u32) -> Self {
        let config = &gc.config;
        let backoff = config
            .read_retry_backoff
            .saturating_mul(1 << (failures - 1).min(16))
            .min(config.max_read_retry_backoff);
        Self {
            retry_after: Some(Instant::now() + backoff),
            failures,
            ..Self::new(gc, lsid, blocks)
        }
    }

    /// Bytes a read must return to cover every live block.
    fn needed_len(&self) -> usize {
        let block_size = self.gc.allocation_context().address_info().block_size();
        self.blocks
            .iter()
            .map(|b| (b.offset as usize + 1) * block_size)
            .max()
            .unwrap_or(0)
    }

    /// Submit the read. The live blocks move into the completion.
    pub fn submit(&mut self) {
        let gc = Arc::clone(&self.gc);
        let info = *gc.allocation_context().address_info();
        let lsid = self.lsid;
        let failures = self.failures;
        let needed = self.needed_len();
        let blocks = std::mem::take(&mut self.blocks);

        let stage = Arc::clone(&gc);
        gc.io.submit_async_io(
            IoRequest {
                direction: IoDirection::Read,
                partition: PartitionType::UserData,
                lsid,
                block_offset: 0,
                block_count: info.blks_per_stripe(),
                data: None,
            },
            Box::new(move |completion| match (completion.data, completion.error) {
                (Some(data), None) if data.len() >= needed => {
                    let scheduler = Arc::clone(&stage.scheduler);
                    scheduler.enqueue(Box::new(VictimReadCompletion::new(
                        stage, lsid, blocks, data,
                    )));
                }
                (data, error) => {
                    let reason = error.unwrap_or_else(|| {
                        format!(
                            "short read, {} of {} bytes",
                            data.map_or(0, |d| d.len()),
                            needed
                        )
                    });
                    Self::on_failure(stage, lsid, blocks, failures + 1, &reason);
                }
            }),
        );
    }

    fn on_failure(
        gc: Arc<GcContext>,
        lsid: StripeId,
        blocks: Vec<ValidBlock>,
        failures: u32,
        reason: &str,
    ) {
        gc.meta
            .stats()
            .read_failures
            .fetch_add(1, Ordering::Relaxed);
        if gc.meta.is_stop_requested() {
            error!(
                "Read of victim stripe {} failed ({}), abandoned with {} live blocks on stop",
                lsid,
                reason,
                blocks.len()
            );
            gc.meta.read_done();
            return;
        }

        warn!(
            "Read of victim stripe {} failed ({}), retry {}",
            lsid, reason, failures
        );
        let scheduler = Arc::clone(&gc.scheduler);
        scheduler.enqueue(Box::new(Self::retry(gc, lsid, blocks, failures)));
    }
}

impl Event for VictimRead {
    fn execute(&mut self) -> bool {
        if self.retry_after.is_some_and(|at| Instant::now() < at) {
            return false;
        }
        self.submit();
        true
    }

    fn name(&self) -> &'static str {
        "gc_victim_read"
    }
}

// =============================================================================
// Stage 1: Victim Read Completion
// =============================================================================

/// Copies the live blocks of one victim stripe into GC buffers.
pub struct VictimReadCompletion {
    gc: Arc<GcContext>,
    vsid: StripeId,
    blocks: Vec<ValidBlock>,
    data: Bytes,
    next: usize,
}

impl VictimReadCompletion {
    pub fn new(gc: Arc<GcContext>, vsid: StripeId, blocks: Vec<ValidBlock>, data: Bytes) -> Self {
        Self {
            gc,
            vsid,
            blocks,
            data,
            next: 0,
        }
    }

    /// Copy one grant's worth of blocks. Returns how many were recorded.
    /// [`VictimRead`] only hands over reads that cover every live block.
    fn copy_run(&self, buffer: &GcWriteBuffer, offset: u32, count: u32) -> u32 {
        let block_size = self.gc.allocation_context().address_info().block_size();
        let mut recorded = 0;
        for i in 0..count {
            let block = self.blocks[self.next + i as usize];
            let start = block.offset as usize * block_size;
            let Some(payload) = self.data.get(start..start + block_size) else {
                error!(
                    "Victim stripe {} read is short at offset {}",
                    self.vsid, block.offset
                );
                continue;
            };
            let info = GcBlockInfo {
                rba: block.rba,
                victim: block.vsa(self.vsid),
            };
            let copied = buffer
                .write_block(offset + i, payload)
                .and_then(|_| self.gc.buffers.set_blk_info(buffer, offset + i, info));
            match copied {
                Ok(()) => recorded += 1,
                Err(e) => error!("Failed to copy victim block {}: {}", info.victim, e),
            }
        }
        recorded
    }
}

impl Event for VictimReadCompletion {
    fn execute(&mut self) -> bool {
        let gc = Arc::clone(&self.gc);
        while self.next < self.blocks.len() {
            let volume_id = self.blocks[self.next].volume_id;
            let run = self.blocks[self.next..]
                .iter()
                .take_while(|b| b.volume_id == volume_id)
                .count() as u32;

            let Some(grant) = gc.buffers.allocate_gc_blocks(volume_id, run) else {
                debug!("No free GC buffer for volume {}, retrying", volume_id);
                return false;
            };

            let recorded = self.copy_run(&grant.buffer, grant.offset, grant.count);
            gc.meta.blocks_buffered(recorded);
            self.next += grant.count as usize;

            match gc
                .buffers
                .decrease_remaining_and_check_full(&grant.buffer, grant.count)
            {
                Ok(true) => gc
                    .scheduler
                    .enqueue(Box::new(FlushSubmission::new(Arc::clone(&gc), grant.buffer))),
                Ok(false) => {}
                Err(e) => error!("GC buffer accounting failed: {}", e),
            }
        }

        debug!(
            "Victim stripe {} copied ({} blocks)",
            self.vsid,
            self.blocks.len()
        );
        gc.meta.read_done();
        true
    }

    fn name(&self) -> &'static str {
        "gc_victim_read_completion"
    }
}

// =============================================================================
// Stage 2: Flush Submission
// =============================================================================

/// Writes a full GC buffer to a fresh user-area stripe.
pub struct FlushSubmission {
    gc: Arc<GcContext>,
    buffer: Arc<GcWriteBuffer>,
}

impl FlushSubmission {
    pub fn new(gc: Arc<GcContext>, buffer: Arc<GcWriteBuffer>) -> Self {
        Self { gc, buffer }
    }

    fn discard(&self) {
        let copied = self.buffer.copied_blocks();
        self.gc.buffers.release_buffer(&self.buffer);
        self.gc.meta.blocks_finished(copied);
    }
}

impl Event for FlushSubmission {
    fn execute(&mut self) -> bool {
        let gc = &self.gc;
        let volume_id = self.buffer.volume_id();

        if self.buffer.is_discarded() {
            debug!(
                "Dropping GC buffer {} of deleted volume {}",
                self.buffer.id(),
                volume_id
            );
            self.discard();
            return true;
        }

        let bps = gc.allocation_context().address_info().blks_per_stripe();
        if gc.flow_control.get_token(FlowControlType::Gc, bps) == 0 {
            return false;
        }

        let stripe = match gc.allocator.allocate_gc_dest_stripe(volume_id) {
            Ok(Allocation::Granted(stripe)) => stripe,
            Ok(denied) => {
                debug!("GC destination stripe for volume {}: {}", volume_id, denied);
                gc.flow_control.return_token(FlowControlType::Gc, bps);
                return false;
            }
            Err(e) => {
                error!("GC flush for volume {} abandoned: {}", volume_id, e);
                gc.flow_control.return_token(FlowControlType::Gc, bps);
                self.discard();
                return true;
            }
        };

        let blocks = self.buffer.block_infos();
        for (offset, block) in blocks.iter().enumerate() {
            if let Some(block) = block {
                let entry = ReverseMapEntry::new(block.rba, volume_id);
                if let Err(e) = stripe.update_reverse_map(offset as u32, entry) {
                    error!("Reverse map stamp failed: {}", e);
                }
            }
        }
        stripe.attach_data(self.buffer.take_data());
        gc.meta.begin_internal_io(volume_id);

        let completion = FlushCompletion::new(
            Arc::clone(gc),
            Arc::clone(&stripe),
            Arc::clone(&self.buffer),
            blocks,
        );
        let scheduler = Arc::clone(&gc.scheduler);
        debug!(
            "GC buffer {} flushing to stripe {}",
            self.buffer.id(),
            stripe.vsid()
        );
        stripe.flush(
            gc.io.as_ref(),
            Box::new(move |io: IoCompletion| {
                let mut completion = completion;
                completion.failure = io.error;
                scheduler.enqueue(Box::new(completion));
            }),
        );
        true
    }

    fn name(&self) -> &'static str {
        "gc_flush_submission"
    }
}

// =============================================================================
// Stage 3: Flush Completion
// =============================================================================

/// Publishes the written stripe and takes ownership of its blocks.
pub struct FlushCompletion {
    gc: Arc<GcContext>,
    stripe: Arc<Stripe>,
    buffer: Arc<GcWriteBuffer>,
    blocks: Vec<Option<GcBlockInfo>>,
    ranges: Vec<RbaRange>,
    failure: Option<String>,
    published: bool,
    retries: u32,
    backoff: Duration,
    retry_after: Option<Instant>,
    escalated: bool,
}

impl FlushCompletion {
    fn new(
        gc: Arc<GcContext>,
        stripe: Arc<Stripe>,
        buffer: Arc<GcWriteBuffer>,
        blocks: Vec<Option<GcBlockInfo>>,
    ) -> Self {
        let ranges = blocks
            .iter()
            .flatten()
            .map(|b| RbaRange::new(b.rba, 1))
            .collect();
        Self {
            gc,
            stripe,
            buffer,
            blocks,
            ranges,
            failure: None,
            published: false,
            retries: 0,
            backoff: Duration::ZERO,
            retry_after: None,
            escalated: false,
        }
    }

    fn copied(&self) -> u32 {
        self.blocks.iter().flatten().count() as u32
    }

    /// Returns false when the write failed and the stripe was abandoned.
    fn publish(&self) -> bool {
        let gc = &self.gc;
        let ctx = gc.allocation_context();
        let vsid = self.stripe.vsid();
        let lsid = self.stripe.user_lsid();
        let volume_id = self.stripe.volume_id();

        if let Some(reason) = &self.failure {
            error!(
                "GC write of stripe {} for volume {} failed: {}",
                vsid, volume_id, reason
            );
            gc.meta.stats().flush_failures.fetch_add(1, Ordering::Relaxed);
            ctx.increase_occupied_stripe(lsid);
            gc.allocator.release_gc_dest_stripe(&self.stripe);
            gc.buffers.release_buffer(&self.buffer);
            gc.meta.blocks_finished(self.copied());
            gc.meta.end_internal_io(volume_id);
            return false;
        }

        // Count the copies live before the segment can close around them;
        // stage 4 takes back the ones overwritten meanwhile.
        let copied = self.copied();
        if copied > 0 {
            let blks = VirtualBlks::new(VirtualBlkAddr::new(vsid, 0), copied);
            if let Err(e) = gc.allocator.validate_blks(blks) {
                error!("Failed to count GC copies in stripe {}: {}", vsid, e);
            }
        }
        gc.reverse_maps.store(vsid, self.stripe.reverse_map());
        gc.stripe_map.set_lsa(vsid, StripeAddr::user_area(lsid));
        self.stripe.set_finished();
        ctx.increase_occupied_stripe(lsid);
        gc.meta.stats().stripes_flushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn next_backoff(&self) -> Duration {
        let config = &self.gc.config;
        if self.backoff.is_zero() {
            config.ownership_backoff
        } else {
            (self.backoff * 2).min(config.max_ownership_backoff)
        }
    }

    fn record_ownership_miss(&mut self) {
        let gc = Arc::clone(&self.gc);
        let volume_id = self.stripe.volume_id();
        self.retries += 1;
        gc.meta
            .stats()
            .ownership_retries
            .fetch_add(1, Ordering::Relaxed);

        if self.retries % gc.config.ownership_retry_warn_threshold == 0 {
            warn!(
                "GC stripe {} waited {} times for block ownership on volume {}",
                self.stripe.vsid(),
                self.retries,
                volume_id
            );
        }

        if !self.escalated && self.retries >= gc.config.max_ownership_retries {
            self.escalated = true;
            gc.allocation_context().hold_gc_priority();
            gc.meta
                .stats()
                .ownership_escalations
                .fetch_add(1, Ordering::Relaxed);
            error!(
                "GC stripe {} could not take block ownership on volume {} after {} attempts, holding user allocation",
                self.stripe.vsid(),
                volume_id,
                self.retries
            );
            gc.allocation_context()
                .events()
                .emit(EngineEvent::OwnershipEscalated {
                    volume_id,
                    retries: self.retries,
                    timestamp: Utc::now(),
                });
        }

        self.backoff = self.next_backoff();
        self.retry_after = Some(Instant::now() + self.backoff);
    }
}

impl Event for FlushCompletion {
    fn execute(&mut self) -> bool {
        if !self.published {
            self.published = true;
            if !self.publish() {
                return true;
            }
        }

        if let Some(after) = self.retry_after {
            if Instant::now() < after {
                return false;
            }
        }

        let gc = &self.gc;
        let volume_id = self.stripe.volume_id();
        if !gc
            .rba_states
            .acquire_ownership_rba_list(volume_id, &self.ranges)
        {
            self.record_ownership_miss();
            return false;
        }

        if self.escalated {
            gc.allocation_context().release_gc_priority();
            info!(
                "GC stripe {} took block ownership after {} retries, user allocation released",
                self.stripe.vsid(),
                self.retries
            );
        }

        gc.scheduler.enqueue(Box::new(MapUpdateRequest {
            gc: Arc::clone(gc),
            stripe: Arc::clone(&self.stripe),
            buffer: Arc::clone(&self.buffer),
            blocks: std::mem::take(&mut self.blocks),
            ranges: std::mem::take(&mut self.ranges),
            overwritten_settled: false,
        }));
        true
    }

    fn name(&self) -> &'static str {
        "gc_flush_completion"
    }
}

// =============================================================================
// Stage 4: Map Update Request
// =============================================================================

/// Repoints every block still mapped at its victim copy.
#[derive(Clone)]
pub struct MapUpdateRequest {
    gc: Arc<GcContext>,
    stripe: Arc<Stripe>,
    buffer: Arc<GcWriteBuffer>,
    blocks: Vec<Option<GcBlockInfo>>,
    ranges: Vec<RbaRange>,
    overwritten_settled: bool,
}

impl MapUpdateRequest {
    fn into_completion(self, moved: u32, overwritten: u32) -> MapUpdateCompletion {
        MapUpdateCompletion {
            gc: self.gc,
            stripe: self.stripe,
            buffer: self.buffer,
            ranges: self.ranges,
            moved,
            overwritten,
        }
    }
}

impl Event for MapUpdateRequest {
    fn execute(&mut self) -> bool {
        let gc = Arc::clone(&self.gc);
        let vsid = self.stripe.vsid();
        let volume_id = self.stripe.volume_id();

        let mut updates = Vec::new();
        let mut victims = Vec::new();
        let mut overwritten = 0u32;
        for (offset, block) in self.blocks.iter().enumerate() {
            let Some(block) = block else { continue };
            if gc.block_map.get_vsa(volume_id, block.rba) == block.victim {
                updates.push(BlockMapUpdate {
                    rba: block.rba,
                    vsa: VirtualBlkAddr::new(vsid, offset as u32),
                });
                victims.push(block.victim);
            } else {
                overwritten += 1;
            }
        }

        if overwritten > 0 && !self.overwritten_settled {
            let segment_id = gc.allocation_context().address_info().segment_of(vsid);
            if let Err(e) = gc
                .allocation_context()
                .decrease_valid_blk_count(segment_id, overwritten)
            {
                error!("Failed to drop overwritten GC copies in stripe {}: {}", vsid, e);
            }
            gc.meta
                .stats()
                .overwritten_blocks
                .fetch_add(overwritten as u64, Ordering::Relaxed);
        }
        self.overwritten_settled = true;

        let moved = updates.len() as u32;
        if updates.is_empty() {
            gc.scheduler
                .enqueue(Box::new(self.clone().into_completion(0, overwritten)));
            return true;
        }

        let entry = BlockMapUpdateEntry {
            volume_id,
            updates,
        };
        let retry = self.clone();
        gc.journal.add_block_map_update(
            entry.clone(),
            Box::new(move |durable| {
                let gc = Arc::clone(&retry.gc);
                if let Err(e) = durable {
                    error!("Journal rejected GC map update for stripe {}: {}", vsid, e);
                    gc.meta
                        .stats()
                        .map_update_retries
                        .fetch_add(1, Ordering::Relaxed);
                    gc.scheduler.enqueue(Box::new(retry));
                    return;
                }

                gc.block_map.apply(&entry);
                for victim in victims {
                    if let Err(e) = gc.allocator.invalidate_blks(VirtualBlks::new(victim, 1)) {
                        error!("Failed to invalidate victim block {}: {}", victim, e);
                    }
                }
                gc.scheduler
                    .enqueue(Box::new(retry.into_completion(moved, overwritten)));
            }),
        );
        true
    }

    fn name(&self) -> &'static str {
        "gc_map_update_request"
    }
}

// =============================================================================
// Stage 5: Map Update Completion
// =============================================================================

/// Gives back ownership, the destination stripe and the GC buffer.
pub struct MapUpdateCompletion {
    gc: Arc<GcContext>,
    stripe: Arc<Stripe>,
    buffer: Arc<GcWriteBuffer>,
    ranges: Vec<RbaRange>,
    moved: u32,
    overwritten: u32,
}

impl Event for MapUpdateCompletion {
    fn execute(&mut self) -> bool {
        let gc = &self.gc;
        let volume_id: VolumeId = self.stripe.volume_id();

        gc.rba_states
            .release_ownership_rba_list(volume_id, &self.ranges);
        gc.allocator.release_gc_dest_stripe(&self.stripe);
        gc.buffers.release_buffer(&self.buffer);
        gc.meta.end_internal_io(volume_id);

        gc.meta
            .stats()
            .copied_blocks
            .fetch_add(self.moved as u64, Ordering::Relaxed);
        gc.meta.blocks_finished(self.moved + self.overwritten);
        debug!(
            "GC stripe {} done: {} blocks moved, {} overwritten",
            self.stripe.vsid(),
            self.moved,
            self.overwritten
        );
        true
    }

    fn name(&self) -> &'static str {
        "gc_map_update_completion"
    }
}
