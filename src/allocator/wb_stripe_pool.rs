//! Write Buffer Stripe Pool
//!
//! Owns the fixed arena of `num_wb_stripes` [`Stripe`] slots. Slots and their
//! data buffers are allocated once in [`WriteBufferStripePool::new`] and
//! reused for the lifetime of the array. The write-buffer LSID is the arena
//! index.
//!
//! # Flush paths
//!
//! ```text
//!  write_completed(n) ──▶ remaining hits 0 ──┐
//!                                            ├──▶ flush_stripe ──▶ IoSubmitter
//!  finish_active_stripe ──▶ pad the rest ────┘                         │
//!                                                                      ▼
//!                 on_flush_complete: store reverse map, publish UserArea,
//!                 count occupied stripe, release slot (or defer), wake waiters
//! ```
//!
//! Flush-all and rebuild preparation are the only callers that block. They
//! first close every tail they care about, then wait on a condition variable
//! that is signalled whenever a stripe drains or finishes flushing.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::context::{ActiveStripeTail, AllocationContext, TailKind};
use super::stripe::{Stripe, StripeHandle};
use crate::address::{ReverseMapEntry, SegmentId, StripeAddr, StripeId, VirtualBlkAddr, VolumeId};
use crate::domain::events::EngineEvent;
use crate::domain::ports::{IoCompletion, IoSubmitter, ReverseMapStore, StripeMap};
use crate::error::{Error, Result};

/// Re-check interval for drain waiters.
const DRAIN_RECHECK: Duration = Duration::from_millis(10);

/// Write-back attempts before a stripe is left failed in the write buffer.
const FLUSH_ATTEMPTS: u32 = 3;

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct PoolStats {
    pub flushes_submitted: AtomicU64,
    pub flushes_completed: AtomicU64,
    pub flush_failures: AtomicU64,
    pub deferred_releases: AtomicU64,
    pub padded_blocks: AtomicU64,
}

/// Serializable copy of [`PoolStats`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub flushes_submitted: u64,
    pub flushes_completed: u64,
    pub flush_failures: u64,
    pub deferred_releases: u64,
    pub padded_blocks: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            flushes_submitted: self.flushes_submitted.load(Ordering::Relaxed),
            flushes_completed: self.flushes_completed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            deferred_releases: self.deferred_releases.load(Ordering::Relaxed),
            padded_blocks: self.padded_blocks.load(Ordering::Relaxed),
        }
    }
}

/// A stripe closed by flush-all, with the identity it had when closed.
#[derive(Debug, Clone)]
pub struct ClosedStripe {
    pub stripe: Arc<Stripe>,
    pub vsid: StripeId,
    pub generation: u64,
}

// =============================================================================
// Pool
// =============================================================================

pub struct WriteBufferStripePool {
    ctx: Arc<AllocationContext>,
    stripe_map: Arc<dyn StripeMap>,
    reverse_maps: Arc<dyn ReverseMapStore>,
    io: Arc<dyn IoSubmitter>,

    slots: Vec<Arc<Stripe>>,
    pending_full_stripes: Mutex<Vec<Arc<Stripe>>>,

    drain_lock: Mutex<()>,
    drain_cv: Condvar,

    stats: PoolStats,
}

impl WriteBufferStripePool {
    pub fn new(
        ctx: Arc<AllocationContext>,
        stripe_map: Arc<dyn StripeMap>,
        reverse_maps: Arc<dyn ReverseMapStore>,
        io: Arc<dyn IoSubmitter>,
    ) -> Arc<Self> {
        let info = *ctx.address_info();
        let slots = (0..info.num_wb_stripes())
            .map(|_| Arc::new(Stripe::new(info.blks_per_stripe(), info.block_size())))
            .collect();

        info!(
            "Write buffer pool initialised with {} stripes of {} blocks",
            info.num_wb_stripes(),
            info.blks_per_stripe()
        );

        Arc::new(Self {
            ctx,
            stripe_map,
            reverse_maps,
            io,
            slots,
            pending_full_stripes: Mutex::new(Vec::new()),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
            stats: PoolStats::default(),
        })
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn context(&self) -> &Arc<AllocationContext> {
        &self.ctx
    }

    // =========================================================================
    // Slot Access
    // =========================================================================

    /// Slot by write-buffer LSID.
    pub fn stripe(&self, wb_lsid: StripeId) -> Option<Arc<Stripe>> {
        self.slots.get(wb_lsid as usize).cloned()
    }

    fn slot(&self, wb_lsid: StripeId) -> Result<&Arc<Stripe>> {
        self.slots
            .get(wb_lsid as usize)
            .ok_or(Error::WbStripeOutOfRange(wb_lsid))
    }

    /// The buffered stripe at `addr`, `None` for user-area addresses.
    pub fn get_stripe(&self, addr: &StripeAddr) -> Option<Arc<Stripe>> {
        if addr.is_in_user_data_area() {
            return None;
        }
        self.stripe(addr.id)
    }

    pub fn handle(&self, wb_lsid: StripeId) -> Option<StripeHandle> {
        self.slots.get(wb_lsid as usize).map(|s| StripeHandle {
            wb_lsid,
            generation: s.generation(),
        })
    }

    /// Resolve a handle, `None` if the slot was re-bound since.
    pub fn resolve(&self, handle: StripeHandle) -> Option<Arc<Stripe>> {
        self.stripe(handle.wb_lsid)
            .filter(|s| s.generation() == handle.generation)
    }

    pub fn num_stripes(&self) -> u32 {
        self.slots.len() as u32
    }

    // =========================================================================
    // Release and References
    // =========================================================================

    /// Return a slot to the free bitmap. Refused while readers pin it.
    ///
    /// The reference check and the bit release happen under the array lock,
    /// the same lock [`Self::refer_lsid_cnt`] pins under, so a free slot
    /// never carries a reference.
    pub fn free_wb_stripe_id(&self, wb_lsid: StripeId) -> Result<()> {
        let stripe = self.slot(wb_lsid)?;
        {
            let mut st = self.ctx.lock_state();
            let refs = stripe.ref_count();
            if refs > 0 {
                debug!("Refusing to free stripe {} with {} references", wb_lsid, refs);
                return Err(Error::StripeReferenced { wb_lsid, refs });
            }
            if !st.release_wb_stripe(wb_lsid) {
                error!("Write buffer stripe {} released twice", wb_lsid);
                return Err(Error::WbStripeNotAllocated(wb_lsid));
            }
        }
        self.ctx.decrease_used_stripe_count();
        Ok(())
    }

    /// Pin the buffered stripe at `addr`. False for user-area addresses and
    /// for slots that are not currently allocated.
    pub fn refer_lsid_cnt(&self, addr: &StripeAddr) -> bool {
        let Some(stripe) = self.get_stripe(addr) else {
            return false;
        };
        let st = self.ctx.lock_state();
        if !st.is_wb_stripe_allocated(addr.id) {
            debug!("Not pinning released write buffer stripe {}", addr.id);
            return false;
        }
        stripe.refer();
        true
    }

    /// Drop `n` pins. The last one completes a deferred release.
    pub fn derefer_lsid_cnt(&self, addr: &StripeAddr, n: u32) -> Result<()> {
        let Some(stripe) = self.get_stripe(addr) else {
            return Ok(());
        };
        if stripe.derefer(n)? == 0 && stripe.take_release_pending() {
            self.release_slot(&stripe);
        }
        Ok(())
    }

    fn release_or_defer(&self, stripe: &Arc<Stripe>) {
        if stripe.ref_count() == 0 {
            self.release_slot(stripe);
            return;
        }
        stripe.set_release_pending();
        self.stats.deferred_releases.fetch_add(1, Ordering::Relaxed);
        // The last reader may have left between the check and the flag.
        if stripe.ref_count() == 0 && stripe.take_release_pending() {
            self.release_slot(stripe);
        }
    }

    fn release_slot(&self, stripe: &Arc<Stripe>) {
        let wb_lsid = stripe.wb_lsid();
        if let Err(e) = self.free_wb_stripe_id(wb_lsid) {
            match e {
                Error::StripeReferenced { .. } => stripe.set_release_pending(),
                other => error!("Failed to release write buffer stripe {}: {}", wb_lsid, other),
            }
        }
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Blocks landed in a write-buffer stripe. Returns true if this call
    /// completed the stripe and triggered its flush.
    pub fn write_completed(self: &Arc<Self>, wb_lsid: StripeId, n: u32) -> Result<bool> {
        let stripe = Arc::clone(self.slot(wb_lsid)?);
        let remaining = stripe.decrease_blks_remaining(n)?;
        if remaining > 0 {
            return Ok(false);
        }
        self.notify_drain();
        Ok(self.flush_stripe(&stripe))
    }

    /// Submit the stripe for write-back. False if already submitted.
    pub fn flush_stripe(self: &Arc<Self>, stripe: &Arc<Stripe>) -> bool {
        let pool = Arc::clone(self);
        let target = Arc::clone(stripe);
        let generation = stripe.generation();
        let submitted = stripe.flush(
            self.io.as_ref(),
            Box::new(move |completion| pool.on_flush_complete(&target, generation, completion)),
        );
        if submitted {
            self.stats.flushes_submitted.fetch_add(1, Ordering::Relaxed);
            debug!("Flush submitted for stripe vsid {}", stripe.vsid());
        }
        submitted
    }

    fn on_flush_complete(
        self: &Arc<Self>,
        stripe: &Arc<Stripe>,
        generation: u64,
        completion: IoCompletion,
    ) {
        let binding = stripe.binding();
        if let Some(reason) = completion.error {
            self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
            self.on_flush_failure(stripe, generation, &reason);
            return;
        }

        self.reverse_maps.store(binding.vsid, stripe.reverse_map());
        self.stripe_map
            .set_lsa(binding.vsid, StripeAddr::user_area(binding.user_lsid));
        stripe.set_finished();
        self.ctx.increase_occupied_stripe(binding.user_lsid);
        self.release_or_defer(stripe);

        self.stats.flushes_completed.fetch_add(1, Ordering::Relaxed);
        self.notify_drain();
    }

    /// Resubmit a failed write-back, or give up after [`FLUSH_ATTEMPTS`] and
    /// wake drain waiters so they stop waiting on this stripe.
    fn on_flush_failure(self: &Arc<Self>, stripe: &Arc<Stripe>, generation: u64, reason: &str) {
        let binding = stripe.binding();
        if stripe.generation() != generation {
            error!("Flush failure for re-bound slot wb {} ignored", binding.wb_lsid);
            return;
        }

        let failures = stripe.record_flush_failure();
        if failures < FLUSH_ATTEMPTS {
            warn!(
                "Flush of stripe vsid {} (wb {}) failed ({}), resubmitting, attempt {}",
                binding.vsid,
                binding.wb_lsid,
                reason,
                failures + 1
            );
            self.flush_stripe(stripe);
            return;
        }

        error!(
            "Flush of stripe vsid {} (wb {}) failed {} times: {}; stripe stays in the write buffer",
            binding.vsid, binding.wb_lsid, failures, reason
        );
        stripe.mark_flush_failed();
        self.notify_drain();
    }

    // =========================================================================
    // Active Stripe Tails
    // =========================================================================

    /// Close one tail: unmap it, pad the unused blocks and flush if that
    /// completed the stripe.
    fn finish_active_stripe(self: &Arc<Self>, tail_index: usize) -> Option<ClosedStripe> {
        let bps = self.ctx.address_info().blks_per_stripe();
        let (wb_lsid, offset) = {
            let mut tail = self.ctx.tail(tail_index).lock();
            if tail.is_unmap() {
                return None;
            }
            let closed = (tail.wb_lsid, tail.vsa.offset.min(bps));
            *tail = ActiveStripeTail::UNMAP;
            closed
        };

        let stripe = match self.slot(wb_lsid) {
            Ok(stripe) => Arc::clone(stripe),
            Err(e) => {
                error!("Active tail {} points at a bad stripe: {}", tail_index, e);
                return None;
            }
        };
        let closed = ClosedStripe {
            vsid: stripe.vsid(),
            generation: stripe.generation(),
            stripe: Arc::clone(&stripe),
        };

        let unused = bps - offset;
        if unused > 0 {
            stripe.invalidate_reverse_map_from(offset);
            self.stats
                .padded_blocks
                .fetch_add(unused as u64, Ordering::Relaxed);
            match stripe.decrease_blks_remaining(unused) {
                Ok(0) => {
                    self.notify_drain();
                    self.flush_stripe(&stripe);
                }
                Ok(_) => {}
                Err(e) => error!("Failed to pad stripe vsid {}: {}", closed.vsid, e),
            }
        }
        Some(closed)
    }

    /// Close the user and GC tails of a volume.
    pub fn pick_active_stripe(self: &Arc<Self>, volume_id: VolumeId) -> Vec<ClosedStripe> {
        [TailKind::User, TailKind::Gc]
            .into_iter()
            .filter_map(|kind| self.finish_active_stripe(self.ctx.tail_index(volume_id, kind)))
            .collect()
    }

    /// Close every tail in the array.
    pub fn check_all_active_stripes(self: &Arc<Self>) -> Vec<ClosedStripe> {
        (0..self.ctx.num_tails())
            .filter_map(|index| self.finish_active_stripe(index))
            .collect()
    }

    /// Block until every closed stripe has drained and either left the write
    /// buffer or given up on its flush.
    pub fn finalize_write_io(&self, stripes: &[ClosedStripe]) {
        for closed in stripes {
            let rebound = || closed.stripe.generation() != closed.generation;
            self.wait_until(|| rebound() || closed.stripe.blks_remaining() == 0);
            self.wait_until(|| {
                !self.stripe_map.is_in_write_buffer_area(closed.vsid)
                    || (!rebound() && closed.stripe.is_flush_failed())
            });
            if !rebound() && closed.stripe.is_flush_failed() {
                warn!("Stripe vsid {} drained but its flush failed", closed.vsid);
            } else {
                debug!("Stripe vsid {} drained", closed.vsid);
            }
        }
    }

    fn wait_until(&self, done: impl Fn() -> bool) {
        let mut guard = self.drain_lock.lock();
        while !done() {
            self.drain_cv.wait_for(&mut guard, DRAIN_RECHECK);
        }
    }

    fn notify_drain(&self) {
        let _guard = self.drain_lock.lock();
        self.drain_cv.notify_all();
    }

    /// Close every tail and wait for all of it to reach the user area.
    #[instrument(skip(self))]
    pub fn flush_all_pending_stripes(self: &Arc<Self>) {
        self.flush_pending_active_stripes();
        let stripes = self.check_all_active_stripes();
        info!("Flushing {} active stripes", stripes.len());
        self.finalize_write_io(&stripes);
    }

    /// Close the tails of one volume and wait for them.
    #[instrument(skip(self))]
    pub fn flush_all_pending_stripes_in_volume(self: &Arc<Self>, volume_id: VolumeId) {
        let stripes = self.pick_active_stripe(volume_id);
        debug!(
            "Flushing {} active stripes of volume {}",
            stripes.len(),
            volume_id
        );
        self.finalize_write_io(&stripes);
    }

    // =========================================================================
    // Rebuild
    // =========================================================================

    /// Freeze allocation, snapshot allocated segments as rebuild targets,
    /// move the SSD cursor past them and push every stripe that overlaps
    /// them out of the write buffer.
    #[instrument(skip(self))]
    pub fn prepare_rebuild(self: &Arc<Self>) -> Result<()> {
        self.ctx.turn_off_blk_allocation();

        let (targets, stale) = self.ctx.make_rebuild_target();
        if stale > 0 {
            warn!("Discarded {} stale rebuild targets", stale);
        }
        if targets == 0 {
            info!("No rebuild target segment, nothing to prepare");
            self.ctx.turn_on_blk_allocation();
            return Ok(());
        }

        self.ctx.set_next_ssd_lsid();
        let target_set: BTreeSet<SegmentId> = self.ctx.rebuild_targets().into_iter().collect();
        let online = self.flush_online_stripes(&target_set);
        self.finalize_write_io(&online);

        let active = self.check_all_active_stripes();
        self.finalize_write_io(&active);

        self.ctx.turn_on_blk_allocation();
        info!("Rebuild prepared for {} segments", targets);
        Ok(())
    }

    /// Flush full-but-unflushed buffered stripes that live in `segments`.
    fn flush_online_stripes(self: &Arc<Self>, segments: &BTreeSet<SegmentId>) -> Vec<ClosedStripe> {
        let info = *self.ctx.address_info();
        let mut flushed = Vec::new();
        for stripe in &self.slots {
            if stripe.is_finished() || stripe.blks_remaining() != 0 {
                continue;
            }
            let binding = stripe.binding();
            if !segments.contains(&info.segment_of(binding.user_lsid)) {
                continue;
            }
            if !self.stripe_map.is_in_write_buffer_area(binding.vsid) {
                continue;
            }
            self.flush_stripe(stripe);
            flushed.push(ClosedStripe {
                stripe: Arc::clone(stripe),
                vsid: binding.vsid,
                generation: stripe.generation(),
            });
        }
        flushed
    }

    /// Drop the rebuild target set.
    #[instrument(skip(self))]
    pub fn stop_rebuilding(&self) -> Result<()> {
        match self.ctx.clear_rebuild_targets() {
            Ok(count) => {
                info!("Rebuild stopped, {} target segments cleared", count);
                self.ctx.events().emit(EngineEvent::RebuildStopped {
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("Stop rebuilding requested without targets");
                Err(e)
            }
        }
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Rebuild an active stripe from replayed state. `tail` is the last
    /// written position; `entries` are the replayed reverse map slots.
    pub fn reconstruct_active_stripe(
        &self,
        volume_id: VolumeId,
        wb_lsid: StripeId,
        tail: VirtualBlkAddr,
        entries: &[(u32, ReverseMapEntry)],
    ) -> Result<()> {
        let bps = self.ctx.address_info().blks_per_stripe();
        let vsid = tail.stripe_id;
        if tail.is_unmap() || tail.offset == 0 || tail.offset > bps {
            error!(
                "Cannot reconstruct stripe {} with block count {}",
                vsid, tail.offset
            );
            return Err(Error::ReconstructFailed {
                vsid,
                reason: format!("invalid block count {}", tail.offset),
            });
        }

        if let Some((offset, _)) = entries.iter().find(|(offset, _)| *offset >= bps) {
            error!(
                "Cannot reconstruct stripe {} with reverse map offset {}",
                vsid, offset
            );
            return Err(Error::ReverseMapOffset {
                offset: *offset,
                capacity: bps,
            });
        }

        let stripe = Arc::clone(self.slot(wb_lsid)?);
        if !self.ctx.lock_state().mark_wb_stripe_allocated(wb_lsid) {
            error!("Write buffer stripe {} already in use during replay", wb_lsid);
            return Err(Error::ReconstructFailed {
                vsid,
                reason: format!("write buffer stripe {} already allocated", wb_lsid),
            });
        }
        self.ctx.increase_used_stripe_count();

        stripe.assign(vsid, wb_lsid, vsid, volume_id);
        for (offset, entry) in entries {
            stripe.update_reverse_map(*offset, *entry)?;
        }
        self.stripe_map
            .set_lsa(vsid, StripeAddr::write_buffer(wb_lsid));

        if stripe.decrease_blks_remaining(tail.offset)? == 0 {
            debug!("Reconstructed stripe {} is full, flush pending", vsid);
            self.pending_full_stripes.lock().push(stripe);
        }
        Ok(())
    }

    /// Re-open a tail at its replayed position.
    pub fn restore_active_stripe_tail(
        &self,
        volume_id: VolumeId,
        kind: TailKind,
        tail: VirtualBlkAddr,
        wb_lsid: StripeId,
    ) -> Result<()> {
        self.ctx.address_info().check_volume(volume_id)?;
        let index = self.ctx.tail_index(volume_id, kind);
        *self.ctx.tail(index).lock() = ActiveStripeTail { vsa: tail, wb_lsid };
        info!(
            "Restored {:?} tail of volume {} at {} (wb {})",
            kind, volume_id, tail, wb_lsid
        );
        Ok(())
    }

    /// Flush every stripe that replay found already full.
    pub fn flush_pending_active_stripes(self: &Arc<Self>) -> usize {
        let pending = std::mem::take(&mut *self.pending_full_stripes.lock());
        let count = pending.len();
        for stripe in pending {
            self.flush_stripe(&stripe);
        }
        if count > 0 {
            info!("Flushed {} reconstructed full stripes", count);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::adapters::memory::{InMemoryReverseMapStore, InMemoryStripeMap, MemoryDevice};
    use crate::address::AddressInfo;
    use crate::allocator::{Allocation, BlockAllocator};
    use crate::config::GeometryConfig;
    use crate::domain::events::EventSink;
    use crate::domain::ports::{IoCallback, IoRequest};

    struct Fixture {
        allocator: BlockAllocator,
        pool: Arc<WriteBufferStripePool>,
        stripe_map: Arc<InMemoryStripeMap>,
        reverse_maps: Arc<InMemoryReverseMapStore>,
        device: Arc<MemoryDevice>,
    }

    /// Write device that fails the first `failures` submissions.
    struct FlakyIo {
        failures: AtomicU32,
        submitted: AtomicU32,
    }

    impl FlakyIo {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                submitted: AtomicU32::new(0),
            })
        }
    }

    impl IoSubmitter for FlakyIo {
        fn submit_async_io(&self, request: IoRequest, callback: IoCallback) {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| f.checked_sub(1))
                .is_ok();
            callback(IoCompletion {
                lsid: request.lsid,
                data: None,
                error: failed.then(|| "media error".to_string()),
            });
        }
    }

    fn geometry(num_wb_stripes: u32) -> GeometryConfig {
        GeometryConfig {
            block_size: 512,
            blks_per_stripe: 8,
            stripes_per_segment: 2,
            num_segments: 16,
            num_wb_stripes,
            max_volumes: 2,
        }
    }

    fn build(
        num_wb_stripes: u32,
        io: Arc<dyn IoSubmitter>,
    ) -> (BlockAllocator, Arc<WriteBufferStripePool>, Arc<InMemoryStripeMap>, Arc<InMemoryReverseMapStore>) {
        let info = AddressInfo::new(&geometry(num_wb_stripes)).unwrap();
        let ctx = Arc::new(AllocationContext::new(info, 4, 2, EventSink::disabled()));
        let stripe_map = Arc::new(InMemoryStripeMap::new());
        let reverse_maps = Arc::new(InMemoryReverseMapStore::new());
        let pool = WriteBufferStripePool::new(ctx, stripe_map.clone(), reverse_maps.clone(), io);
        let allocator = BlockAllocator::new(Arc::clone(&pool), stripe_map.clone(), false);
        (allocator, pool, stripe_map, reverse_maps)
    }

    fn fixture(num_wb_stripes: u32) -> Fixture {
        let device = Arc::new(MemoryDevice::new(512));
        let (allocator, pool, stripe_map, reverse_maps) = build(num_wb_stripes, device.clone());
        Fixture {
            allocator,
            pool,
            stripe_map,
            reverse_maps,
            device,
        }
    }

    fn allocate(f: &Fixture, volume_id: VolumeId, n: u32) -> (StripeId, StripeId) {
        match f.allocator.allocate_write_buffer_blks(volume_id, n).unwrap() {
            Allocation::Granted(grant) => {
                f.allocator.validate_blks(grant.blks).unwrap();
                (grant.blks.start_vsa.stripe_id, grant.wb_lsid)
            }
            other => panic!("expected a grant, got {}", other),
        }
    }

    // =========================================================================
    // Reference Tests
    // =========================================================================

    #[test]
    fn test_referenced_stripe_not_freed() {
        let f = fixture(4);
        let (vsid, wb_lsid) = allocate(&f, 0, 8);
        let addr = StripeAddr::write_buffer(wb_lsid);

        assert!(f.pool.refer_lsid_cnt(&addr));
        assert!(matches!(
            f.pool.free_wb_stripe_id(wb_lsid),
            Err(Error::StripeReferenced { refs: 1, .. })
        ));

        // Flush completes while a reader pins the slot.
        f.pool.write_completed(wb_lsid, 8).unwrap();
        assert!(f.stripe_map.is_in_user_data_area(vsid));
        assert!(f.pool.context().lock_state().is_wb_stripe_allocated(wb_lsid));
        assert_eq!(f.pool.stats().snapshot().deferred_releases, 1);

        f.pool.derefer_lsid_cnt(&addr, 1).unwrap();
        assert!(!f.pool.context().lock_state().is_wb_stripe_allocated(wb_lsid));
    }

    #[test]
    fn test_released_slot_cannot_be_pinned() {
        let f = fixture(1);
        let (_, wb_lsid) = allocate(&f, 0, 8);
        f.pool.write_completed(wb_lsid, 8).unwrap();
        assert!(!f.pool.context().lock_state().is_wb_stripe_allocated(wb_lsid));

        let addr = StripeAddr::write_buffer(wb_lsid);
        assert!(!f.pool.refer_lsid_cnt(&addr));
        assert_eq!(f.pool.stripe(wb_lsid).unwrap().ref_count(), 0);
    }

    #[test]
    fn test_pinned_slot_not_reallocated() {
        let f = fixture(1);
        let (_, wb_lsid) = allocate(&f, 0, 8);
        let addr = StripeAddr::write_buffer(wb_lsid);
        assert!(f.pool.refer_lsid_cnt(&addr));
        f.pool.write_completed(wb_lsid, 8).unwrap();

        assert_eq!(
            f.allocator.allocate_write_buffer_blks(0, 8).unwrap(),
            Allocation::Exhausted
        );
        assert_eq!(f.pool.stripe(wb_lsid).unwrap().ref_count(), 1);

        f.pool.derefer_lsid_cnt(&addr, 1).unwrap();
        assert!(f.allocator.allocate_write_buffer_blks(0, 8).unwrap().is_granted());
    }

    #[test]
    fn test_allocation_skips_free_but_referenced_slot() {
        let f = fixture(2);
        // Force the broken state directly: slot 0 free in the bitmap yet pinned.
        f.pool.stripe(0).unwrap().refer();

        let (_, wb_lsid) = allocate(&f, 0, 8);
        assert_eq!(wb_lsid, 1);
        assert_eq!(
            f.allocator.allocate_write_buffer_blks(1, 8).unwrap(),
            Allocation::Exhausted
        );
    }

    #[test]
    fn test_user_area_address_not_pinned() {
        let f = fixture(4);
        assert!(!f.pool.refer_lsid_cnt(&StripeAddr::user_area(3)));
        f.pool.derefer_lsid_cnt(&StripeAddr::user_area(3), 1).unwrap();
    }

    #[test]
    fn test_handle_goes_stale_after_reuse() {
        let f = fixture(1);
        let (_, wb_lsid) = allocate(&f, 0, 8);
        let handle = f.pool.handle(wb_lsid).unwrap();
        assert!(f.pool.resolve(handle).is_some());

        f.pool.write_completed(wb_lsid, 8).unwrap();
        let (_, reused) = allocate(&f, 0, 8);
        assert_eq!(reused, wb_lsid);
        assert!(f.pool.resolve(handle).is_none());
    }

    // =========================================================================
    // Flush Tests
    // =========================================================================

    #[test]
    fn test_flush_all_pads_open_tails() {
        let f = fixture(4);
        let (vsid_a, wb_a) = allocate(&f, 0, 3);
        let (vsid_b, wb_b) = allocate(&f, 1, 5);
        f.pool.write_completed(wb_a, 3).unwrap();
        f.pool.write_completed(wb_b, 5).unwrap();

        f.pool.flush_all_pending_stripes();

        assert!(f.stripe_map.is_in_user_data_area(vsid_a));
        assert!(f.stripe_map.is_in_user_data_area(vsid_b));
        assert!(f.pool.context().active_tail(0, TailKind::User).is_unmap());
        assert_eq!(f.pool.stats().snapshot().padded_blocks, 8);

        let reverse = f.reverse_maps.load(vsid_a).unwrap();
        assert!(reverse.iter().skip(3).all(|e| !e.is_valid()));
    }

    #[test]
    fn test_flush_all_waits_for_in_flight_writes() {
        let f = fixture(4);
        let (vsid, wb_lsid) = allocate(&f, 0, 4);
        f.device.set_deferred(true);

        let pool = Arc::clone(&f.pool);
        let flusher = thread::spawn(move || pool.flush_all_pending_stripes_in_volume(0));

        thread::sleep(Duration::from_millis(30));
        assert!(!flusher.is_finished());

        // The write lands, the padded stripe flushes, the device completes.
        f.pool.write_completed(wb_lsid, 4).unwrap();
        while f.device.deferred_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        f.device.complete_deferred();

        flusher.join().unwrap();
        assert!(f.stripe_map.is_in_user_data_area(vsid));
    }

    #[test]
    fn test_failed_flush_is_resubmitted() {
        let io = FlakyIo::new(1);
        let (allocator, pool, stripe_map, _) = build(4, io.clone());
        let grant = allocator.allocate_write_buffer_blks(0, 8).unwrap().granted().unwrap();
        let vsid = grant.blks.start_vsa.stripe_id;

        pool.write_completed(grant.wb_lsid, 8).unwrap();

        assert_eq!(io.submitted.load(Ordering::SeqCst), 2);
        assert!(stripe_map.is_in_user_data_area(vsid));
        assert!(!pool.context().lock_state().is_wb_stripe_allocated(grant.wb_lsid));
        let stats = pool.stats().snapshot();
        assert_eq!(stats.flush_failures, 1);
        assert_eq!(stats.flushes_completed, 1);
    }

    #[test]
    fn test_flush_all_returns_after_flush_gives_up() {
        let io = FlakyIo::new(u32::MAX);
        let (allocator, pool, stripe_map, _) = build(4, io.clone());
        let grant = allocator.allocate_write_buffer_blks(0, 3).unwrap().granted().unwrap();
        let vsid = grant.blks.start_vsa.stripe_id;
        pool.write_completed(grant.wb_lsid, 3).unwrap();

        let flusher = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.flush_all_pending_stripes())
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flusher.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(flusher.is_finished());
        flusher.join().unwrap();

        let stripe = pool.stripe(grant.wb_lsid).unwrap();
        assert!(stripe.is_flush_failed());
        assert_eq!(io.submitted.load(Ordering::SeqCst), FLUSH_ATTEMPTS);
        assert_eq!(pool.stats().snapshot().flush_failures, FLUSH_ATTEMPTS as u64);
        // Data stays buffered and the slot stays taken.
        assert!(stripe_map.is_in_write_buffer_area(vsid));
        assert!(pool.context().lock_state().is_wb_stripe_allocated(grant.wb_lsid));
    }

    // =========================================================================
    // Rebuild Tests
    // =========================================================================

    #[test]
    fn test_prepare_rebuild_twice_starts_fresh() {
        let f = fixture(8);
        let (_, wb_lsid) = allocate(&f, 0, 8);
        f.pool.write_completed(wb_lsid, 8).unwrap();
        let (_, open) = allocate(&f, 0, 2);
        f.pool.write_completed(open, 2).unwrap();

        f.pool.prepare_rebuild().unwrap();
        let ctx = f.pool.context();
        assert_eq!(ctx.rebuild_targets(), vec![0]);
        assert!(!ctx.is_blk_allocation_off());

        f.pool.prepare_rebuild().unwrap();
        assert_eq!(ctx.rebuild_target_count(), 1);

        f.pool.stop_rebuilding().unwrap();
        assert!(matches!(f.pool.stop_rebuilding(), Err(Error::NoRebuildTarget)));
    }

    #[test]
    fn test_prepare_rebuild_moves_cursor_off_targets() {
        let f = fixture(8);
        let (_, wb_lsid) = allocate(&f, 0, 8);
        f.pool.write_completed(wb_lsid, 8).unwrap();
        f.pool.prepare_rebuild().unwrap();

        let (vsid, _) = allocate(&f, 0, 1);
        assert_eq!(vsid, 2);
        let segment = f.pool.context().address_info().segment_of(vsid);
        assert!(!f.pool.context().is_rebuild_target(segment));
    }

    // =========================================================================
    // Replay Tests
    // =========================================================================

    #[test]
    fn test_reconstruct_rejects_empty_stripe() {
        let f = fixture(4);
        assert!(matches!(
            f.pool
                .reconstruct_active_stripe(0, 1, VirtualBlkAddr::new(6, 0), &[]),
            Err(Error::ReconstructFailed { vsid: 6, .. })
        ));
        assert!(!f.pool.context().lock_state().is_wb_stripe_allocated(1));
    }

    #[test]
    fn test_reconstruct_bad_entry_leaves_slot_free() {
        let f = fixture(4);
        let ctx = f.pool.context();
        let used = ctx.used_stripe_count();
        let entries = [(2, ReverseMapEntry::new(5, 0)), (9, ReverseMapEntry::new(6, 0))];

        assert!(matches!(
            f.pool
                .reconstruct_active_stripe(0, 1, VirtualBlkAddr::new(6, 3), &entries),
            Err(Error::ReverseMapOffset { offset: 9, capacity: 8 })
        ));
        assert!(!ctx.lock_state().is_wb_stripe_allocated(1));
        assert_eq!(ctx.used_stripe_count(), used);
        assert!(f.stripe_map.get_lsa(6).is_none());

        // The same slot is still available to a valid replay.
        f.pool
            .reconstruct_active_stripe(0, 1, VirtualBlkAddr::new(6, 3), &entries[..1])
            .unwrap();
        assert!(ctx.lock_state().is_wb_stripe_allocated(1));
    }

    #[test]
    fn test_reconstruct_full_stripe_flushes_on_request() {
        let f = fixture(4);
        let entries: Vec<(u32, ReverseMapEntry)> =
            (0..8).map(|i| (i, ReverseMapEntry::new(100 + i as u64, 0))).collect();
        f.pool
            .reconstruct_active_stripe(0, 2, VirtualBlkAddr::new(6, 8), &entries)
            .unwrap();
        assert!(f.stripe_map.is_in_write_buffer_area(6));

        assert_eq!(f.pool.flush_pending_active_stripes(), 1);
        assert!(f.stripe_map.is_in_user_data_area(6));
        assert_eq!(f.reverse_maps.load(6).unwrap()[7], ReverseMapEntry::new(107, 0));
    }

    #[test]
    fn test_restored_tail_continues_allocation() {
        let f = fixture(4);
        f.pool
            .reconstruct_active_stripe(1, 0, VirtualBlkAddr::new(4, 3), &[])
            .unwrap();
        f.pool
            .restore_active_stripe_tail(1, TailKind::User, VirtualBlkAddr::new(4, 3), 0)
            .unwrap();

        match f.allocator.allocate_write_buffer_blks(1, 2).unwrap() {
            Allocation::Granted(grant) => {
                assert_eq!(grant.blks.start_vsa, VirtualBlkAddr::new(4, 3));
                assert_eq!(grant.wb_lsid, 0);
            }
            other => panic!("expected a grant, got {}", other),
        }
    }
}
