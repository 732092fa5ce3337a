//! Block Allocator
//!
//! Hands out runs of virtual blocks from a volume's active stripe tail and
//! rolls the tail over to a fresh stripe pair when it is closed.
//!
//! ```text
//!  allocate_write_buffer_blks(vol, n)
//!        │  tail lock (vol, User)
//!        ▼
//!  tail closed? ──yes──▶ allocate_stripe
//!        │                 │ array lock: wb bit + SSD cursor
//!        │                 │   user half failed → wb bit returned
//!        │                 ▼
//!        │               assign slot, publish location, tail = (vsid, 0)
//!        ▼
//!  grant min(n, bps - offset), advance tail
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use super::context::{ActiveStripeTail, AllocationContext, TailKind};
use super::stripe::Stripe;
use super::wb_stripe_pool::WriteBufferStripePool;
use super::Allocation;
use crate::address::{
    AddressInfo, StripeAddr, StripeId, VirtualBlkAddr, VirtualBlks, VolumeId, UNMAP_STRIPE,
};
use crate::domain::ports::StripeMap;
use crate::error::{Error, Result};

/// A run of blocks and the write-buffer stripe that holds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGrant {
    pub blks: VirtualBlks,
    pub wb_lsid: StripeId,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct AllocatorStats {
    pub grants: AtomicU64,
    pub blocks_granted: AtomicU64,
    pub stripes_allocated: AtomicU64,
    pub gc_dest_stripes: AtomicU64,
    pub exhausted: AtomicU64,
    pub prohibited: AtomicU64,
    pub rollbacks: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStatsSnapshot {
    pub grants: u64,
    pub blocks_granted: u64,
    pub stripes_allocated: u64,
    pub gc_dest_stripes: u64,
    pub exhausted: u64,
    pub prohibited: u64,
    pub rollbacks: u64,
}

impl AllocatorStats {
    pub fn snapshot(&self) -> AllocatorStatsSnapshot {
        AllocatorStatsSnapshot {
            grants: self.grants.load(Ordering::Relaxed),
            blocks_granted: self.blocks_granted.load(Ordering::Relaxed),
            stripes_allocated: self.stripes_allocated.load(Ordering::Relaxed),
            gc_dest_stripes: self.gc_dest_stripes.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            prohibited: self.prohibited.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }

    fn record_denied<T>(&self, outcome: &Allocation<T>) {
        match outcome {
            Allocation::Exhausted => self.exhausted.fetch_add(1, Ordering::Relaxed),
            Allocation::Prohibited => self.prohibited.fetch_add(1, Ordering::Relaxed),
            Allocation::Granted(_) => 0,
        };
    }
}

// =============================================================================
// Block Allocator
// =============================================================================

pub struct BlockAllocator {
    ctx: Arc<AllocationContext>,
    pool: Arc<WriteBufferStripePool>,
    stripe_map: Arc<dyn StripeMap>,
    write_through: bool,
    stats: AllocatorStats,
}

impl BlockAllocator {
    pub fn new(
        pool: Arc<WriteBufferStripePool>,
        stripe_map: Arc<dyn StripeMap>,
        write_through: bool,
    ) -> Self {
        Self {
            ctx: Arc::clone(pool.context()),
            pool,
            stripe_map,
            write_through,
            stats: AllocatorStats::default(),
        }
    }

    pub fn context(&self) -> &Arc<AllocationContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &Arc<WriteBufferStripePool> {
        &self.pool
    }

    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }

    pub fn is_write_through(&self) -> bool {
        self.write_through
    }

    fn info(&self) -> &AddressInfo {
        self.ctx.address_info()
    }

    /// Blocks for a user write. The grant may be shorter than `num_blks`
    /// when the tail stripe has less room left; call again for the rest.
    pub fn allocate_write_buffer_blks(
        &self,
        volume_id: VolumeId,
        num_blks: u32,
    ) -> Result<Allocation<BlockGrant>> {
        self.allocate_blks(volume_id, num_blks, TailKind::User)
    }

    /// Blocks on the volume's GC tail. Not subject to the user-only
    /// prohibition.
    pub fn allocate_gc_write_buffer_blks(
        &self,
        volume_id: VolumeId,
        num_blks: u32,
    ) -> Result<Allocation<BlockGrant>> {
        self.allocate_blks(volume_id, num_blks, TailKind::Gc)
    }

    fn allocate_blks(
        &self,
        volume_id: VolumeId,
        num_blks: u32,
        kind: TailKind,
    ) -> Result<Allocation<BlockGrant>> {
        self.info().check_volume(volume_id)?;
        if num_blks == 0 {
            error!("Block allocation for volume {} asked for zero blocks", volume_id);
            return Err(Error::InvalidBlockCount {
                operation: "allocate_write_buffer_blks",
                count: num_blks,
            });
        }

        let bps = self.info().blks_per_stripe();
        let mut tail = self.ctx.tail(self.ctx.tail_index(volume_id, kind)).lock();

        if let Some(reason) = self.ctx.allocation_block_reason(volume_id, kind) {
            debug!("Allocation on volume {} refused: {}", volume_id, reason);
            self.stats.prohibited.fetch_add(1, Ordering::Relaxed);
            return Ok(Allocation::Prohibited);
        }

        if tail.is_closed(bps) {
            match self.allocate_stripe(volume_id, kind)? {
                Allocation::Granted(fresh) => *tail = fresh,
                Allocation::Exhausted => {
                    self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                    return Ok(Allocation::Exhausted);
                }
                Allocation::Prohibited => {
                    self.stats.prohibited.fetch_add(1, Ordering::Relaxed);
                    return Ok(Allocation::Prohibited);
                }
            }
        }

        let start = tail.vsa;
        let granted = num_blks.min(bps - start.offset);
        tail.vsa = start.advance(granted);

        self.stats.grants.fetch_add(1, Ordering::Relaxed);
        self.stats
            .blocks_granted
            .fetch_add(granted as u64, Ordering::Relaxed);

        Ok(Allocation::Granted(BlockGrant {
            blks: VirtualBlks::new(start, granted),
            wb_lsid: tail.wb_lsid,
        }))
    }

    /// Bind a new write-buffer stripe and user-area stripe to a tail. The
    /// caller holds the tail lock.
    fn allocate_stripe(
        &self,
        volume_id: VolumeId,
        kind: TailKind,
    ) -> Result<Allocation<ActiveStripeTail>> {
        let (wb_lsid, user_lsid) = {
            let mut st = self.ctx.lock_state();
            let pinned = |lsid| self.pool.stripe(lsid).is_some_and(|s| s.ref_count() > 0);
            let Some(wb_lsid) = st.alloc_wb_stripe(pinned) else {
                debug!("Write buffer exhausted for volume {}", volume_id);
                return Ok(Allocation::Exhausted);
            };
            match self.ctx.allocate_user_lsid(&mut st, kind == TailKind::User) {
                Allocation::Granted(user_lsid) => (wb_lsid, user_lsid),
                denied => {
                    st.release_wb_stripe(wb_lsid);
                    self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "User area allocation for volume {} {}, returned write buffer stripe {}",
                        volume_id, denied, wb_lsid
                    );
                    return Ok(match denied {
                        Allocation::Prohibited => Allocation::Prohibited,
                        _ => Allocation::Exhausted,
                    });
                }
            }
        };
        self.ctx.increase_used_stripe_count();

        let stripe = self
            .pool
            .stripe(wb_lsid)
            .ok_or(Error::WbStripeOutOfRange(wb_lsid))?;
        let vsid = user_lsid;
        stripe.assign(vsid, wb_lsid, user_lsid, volume_id);

        let location = if self.write_through {
            StripeAddr::user_area(user_lsid)
        } else {
            StripeAddr::write_buffer(wb_lsid)
        };
        self.stripe_map.set_lsa(vsid, location);

        self.stats.stripes_allocated.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Volume {} {:?} tail now on vsid {} (wb {})",
            volume_id, kind, vsid, wb_lsid
        );

        Ok(Allocation::Granted(ActiveStripeTail {
            vsa: VirtualBlkAddr::new(vsid, 0),
            wb_lsid,
        }))
    }

    /// A user-area stripe for a GC flush. The stripe carries no write
    /// buffer slot; the GC path attaches its own buffer.
    pub fn allocate_gc_dest_stripe(&self, volume_id: VolumeId) -> Result<Allocation<Arc<Stripe>>> {
        self.info().check_volume(volume_id)?;
        let _tail = self
            .ctx
            .tail(self.ctx.tail_index(volume_id, TailKind::Gc))
            .lock();

        if let Some(reason) = self.ctx.allocation_block_reason(volume_id, TailKind::Gc) {
            debug!("GC stripe for volume {} refused: {}", volume_id, reason);
            self.stats.prohibited.fetch_add(1, Ordering::Relaxed);
            return Ok(Allocation::Prohibited);
        }

        let outcome = {
            let mut st = self.ctx.lock_state();
            self.ctx.allocate_user_lsid(&mut st, false)
        };
        let user_lsid = match outcome {
            Allocation::Granted(lsid) => lsid,
            denied => {
                self.stats.record_denied(&denied);
                warn!("No GC destination stripe for volume {}: {}", volume_id, denied);
                return Ok(match denied {
                    Allocation::Prohibited => Allocation::Prohibited,
                    _ => Allocation::Exhausted,
                });
            }
        };
        self.ctx.increase_used_stripe_count();

        let info = self.info();
        let stripe = Arc::new(Stripe::without_buffer(
            info.blks_per_stripe(),
            info.block_size(),
        ));
        stripe.assign(user_lsid, UNMAP_STRIPE, user_lsid, volume_id);
        self.stats.gc_dest_stripes.fetch_add(1, Ordering::Relaxed);
        debug!("GC destination stripe {} for volume {}", user_lsid, volume_id);

        Ok(Allocation::Granted(stripe))
    }

    /// A GC destination stripe reached the user area.
    pub fn release_gc_dest_stripe(&self, stripe: &Stripe) {
        self.ctx.decrease_used_stripe_count();
        debug!("GC destination stripe {} released", stripe.vsid());
    }

    // =========================================================================
    // Valid Block Accounting
    // =========================================================================

    /// Count a run as live in its segment.
    pub fn validate_blks(&self, blks: VirtualBlks) -> Result<()> {
        if blks.is_unmap() {
            return Ok(());
        }
        let segment_id = self.info().segment_of(blks.start_vsa.stripe_id);
        self.ctx.increase_valid_blk_count(segment_id, blks.num_blks)
    }

    /// Drop a run from its segment's live count. Returns true if that
    /// freed the segment.
    pub fn invalidate_blks(&self, blks: VirtualBlks) -> Result<bool> {
        if blks.is_unmap() {
            return Ok(false);
        }
        let segment_id = self.info().segment_of(blks.start_vsa.stripe_id);
        self.ctx.decrease_valid_blk_count(segment_id, blks.num_blks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryReverseMapStore, InMemoryStripeMap, MemoryDevice};
    use crate::config::GeometryConfig;
    use crate::domain::events::EventSink;

    struct Fixture {
        allocator: BlockAllocator,
        stripe_map: Arc<InMemoryStripeMap>,
        device: Arc<MemoryDevice>,
    }

    fn fixture(geometry: GeometryConfig, normal: u32, urgent: u32) -> Fixture {
        let info = AddressInfo::new(&geometry).unwrap();
        let ctx = Arc::new(AllocationContext::new(info, normal, urgent, EventSink::disabled()));
        let stripe_map = Arc::new(InMemoryStripeMap::new());
        let device = Arc::new(MemoryDevice::new(geometry.block_size));
        let pool = WriteBufferStripePool::new(
            ctx,
            stripe_map.clone(),
            Arc::new(InMemoryReverseMapStore::new()),
            device.clone(),
        );
        Fixture {
            allocator: BlockAllocator::new(pool, stripe_map.clone(), false),
            stripe_map,
            device,
        }
    }

    fn geometry(bps: u32, sps: u32, segments: u32, wb: u32) -> GeometryConfig {
        GeometryConfig {
            block_size: 512,
            blks_per_stripe: bps,
            stripes_per_segment: sps,
            num_segments: segments,
            num_wb_stripes: wb,
            max_volumes: 2,
        }
    }

    fn granted(outcome: Allocation<BlockGrant>) -> BlockGrant {
        match outcome {
            Allocation::Granted(grant) => grant,
            other => panic!("expected a grant, got {}", other),
        }
    }

    // =========================================================================
    // Write Buffer Allocation Tests
    // =========================================================================

    #[test]
    fn test_request_split_at_stripe_boundary() {
        let f = fixture(geometry(16, 4, 8, 8), 2, 1);
        let first = granted(f.allocator.allocate_write_buffer_blks(0, 20).unwrap());
        assert_eq!(first.blks.num_blks, 16);
        assert_eq!(first.blks.start_vsa.offset, 0);

        let second = granted(f.allocator.allocate_write_buffer_blks(0, 4).unwrap());
        assert_eq!(second.blks.num_blks, 4);
        assert_eq!(second.blks.start_vsa.offset, 0);
        assert_ne!(second.blks.start_vsa.stripe_id, first.blks.start_vsa.stripe_id);
        assert_ne!(second.wb_lsid, first.wb_lsid);
    }

    #[test]
    fn test_partial_tail_fills_before_rollover() {
        let f = fixture(geometry(16, 4, 8, 8), 2, 1);
        let a = granted(f.allocator.allocate_write_buffer_blks(0, 10).unwrap());
        let b = granted(f.allocator.allocate_write_buffer_blks(0, 10).unwrap());
        assert_eq!(b.blks.start_vsa, a.blks.start_vsa.advance(10));
        assert_eq!(b.blks.num_blks, 6);
        assert_eq!(a.wb_lsid, b.wb_lsid);
    }

    #[test]
    fn test_new_stripe_published_in_write_buffer() {
        let f = fixture(geometry(4, 4, 8, 8), 2, 1);
        let grant = granted(f.allocator.allocate_write_buffer_blks(1, 1).unwrap());
        let vsid = grant.blks.start_vsa.stripe_id;
        assert_eq!(
            f.stripe_map.get_lsa(vsid),
            Some(StripeAddr::write_buffer(grant.wb_lsid))
        );
        assert_eq!(f.allocator.context().used_stripe_count(), 1);

        let stripe = f.allocator.pool().stripe(grant.wb_lsid).unwrap();
        assert_eq!(stripe.vsid(), vsid);
        assert_eq!(stripe.volume_id(), 1);
    }

    #[test]
    fn test_volumes_use_separate_tails() {
        let f = fixture(geometry(8, 4, 8, 8), 2, 1);
        let a = granted(f.allocator.allocate_write_buffer_blks(0, 2).unwrap());
        let b = granted(f.allocator.allocate_write_buffer_blks(1, 2).unwrap());
        assert_ne!(a.wb_lsid, b.wb_lsid);
        assert_eq!(b.blks.start_vsa.offset, 0);
    }

    #[test]
    fn test_zero_blocks_rejected() {
        let f = fixture(geometry(8, 4, 8, 8), 2, 1);
        assert!(matches!(
            f.allocator.allocate_write_buffer_blks(0, 0),
            Err(Error::InvalidBlockCount { .. })
        ));
        assert!(matches!(
            f.allocator.allocate_write_buffer_blks(9, 1),
            Err(Error::VolumeOutOfRange { .. })
        ));
    }

    // =========================================================================
    // Exhaustion and Rollback Tests
    // =========================================================================

    #[test]
    fn test_write_buffer_exhaustion_changes_nothing() {
        let f = fixture(geometry(4, 4, 8, 2), 2, 1);
        granted(f.allocator.allocate_write_buffer_blks(0, 4).unwrap());
        granted(f.allocator.allocate_write_buffer_blks(0, 4).unwrap());

        let ctx = f.allocator.context();
        let used = ctx.used_stripe_count();
        let free_segments = ctx.free_segment_count();

        assert_eq!(
            f.allocator.allocate_write_buffer_blks(0, 4).unwrap(),
            Allocation::Exhausted
        );
        assert_eq!(
            f.allocator.allocate_write_buffer_blks(0, 1).unwrap(),
            Allocation::Exhausted
        );
        assert_eq!(ctx.used_stripe_count(), used);
        assert_eq!(ctx.free_segment_count(), free_segments);
        assert_eq!(ctx.free_wb_stripe_count(), 0);
    }

    #[test]
    fn test_segment_exhaustion_rolls_back_wb_stripe() {
        let f = fixture(geometry(4, 1, 2, 4), 1, 0);
        granted(f.allocator.allocate_gc_write_buffer_blks(0, 4).unwrap());
        granted(f.allocator.allocate_gc_write_buffer_blks(0, 4).unwrap());

        let ctx = f.allocator.context();
        assert_eq!(ctx.free_wb_stripe_count(), 2);
        assert_eq!(
            f.allocator.allocate_gc_write_buffer_blks(0, 1).unwrap(),
            Allocation::Exhausted
        );
        assert_eq!(ctx.free_wb_stripe_count(), 2);
        assert_eq!(ctx.used_stripe_count(), 2);
        assert_eq!(f.allocator.stats().snapshot().rollbacks, 1);
    }

    #[test]
    fn test_urgent_mode_prohibits_user_but_not_gc() {
        let f = fixture(geometry(4, 1, 3, 8), 2, 1);
        granted(f.allocator.allocate_write_buffer_blks(0, 4).unwrap());
        granted(f.allocator.allocate_write_buffer_blks(0, 4).unwrap());

        assert_eq!(
            f.allocator.allocate_write_buffer_blks(0, 4).unwrap(),
            Allocation::Prohibited
        );
        assert_eq!(f.allocator.context().free_wb_stripe_count(), 6);
        assert!(f.allocator.context().is_user_blk_alloc_prohibited());
        assert!(f
            .allocator
            .allocate_gc_write_buffer_blks(0, 4)
            .unwrap()
            .is_granted());
    }

    #[test]
    fn test_prohibited_volume_refused() {
        let f = fixture(geometry(4, 4, 8, 8), 2, 1);
        f.allocator.context().prohibit_blk_alloc(1);
        assert_eq!(
            f.allocator.allocate_write_buffer_blks(1, 1).unwrap(),
            Allocation::Prohibited
        );
        assert!(matches!(
            f.allocator.allocate_gc_dest_stripe(1).unwrap(),
            Allocation::Prohibited
        ));
        assert!(f.allocator.allocate_write_buffer_blks(0, 1).unwrap().is_granted());
    }

    // =========================================================================
    // GC Destination Stripe Tests
    // =========================================================================

    #[test]
    fn test_gc_dest_stripe_without_free_segment() {
        let f = fixture(geometry(4, 1, 2, 4), 1, 0);
        let first = match f.allocator.allocate_gc_dest_stripe(0).unwrap() {
            Allocation::Granted(stripe) => stripe,
            other => panic!("expected a stripe, got {}", other),
        };
        assert_eq!(first.wb_lsid(), UNMAP_STRIPE);
        assert!(f.allocator.allocate_gc_dest_stripe(0).unwrap().is_granted());

        let used = f.allocator.context().used_stripe_count();
        assert!(matches!(
            f.allocator.allocate_gc_dest_stripe(0).unwrap(),
            Allocation::Exhausted
        ));
        assert_eq!(f.allocator.context().used_stripe_count(), used);

        f.allocator.release_gc_dest_stripe(&first);
        assert_eq!(f.allocator.context().used_stripe_count(), used - 1);
    }

    // =========================================================================
    // Flush and Accounting Tests
    // =========================================================================

    #[test]
    fn test_full_stripe_flushes_and_frees_slot() {
        let f = fixture(geometry(4, 4, 8, 2), 2, 1);
        let grant = granted(f.allocator.allocate_write_buffer_blks(0, 4).unwrap());
        let vsid = grant.blks.start_vsa.stripe_id;

        assert!(f.allocator.pool().write_completed(grant.wb_lsid, 4).unwrap());
        assert!(f.device.has_stripe(vsid));
        assert_eq!(f.stripe_map.get_lsa(vsid), Some(StripeAddr::user_area(vsid)));
        assert_eq!(f.allocator.context().free_wb_stripe_count(), 2);
        assert_eq!(f.allocator.context().used_stripe_count(), 0);
        assert_eq!(f.allocator.context().occupied_stripe_count(0), 1);
    }

    #[test]
    fn test_validate_and_invalidate_blocks() {
        let f = fixture(geometry(4, 1, 8, 8), 2, 1);
        let grant = granted(f.allocator.allocate_write_buffer_blks(0, 4).unwrap());
        f.allocator.validate_blks(grant.blks).unwrap();
        assert_eq!(f.allocator.context().valid_blk_count(0), 4);

        f.allocator.pool().write_completed(grant.wb_lsid, 4).unwrap();
        assert!(f.allocator.invalidate_blks(grant.blks).unwrap());
        assert_eq!(f.allocator.context().free_segment_count(), 8);
        assert!(!f.allocator.invalidate_blks(VirtualBlks::UNMAP).unwrap());
    }
}
