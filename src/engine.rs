//! Storage Engine
//!
//! Composition root. Every component receives its collaborators through
//! constructors; nothing is global. The engine also carries a small
//! front-end write and read path so that the allocator and the GC can be
//! driven end to end.
//!
//! ```text
//!   write_blocks ──▶ ownership ─▶ user token ─▶ BlockAllocator ─▶ Stripe
//!                                                    │              │ full
//!                                                    ▼              ▼
//!                                           AllocationContext   flush ─▶ IoSubmitter
//!
//!   GarbageCollector ── Copier + pipeline on the EventScheduler
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    InMemoryBlockMap, InMemoryJournal, InMemoryReverseMapStore, InMemoryStripeMap,
    LoggingEventPublisher, MemoryDevice,
};
use crate::address::{
    AddressInfo, Rba, ReverseMapEntry, StripeAddr, VirtualBlkAddr, VirtualBlks, VolumeId,
};
use crate::allocator::{
    Allocation, AllocationContext, BlockAllocator, BlockGrant, Stripe, TailKind,
    WriteBufferStripePool,
};
use crate::config::EngineConfig;
use crate::domain::events::EventSink;
use crate::domain::ports::{
    BlockMap, EventPublisher, EventScheduler, IoDirection, IoRequest, IoSubmitter,
    JournalWriter, PartitionType, ReverseMapStore, StripeMap,
};
use crate::error::{Error, Result};
use crate::gc::{
    CopierMeta, FlowControl, FlowControlType, GarbageCollector, GcContext, GcStripeManager,
    RbaStateManager,
};
use crate::metrics::EngineMetrics;
use crate::scheduler::WorkerPool;

/// How long volume deletion waits for GC stripes of the volume.
const VOLUME_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Adapters
// =============================================================================

/// External collaborators of the engine.
pub struct EngineAdapters {
    pub stripe_map: Arc<dyn StripeMap>,
    pub block_map: Arc<dyn BlockMap>,
    pub reverse_maps: Arc<dyn ReverseMapStore>,
    pub journal: Arc<dyn JournalWriter>,
    pub io: Arc<dyn IoSubmitter>,
    pub publisher: Arc<dyn EventPublisher>,
    /// Run events here instead of on a private worker pool
    pub scheduler: Option<Arc<dyn EventScheduler>>,
}

impl EngineAdapters {
    /// Heap-backed maps, an inline RAM device and a logging publisher.
    pub fn in_memory(block_size: usize) -> Self {
        Self {
            stripe_map: Arc::new(InMemoryStripeMap::new()),
            block_map: Arc::new(InMemoryBlockMap::new()),
            reverse_maps: Arc::new(InMemoryReverseMapStore::new()),
            journal: Arc::new(InMemoryJournal::new()),
            io: Arc::new(MemoryDevice::new(block_size)),
            publisher: Arc::new(LoggingEventPublisher::new()),
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn EventScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct StorageEngine {
    config: EngineConfig,
    info: AddressInfo,
    allocator: Arc<BlockAllocator>,
    pool: Arc<WriteBufferStripePool>,
    stripe_map: Arc<dyn StripeMap>,
    block_map: Arc<dyn BlockMap>,
    io: Arc<dyn IoSubmitter>,
    rba_states: Arc<RbaStateManager>,
    flow_control: Arc<FlowControl>,
    workers: Option<Arc<WorkerPool>>,
    gc: Arc<GarbageCollector>,
    metrics: Arc<EngineMetrics>,
}

impl StorageEngine {
    /// Validate `config` and wire every component.
    pub fn new(config: EngineConfig, adapters: EngineAdapters) -> Result<Self> {
        config.validate()?;
        let info = AddressInfo::new(&config.geometry)?;

        let (sink, events) = EventSink::channel();
        let ctx = Arc::new(AllocationContext::new(
            info,
            config.gc.normal_threshold,
            config.gc.urgent_threshold,
            sink,
        ));
        let pool = WriteBufferStripePool::new(
            Arc::clone(&ctx),
            Arc::clone(&adapters.stripe_map),
            Arc::clone(&adapters.reverse_maps),
            Arc::clone(&adapters.io),
        );
        let allocator = Arc::new(BlockAllocator::new(
            Arc::clone(&pool),
            Arc::clone(&adapters.stripe_map),
            config.write_through,
        ));

        let flow_control = Arc::new(FlowControl::new(
            Arc::clone(&ctx),
            config.flow_control.clone(),
            config.gc.normal_threshold,
            config.gc.urgent_threshold,
        ));
        let rba_states = Arc::new(RbaStateManager::new());
        let buffers = Arc::new(GcStripeManager::new(info, config.gc.num_gc_buffers));
        let meta = Arc::new(CopierMeta::new());

        let (scheduler, workers) = match adapters.scheduler {
            Some(scheduler) => (scheduler, None),
            None => {
                let workers = Arc::new(WorkerPool::new(config.scheduler.workers)?);
                let scheduler: Arc<dyn EventScheduler> = workers.clone();
                (scheduler, Some(workers))
            }
        };

        let gc_context = Arc::new(GcContext {
            config: config.gc.clone(),
            allocator: Arc::clone(&allocator),
            stripe_map: Arc::clone(&adapters.stripe_map),
            block_map: Arc::clone(&adapters.block_map),
            reverse_maps: adapters.reverse_maps,
            journal: adapters.journal,
            io: Arc::clone(&adapters.io),
            scheduler,
            rba_states: Arc::clone(&rba_states),
            flow_control: Arc::clone(&flow_control),
            buffers,
            meta: Arc::clone(&meta),
        });

        let metrics = Arc::new(EngineMetrics::new(Arc::clone(&allocator), meta)?);
        let gc = Arc::new(GarbageCollector::new(
            gc_context,
            adapters.publisher,
            events,
            Some(Arc::clone(&metrics)),
        ));

        info!(
            "Storage engine ready: {} segments x {} stripes x {} blocks of {} bytes, {} write buffer stripes",
            info.num_user_segments(),
            info.stripes_per_segment(),
            info.blks_per_stripe(),
            info.block_size(),
            info.num_wb_stripes()
        );

        Ok(Self {
            config,
            info,
            allocator,
            pool,
            stripe_map: adapters.stripe_map,
            block_map: adapters.block_map,
            io: adapters.io,
            rba_states,
            flow_control,
            workers,
            gc,
            metrics,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn address_info(&self) -> &AddressInfo {
        &self.info
    }

    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.allocator
    }

    pub fn context(&self) -> &Arc<AllocationContext> {
        self.allocator.context()
    }

    pub fn pool(&self) -> &Arc<WriteBufferStripePool> {
        &self.pool
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn flow_control(&self) -> &Arc<FlowControl> {
        &self.flow_control
    }

    pub fn rba_states(&self) -> &Arc<RbaStateManager> {
        &self.rba_states
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub fn create_volume(&self, volume_id: VolumeId, size_blocks: u64) -> Result<()> {
        self.info.check_volume(volume_id)?;
        self.block_map.create_volume(volume_id, size_blocks)?;
        self.rba_states.create_volume(volume_id, size_blocks);
        self.context().permit_blk_alloc(volume_id);
        info!("Volume {} created with {} blocks", volume_id, size_blocks);
        Ok(())
    }

    /// Stop allocation for the volume, push its data out of the write
    /// buffer, drop its GC buffers and release every block it held.
    #[instrument(skip(self))]
    pub fn delete_volume(&self, volume_id: VolumeId) -> Result<()> {
        self.info.check_volume(volume_id)?;
        let size = self
            .block_map
            .volume_size(volume_id)
            .ok_or(Error::VolumeNotFound(volume_id))?;

        let ctx = self.context();
        ctx.prohibit_blk_alloc(volume_id);
        self.pool.flush_all_pending_stripes_in_volume(volume_id);

        let gc = self.gc.context();
        gc.meta.blocks_finished(gc.buffers.volume_deleted(volume_id));
        if !gc.meta.wait_internal_io_drained(volume_id, VOLUME_DRAIN_TIMEOUT) {
            warn!(
                "Volume {} still has {} GC stripes in flight, deleting anyway",
                volume_id,
                gc.meta.pending_internal_io(volume_id)
            );
        }

        let mut released = 0u64;
        for rba in 0..size {
            if let Some(vsa) = self.block_map.get_vsa(volume_id, rba).mapped() {
                self.allocator.invalidate_blks(VirtualBlks::new(vsa, 1))?;
                released += 1;
            }
        }
        self.block_map.delete_volume(volume_id);
        self.rba_states.delete_volume(volume_id);
        ctx.permit_blk_alloc(volume_id);

        info!("Volume {} deleted, {} blocks released", volume_id, released);
        Ok(())
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Write whole blocks at `rba`. `Granted(n)` reports how many blocks
    /// landed, which may be fewer than asked when space ran out midway.
    /// Backpressure and busy blocks come back as `Exhausted`/`Prohibited`.
    pub fn write_blocks(&self, volume_id: VolumeId, rba: Rba, data: &[u8]) -> Result<Allocation<u32>> {
        self.write(volume_id, rba, data, TailKind::User)
    }

    /// Same as [`write_blocks`](Self::write_blocks) on the volume's GC tail.
    /// Not subject to the user-only prohibition.
    pub fn write_internal_blocks(
        &self,
        volume_id: VolumeId,
        rba: Rba,
        data: &[u8],
    ) -> Result<Allocation<u32>> {
        self.write(volume_id, rba, data, TailKind::Gc)
    }

    fn write(
        &self,
        volume_id: VolumeId,
        rba: Rba,
        data: &[u8],
        kind: TailKind,
    ) -> Result<Allocation<u32>> {
        let num_blks = self.check_write(volume_id, rba, data)?;

        // One attempt; a caller refused here backs off and resubmits.
        if !self
            .rba_states
            .bulk_acquire_ownership(volume_id, rba, num_blks)
        {
            debug!(
                "Blocks {}+{} of volume {} are owned by GC",
                rba, num_blks, volume_id
            );
            return Ok(Allocation::Prohibited);
        }
        let outcome = self.write_owned(volume_id, rba, data, num_blks, kind);
        self.rba_states
            .bulk_release_ownership(volume_id, rba, num_blks);
        outcome
    }

    fn check_write(&self, volume_id: VolumeId, rba: Rba, data: &[u8]) -> Result<u32> {
        self.info.check_volume(volume_id)?;
        let block_size = self.info.block_size();
        let num_blks = (data.len() / block_size) as u32;
        if data.is_empty() || data.len() % block_size != 0 {
            return Err(Error::InvalidBlockCount {
                operation: "write_blocks",
                count: num_blks,
            });
        }
        let size = self
            .block_map
            .volume_size(volume_id)
            .ok_or(Error::VolumeNotFound(volume_id))?;
        if rba + num_blks as u64 > size {
            return Err(Error::RbaOutOfRange {
                volume_id,
                start: rba,
                count: num_blks,
                size,
            });
        }
        Ok(num_blks)
    }

    fn write_owned(
        &self,
        volume_id: VolumeId,
        rba: Rba,
        data: &[u8],
        num_blks: u32,
        kind: TailKind,
    ) -> Result<Allocation<u32>> {
        let token_kind = match kind {
            TailKind::User => FlowControlType::User,
            TailKind::Gc => FlowControlType::Gc,
        };
        if self.flow_control.get_token(token_kind, num_blks) == 0 {
            debug!("Write of {} blocks to volume {} throttled", num_blks, volume_id);
            return Ok(Allocation::Exhausted);
        }

        let block_size = self.info.block_size();
        let mut written = 0u32;
        let mut denied = None;
        while written < num_blks {
            let remaining = num_blks - written;
            let outcome = match kind {
                TailKind::User => self.allocator.allocate_write_buffer_blks(volume_id, remaining),
                TailKind::Gc => self
                    .allocator
                    .allocate_gc_write_buffer_blks(volume_id, remaining),
            };
            let grant = match outcome {
                Ok(Allocation::Granted(grant)) => grant,
                Ok(other) => {
                    denied = Some(other);
                    break;
                }
                Err(e) => {
                    self.flow_control
                        .return_token(token_kind, num_blks - written);
                    return Err(e);
                }
            };
            let start = written as usize * block_size;
            let end = start + grant.blks.num_blks as usize * block_size;
            if let Err(e) = self.fill_grant(volume_id, rba + written as u64, &data[start..end], grant) {
                self.flow_control
                    .return_token(token_kind, num_blks - written);
                return Err(e);
            }
            written += grant.blks.num_blks;
        }

        if written < num_blks {
            self.flow_control
                .return_token(token_kind, num_blks - written);
        }
        match denied {
            Some(denied) if written == 0 => Ok(denied.map(|_| 0)),
            _ => Ok(Allocation::Granted(written)),
        }
    }

    /// Land one grant, then count it off the stripe (which may flush). The
    /// grant is counted even when landing fails so the stripe still drains;
    /// blocks the forward map never reached are skipped by GC.
    fn fill_grant(
        &self,
        volume_id: VolumeId,
        rba: Rba,
        data: &[u8],
        grant: BlockGrant,
    ) -> Result<()> {
        let stripe = self
            .pool
            .stripe(grant.wb_lsid)
            .ok_or(Error::WbStripeOutOfRange(grant.wb_lsid))?;
        let landed = self.land_grant(&stripe, volume_id, rba, data, grant);
        if let Err(e) = &landed {
            error!(
                "Write of {} blocks at {} on volume {} failed, completing the grant: {}",
                grant.blks.num_blks, grant.blks.start_vsa, volume_id, e
            );
        }
        let completed = self.pool.write_completed(grant.wb_lsid, grant.blks.num_blks);
        landed?;
        completed.map(|_| ())
    }

    /// Data and reverse map into the stripe, then the forward map.
    fn land_grant(
        &self,
        stripe: &Stripe,
        volume_id: VolumeId,
        rba: Rba,
        data: &[u8],
        grant: BlockGrant,
    ) -> Result<()> {
        let start = grant.blks.start_vsa;
        stripe.write_data(start.offset, data)?;
        for i in 0..grant.blks.num_blks {
            stripe.update_reverse_map(
                start.offset + i,
                ReverseMapEntry::new(rba + i as u64, volume_id),
            )?;
        }

        // New blocks count before old ones are dropped so a segment that
        // holds both is never seen empty.
        self.allocator.validate_blks(grant.blks)?;
        for (i, vsa) in grant.blks.iter().enumerate() {
            let previous = self.block_map.set_vsa(volume_id, rba + i as u64, vsa);
            if let Some(previous) = previous.mapped() {
                self.allocator
                    .invalidate_blks(VirtualBlks::new(previous, 1))?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// One block of volume data, `None` if the block was never written.
    pub async fn read_block(&self, volume_id: VolumeId, rba: Rba) -> Result<Option<Bytes>> {
        let Some(vsa) = self.block_map.get_vsa(volume_id, rba).mapped() else {
            return Ok(None);
        };
        let Some(addr) = self.stripe_map.get_lsa(vsa.stripe_id) else {
            warn!("Block {} of volume {} maps to unpublished {}", rba, volume_id, vsa);
            return Ok(None);
        };

        if addr.is_in_write_buffer_area() {
            if let Some(data) = self.read_buffered(&addr, vsa)? {
                return Ok(Some(data));
            }
            debug!("Stripe of {} left the write buffer, reading the device", vsa);
        }
        self.read_device(vsa).await.map(Some)
    }

    /// Copy a block out of a pinned write-buffer stripe. `None` if the
    /// slot was re-bound to another stripe before the pin.
    fn read_buffered(&self, addr: &StripeAddr, vsa: VirtualBlkAddr) -> Result<Option<Bytes>> {
        if !self.pool.refer_lsid_cnt(addr) {
            return Ok(None);
        }
        let data = self
            .pool
            .get_stripe(addr)
            .filter(|stripe| stripe.vsid() == vsa.stripe_id)
            .and_then(|stripe| stripe.read_block(vsa.offset));
        self.pool.derefer_lsid_cnt(addr, 1)?;
        Ok(data)
    }

    async fn read_device(&self, vsa: VirtualBlkAddr) -> Result<Bytes> {
        let user_lsid = match self.stripe_map.get_lsa(vsa.stripe_id) {
            Some(addr) if addr.is_in_user_data_area() => addr.id,
            _ => vsa.stripe_id,
        };
        let (tx, rx) = oneshot::channel();
        self.io.submit_async_io(
            IoRequest {
                direction: IoDirection::Read,
                partition: PartitionType::UserData,
                lsid: user_lsid,
                block_offset: vsa.offset,
                block_count: 1,
                data: None,
            },
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
        );

        let completion = rx
            .await
            .map_err(|_| Error::Internal(format!("read of {} dropped", vsa)))?;
        match (completion.data, completion.error) {
            (Some(data), None) => Ok(data),
            (_, error) => Err(Error::IoFailed {
                lsid: user_lsid,
                reason: error.unwrap_or_else(|| "no data".into()),
            }),
        }
    }

    // =========================================================================
    // Array Operations
    // =========================================================================

    /// Close every open stripe and wait until all of them reached the
    /// user area.
    pub fn flush_all(&self) {
        self.pool.flush_all_pending_stripes();
    }

    pub fn prepare_rebuild(&self) -> Result<()> {
        self.pool.prepare_rebuild()
    }

    pub fn stop_rebuilding(&self) -> Result<()> {
        self.pool.stop_rebuilding()
    }

    /// Block until the private worker pool has nothing queued. Always true
    /// with an injected scheduler.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        match &self.workers {
            Some(workers) => workers.wait_idle(timeout),
            None => true,
        }
    }

    /// Stop GC, flush the write buffer and stop the workers.
    #[instrument(skip(self))]
    pub fn shutdown(&self, timeout: Duration) {
        self.gc.stop();
        if self.gc.is_running() && !self.wait_idle(timeout) {
            warn!("GC did not drain within {:?}", timeout);
        }
        self.flush_all();
        if let Some(workers) = &self.workers {
            workers.shutdown();
        }
        info!("Storage engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeometryConfig;
    use crate::scheduler::QueueScheduler;

    const BLOCK: usize = 16;

    fn engine() -> (StorageEngine, Arc<QueueScheduler>) {
        let mut config = EngineConfig::default();
        config.geometry = GeometryConfig {
            block_size: BLOCK,
            blks_per_stripe: 4,
            stripes_per_segment: 2,
            num_segments: 16,
            num_wb_stripes: 4,
            max_volumes: 2,
        };
        config.gc.normal_threshold = 4;
        config.gc.urgent_threshold = 2;
        config.gc.ownership_retry_warn_threshold = 4;
        config.gc.max_ownership_retries = 8;
        let scheduler = Arc::new(QueueScheduler::new());
        let adapters = EngineAdapters::in_memory(BLOCK).with_scheduler(scheduler.clone());
        let engine = StorageEngine::new(config, adapters).unwrap();
        engine.create_volume(0, 64).unwrap();
        (engine, scheduler)
    }

    fn blocks(fill: u8, n: usize) -> Vec<u8> {
        vec![fill; n * BLOCK]
    }

    // =========================================================================
    // Write Path Tests
    // =========================================================================

    #[tokio::test]
    async fn test_write_then_read_from_write_buffer() {
        let (engine, _) = engine();
        let outcome = engine.write_blocks(0, 3, &blocks(7, 2)).unwrap();
        assert_eq!(outcome, Allocation::Granted(2));

        let data = engine.read_block(0, 4).await.unwrap().unwrap();
        assert_eq!(&data[..], &blocks(7, 1)[..]);
        assert!(engine.read_block(0, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_stripe_is_flushed_and_read_from_device() {
        let (engine, _) = engine();
        engine.write_blocks(0, 0, &blocks(1, 4)).unwrap();

        assert_eq!(engine.context().used_stripe_count(), 0);
        assert_eq!(engine.context().free_wb_stripe_count(), 4);
        let data = engine.read_block(0, 2).await.unwrap().unwrap();
        assert_eq!(&data[..], &blocks(1, 1)[..]);
    }

    #[test]
    fn test_write_spans_stripes() {
        let (engine, _) = engine();
        assert_eq!(
            engine.write_blocks(0, 0, &blocks(2, 6)).unwrap(),
            Allocation::Granted(6)
        );
        let ctx = engine.context();
        assert_eq!(ctx.valid_blk_count(0), 6);
        assert_eq!(ctx.used_stripe_count(), 1);
    }

    #[test]
    fn test_overwrite_moves_valid_count() {
        let (engine, _) = engine();
        engine.write_blocks(0, 0, &blocks(1, 4)).unwrap();
        engine.write_blocks(0, 0, &blocks(2, 4)).unwrap();
        let ctx = engine.context();
        assert_eq!(ctx.valid_blk_count(0), 4);
        assert_eq!(ctx.occupied_stripe_count(0), 2);
    }

    #[test]
    fn test_write_rejects_bad_requests() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.write_blocks(0, 0, &[0u8; 3]),
            Err(Error::InvalidBlockCount { .. })
        ));
        assert!(matches!(
            engine.write_blocks(0, 63, &blocks(0, 2)),
            Err(Error::RbaOutOfRange { .. })
        ));
        assert!(matches!(
            engine.write_blocks(1, 0, &blocks(0, 1)),
            Err(Error::VolumeNotFound(1))
        ));
    }

    #[test]
    fn test_write_busy_while_gc_owns_blocks() {
        let (engine, _) = engine();
        assert!(engine.rba_states().bulk_acquire_ownership(0, 8, 1));
        assert_eq!(
            engine.write_blocks(0, 7, &blocks(0, 2)).unwrap(),
            Allocation::Prohibited
        );
        engine.rba_states().bulk_release_ownership(0, 8, 1);
        assert!(engine.write_blocks(0, 7, &blocks(0, 2)).unwrap().is_granted());
    }

    #[test]
    fn test_ownership_refusal_does_not_allocate() {
        let (engine, _) = engine();
        assert!(engine.rba_states().bulk_acquire_ownership(0, 0, 4));
        let grants = engine.allocator().stats().snapshot().grants;

        assert_eq!(
            engine.write_blocks(0, 0, &blocks(1, 4)).unwrap(),
            Allocation::Prohibited
        );
        assert_eq!(engine.allocator().stats().snapshot().grants, grants);
        assert!(engine.context().active_tail(0, TailKind::User).is_unmap());
        // The refused writer took nothing, GC still owns every block.
        assert!(!engine.rba_states().bulk_acquire_ownership(0, 3, 1));
        engine.rba_states().bulk_release_ownership(0, 0, 4);
    }

    #[test]
    fn test_failed_write_still_completes_its_grant() {
        let (engine, _) = engine();
        // Point block 5 at a stripe of an empty segment so dropping the
        // old mapping underflows that segment's valid count.
        engine.block_map.set_vsa(0, 5, VirtualBlkAddr::new(12, 0));

        assert!(matches!(
            engine.write_blocks(0, 5, &blocks(9, 1)),
            Err(Error::ValidCountUnderflow { .. })
        ));
        let wb_lsid = engine.context().active_tail(0, TailKind::User).wb_lsid;
        let stripe = engine.pool().stripe(wb_lsid).unwrap();
        let vsid = stripe.vsid();
        assert_eq!(stripe.blks_remaining(), 3);

        // The tail pads the other three blocks and the stripe flushes.
        engine.pool().flush_all_pending_stripes_in_volume(0);
        assert!(engine.stripe_map.is_in_user_data_area(vsid));
        assert!(engine.write_blocks(0, 6, &blocks(1, 1)).unwrap().is_granted());
    }

    #[test]
    fn test_prohibited_volume_refuses_writes() {
        let (engine, _) = engine();
        engine.context().prohibit_blk_alloc(0);
        assert_eq!(
            engine.write_blocks(0, 0, &blocks(0, 1)).unwrap(),
            Allocation::Prohibited
        );
        engine.context().permit_blk_alloc(0);
        assert!(engine.write_blocks(0, 0, &blocks(0, 1)).unwrap().is_granted());
    }

    #[test]
    fn test_internal_write_ignores_user_prohibition() {
        let (engine, _) = engine();
        engine.context().prohibit_user_blk_alloc();
        assert_eq!(
            engine.write_blocks(0, 0, &blocks(0, 1)).unwrap(),
            Allocation::Prohibited
        );
        assert_eq!(
            engine.write_internal_blocks(0, 0, &blocks(0, 1)).unwrap(),
            Allocation::Granted(1)
        );
    }

    // =========================================================================
    // Volume Tests
    // =========================================================================

    #[tokio::test]
    async fn test_delete_volume_releases_blocks() {
        let (engine, _) = engine();
        engine.write_blocks(0, 0, &blocks(3, 6)).unwrap();
        let free_before = engine.context().free_segment_count();

        engine.delete_volume(0).unwrap();
        assert!(engine.read_block(0, 0).await.unwrap().is_none());
        assert_eq!(engine.context().valid_blk_count(0), 0);
        // The flushed partial stripe filled the segment, which is now empty.
        assert_eq!(engine.context().free_segment_count(), free_before + 1);
        assert!(matches!(engine.delete_volume(0), Err(Error::VolumeNotFound(0))));

        engine.create_volume(0, 64).unwrap();
        assert!(engine.write_blocks(0, 0, &blocks(4, 1)).unwrap().is_granted());
    }

    #[test]
    fn test_create_volume_out_of_range() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.create_volume(5, 8),
            Err(Error::VolumeOutOfRange { .. })
        ));
        assert!(matches!(engine.create_volume(0, 8), Err(Error::VolumeExists(0))));
    }

    #[test]
    fn test_metrics_exposed() {
        let (engine, _) = engine();
        engine.write_blocks(0, 0, &blocks(0, 4)).unwrap();
        engine.metrics().refresh();
        let text = engine.metrics().gather_text().unwrap();
        assert!(text.contains("stripeflow_flushed_stripes_total 1"));
    }
}
