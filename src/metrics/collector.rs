//! Engine Metrics
//!
//! Prometheus view of the allocator and the garbage collector. Components
//! keep their own atomic counters; [`EngineMetrics::refresh`] samples them
//! into a private registry so a scrape never touches allocator locks.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tracing::debug;

use crate::allocator::{AllocationContext, BlockAllocator, GcMode};
use crate::error::{Error, Result};
use crate::gc::CopierMeta;

/// Metric name prefix
const NAMESPACE: &str = "stripeflow";

pub struct EngineMetrics {
    registry: Registry,
    allocator: Arc<BlockAllocator>,
    gc: Arc<CopierMeta>,

    // Gauges
    free_segments: IntGauge,
    used_wb_stripes: IntGauge,
    gc_mode: IntGauge,
    rebuild_targets: IntGauge,

    // Counters
    exhausted_allocations: IntCounter,
    prohibited_allocations: IntCounter,
    flushed_stripes: IntCounter,
    gc_copied_blocks: IntCounter,
    ownership_retries: IntCounter,
    ownership_escalations: IntCounter,
}

impl EngineMetrics {
    pub fn new(allocator: Arc<BlockAllocator>, gc: Arc<CopierMeta>) -> Result<Self> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let free_segments = gauge("free_segments", "Segments in the free pool")?;
        let used_wb_stripes = gauge("used_wb_stripes", "Write buffer stripes in use")?;
        let gc_mode = gauge("gc_mode", "GC urgency: 0 none, 1 normal, 2 urgent")?;
        let rebuild_targets = gauge("rebuild_targets", "Segments awaiting rebuild")?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let exhausted_allocations = counter(
            "allocations_exhausted_total",
            "Allocations refused for lack of space",
        )?;
        let prohibited_allocations = counter(
            "allocations_prohibited_total",
            "Allocations refused by a prohibition",
        )?;
        let flushed_stripes = counter(
            "flushed_stripes_total",
            "Write buffer stripes written to the user area",
        )?;
        let gc_copied_blocks = counter("gc_copied_blocks_total", "Blocks moved by GC")?;
        let ownership_retries = counter(
            "gc_ownership_retries_total",
            "GC attempts that found a block owned by a writer",
        )?;
        let ownership_escalations = counter(
            "gc_ownership_escalations_total",
            "GC stripes that held user allocation to win ownership",
        )?;

        Ok(Self {
            registry,
            allocator,
            gc,
            free_segments,
            used_wb_stripes,
            gc_mode,
            rebuild_targets,
            exhausted_allocations,
            prohibited_allocations,
            flushed_stripes,
            gc_copied_blocks,
            ownership_retries,
            ownership_escalations,
        })
    }

    fn context(&self) -> &AllocationContext {
        self.allocator.context()
    }

    /// Sample every source into the registry.
    pub fn refresh(&self) {
        let ctx = self.context();
        self.free_segments.set(ctx.free_segment_count() as i64);
        self.used_wb_stripes.set(ctx.used_stripe_count() as i64);
        self.gc_mode.set(match ctx.gc_mode() {
            GcMode::None => 0,
            GcMode::Normal => 1,
            GcMode::Urgent => 2,
        });
        self.rebuild_targets.set(ctx.rebuild_target_count() as i64);

        let allocator = self.allocator.stats().snapshot();
        let pool = self.allocator.pool().stats().snapshot();
        let gc = self.gc.stats().snapshot();
        advance(&self.exhausted_allocations, allocator.exhausted);
        advance(&self.prohibited_allocations, allocator.prohibited);
        advance(&self.flushed_stripes, pool.flushes_completed);
        advance(&self.gc_copied_blocks, gc.copied_blocks);
        advance(&self.ownership_retries, gc.ownership_retries);
        advance(&self.ownership_escalations, gc.ownership_escalations);
        debug!("Engine metrics refreshed");
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of the current registry.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
    }
}

/// Move a counter up to a monotonic source value.
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryReverseMapStore, InMemoryStripeMap, MemoryDevice};
    use crate::address::AddressInfo;
    use crate::allocator::WriteBufferStripePool;
    use crate::config::GeometryConfig;
    use crate::domain::events::EventSink;
    use std::sync::atomic::Ordering;

    fn metrics() -> EngineMetrics {
        let geometry = GeometryConfig {
            block_size: 512,
            blks_per_stripe: 4,
            stripes_per_segment: 2,
            num_segments: 8,
            num_wb_stripes: 1,
            max_volumes: 2,
        };
        let info = AddressInfo::new(&geometry).unwrap();
        let ctx = Arc::new(AllocationContext::new(info, 4, 2, EventSink::disabled()));
        let stripe_map = Arc::new(InMemoryStripeMap::new());
        let pool = WriteBufferStripePool::new(
            ctx,
            stripe_map.clone(),
            Arc::new(InMemoryReverseMapStore::new()),
            Arc::new(MemoryDevice::new(512)),
        );
        let allocator = Arc::new(BlockAllocator::new(pool, stripe_map, false));
        EngineMetrics::new(allocator, Arc::new(CopierMeta::new())).unwrap()
    }

    #[test]
    fn test_refresh_samples_state() {
        let metrics = metrics();
        metrics.allocator.allocate_write_buffer_blks(0, 4).unwrap();
        metrics.allocator.allocate_write_buffer_blks(1, 4).unwrap();
        metrics
            .gc
            .stats()
            .copied_blocks
            .fetch_add(12, Ordering::Relaxed);

        metrics.refresh();
        assert_eq!(metrics.free_segments.get(), 7);
        assert_eq!(metrics.used_wb_stripes.get(), 1);
        assert_eq!(metrics.exhausted_allocations.get(), 1);
        assert_eq!(metrics.gc_copied_blocks.get(), 12);

        // A second refresh must not double count.
        metrics.refresh();
        assert_eq!(metrics.gc_copied_blocks.get(), 12);
    }

    #[test]
    fn test_gather_text() {
        let metrics = metrics();
        metrics.refresh();
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("stripeflow_free_segments 8"));
        assert!(text.contains("stripeflow_gc_mode 0"));
        assert!(text.contains("stripeflow_gc_ownership_escalations_total 0"));
    }
}
