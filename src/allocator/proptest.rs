//! Property-Based Tests for Allocation
//!
//! # Test Properties
//!
//! 1. **At-most-one flush**: concurrent decrements that sum to a stripe's
//!    capacity observe zero exactly once
//! 2. **Allocation bound**: every grant fits in its stripe and never exceeds
//!    the request
//! 3. **Reference safety**: a flushed stripe stays out of the free pool while
//!    any reader pins it

#![cfg(test)]

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use super::{Allocation, AllocationContext, BlockAllocator, Stripe, WriteBufferStripePool};
use crate::adapters::memory::{InMemoryReverseMapStore, InMemoryStripeMap, MemoryDevice};
use crate::address::{AddressInfo, StripeAddr};
use crate::config::GeometryConfig;
use crate::domain::events::EventSink;

fn allocator(blks_per_stripe: u32, num_wb_stripes: u32) -> BlockAllocator {
    let geometry = GeometryConfig {
        block_size: 512,
        blks_per_stripe,
        stripes_per_segment: 4,
        num_segments: 64,
        num_wb_stripes,
        max_volumes: 4,
    };
    let info = AddressInfo::new(&geometry).unwrap();
    let ctx = Arc::new(AllocationContext::new(info, 2, 1, EventSink::disabled()));
    let stripe_map = Arc::new(InMemoryStripeMap::new());
    let pool = WriteBufferStripePool::new(
        ctx,
        stripe_map.clone(),
        Arc::new(InMemoryReverseMapStore::new()),
        Arc::new(MemoryDevice::new(512)),
    );
    BlockAllocator::new(pool, stripe_map, false)
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Split `total` into between 1 and `max_parts` positive chunks.
fn chunks_strategy(total: u32, max_parts: usize) -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(1u32..=total, 1..max_parts).prop_map(move |cuts| {
        let mut points: Vec<u32> = cuts.into_iter().map(|c| c % total).collect();
        points.push(0);
        points.push(total);
        points.sort();
        points.dedup();
        points.windows(2).map(|w| w[1] - w[0]).collect()
    })
}

// =============================================================================
// Flush Trigger Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: exactly one writer sees the remaining count hit zero.
    #[test]
    fn prop_single_zero_observer(chunks in chunks_strategy(64, 24)) {
        let stripe = Arc::new(Stripe::new(64, 512));
        stripe.assign(0, 0, 0, 0);

        let handles: Vec<_> = chunks
            .into_iter()
            .map(|n| {
                let stripe = Arc::clone(&stripe);
                thread::spawn(move || stripe.decrease_blks_remaining(n).unwrap() == 0)
            })
            .collect();

        let zeros = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|saw_zero| *saw_zero)
            .count();
        prop_assert_eq!(zeros, 1);
        prop_assert_eq!(stripe.blks_remaining(), 0);
    }
}

// =============================================================================
// Allocation Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: grants stay inside one stripe and never exceed the request.
    #[test]
    fn prop_grant_within_stripe(
        bps in prop::sample::select(vec![4u32, 8, 16, 32]),
        requests in prop::collection::vec((0u32..4, 1u32..40), 1..60),
    ) {
        let allocator = allocator(bps, 256);
        for (volume_id, n) in requests {
            match allocator.allocate_write_buffer_blks(volume_id, n)? {
                Allocation::Granted(grant) => {
                    prop_assert!(grant.blks.num_blks >= 1);
                    prop_assert!(grant.blks.num_blks <= n);
                    prop_assert!(grant.blks.start_vsa.offset + grant.blks.num_blks <= bps);
                    let stripe = allocator.pool().stripe(grant.wb_lsid).unwrap();
                    prop_assert_eq!(stripe.vsid(), grant.blks.start_vsa.stripe_id);
                    prop_assert_eq!(stripe.volume_id(), volume_id);
                }
                other => prop_assert!(false, "unexpected {}", other),
            }
        }
    }

    /// Property: once the write buffer is exhausted, further requests are
    /// refused without touching any counter.
    #[test]
    fn prop_exhaustion_is_side_effect_free(
        wb in 1u32..6,
        extra in prop::collection::vec((0u32..4, 1u32..10), 1..20),
    ) {
        let allocator = allocator(4, wb);
        for _ in 0..wb {
            prop_assert!(allocator.allocate_write_buffer_blks(0, 4)?.is_granted());
        }

        let ctx = allocator.context();
        let used = ctx.used_stripe_count();
        let free_segments = ctx.free_segment_count();
        for (volume_id, n) in extra {
            prop_assert_eq!(
                allocator.allocate_write_buffer_blks(volume_id, n)?,
                Allocation::Exhausted
            );
        }
        prop_assert_eq!(ctx.used_stripe_count(), used);
        prop_assert_eq!(ctx.free_segment_count(), free_segments);
    }
}

// =============================================================================
// Reference Safety Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the only write-buffer slot is never handed out again while
    /// a reader holds it, and is handed out as soon as the last one leaves.
    #[test]
    fn prop_referenced_stripe_not_reused(
        initial_refs in 0u32..4,
        ops in prop::collection::vec(any::<bool>(), 0..32),
    ) {
        let allocator = allocator(4, 1);
        let pool = allocator.pool();
        let grant = allocator
            .allocate_write_buffer_blks(0, 4)?
            .granted()
            .unwrap();
        let addr = StripeAddr::write_buffer(grant.wb_lsid);

        let mut refs = initial_refs;
        for _ in 0..initial_refs {
            prop_assert!(pool.refer_lsid_cnt(&addr));
        }
        pool.write_completed(grant.wb_lsid, 4)?;

        for refer in ops {
            if refs == 0 {
                break;
            }
            prop_assert_eq!(
                allocator.allocate_write_buffer_blks(1, 1)?,
                Allocation::Exhausted
            );
            if refer {
                pool.refer_lsid_cnt(&addr);
                refs += 1;
            } else {
                pool.derefer_lsid_cnt(&addr, 1)?;
                refs -= 1;
            }
        }

        if refs > 0 {
            pool.derefer_lsid_cnt(&addr, refs)?;
        }
        prop_assert!(allocator.allocate_write_buffer_blks(1, 1)?.is_granted());
    }
}
