//! Property-Based Tests for Garbage Collection
//!
//! # Test Properties
//!
//! 1. **Replay idempotence**: replaying a journal twice leaves the block map
//!    as replaying it once
//! 2. **Ownership rollback**: a failed list acquisition leaves exactly the
//!    previously owned blocks owned
//! 3. **GC buffer accounting**: grants never overlap, never cross the buffer
//!    end, and exactly one fill completes each buffer

#![cfg(test)]

use std::collections::HashSet;

use proptest::prelude::*;

use super::{GcStripeManager, RbaRange, RbaStateManager};
use crate::adapters::memory::{InMemoryBlockMap, InMemoryJournal};
use crate::address::{AddressInfo, VirtualBlkAddr};
use crate::config::GeometryConfig;
use crate::domain::ports::{BlockMap, BlockMapUpdate, BlockMapUpdateEntry, JournalWriter};

const VOLUME_BLOCKS: u64 = 128;

// =============================================================================
// Property Strategies
// =============================================================================

fn update_strategy() -> impl Strategy<Value = BlockMapUpdate> {
    (0..VOLUME_BLOCKS, 0u32..64, 0u32..8).prop_map(|(rba, vsid, offset)| BlockMapUpdate {
        rba,
        vsa: VirtualBlkAddr::new(vsid, offset),
    })
}

fn entries_strategy() -> impl Strategy<Value = Vec<BlockMapUpdateEntry>> {
    prop::collection::vec(
        prop::collection::vec(update_strategy(), 1..8).prop_map(|updates| BlockMapUpdateEntry {
            volume_id: 0,
            updates,
        }),
        1..16,
    )
}

fn ranges_strategy() -> impl Strategy<Value = Vec<RbaRange>> {
    prop::collection::vec(
        (0..VOLUME_BLOCKS - 8, 1u32..8).prop_map(|(start, count)| RbaRange::new(start, count)),
        1..12,
    )
}

fn snapshot(map: &InMemoryBlockMap) -> Vec<VirtualBlkAddr> {
    map.snapshot(0).unwrap_or_default()
}

// =============================================================================
// Journal Replay Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: replay is idempotent and matches the live map.
    #[test]
    fn prop_replay_is_idempotent(entries in entries_strategy()) {
        let journal = InMemoryJournal::new();
        let live = InMemoryBlockMap::new();
        live.create_volume(0, VOLUME_BLOCKS).unwrap();
        for entry in entries {
            live.apply(&entry);
            journal.add_block_map_update(entry, Box::new(|r| assert!(r.is_ok())));
        }

        let once = InMemoryBlockMap::new();
        once.create_volume(0, VOLUME_BLOCKS).unwrap();
        journal.replay(&once);

        let twice = InMemoryBlockMap::new();
        twice.create_volume(0, VOLUME_BLOCKS).unwrap();
        journal.replay(&twice);
        journal.replay(&twice);

        prop_assert_eq!(snapshot(&once), snapshot(&live));
        prop_assert_eq!(snapshot(&twice), snapshot(&once));
    }
}

// =============================================================================
// Ownership Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Property: acquisition is all-or-nothing against a pre-owned block.
    #[test]
    fn prop_list_acquire_rolls_back(ranges in ranges_strategy(), held in 0..VOLUME_BLOCKS) {
        let states = RbaStateManager::new();
        states.create_volume(0, VOLUME_BLOCKS);
        prop_assert!(states.bulk_acquire_ownership(0, held, 1));

        let covered: HashSet<u64> = ranges
            .iter()
            .flat_map(|r| r.start..r.start + r.count as u64)
            .collect();
        let acquired = states.acquire_ownership_rba_list(0, &ranges);
        prop_assert_eq!(acquired, !covered.contains(&held));

        for rba in 0..VOLUME_BLOCKS {
            let expected = rba == held || (acquired && covered.contains(&rba));
            prop_assert_eq!(states.is_owned(0, rba), expected);
        }

        if acquired {
            states.release_ownership_rba_list(0, &ranges);
            for rba in covered {
                prop_assert_eq!(states.is_owned(0, rba), rba == held);
            }
        }
    }
}

// =============================================================================
// GC Buffer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: grants tile each buffer exactly once.
    #[test]
    fn prop_gc_grants_tile_buffers(requests in prop::collection::vec(1u32..12, 1..40)) {
        let geometry = GeometryConfig {
            block_size: 8,
            blks_per_stripe: 8,
            stripes_per_segment: 2,
            num_segments: 8,
            num_wb_stripes: 2,
            max_volumes: 1,
        };
        let manager = GcStripeManager::new(AddressInfo::new(&geometry).unwrap(), u32::MAX);

        let mut seen: HashSet<(u32, u32)> = HashSet::new();
        let mut completed: HashSet<u32> = HashSet::new();
        for request in requests {
            let mut left = request;
            while left > 0 {
                let grant = manager.allocate_gc_blocks(0, left).unwrap();
                prop_assert!(grant.count >= 1 && grant.count <= left);
                prop_assert!(grant.offset + grant.count <= 8);
                for offset in grant.offset..grant.offset + grant.count {
                    prop_assert!(seen.insert((grant.buffer.id(), offset)));
                }
                let full = manager
                    .decrease_remaining_and_check_full(&grant.buffer, grant.count)
                    .unwrap();
                if full {
                    prop_assert!(completed.insert(grant.buffer.id()));
                    prop_assert_eq!(grant.buffer.remaining(), 0);
                }
                left -= grant.count;
            }
        }

        let total = seen.len() as u32;
        prop_assert_eq!(completed.len() as u32, total / 8);
        prop_assert_eq!(manager.has_active_buffer(0), total % 8 != 0);
    }
}
