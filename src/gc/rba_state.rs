//! Per-Block Ownership
//!
//! Mutual exclusion between user writes and GC map updates on the same
//! logical block. One flag per block, grouped per volume. Acquisition never
//! waits: it either takes every flag of a range or none of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use crate::address::{Rba, VolumeId};

/// A contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RbaRange {
    pub start: Rba,
    pub count: u32,
}

impl RbaRange {
    pub fn new(start: Rba, count: u32) -> Self {
        Self { start, count }
    }

    fn end(&self) -> Rba {
        self.start + self.count as u64
    }
}

#[derive(Debug)]
struct VolumeStates {
    flags: Vec<AtomicBool>,
}

impl VolumeStates {
    fn new(size_blocks: u64) -> Self {
        Self {
            flags: (0..size_blocks).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn contains(&self, range: &RbaRange) -> bool {
        range.count > 0 && range.end() <= self.flags.len() as u64
    }

    fn acquire(&self, range: &RbaRange) -> bool {
        if !self.contains(range) {
            return false;
        }
        for rba in range.start..range.end() {
            if self.flags[rba as usize].swap(true, Ordering::AcqRel) {
                self.release(&RbaRange::new(range.start, (rba - range.start) as u32));
                return false;
            }
        }
        true
    }

    fn release(&self, range: &RbaRange) {
        if range.count == 0 || !self.contains(range) {
            return;
        }
        for rba in range.start..range.end() {
            self.flags[rba as usize].store(false, Ordering::Release);
        }
    }

    fn is_owned(&self, rba: Rba) -> bool {
        self.flags
            .get(rba as usize)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

/// Ownership flags of every volume.
#[derive(Debug, Default)]
pub struct RbaStateManager {
    volumes: DashMap<VolumeId, Arc<VolumeStates>>,
}

impl RbaStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_volume(&self, volume_id: VolumeId, size_blocks: u64) {
        self.volumes
            .insert(volume_id, Arc::new(VolumeStates::new(size_blocks)));
        debug!(
            "Ownership table for volume {} sized to {} blocks",
            volume_id, size_blocks
        );
    }

    pub fn delete_volume(&self, volume_id: VolumeId) {
        self.volumes.remove(&volume_id);
    }

    fn volume(&self, volume_id: VolumeId) -> Option<Arc<VolumeStates>> {
        self.volumes.get(&volume_id).map(|v| Arc::clone(&v))
    }

    /// Take every block of `[start, start + count)` or none of them.
    pub fn bulk_acquire_ownership(&self, volume_id: VolumeId, start: Rba, count: u32) -> bool {
        match self.volume(volume_id) {
            Some(states) => states.acquire(&RbaRange::new(start, count)),
            None => {
                error!("Ownership requested on unknown volume {}", volume_id);
                false
            }
        }
    }

    pub fn bulk_release_ownership(&self, volume_id: VolumeId, start: Rba, count: u32) {
        if let Some(states) = self.volume(volume_id) {
            states.release(&RbaRange::new(start, count));
        }
    }

    /// Acquire a set of ranges in ascending order. On failure every range
    /// already taken is released again.
    pub fn acquire_ownership_rba_list(&self, volume_id: VolumeId, ranges: &[RbaRange]) -> bool {
        let Some(states) = self.volume(volume_id) else {
            error!("Ownership requested on unknown volume {}", volume_id);
            return false;
        };
        let unique = sorted_unique(ranges);
        for (index, range) in unique.iter().enumerate() {
            if !states.acquire(range) {
                for taken in &unique[..index] {
                    states.release(taken);
                }
                return false;
            }
        }
        true
    }

    pub fn release_ownership_rba_list(&self, volume_id: VolumeId, ranges: &[RbaRange]) {
        if let Some(states) = self.volume(volume_id) {
            for range in sorted_unique(ranges) {
                states.release(&range);
            }
        }
    }

    pub fn is_owned(&self, volume_id: VolumeId, rba: Rba) -> bool {
        self.volume(volume_id)
            .map(|states| states.is_owned(rba))
            .unwrap_or(false)
    }
}

/// Sort, drop duplicates and coalesce overlapping or touching ranges, so a
/// list never trips over its own flags.
fn sorted_unique(ranges: &[RbaRange]) -> Vec<RbaRange> {
    let mut sorted: Vec<RbaRange> = ranges.iter().copied().filter(|r| r.count > 0).collect();
    sorted.sort();
    sorted.dedup();

    let mut merged: Vec<RbaRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end() => {
                let end = last.end().max(range.end());
                last.count = (end - last.start) as u32;
            }
            _ => merged.push(range),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RbaStateManager {
        let manager = RbaStateManager::new();
        manager.create_volume(0, 64);
        manager
    }

    #[test]
    fn test_bulk_acquire_is_all_or_nothing() {
        let m = manager();
        assert!(m.bulk_acquire_ownership(0, 10, 1));
        assert!(!m.bulk_acquire_ownership(0, 8, 4));
        assert!(!m.is_owned(0, 8));
        assert!(!m.is_owned(0, 9));
        assert!(m.is_owned(0, 10));

        m.bulk_release_ownership(0, 10, 1);
        assert!(m.bulk_acquire_ownership(0, 8, 4));
    }

    #[test]
    fn test_out_of_range_and_unknown_volume() {
        let m = manager();
        assert!(!m.bulk_acquire_ownership(0, 60, 8));
        assert!(!m.bulk_acquire_ownership(0, 0, 0));
        assert!(!m.bulk_acquire_ownership(3, 0, 1));
    }

    #[test]
    fn test_rba_list_dedups_and_rolls_back() {
        let m = manager();
        let ranges = [
            RbaRange::new(20, 2),
            RbaRange::new(4, 2),
            RbaRange::new(20, 2),
        ];
        assert!(m.acquire_ownership_rba_list(0, &ranges));
        m.release_ownership_rba_list(0, &ranges);
        assert!(!m.is_owned(0, 20));

        m.bulk_acquire_ownership(0, 30, 1);
        let blocked = [RbaRange::new(4, 2), RbaRange::new(30, 1)];
        assert!(!m.acquire_ownership_rba_list(0, &blocked));
        assert!(!m.is_owned(0, 4));
        assert!(m.is_owned(0, 30));
    }

    #[test]
    fn test_overlapping_ranges_coalesce() {
        let m = manager();
        let ranges = [RbaRange::new(5, 2), RbaRange::new(4, 2), RbaRange::new(7, 1)];
        assert!(m.acquire_ownership_rba_list(0, &ranges));
        assert!((4..8).all(|rba| m.is_owned(0, rba)));
        m.release_ownership_rba_list(0, &ranges);
        assert!((4..8).all(|rba| !m.is_owned(0, rba)));
    }

    #[test]
    fn test_deleted_volume_drops_flags() {
        let m = manager();
        m.bulk_acquire_ownership(0, 1, 1);
        m.delete_volume(0);
        assert!(!m.is_owned(0, 1));
        m.create_volume(0, 8);
        assert!(m.bulk_acquire_ownership(0, 1, 1));
    }
}
