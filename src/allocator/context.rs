//! Allocation Context
//!
//! Mutable per-array allocator state.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ tails[0..V)       user tails      ┐                              │
//! │ tails[V..2V)      GC tails        ┘ one Mutex each               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ state (array lock)                                               │
//! │   wb bitmap │ SSD cursor (current/prev) │ segment bitmap/states  │
//! │   rebuild targets │ segment under rebuild │ deferred frees       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ lock-free: valid counts, occupied counts, free segment count,    │
//! │            prohibition flags, used stripe count                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Segment lifecycle
//!
//! `Free → Active` when the SSD cursor enters it, `Active → Ssd` once every
//! stripe of it has been flushed (or skipped), `Ssd → Victim` when GC picks
//! it, and back to `Free` as soon as its valid count is zero in `Ssd` or
//! `Victim` state. A segment under rebuild is never released until the
//! rebuild lets go of it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::bitmap::Bitmap;
use super::Allocation;
use crate::address::{AddressInfo, SegmentId, StripeId, VirtualBlkAddr, VolumeId, UNMAP_STRIPE};
use crate::domain::events::{EngineEvent, EventSink};
use crate::error::{Error, Result};

// =============================================================================
// Types
// =============================================================================

/// Which of a volume's two tails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TailKind {
    User,
    Gc,
}

/// The open-for-write cursor of one tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveStripeTail {
    pub vsa: VirtualBlkAddr,
    pub wb_lsid: StripeId,
}

impl ActiveStripeTail {
    pub const UNMAP: ActiveStripeTail = ActiveStripeTail {
        vsa: VirtualBlkAddr::UNMAP,
        wb_lsid: UNMAP_STRIPE,
    };

    pub fn is_unmap(&self) -> bool {
        self.vsa.is_unmap()
    }

    /// Unmapped or filled to the last block.
    pub fn is_closed(&self, blks_per_stripe: u32) -> bool {
        self.is_unmap() || self.vsa.offset >= blks_per_stripe
    }
}

/// Segment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SegmentState {
    Free,
    /// Being filled by the SSD cursor
    Active,
    /// Every stripe flushed
    Ssd,
    /// Picked by GC
    Victim,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentState::Free => write!(f, "Free"),
            SegmentState::Active => write!(f, "Active"),
            SegmentState::Ssd => write!(f, "Ssd"),
            SegmentState::Victim => write!(f, "Victim"),
        }
    }
}

/// GC urgency derived from the free segment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum GcMode {
    None,
    Normal,
    Urgent,
}

impl fmt::Display for GcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcMode::None => write!(f, "None"),
            GcMode::Normal => write!(f, "Normal"),
            GcMode::Urgent => write!(f, "Urgent"),
        }
    }
}

/// State guarded by the array lock.
#[derive(Debug)]
pub struct ArrayState {
    wb_bitmap: Bitmap,
    wb_hint: u32,
    current_ssd_lsid: StripeId,
    prev_ssd_lsid: StripeId,
    segment_bitmap: Bitmap,
    segment_hint: u32,
    segment_states: Vec<SegmentState>,
    rebuild_targets: BTreeSet<SegmentId>,
    under_rebuild: Option<SegmentId>,
    /// Emptied while under rebuild, released by `release_rebuild_segment`
    deferred_frees: BTreeSet<SegmentId>,
}

impl ArrayState {
    /// Take the next free write-buffer stripe, skipping any slot a reader
    /// still pins.
    pub fn alloc_wb_stripe(&mut self, pinned: impl Fn(StripeId) -> bool) -> Option<StripeId> {
        let mut hint = self.wb_hint;
        for _ in 0..self.wb_bitmap.num_clear() {
            let lsid = self.wb_bitmap.find_first_clear_from(hint)?;
            if pinned(lsid) {
                warn!("Write buffer stripe {} is free but still referenced", lsid);
                hint = lsid + 1;
                continue;
            }
            self.wb_bitmap.set(lsid);
            self.wb_hint = lsid + 1;
            return Some(lsid);
        }
        None
    }

    /// Return a write-buffer stripe bit. False if it was not allocated.
    pub fn release_wb_stripe(&mut self, lsid: StripeId) -> bool {
        self.wb_bitmap.clear(lsid)
    }

    /// Claim a specific write-buffer stripe (replay). False if taken.
    pub fn mark_wb_stripe_allocated(&mut self, lsid: StripeId) -> bool {
        self.wb_bitmap.set(lsid)
    }

    pub fn is_wb_stripe_allocated(&self, lsid: StripeId) -> bool {
        self.wb_bitmap.is_set(lsid)
    }

    pub fn current_ssd_lsid(&self) -> StripeId {
        self.current_ssd_lsid
    }

    pub fn prev_ssd_lsid(&self) -> StripeId {
        self.prev_ssd_lsid
    }
}

// =============================================================================
// Allocation Context
// =============================================================================

pub struct AllocationContext {
    info: AddressInfo,
    normal_threshold: u32,
    urgent_threshold: u32,

    tails: Vec<Mutex<ActiveStripeTail>>,
    state: Mutex<ArrayState>,

    valid_counts: Vec<AtomicU32>,
    occupied_counts: Vec<AtomicU32>,
    free_segments: AtomicU32,
    used_stripes: AtomicU64,

    volume_prohibited: Vec<AtomicBool>,
    allocation_off: AtomicBool,
    user_prohibited: AtomicBool,
    gc_priority_holds: AtomicU32,

    events: EventSink,
}

impl AllocationContext {
    pub fn new(
        info: AddressInfo,
        normal_threshold: u32,
        urgent_threshold: u32,
        events: EventSink,
    ) -> Self {
        let num_segments = info.num_user_segments();
        let num_tails = info.max_volumes() as usize * 2;

        Self {
            info,
            normal_threshold,
            urgent_threshold,
            tails: (0..num_tails)
                .map(|_| Mutex::new(ActiveStripeTail::UNMAP))
                .collect(),
            state: Mutex::new(ArrayState {
                wb_bitmap: Bitmap::new(info.num_wb_stripes()),
                wb_hint: 0,
                current_ssd_lsid: UNMAP_STRIPE,
                prev_ssd_lsid: UNMAP_STRIPE,
                segment_bitmap: Bitmap::new(num_segments),
                segment_hint: 0,
                segment_states: vec![SegmentState::Free; num_segments as usize],
                rebuild_targets: BTreeSet::new(),
                under_rebuild: None,
                deferred_frees: BTreeSet::new(),
            }),
            valid_counts: (0..num_segments).map(|_| AtomicU32::new(0)).collect(),
            occupied_counts: (0..num_segments).map(|_| AtomicU32::new(0)).collect(),
            free_segments: AtomicU32::new(num_segments),
            used_stripes: AtomicU64::new(0),
            volume_prohibited: (0..info.max_volumes())
                .map(|_| AtomicBool::new(false))
                .collect(),
            allocation_off: AtomicBool::new(false),
            user_prohibited: AtomicBool::new(false),
            gc_priority_holds: AtomicU32::new(0),
            events,
        }
    }

    pub fn address_info(&self) -> &AddressInfo {
        &self.info
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ArrayState> {
        self.state.lock()
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    // =========================================================================
    // Tails
    // =========================================================================

    pub fn num_tails(&self) -> usize {
        self.tails.len()
    }

    pub fn tail_index(&self, volume_id: VolumeId, kind: TailKind) -> usize {
        match kind {
            TailKind::User => volume_id as usize,
            TailKind::Gc => (volume_id + self.info.max_volumes()) as usize,
        }
    }

    /// Volume and kind served by a tail index.
    pub fn tail_owner(&self, index: usize) -> (VolumeId, TailKind) {
        let max = self.info.max_volumes() as usize;
        if index < max {
            (index as VolumeId, TailKind::User)
        } else {
            ((index - max) as VolumeId, TailKind::Gc)
        }
    }

    pub fn tail(&self, index: usize) -> &Mutex<ActiveStripeTail> {
        &self.tails[index]
    }

    /// Snapshot of a tail without holding its lock afterwards.
    pub fn active_tail(&self, volume_id: VolumeId, kind: TailKind) -> ActiveStripeTail {
        *self.tails[self.tail_index(volume_id, kind)].lock()
    }

    // =========================================================================
    // User Area Cursor
    // =========================================================================

    /// Advance the SSD cursor by one stripe, opening a new segment on a
    /// boundary. User stripes are refused a new segment in urgent GC mode.
    pub(crate) fn allocate_user_lsid(
        &self,
        st: &mut ArrayState,
        for_user: bool,
    ) -> Allocation<StripeId> {
        let next = match st.current_ssd_lsid {
            UNMAP_STRIPE => None,
            current => Some(current + 1),
        };

        let lsid = match next {
            Some(lsid) if !self.info.is_segment_boundary(lsid) => lsid,
            _ => {
                if for_user && self.gc_mode() == GcMode::Urgent {
                    self.prohibit_user_blk_alloc_with_reason("urgent GC");
                    return Allocation::Prohibited;
                }
                match self.allocate_free_segment(st) {
                    Some(segment_id) => self.info.first_stripe_of(segment_id),
                    None => return Allocation::Exhausted,
                }
            }
        };

        st.prev_ssd_lsid = st.current_ssd_lsid;
        st.current_ssd_lsid = lsid;
        Allocation::Granted(lsid)
    }

    /// Close the segment under the cursor so the next user stripe opens a
    /// fresh one. Skipped stripes count as occupied.
    pub fn set_next_ssd_lsid(&self) {
        let mut st = self.state.lock();
        let current = st.current_ssd_lsid;
        if current == UNMAP_STRIPE {
            return;
        }

        let segment_id = self.info.segment_of(current);
        let last = self.info.first_stripe_of(segment_id) + self.info.stripes_per_segment() - 1;
        let skipped = last - current;

        st.prev_ssd_lsid = current;
        st.current_ssd_lsid = last;
        info!(
            "SSD cursor moved from {} to end of segment {} ({} stripes skipped)",
            current, segment_id, skipped
        );

        if skipped > 0 {
            self.add_occupied_locked(&mut st, segment_id, skipped);
        }
    }

    // =========================================================================
    // Segments
    // =========================================================================

    fn allocate_free_segment(&self, st: &mut ArrayState) -> Option<SegmentId> {
        let num_segments = self.info.num_user_segments();
        let mut hint = st.segment_hint;

        for _ in 0..num_segments {
            let segment_id = match st.segment_bitmap.find_first_clear_from(hint) {
                Some(id) => id,
                None => break,
            };
            if st.rebuild_targets.contains(&segment_id) {
                error!(
                    "Segment {} is free but still a rebuild target, skipping",
                    segment_id
                );
                hint = segment_id + 1;
                continue;
            }

            st.segment_bitmap.set(segment_id);
            st.segment_hint = segment_id + 1;
            st.segment_states[segment_id as usize] = SegmentState::Active;
            self.valid_counts[segment_id as usize].store(0, Ordering::Release);
            self.occupied_counts[segment_id as usize].store(0, Ordering::Release);
            let free = self.free_segments.fetch_sub(1, Ordering::AcqRel) - 1;

            debug!("Allocated segment {}, {} free", segment_id, free);
            self.events.emit(EngineEvent::SegmentAllocated {
                segment_id,
                free_segments: free,
                timestamp: Utc::now(),
            });
            return Some(segment_id);
        }

        warn!("No free segment available");
        None
    }

    /// Release a segment whose last valid block is gone. Returns true if the
    /// segment went back to the free pool right away.
    fn free_segment_locked(&self, st: &mut ArrayState, segment_id: SegmentId) -> bool {
        if st.under_rebuild == Some(segment_id) {
            info!(
                "Segment {} emptied while under rebuild, deferring release",
                segment_id
            );
            st.deferred_frees.insert(segment_id);
            return false;
        }
        if !st.segment_bitmap.clear(segment_id) {
            return false;
        }

        st.rebuild_targets.remove(&segment_id);
        st.segment_states[segment_id as usize] = SegmentState::Free;
        self.valid_counts[segment_id as usize].store(0, Ordering::Release);
        self.occupied_counts[segment_id as usize].store(0, Ordering::Release);
        let free = self.free_segments.fetch_add(1, Ordering::AcqRel) + 1;

        info!("Segment {} freed, {} free", segment_id, free);
        self.events.emit(EngineEvent::SegmentFreed {
            segment_id,
            free_segments: free,
            timestamp: Utc::now(),
        });

        if self.gc_mode() != GcMode::Urgent {
            self.permit_user_blk_alloc();
        }
        true
    }

    fn release_if_empty_locked(&self, st: &mut ArrayState, segment_id: SegmentId) -> bool {
        let state = st.segment_states[segment_id as usize];
        let closed = matches!(state, SegmentState::Ssd | SegmentState::Victim);
        if closed && self.valid_counts[segment_id as usize].load(Ordering::Acquire) == 0 {
            return self.free_segment_locked(st, segment_id);
        }
        false
    }

    fn add_occupied_locked(&self, st: &mut ArrayState, segment_id: SegmentId, n: u32) -> bool {
        let sps = self.info.stripes_per_segment();
        let occupied = self.occupied_counts[segment_id as usize].fetch_add(n, Ordering::AcqRel) + n;
        if occupied >= sps && st.segment_states[segment_id as usize] == SegmentState::Active {
            st.segment_states[segment_id as usize] = SegmentState::Ssd;
            debug!("Segment {} fully written", segment_id);
            return self.release_if_empty_locked(st, segment_id);
        }
        false
    }

    /// Record one flushed stripe of the segment owning `user_lsid`. Returns
    /// true if that freed the segment.
    pub fn increase_occupied_stripe(&self, user_lsid: StripeId) -> bool {
        let segment_id = self.info.segment_of(user_lsid);
        let mut st = self.state.lock();
        self.add_occupied_locked(&mut st, segment_id, 1)
    }

    pub fn increase_valid_blk_count(&self, segment_id: SegmentId, n: u32) -> Result<()> {
        let capacity = self.info.blks_per_segment();
        let counter = self.segment_counter(segment_id)?;
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(n).filter(|next| *next <= capacity)
            })
            .map(|_| ())
            .map_err(|current| {
                error!(
                    "Valid count overflow on segment {}: {} + {}",
                    segment_id, current, n
                );
                Error::ValidCountOverflow {
                    segment_id,
                    current,
                    increment: n,
                    capacity,
                }
            })
    }

    /// Returns true if the decrement freed the segment.
    pub fn decrease_valid_blk_count(&self, segment_id: SegmentId, n: u32) -> Result<bool> {
        let counter = self.segment_counter(segment_id)?;
        let previous = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(n)
            })
            .map_err(|current| {
                error!(
                    "Valid count underflow on segment {}: {} - {}",
                    segment_id, current, n
                );
                Error::ValidCountUnderflow {
                    segment_id,
                    current,
                    decrement: n,
                }
            })?;

        if previous == n {
            let mut st = self.state.lock();
            return Ok(self.release_if_empty_locked(&mut st, segment_id));
        }
        Ok(false)
    }

    fn segment_counter(&self, segment_id: SegmentId) -> Result<&AtomicU32> {
        self.valid_counts
            .get(segment_id as usize)
            .ok_or_else(|| Error::SegmentStateInconsistent {
                segment_id,
                state: "out of range".into(),
                operation: "valid count update",
            })
    }

    pub fn valid_blk_count(&self, segment_id: SegmentId) -> u32 {
        self.valid_counts
            .get(segment_id as usize)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn occupied_stripe_count(&self, segment_id: SegmentId) -> u32 {
        self.occupied_counts
            .get(segment_id as usize)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn segment_state(&self, segment_id: SegmentId) -> Option<SegmentState> {
        self.state
            .lock()
            .segment_states
            .get(segment_id as usize)
            .copied()
    }

    pub fn free_segment_count(&self) -> u32 {
        self.free_segments.load(Ordering::Acquire)
    }

    pub fn gc_mode(&self) -> GcMode {
        let free = self.free_segment_count();
        if free <= self.urgent_threshold {
            GcMode::Urgent
        } else if free <= self.normal_threshold {
            GcMode::Normal
        } else {
            GcMode::None
        }
    }

    /// Pick the fully written segment with the fewest valid blocks and mark
    /// it as a GC victim.
    pub fn allocate_gc_victim_segment(&self) -> Option<(SegmentId, u32)> {
        let mut st = self.state.lock();

        let victim = st
            .segment_states
            .iter()
            .enumerate()
            .filter(|(id, state)| {
                **state == SegmentState::Ssd && !st.rebuild_targets.contains(&(*id as SegmentId))
            })
            .map(|(id, _)| (id as SegmentId, self.valid_counts[id].load(Ordering::Acquire)))
            .min_by_key(|(_, valid)| *valid);

        let (segment_id, valid) = victim?;
        st.segment_states[segment_id as usize] = SegmentState::Victim;
        drop(st);

        info!(
            "Selected GC victim segment {} with {} valid blocks",
            segment_id, valid
        );
        self.events.emit(EngineEvent::VictimSelected {
            segment_id,
            valid_blocks: valid,
            timestamp: Utc::now(),
        });
        Some((segment_id, valid))
    }

    // =========================================================================
    // Used Stripe Count
    // =========================================================================

    pub fn used_stripe_count(&self) -> u64 {
        self.used_stripes.load(Ordering::Acquire)
    }

    pub(crate) fn increase_used_stripe_count(&self) {
        self.used_stripes.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrease_used_stripe_count(&self) {
        let _ = self
            .used_stripes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    pub fn free_wb_stripe_count(&self) -> u32 {
        self.state.lock().wb_bitmap.num_clear()
    }

    // =========================================================================
    // Allocation Switches
    // =========================================================================

    /// Why allocation on this tail is blocked, if it is.
    pub fn allocation_block_reason(
        &self,
        volume_id: VolumeId,
        kind: TailKind,
    ) -> Option<&'static str> {
        if self.allocation_off.load(Ordering::Acquire) {
            return Some("block allocation turned off");
        }
        match self.volume_prohibited.get(volume_id as usize) {
            Some(flag) if flag.load(Ordering::Acquire) => {
                return Some("volume allocation prohibited")
            }
            Some(_) => {}
            None => return Some("volume out of range"),
        }
        if kind == TailKind::User {
            if self.user_prohibited.load(Ordering::Acquire) {
                return Some("user allocation prohibited");
            }
            if self.gc_priority_holds.load(Ordering::Acquire) > 0 {
                return Some("GC priority hold");
            }
        }
        None
    }

    pub fn prohibit_blk_alloc(&self, volume_id: VolumeId) {
        let Some(flag) = self.volume_prohibited.get(volume_id as usize) else {
            warn!("Ignoring prohibit for out-of-range volume {}", volume_id);
            return;
        };
        flag.store(true, Ordering::Release);
        // Wait out any allocation already past the check.
        for kind in [TailKind::User, TailKind::Gc] {
            drop(self.tails[self.tail_index(volume_id, kind)].lock());
        }
    }

    pub fn permit_blk_alloc(&self, volume_id: VolumeId) {
        match self.volume_prohibited.get(volume_id as usize) {
            Some(flag) => flag.store(false, Ordering::Release),
            None => warn!("Ignoring permit for out-of-range volume {}", volume_id),
        }
    }

    /// A volume outside the array is always prohibited.
    pub fn is_blk_alloc_prohibited(&self, volume_id: VolumeId) -> bool {
        self.volume_prohibited
            .get(volume_id as usize)
            .map_or(true, |flag| flag.load(Ordering::Acquire))
    }

    /// Block every tail. Returns once no allocation is in flight.
    pub fn turn_off_blk_allocation(&self) {
        self.allocation_off.store(true, Ordering::Release);
        for tail in &self.tails {
            drop(tail.lock());
        }
        debug!("Block allocation turned off");
    }

    pub fn turn_on_blk_allocation(&self) {
        self.allocation_off.store(false, Ordering::Release);
        debug!("Block allocation turned on");
    }

    pub fn is_blk_allocation_off(&self) -> bool {
        self.allocation_off.load(Ordering::Acquire)
    }

    pub fn prohibit_user_blk_alloc(&self) {
        self.prohibit_user_blk_alloc_with_reason("administrative");
    }

    fn prohibit_user_blk_alloc_with_reason(&self, reason: &str) {
        if !self.user_prohibited.swap(true, Ordering::AcqRel) {
            warn!("User block allocation prohibited ({})", reason);
            self.events.emit(EngineEvent::AllocationProhibited {
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    pub fn permit_user_blk_alloc(&self) {
        if self.user_prohibited.swap(false, Ordering::AcqRel) {
            info!("User block allocation permitted");
            self.events.emit(EngineEvent::AllocationPermitted {
                timestamp: Utc::now(),
            });
        }
    }

    pub fn is_user_blk_alloc_prohibited(&self) -> bool {
        self.user_prohibited.load(Ordering::Acquire)
    }

    /// Block user allocation until the matching release.
    pub fn hold_gc_priority(&self) {
        self.gc_priority_holds.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_gc_priority(&self) {
        let _ = self
            .gc_priority_holds
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    pub fn gc_priority_holds(&self) -> u32 {
        self.gc_priority_holds.load(Ordering::Acquire)
    }

    // =========================================================================
    // Rebuild Targets
    // =========================================================================

    /// Snapshot every allocated segment as the rebuild target set. A stale
    /// set left by an unfinished rebuild is logged and replaced. Returns
    /// `(targets, stale entries cleared)`.
    pub fn make_rebuild_target(&self) -> (usize, usize) {
        let mut st = self.state.lock();

        let stale = st.rebuild_targets.len();
        if stale > 0 {
            warn!(
                "Rebuild target set still holds {} segments {:?}, clearing",
                stale, st.rebuild_targets
            );
            st.rebuild_targets.clear();
        }
        st.under_rebuild = None;
        self.flush_deferred_frees_locked(&mut st);

        let allocated: Vec<SegmentId> = st.segment_bitmap.iter_set().collect();
        st.rebuild_targets.extend(allocated);
        let count = st.rebuild_targets.len();
        drop(st);

        info!("Rebuild target set prepared with {} segments", count);
        self.events.emit(EngineEvent::RebuildTargetsPrepared {
            segments: count,
            stale_cleared: stale,
            timestamp: Utc::now(),
        });
        (count, stale)
    }

    /// Next segment to rebuild, marked as under rebuild.
    pub fn get_rebuild_target_segment(&self) -> Option<SegmentId> {
        let mut st = self.state.lock();
        if let Some(segment_id) = st.under_rebuild {
            return Some(segment_id);
        }

        // Segments freed since the snapshot no longer need rebuilding.
        let free: Vec<SegmentId> = st
            .rebuild_targets
            .iter()
            .copied()
            .filter(|id| !st.segment_bitmap.is_set(*id))
            .collect();
        for id in free {
            st.rebuild_targets.remove(&id);
        }

        let next = st.rebuild_targets.iter().next().copied();
        st.under_rebuild = next;
        next
    }

    /// The rebuild of `segment_id` is done.
    pub fn release_rebuild_segment(&self, segment_id: SegmentId) -> Result<()> {
        let mut st = self.state.lock();
        if !st.rebuild_targets.remove(&segment_id) {
            error!("Segment {} is not a rebuild target", segment_id);
            return Err(Error::SegmentStateInconsistent {
                segment_id,
                state: st.segment_states[segment_id as usize].to_string(),
                operation: "release_rebuild_segment",
            });
        }
        if st.under_rebuild == Some(segment_id) {
            st.under_rebuild = None;
        }
        if st.deferred_frees.remove(&segment_id) {
            self.free_segment_locked(&mut st, segment_id);
        }
        Ok(())
    }

    /// Drop the whole target set. Fails if there is none.
    pub fn clear_rebuild_targets(&self) -> Result<usize> {
        let mut st = self.state.lock();
        if st.rebuild_targets.is_empty() {
            return Err(Error::NoRebuildTarget);
        }
        let count = st.rebuild_targets.len();
        st.rebuild_targets.clear();
        st.under_rebuild = None;
        self.flush_deferred_frees_locked(&mut st);
        Ok(count)
    }

    fn flush_deferred_frees_locked(&self, st: &mut ArrayState) {
        let deferred = std::mem::take(&mut st.deferred_frees);
        for segment_id in deferred {
            self.free_segment_locked(st, segment_id);
        }
    }

    pub fn rebuild_target_count(&self) -> usize {
        self.state.lock().rebuild_targets.len()
    }

    pub fn rebuild_targets(&self) -> Vec<SegmentId> {
        self.state.lock().rebuild_targets.iter().copied().collect()
    }

    pub fn is_rebuild_target(&self, segment_id: SegmentId) -> bool {
        self.state.lock().rebuild_targets.contains(&segment_id)
    }
}
