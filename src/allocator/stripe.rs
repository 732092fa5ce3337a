//! Stripe Entity
//!
//! The unit of write aggregation. A stripe slot lives forever in the write
//! buffer arena and is re-bound to a new `(vsid, wb_lsid, user_lsid)` every
//! time the allocator hands it out.
//!
//! # State machine
//!
//! ```text
//!   assign()            decrease_blks_remaining() → 0     flush()
//!  ─────────▶ OPEN ──────────────────────────────────▶ FULL ───────▶ FLUSH_PENDING
//!                                                                        │
//!                                  flush completion: finished = true     ▼
//!                                  slot released once refs == 0     RELEASED
//! ```
//!
//! `remaining` and `refs` are the synchronisation points. The caller whose
//! decrement takes `remaining` to zero owns the flush; `active_flush_target`
//! makes a second flush request a no-op. A failed flush hands the target
//! back so the pool can resubmit; a stripe that keeps failing is marked
//! `flush_failed` and stays in the write buffer.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::address::{ReverseMapEntry, StripeId, VolumeId, UNMAP_STRIPE};
use crate::domain::ports::{IoCallback, IoDirection, IoRequest, IoSubmitter, PartitionType};
use crate::error::{Error, Result};

/// Identity of the current occupant of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeBinding {
    pub vsid: StripeId,
    pub wb_lsid: StripeId,
    pub user_lsid: StripeId,
    pub volume_id: VolumeId,
}

impl StripeBinding {
    const UNBOUND: StripeBinding = StripeBinding {
        vsid: UNMAP_STRIPE,
        wb_lsid: UNMAP_STRIPE,
        user_lsid: UNMAP_STRIPE,
        volume_id: u32::MAX,
    };
}

/// A stale-safe reference to a write-buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeHandle {
    pub wb_lsid: StripeId,
    pub generation: u64,
}

#[derive(Debug)]
pub struct Stripe {
    blks_per_stripe: u32,
    block_size: usize,
    binding: RwLock<StripeBinding>,
    generation: AtomicU64,
    remaining: AtomicU32,
    refs: AtomicU32,
    finished: AtomicBool,
    active_flush_target: AtomicBool,
    flush_attempts: AtomicU32,
    flush_failed: AtomicBool,
    release_pending: AtomicBool,
    reverse_map: Mutex<Vec<ReverseMapEntry>>,
    data: Mutex<BytesMut>,
}

impl Stripe {
    /// Slot with a pre-allocated, zeroed data buffer.
    pub fn new(blks_per_stripe: u32, block_size: usize) -> Self {
        let mut data = BytesMut::with_capacity(blks_per_stripe as usize * block_size);
        data.resize(blks_per_stripe as usize * block_size, 0);
        Self::with_buffer(blks_per_stripe, block_size, data)
    }

    /// Slot without a data buffer (GC destination stripes bring their own).
    pub fn without_buffer(blks_per_stripe: u32, block_size: usize) -> Self {
        Self::with_buffer(blks_per_stripe, block_size, BytesMut::new())
    }

    fn with_buffer(blks_per_stripe: u32, block_size: usize, data: BytesMut) -> Self {
        Self {
            blks_per_stripe,
            block_size,
            binding: RwLock::new(StripeBinding::UNBOUND),
            generation: AtomicU64::new(0),
            remaining: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            finished: AtomicBool::new(true),
            active_flush_target: AtomicBool::new(false),
            flush_attempts: AtomicU32::new(0),
            flush_failed: AtomicBool::new(false),
            release_pending: AtomicBool::new(false),
            reverse_map: Mutex::new(vec![ReverseMapEntry::INVALID; blks_per_stripe as usize]),
            data: Mutex::new(data),
        }
    }

    /// Bind the slot to a new stripe and reset its lifecycle.
    pub fn assign(
        &self,
        vsid: StripeId,
        wb_lsid: StripeId,
        user_lsid: StripeId,
        volume_id: VolumeId,
    ) {
        *self.binding.write() = StripeBinding {
            vsid,
            wb_lsid,
            user_lsid,
            volume_id,
        };
        self.reverse_map
            .lock()
            .iter_mut()
            .for_each(|e| *e = ReverseMapEntry::INVALID);
        self.remaining.store(self.blks_per_stripe, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        self.active_flush_target.store(false, Ordering::Release);
        self.flush_attempts.store(0, Ordering::Release);
        self.flush_failed.store(false, Ordering::Release);
        self.release_pending.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn binding(&self) -> StripeBinding {
        *self.binding.read()
    }

    pub fn vsid(&self) -> StripeId {
        self.binding.read().vsid
    }

    pub fn wb_lsid(&self) -> StripeId {
        self.binding.read().wb_lsid
    }

    pub fn user_lsid(&self) -> StripeId {
        self.binding.read().user_lsid
    }

    pub fn volume_id(&self) -> VolumeId {
        self.binding.read().volume_id
    }

    pub fn blks_per_stripe(&self) -> u32 {
        self.blks_per_stripe
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> StripeHandle {
        StripeHandle {
            wb_lsid: self.wb_lsid(),
            generation: self.generation(),
        }
    }

    // =========================================================================
    // Remaining Blocks
    // =========================================================================

    /// Subtract `n` landed blocks and return what is left. Exactly one caller
    /// observes 0.
    pub fn decrease_blks_remaining(&self, n: u32) -> Result<u32> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(n))
            .map(|previous| previous - n)
            .map_err(|remaining| Error::RemainingUnderflow {
                wb_lsid: self.wb_lsid(),
                remaining,
                decrement: n,
            })
    }

    pub fn blks_remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    // =========================================================================
    // References
    // =========================================================================

    pub fn refer(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn derefer(&self, n: u32) -> Result<u32> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(n))
            .map(|previous| previous - n)
            .map_err(|refs| Error::ReferenceUnderflow {
                wb_lsid: self.wb_lsid(),
                refs,
                decrement: n,
            })
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Ask for the slot to be released by the last `derefer`.
    pub(crate) fn set_release_pending(&self) {
        self.release_pending.store(true, Ordering::Release);
    }

    /// Claim a pending release. Only one caller gets true.
    pub(crate) fn take_release_pending(&self) -> bool {
        self.release_pending.swap(false, Ordering::AcqRel)
    }

    // =========================================================================
    // Flush State
    // =========================================================================

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_active_flush_target(&self) -> bool {
        self.active_flush_target.load(Ordering::Acquire)
    }

    /// Claim the right to flush. False if somebody already did.
    pub fn set_active_flush_target(&self) -> bool {
        self.active_flush_target
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Count a failed write-back and give up the flush target so the stripe
    /// can be submitted again. Returns the number of failures so far.
    pub fn record_flush_failure(&self) -> u32 {
        let failures = self.flush_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        self.active_flush_target.store(false, Ordering::Release);
        failures
    }

    /// Stop retrying; the stripe keeps its slot and its buffered data.
    pub fn mark_flush_failed(&self) {
        self.active_flush_target.store(true, Ordering::Release);
        self.flush_failed.store(true, Ordering::Release);
    }

    pub fn is_flush_failed(&self) -> bool {
        self.flush_failed.load(Ordering::Acquire)
    }

    /// Hand the stripe to the backend. Returns false if a flush for this
    /// occupant was already requested.
    pub fn flush(&self, io: &dyn IoSubmitter, callback: IoCallback) -> bool {
        if !self.set_active_flush_target() {
            return false;
        }
        let request = IoRequest {
            direction: IoDirection::Write,
            partition: PartitionType::UserData,
            lsid: self.user_lsid(),
            block_offset: 0,
            block_count: self.blks_per_stripe,
            data: Some(self.snapshot_data()),
        };
        io.submit_async_io(request, callback);
        true
    }

    // =========================================================================
    // Reverse Map and Data
    // =========================================================================

    pub fn update_reverse_map(&self, offset: u32, entry: ReverseMapEntry) -> Result<()> {
        if offset >= self.blks_per_stripe {
            return Err(Error::ReverseMapOffset {
                offset,
                capacity: self.blks_per_stripe,
            });
        }
        self.reverse_map.lock()[offset as usize] = entry;
        Ok(())
    }

    /// Mark `[from, blks_per_stripe)` as carrying no user data.
    pub fn invalidate_reverse_map_from(&self, from: u32) {
        let mut map = self.reverse_map.lock();
        for entry in map.iter_mut().skip(from as usize) {
            *entry = ReverseMapEntry::INVALID;
        }
    }

    pub fn reverse_map_entry(&self, offset: u32) -> Option<ReverseMapEntry> {
        self.reverse_map.lock().get(offset as usize).copied()
    }

    pub fn reverse_map(&self) -> Vec<ReverseMapEntry> {
        self.reverse_map.lock().clone()
    }

    /// Copy `blocks` into the buffer starting at block `offset`.
    pub fn write_data(&self, offset: u32, blocks: &[u8]) -> Result<()> {
        let start = offset as usize * self.block_size;
        let end = start + blocks.len();
        let mut data = self.data.lock();
        if end > data.len() {
            return Err(Error::ReverseMapOffset {
                offset: (end / self.block_size.max(1)) as u32,
                capacity: self.blks_per_stripe,
            });
        }
        data[start..end].copy_from_slice(blocks);
        Ok(())
    }

    /// One block of buffered data.
    pub fn read_block(&self, offset: u32) -> Option<Bytes> {
        let start = offset as usize * self.block_size;
        let data = self.data.lock();
        data.get(start..start + self.block_size)
            .map(Bytes::copy_from_slice)
    }

    fn snapshot_data(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.lock())
    }

    /// Replace the buffer wholesale (GC destination stripes).
    pub fn attach_data(&self, data: BytesMut) {
        *self.data.lock() = data;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::ports::IoCompletion;

    struct CountingIo {
        submitted: AtomicU32,
    }

    impl IoSubmitter for CountingIo {
        fn submit_async_io(&self, request: IoRequest, callback: IoCallback) {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            callback(IoCompletion {
                lsid: request.lsid,
                data: None,
                error: None,
            });
        }
    }

    // =========================================================================
    // Lifecycle Tests
    // =========================================================================

    #[test]
    fn test_assign_resets_state() {
        let stripe = Stripe::new(16, 512);
        assert!(stripe.is_finished());
        let generation = stripe.generation();

        stripe.assign(40, 3, 40, 1);
        assert_eq!(stripe.vsid(), 40);
        assert_eq!(stripe.wb_lsid(), 3);
        assert_eq!(stripe.volume_id(), 1);
        assert_eq!(stripe.blks_remaining(), 16);
        assert!(!stripe.is_finished());
        assert_eq!(stripe.generation(), generation + 1);
    }

    #[test]
    fn test_decrease_remaining_sequence() {
        let stripe = Stripe::new(16, 512);
        stripe.assign(0, 0, 0, 0);
        let seen: Vec<u32> = (0..4)
            .map(|_| stripe.decrease_blks_remaining(4).unwrap())
            .collect();
        assert_eq!(seen, vec![12, 8, 4, 0]);
        assert!(matches!(
            stripe.decrease_blks_remaining(1),
            Err(Error::RemainingUnderflow { .. })
        ));
    }

    #[test]
    fn test_concurrent_decrease_single_zero_observer() {
        let stripe = Arc::new(Stripe::new(64, 512));
        stripe.assign(0, 0, 0, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stripe = Arc::clone(&stripe);
                std::thread::spawn(move || {
                    (0..8)
                        .filter(|_| stripe.decrease_blks_remaining(1).unwrap() == 0)
                        .count()
                })
            })
            .collect();

        let zeros: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(zeros, 1);
    }

    #[test]
    fn test_reference_counting() {
        let stripe = Stripe::new(4, 512);
        assert_eq!(stripe.refer(), 1);
        assert_eq!(stripe.refer(), 2);
        assert_eq!(stripe.derefer(2).unwrap(), 0);
        assert!(stripe.derefer(1).is_err());
    }

    #[test]
    fn test_flush_only_once() {
        let io = CountingIo {
            submitted: AtomicU32::new(0),
        };
        let stripe = Stripe::new(4, 512);
        stripe.assign(9, 1, 9, 0);

        assert!(stripe.flush(&io, Box::new(|_| {})));
        assert!(!stripe.flush(&io, Box::new(|_| {})));
        assert_eq!(io.submitted.load(Ordering::SeqCst), 1);

        // A new occupant may flush again.
        stripe.assign(10, 1, 10, 0);
        assert!(stripe.flush(&io, Box::new(|_| {})));
    }

    #[test]
    fn test_failed_flush_can_be_resubmitted() {
        let io = CountingIo {
            submitted: AtomicU32::new(0),
        };
        let stripe = Stripe::new(4, 512);
        stripe.assign(9, 1, 9, 0);

        assert!(stripe.flush(&io, Box::new(|_| {})));
        assert_eq!(stripe.record_flush_failure(), 1);
        assert!(stripe.flush(&io, Box::new(|_| {})));
        assert_eq!(stripe.record_flush_failure(), 2);

        stripe.mark_flush_failed();
        assert!(stripe.is_flush_failed());
        assert!(!stripe.flush(&io, Box::new(|_| {})));
        assert_eq!(io.submitted.load(Ordering::SeqCst), 2);

        stripe.assign(10, 1, 10, 0);
        assert!(!stripe.is_flush_failed());
        assert_eq!(stripe.record_flush_failure(), 1);
    }

    // =========================================================================
    // Data Tests
    // =========================================================================

    #[test]
    fn test_reverse_map_bounds() {
        let stripe = Stripe::new(4, 512);
        stripe.assign(1, 0, 1, 2);
        stripe.update_reverse_map(1, ReverseMapEntry::new(77, 2)).unwrap();
        assert_eq!(stripe.reverse_map_entry(1), Some(ReverseMapEntry::new(77, 2)));
        assert!(stripe.update_reverse_map(4, ReverseMapEntry::new(1, 2)).is_err());

        stripe.invalidate_reverse_map_from(1);
        assert_eq!(stripe.reverse_map_entry(1), Some(ReverseMapEntry::INVALID));
    }

    #[test]
    fn test_write_and_read_block() {
        let stripe = Stripe::new(4, 8);
        stripe.write_data(2, &[7u8; 8]).unwrap();
        assert_eq!(stripe.read_block(2).unwrap().as_ref(), &[7u8; 8]);
        assert_eq!(stripe.read_block(0).unwrap().as_ref(), &[0u8; 8]);
        assert!(stripe.write_data(3, &[1u8; 16]).is_err());
    }
}
