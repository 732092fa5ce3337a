//! GC Write Buffers
//!
//! Valid blocks copied out of a victim land in a per-volume GC buffer, a
//! smaller aggregation structure than the main write buffer. A buffer is
//! flushed once every one of its blocks is either filled or padded.
//!
//! ```text
//!   allocate_gc_blocks(vol, n)        decrease_remaining_and_check_full
//!        │ active[vol] or new buffer          │ remaining → 0
//!        ▼                                    ▼
//!   cursor += granted  ──────────────▶  caller owns the flush
//!        │ cursor == bps
//!        ▼
//!   buffer leaves active[vol]
//! ```
//!
//! `remaining` counts blocks that have not been filled yet. The caller whose
//! decrement reaches zero submits the flush, whether it was a copy or
//! [`GcStripeManager::detach_for_flush`] padding a partial buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::address::{AddressInfo, Rba, VirtualBlkAddr, VolumeId};
use crate::error::{Error, Result};

/// Where a copied block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcBlockInfo {
    pub rba: Rba,
    /// Victim location the forward map pointed at when the block was read
    pub victim: VirtualBlkAddr,
}

// =============================================================================
// GC Write Buffer
// =============================================================================

#[derive(Debug)]
pub struct GcWriteBuffer {
    id: u32,
    volume_id: VolumeId,
    block_size: usize,
    blks_per_stripe: u32,
    /// Next unassigned offset, guarded by the manager lock
    cursor: AtomicU32,
    remaining: AtomicU32,
    discarded: AtomicBool,
    data: Mutex<BytesMut>,
    blocks: Mutex<Vec<Option<GcBlockInfo>>>,
}

impl GcWriteBuffer {
    fn new(id: u32, volume_id: VolumeId, info: &AddressInfo) -> Self {
        let mut data = BytesMut::with_capacity(info.stripe_bytes());
        data.resize(info.stripe_bytes(), 0);
        Self {
            id,
            volume_id,
            block_size: info.block_size(),
            blks_per_stripe: info.blks_per_stripe(),
            cursor: AtomicU32::new(0),
            remaining: AtomicU32::new(info.blks_per_stripe()),
            discarded: AtomicBool::new(false),
            data: Mutex::new(data),
            blocks: Mutex::new(vec![None; info.blks_per_stripe() as usize]),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// The volume was deleted while this buffer was filling.
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// Copy one block of payload to `offset`.
    pub fn write_block(&self, offset: u32, block: &[u8]) -> Result<()> {
        if offset >= self.blks_per_stripe || block.len() != self.block_size {
            return Err(self.error(format!(
                "block write of {} bytes at offset {} does not fit",
                block.len(),
                offset
            )));
        }
        let start = offset as usize * self.block_size;
        self.data.lock()[start..start + self.block_size].copy_from_slice(block);
        Ok(())
    }

    /// Block origin per offset, `None` for padding.
    pub fn block_infos(&self) -> Vec<Option<GcBlockInfo>> {
        self.blocks.lock().clone()
    }

    /// Number of offsets carrying a copied block.
    pub fn copied_blocks(&self) -> u32 {
        self.blocks.lock().iter().filter(|b| b.is_some()).count() as u32
    }

    /// Move the payload out for the destination stripe.
    pub fn take_data(&self) -> BytesMut {
        std::mem::take(&mut *self.data.lock())
    }

    fn error(&self, reason: String) -> Error {
        Error::GcBuffer {
            buffer_id: self.id,
            volume_id: self.volume_id,
            reason,
        }
    }
}

/// A run of offsets handed out of one GC buffer.
#[derive(Debug, Clone)]
pub struct GcBlockGrant {
    pub buffer: Arc<GcWriteBuffer>,
    pub offset: u32,
    pub count: u32,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct GcBufferStats {
    pub buffers_allocated: AtomicU64,
    pub buffers_released: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub forced_flushes: AtomicU64,
    pub padded_blocks: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GcBufferStatsSnapshot {
    pub buffers_allocated: u64,
    pub buffers_released: u64,
    pub pool_exhausted: u64,
    pub forced_flushes: u64,
    pub padded_blocks: u64,
}

impl GcBufferStats {
    pub fn snapshot(&self) -> GcBufferStatsSnapshot {
        GcBufferStatsSnapshot {
            buffers_allocated: self.buffers_allocated.load(Ordering::Relaxed),
            buffers_released: self.buffers_released.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            forced_flushes: self.forced_flushes.load(Ordering::Relaxed),
            padded_blocks: self.padded_blocks.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// GC Stripe Manager
// =============================================================================

struct BufferTable {
    active: HashMap<VolumeId, Arc<GcWriteBuffer>>,
    in_use: u32,
    next_id: u32,
}

pub struct GcStripeManager {
    info: AddressInfo,
    max_buffers: u32,
    table: Mutex<BufferTable>,
    stats: GcBufferStats,
}

impl GcStripeManager {
    pub fn new(info: AddressInfo, max_buffers: u32) -> Self {
        Self {
            info,
            max_buffers,
            table: Mutex::new(BufferTable {
                active: HashMap::new(),
                in_use: 0,
                next_id: 0,
            }),
            stats: GcBufferStats::default(),
        }
    }

    pub fn stats(&self) -> &GcBufferStats {
        &self.stats
    }

    pub fn buffers_in_use(&self) -> u32 {
        self.table.lock().in_use
    }

    pub fn has_active_buffer(&self, volume_id: VolumeId) -> bool {
        self.table.lock().active.contains_key(&volume_id)
    }

    /// Volumes with a partially filled buffer.
    pub fn active_volumes(&self) -> Vec<VolumeId> {
        let mut volumes: Vec<_> = self.table.lock().active.keys().copied().collect();
        volumes.sort_unstable();
        volumes
    }

    /// Up to `num_blks` offsets from the volume's active buffer, opening a
    /// new one if needed. `None` when every buffer is in use.
    pub fn allocate_gc_blocks(&self, volume_id: VolumeId, num_blks: u32) -> Option<GcBlockGrant> {
        if num_blks == 0 {
            return None;
        }
        let bps = self.info.blks_per_stripe();
        let mut table = self.table.lock();

        let buffer = match table.active.get(&volume_id) {
            Some(buffer) => Arc::clone(buffer),
            None => {
                if table.in_use >= self.max_buffers {
                    self.stats.pool_exhausted.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                let id = table.next_id;
                table.next_id = table.next_id.wrapping_add(1);
                table.in_use += 1;
                let buffer = Arc::new(GcWriteBuffer::new(id, volume_id, &self.info));
                table.active.insert(volume_id, Arc::clone(&buffer));
                self.stats.buffers_allocated.fetch_add(1, Ordering::Relaxed);
                debug!("GC buffer {} opened for volume {}", id, volume_id);
                buffer
            }
        };

        let offset = buffer.cursor.load(Ordering::Acquire);
        let count = num_blks.min(bps - offset);
        buffer.cursor.store(offset + count, Ordering::Release);
        if offset + count == bps {
            table.active.remove(&volume_id);
        }

        Some(GcBlockGrant {
            buffer,
            offset,
            count,
        })
    }

    /// Record where the block at `offset` came from.
    pub fn set_blk_info(
        &self,
        buffer: &GcWriteBuffer,
        offset: u32,
        block: GcBlockInfo,
    ) -> Result<()> {
        let mut blocks = buffer.blocks.lock();
        match blocks.get_mut(offset as usize) {
            Some(slot) => {
                *slot = Some(block);
                Ok(())
            }
            None => Err(buffer.error(format!("offset {} out of range", offset))),
        }
    }

    /// `n` blocks were filled. True if the buffer is now complete and the
    /// caller must flush it.
    pub fn decrease_remaining_and_check_full(&self, buffer: &GcWriteBuffer, n: u32) -> Result<bool> {
        buffer
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(n))
            .map(|previous| previous == n)
            .map_err(|remaining| {
                error!(
                    "GC buffer {} remaining underflow: {} - {}",
                    buffer.id, remaining, n
                );
                buffer.error(format!("remaining underflow: {} - {}", remaining, n))
            })
    }

    /// Close the volume's partially filled buffer by padding its unassigned
    /// offsets. Returns the buffer if the padding completed it; otherwise an
    /// in-flight copy will. An untouched buffer is released instead.
    pub fn detach_for_flush(&self, volume_id: VolumeId) -> Result<Option<Arc<GcWriteBuffer>>> {
        let bps = self.info.blks_per_stripe();
        let (buffer, unused) = {
            let mut table = self.table.lock();
            let Some(buffer) = table.active.remove(&volume_id) else {
                return Ok(None);
            };
            let cursor = buffer.cursor.swap(bps, Ordering::AcqRel);
            if cursor == 0 {
                table.in_use = table.in_use.saturating_sub(1);
                self.stats.buffers_released.fetch_add(1, Ordering::Relaxed);
                debug!("Empty GC buffer {} of volume {} dropped", buffer.id, volume_id);
                return Ok(None);
            }
            (buffer, bps - cursor)
        };

        self.stats.forced_flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .padded_blocks
            .fetch_add(unused as u64, Ordering::Relaxed);
        debug!(
            "GC buffer {} of volume {} force-flushed with {} padded blocks",
            buffer.id, volume_id, unused
        );
        if self.decrease_remaining_and_check_full(&buffer, unused)? {
            return Ok(Some(buffer));
        }
        Ok(None)
    }

    /// Drop the volume's active buffer. Copies still holding it see
    /// [`GcWriteBuffer::is_discarded`] and the flush stage releases it.
    /// Returns the copied blocks dropped with a buffer released here.
    pub fn volume_deleted(&self, volume_id: VolumeId) -> u32 {
        let Some(buffer) = self.table.lock().active.remove(&volume_id) else {
            return 0;
        };
        buffer.discarded.store(true, Ordering::Release);
        warn!(
            "Volume {} deleted with GC buffer {} still filling",
            volume_id, buffer.id
        );

        let bps = self.info.blks_per_stripe();
        let unused = bps - buffer.cursor.swap(bps, Ordering::AcqRel);
        match self.decrease_remaining_and_check_full(&buffer, unused) {
            Ok(true) => {
                self.release_buffer(&buffer);
                buffer.copied_blocks()
            }
            Ok(false) => 0,
            Err(e) => {
                error!("Failed to close GC buffer of deleted volume {}: {}", volume_id, e);
                0
            }
        }
    }

    /// Return a flushed or discarded buffer's slot to the pool.
    pub fn release_buffer(&self, buffer: &GcWriteBuffer) {
        let mut table = self.table.lock();
        table.in_use = table.in_use.saturating_sub(1);
        self.stats.buffers_released.fetch_add(1, Ordering::Relaxed);
        debug!(
            "GC buffer {} of volume {} released, {} in use",
            buffer.id, buffer.volume_id, table.in_use
        );
    }
}
