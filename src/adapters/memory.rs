//! In-Memory Adapters
//!
//! Heap-backed implementations of the map, journal and device ports. They
//! back the demo binary and every integration test.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::address::{Rba, ReverseMapEntry, StripeAddr, StripeId, VirtualBlkAddr, VolumeId};
use crate::domain::ports::{
    BlockMap, BlockMapUpdateEntry, IoCallback, IoCompletion, IoDirection, IoRequest, IoSubmitter,
    JournalCallback, JournalWriter, PartitionType, ReverseMapStore, StripeMap,
};
use crate::error::{Error, Result};

// =============================================================================
// Stripe Map
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryStripeMap {
    entries: DashMap<StripeId, StripeAddr>,
}

impl InMemoryStripeMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StripeMap for InMemoryStripeMap {
    fn get_lsa(&self, vsid: StripeId) -> Option<StripeAddr> {
        self.entries.get(&vsid).map(|e| *e)
    }

    fn set_lsa(&self, vsid: StripeId, addr: StripeAddr) {
        self.entries.insert(vsid, addr);
    }
}

// =============================================================================
// Block Map
// =============================================================================

#[derive(Debug)]
struct VolumeMap {
    entries: RwLock<Vec<VirtualBlkAddr>>,
}

#[derive(Debug, Default)]
pub struct InMemoryBlockMap {
    volumes: DashMap<VolumeId, Arc<VolumeMap>>,
}

impl InMemoryBlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn volume(&self, volume_id: VolumeId) -> Option<Arc<VolumeMap>> {
        self.volumes.get(&volume_id).map(|v| Arc::clone(&v))
    }

    /// Every mapping of a volume, for comparisons in tests and tools.
    pub fn snapshot(&self, volume_id: VolumeId) -> Option<Vec<VirtualBlkAddr>> {
        self.volume(volume_id).map(|v| v.entries.read().clone())
    }
}

impl BlockMap for InMemoryBlockMap {
    fn create_volume(&self, volume_id: VolumeId, size_blocks: u64) -> Result<()> {
        if self.volumes.contains_key(&volume_id) {
            return Err(Error::VolumeExists(volume_id));
        }
        self.volumes.insert(
            volume_id,
            Arc::new(VolumeMap {
                entries: RwLock::new(vec![VirtualBlkAddr::UNMAP; size_blocks as usize]),
            }),
        );
        Ok(())
    }

    fn delete_volume(&self, volume_id: VolumeId) {
        self.volumes.remove(&volume_id);
    }

    fn volume_size(&self, volume_id: VolumeId) -> Option<u64> {
        self.volume(volume_id)
            .map(|v| v.entries.read().len() as u64)
    }

    fn get_vsa(&self, volume_id: VolumeId, rba: Rba) -> VirtualBlkAddr {
        self.volume(volume_id)
            .and_then(|v| v.entries.read().get(rba as usize).copied())
            .unwrap_or(VirtualBlkAddr::UNMAP)
    }

    fn set_vsa(&self, volume_id: VolumeId, rba: Rba, vsa: VirtualBlkAddr) -> VirtualBlkAddr {
        let Some(volume) = self.volume(volume_id) else {
            warn!("Block map update for unknown volume {}", volume_id);
            return VirtualBlkAddr::UNMAP;
        };
        let mut entries = volume.entries.write();
        match entries.get_mut(rba as usize) {
            Some(slot) => std::mem::replace(slot, vsa),
            None => VirtualBlkAddr::UNMAP,
        }
    }
}

// =============================================================================
// Reverse Map
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryReverseMapStore {
    maps: DashMap<StripeId, Vec<ReverseMapEntry>>,
}

impl InMemoryReverseMapStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReverseMapStore for InMemoryReverseMapStore {
    fn store(&self, vsid: StripeId, entries: Vec<ReverseMapEntry>) {
        self.maps.insert(vsid, entries);
    }

    fn load(&self, vsid: StripeId) -> Option<Vec<ReverseMapEntry>> {
        self.maps.get(&vsid).map(|m| m.clone())
    }
}

// =============================================================================
// Journal
// =============================================================================

/// Append-only journal kept in memory. Entries are durable as soon as they
/// are appended.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    entries: Mutex<Vec<BlockMapUpdateEntry>>,
    fail_writes: AtomicBool,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<BlockMapUpdateEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Make subsequent appends fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Re-apply every logged entry to `map` in order.
    pub fn replay(&self, map: &dyn BlockMap) -> usize {
        let entries = self.entries();
        for entry in &entries {
            map.apply(entry);
        }
        entries.len()
    }
}

impl JournalWriter for InMemoryJournal {
    fn add_block_map_update(&self, entry: BlockMapUpdateEntry, on_durable: JournalCallback) {
        if self.fail_writes.load(Ordering::SeqCst) {
            on_durable(Err(Error::Journal("journal is failing writes".into())));
            return;
        }
        debug!(
            "Journaled {} map updates for volume {}",
            entry.updates.len(),
            entry.volume_id
        );
        self.entries.lock().push(entry);
        on_durable(Ok(()));
    }
}

// =============================================================================
// Device
// =============================================================================

/// A RAM disk addressed by user-area stripe id.
///
/// Completions run inline unless deferral is switched on, in which case
/// they queue until [`MemoryDevice::complete_deferred`].
pub struct MemoryDevice {
    block_size: usize,
    stripes: DashMap<StripeId, Bytes>,
    defer: AtomicBool,
    deferred: Mutex<Vec<(IoRequest, IoCallback)>>,
    failing_reads: AtomicU32,
    short_reads: AtomicU32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryDevice {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            stripes: DashMap::new(),
            defer: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
            failing_reads: AtomicU32::new(0),
            short_reads: AtomicU32::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn set_deferred(&self, defer: bool) {
        self.defer.store(defer, Ordering::SeqCst);
    }

    /// Run every queued completion. Returns how many ran.
    pub fn complete_deferred(&self) -> usize {
        let queued = std::mem::take(&mut *self.deferred.lock());
        let count = queued.len();
        for (request, callback) in queued {
            let completion = self.execute(request);
            callback(completion);
        }
        count
    }

    /// Fail the next `count` reads with a media error.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Return only the first block of the next `count` reads.
    pub fn shorten_next_reads(&self, count: u32) {
        self.short_reads.store(count, Ordering::SeqCst);
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn has_stripe(&self, lsid: StripeId) -> bool {
        self.stripes.contains_key(&lsid)
    }

    fn execute(&self, request: IoRequest) -> IoCompletion {
        if request.partition != PartitionType::UserData {
            return IoCompletion {
                lsid: request.lsid,
                data: None,
                error: Some("write buffer partition is not backed by this device".into()),
            };
        }

        let start = request.block_offset as usize * self.block_size;
        let len = request.block_count as usize * self.block_size;

        match request.direction {
            IoDirection::Write => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                let Some(data) = request.data else {
                    return IoCompletion {
                        lsid: request.lsid,
                        data: None,
                        error: Some("write without payload".into()),
                    };
                };
                if start == 0 && data.len() == len && !self.stripes.contains_key(&request.lsid) {
                    self.stripes.insert(request.lsid, data);
                } else {
                    // Partial or repeated writes merge into what is there.
                    let mut merged = BytesMut::new();
                    if let Some(existing) = self.stripes.get(&request.lsid) {
                        merged.extend_from_slice(&existing);
                    }
                    if merged.len() < start + data.len() {
                        merged.resize(start + data.len(), 0);
                    }
                    merged[start..start + data.len()].copy_from_slice(&data);
                    self.stripes.insert(request.lsid, merged.freeze());
                }
                IoCompletion {
                    lsid: request.lsid,
                    data: None,
                    error: None,
                }
            }
            IoDirection::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                if Self::take_injected(&self.failing_reads) {
                    return IoCompletion {
                        lsid: request.lsid,
                        data: None,
                        error: Some(format!("media error reading stripe {}", request.lsid)),
                    };
                }
                let len = if Self::take_injected(&self.short_reads) {
                    len.min(self.block_size)
                } else {
                    len
                };
                let data = self
                    .stripes
                    .get(&request.lsid)
                    .and_then(|stripe| {
                        if start + len <= stripe.len() {
                            Some(stripe.slice(start..start + len))
                        } else {
                            None
                        }
                    });
                match data {
                    Some(data) => IoCompletion {
                        lsid: request.lsid,
                        data: Some(data),
                        error: None,
                    },
                    None => IoCompletion {
                        lsid: request.lsid,
                        data: None,
                        error: Some(format!("stripe {} not written", request.lsid)),
                    },
                }
            }
        }
    }
}

impl IoSubmitter for MemoryDevice {
    fn submit_async_io(&self, request: IoRequest, callback: IoCallback) {
        if self.defer.load(Ordering::SeqCst) {
            self.deferred.lock().push((request, callback));
            return;
        }
        let completion = self.execute(request);
        callback(completion);
    }
}
