//! GC Copier
//!
//! The long-lived event that drives reclamation one victim segment at a
//! time.
//!
//! ```text
//!            stop requested
//!   ┌──────────────────────────────────────────────▶ ReadyToEnd ─▶ done
//!   │                                                    ▲ drained
//!  ThresholdCheck ──victim──▶ CopyPrepare ──all read──▶ CopyComplete
//!   ▲                          one stripe per run          │ force-flush,
//!   └──────────────────────── reclaimed ◀──────────────────┘ wait drain
//! ```

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use super::pipeline::{FlushSubmission, VictimRead};
use super::victim::VictimStripe;
use super::GcContext;
use crate::address::SegmentId;
use crate::allocator::GcMode;
use crate::domain::events::EngineEvent;
use crate::domain::ports::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CopierState {
    ThresholdCheck,
    CopyPrepare,
    CopyComplete,
    ReadyToEnd,
}

impl fmt::Display for CopierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopierState::ThresholdCheck => write!(f, "ThresholdCheck"),
            CopierState::CopyPrepare => write!(f, "CopyPrepare"),
            CopierState::CopyComplete => write!(f, "CopyComplete"),
            CopierState::ReadyToEnd => write!(f, "ReadyToEnd"),
        }
    }
}

pub struct Copier {
    gc: Arc<GcContext>,
    state: CopierState,
    victim: SegmentId,
    next_stripe: u32,
    force_flushed: bool,
    /// `copied_blocks` when the victim was picked
    copied_before: u64,
}

impl Copier {
    pub fn new(gc: Arc<GcContext>) -> Self {
        Self {
            gc,
            state: CopierState::ThresholdCheck,
            victim: 0,
            next_stripe: 0,
            force_flushed: false,
            copied_before: 0,
        }
    }

    pub fn state(&self) -> CopierState {
        self.state
    }

    fn set_state(&mut self, state: CopierState) {
        debug!("GC copier {} -> {}", self.state, state);
        self.state = state;
    }

    fn check_threshold(&mut self) {
        let meta = &self.gc.meta;
        if meta.is_stop_requested() {
            self.set_state(CopierState::ReadyToEnd);
            return;
        }
        if meta.is_paused() {
            return;
        }

        let ctx = self.gc.allocation_context();
        if ctx.gc_mode() == GcMode::None {
            return;
        }
        let Some((segment_id, valid)) = ctx.allocate_gc_victim_segment() else {
            return;
        };

        info!(
            "GC ({}) reclaiming segment {} with {} valid blocks",
            ctx.gc_mode(),
            segment_id,
            valid
        );
        meta.set_victim(Some(segment_id));
        meta.stats().victims_selected.fetch_add(1, Ordering::Relaxed);
        self.victim = segment_id;
        self.next_stripe = 0;
        self.force_flushed = false;
        self.copied_before = meta.stats().copied_blocks.load(Ordering::Relaxed);
        self.set_state(CopierState::CopyPrepare);
    }

    /// Read one victim stripe per run.
    fn copy_prepare(&mut self) {
        if self.gc.meta.is_paused() {
            return;
        }
        let info = *self.gc.allocation_context().address_info();
        if self.next_stripe >= info.stripes_per_segment() {
            self.set_state(CopierState::CopyComplete);
            return;
        }

        let lsid = info.first_stripe_of(self.victim) + self.next_stripe;
        self.next_stripe += 1;

        let gc = &self.gc;
        let victim = match VictimStripe::load(
            lsid,
            gc.stripe_map.as_ref(),
            gc.block_map.as_ref(),
            gc.reverse_maps.as_ref(),
        ) {
            Ok(victim) => victim,
            Err(e) => {
                error!("Skipping victim stripe {}: {}", lsid, e);
                return;
            }
        };
        if victim.is_empty() {
            return;
        }

        let blocks = victim.into_valid_blocks();
        debug!("Reading {} live blocks of victim stripe {}", blocks.len(), lsid);
        gc.meta.read_submitted();
        VictimRead::new(Arc::clone(gc), lsid, blocks).submit();
    }

    fn copy_complete(&mut self) {
        let gc = Arc::clone(&self.gc);
        if gc.meta.pending_reads() > 0 {
            return;
        }

        if !self.force_flushed {
            self.force_flushed = true;
            for volume_id in gc.buffers.active_volumes() {
                match gc.buffers.detach_for_flush(volume_id) {
                    Ok(Some(buffer)) => gc
                        .scheduler
                        .enqueue(Box::new(FlushSubmission::new(Arc::clone(&gc), buffer))),
                    Ok(None) => {}
                    Err(e) => error!("Force flush of volume {} failed: {}", volume_id, e),
                }
            }
            return;
        }

        if gc.meta.outstanding_blocks() > 0 {
            return;
        }

        let ctx = gc.allocation_context();
        let stats = gc.meta.stats();
        let copied = stats.copied_blocks.load(Ordering::Relaxed) - self.copied_before;
        stats.victims_reclaimed.fetch_add(1, Ordering::Relaxed);
        info!(
            "Victim segment {} reclaimed, {} blocks copied, {} free segments",
            self.victim,
            copied,
            ctx.free_segment_count()
        );
        ctx.events().emit(EngineEvent::VictimReclaimed {
            segment_id: self.victim,
            copied_blocks: copied,
            timestamp: Utc::now(),
        });
        gc.meta.set_victim(None);

        if ctx.gc_mode() != GcMode::Urgent {
            ctx.permit_user_blk_alloc();
        }
        self.set_state(CopierState::ThresholdCheck);
    }

    fn ready_to_end(&self) -> bool {
        let meta = &self.gc.meta;
        if meta.pending_reads() > 0 || meta.outstanding_blocks() > 0 {
            return false;
        }
        meta.set_stopped();
        info!("GC copier stopped");
        true
    }
}

impl Event for Copier {
    fn execute(&mut self) -> bool {
        match self.state {
            CopierState::ThresholdCheck => self.check_threshold(),
            CopierState::CopyPrepare => self.copy_prepare(),
            CopierState::CopyComplete => self.copy_complete(),
            CopierState::ReadyToEnd => return self.ready_to_end(),
        }
        false
    }

    fn name(&self) -> &'static str {
        "gc_copier"
    }
}
