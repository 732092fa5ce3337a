//! Flow Control
//!
//! Admission control between user writes and GC writes once free space runs
//! low. Two token buckets are refilled together from a split computed off
//! the free segment count; a caller whose bucket is empty gets nothing and
//! backs off.
//!
//! ```text
//!   free > normal threshold ──▶ everything granted
//!   otherwise:  bucket > 0 ──▶ CAS subtract, grant
//!               bucket ≤ 0 ──▶ try_lock refill ──▶ other bucket still
//!                                                  moving? refuse
//!                                                  stalled past timeout?
//!                                                  zero both, redistribute
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::allocator::{AllocationContext, GcMode};
use crate::config::{DistributionStrategy, FlowControlConfig};

/// Which traffic a token is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlType {
    User,
    Gc,
}

impl FlowControlType {
    fn index(self) -> usize {
        match self {
            FlowControlType::User => 0,
            FlowControlType::Gc => 1,
        }
    }

    fn counterpart(self) -> Self {
        match self {
            FlowControlType::User => FlowControlType::Gc,
            FlowControlType::Gc => FlowControlType::User,
        }
    }
}

impl fmt::Display for FlowControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowControlType::User => write!(f, "User"),
            FlowControlType::Gc => write!(f, "GC"),
        }
    }
}

/// Share of tokens the user bucket gets per GC mode under the state split.
const STATE_USER_PERCENT_NORMAL: i64 = 70;
const STATE_USER_PERCENT_URGENT: i64 = 10;

#[derive(Debug, Default)]
struct RefillState {
    previous: [i64; 2],
    force_deadline: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct FlowControlStats {
    pub granted: AtomicU64,
    pub refused: AtomicU64,
    pub refills: AtomicU64,
    pub forced_resets: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowControlStatsSnapshot {
    pub granted: u64,
    pub refused: u64,
    pub refills: u64,
    pub forced_resets: u64,
}

impl FlowControlStats {
    pub fn snapshot(&self) -> FlowControlStatsSnapshot {
        FlowControlStatsSnapshot {
            granted: self.granted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            refills: self.refills.load(Ordering::Relaxed),
            forced_resets: self.forced_resets.load(Ordering::Relaxed),
        }
    }
}

pub struct FlowControl {
    ctx: Arc<AllocationContext>,
    config: FlowControlConfig,
    normal_threshold: u32,
    urgent_threshold: u32,
    total_tokens: i64,
    min_tokens: i64,
    buckets: [AtomicI64; 2],
    refill: Mutex<RefillState>,
    stats: FlowControlStats,
}

impl FlowControl {
    pub fn new(
        ctx: Arc<AllocationContext>,
        config: FlowControlConfig,
        normal_threshold: u32,
        urgent_threshold: u32,
    ) -> Self {
        let bps = ctx.address_info().blks_per_stripe() as i64;
        let total_tokens = config.total_token_in_stripe as i64 * bps;
        Self {
            ctx,
            config,
            normal_threshold,
            urgent_threshold,
            total_tokens,
            min_tokens: bps,
            buckets: [AtomicI64::new(0), AtomicI64::new(0)],
            refill: Mutex::new(RefillState::default()),
            stats: FlowControlStats::default(),
        }
    }

    pub fn stats(&self) -> &FlowControlStats {
        &self.stats
    }

    pub fn bucket(&self, kind: FlowControlType) -> i64 {
        self.buckets[kind.index()].load(Ordering::Acquire)
    }

    /// Ask for `tokens`. Returns `tokens` or 0, never a partial amount.
    pub fn get_token(&self, kind: FlowControlType, tokens: u32) -> u32 {
        if !self.config.enable || self.ctx.free_segment_count() > self.normal_threshold {
            return tokens;
        }

        let bucket = &self.buckets[kind.index()];
        let mut refills = 0;
        let mut current = bucket.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                // At most two refills: the second one sees our own bucket
                // still dry and the counterpart full, and gives up.
                if refills == 2 || !self.try_refill(kind) {
                    self.stats.refused.fetch_add(1, Ordering::Relaxed);
                    return 0;
                }
                refills += 1;
                current = bucket.load(Ordering::Acquire);
                continue;
            }
            match bucket.compare_exchange_weak(
                current,
                current - tokens as i64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.stats.granted.fetch_add(1, Ordering::Relaxed);
                    return tokens;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back tokens taken for work that did not happen.
    pub fn return_token(&self, kind: FlowControlType, tokens: u32) {
        if !self.config.enable {
            return;
        }
        self.buckets[kind.index()].fetch_add(tokens as i64, Ordering::AcqRel);
    }

    pub fn reset(&self) {
        let mut refill = self.refill.lock();
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Release);
        }
        *refill = RefillState::default();
        debug!("Flow control buckets reset");
    }

    fn try_refill(&self, kind: FlowControlType) -> bool {
        let Some(mut state) = self.refill.try_lock() else {
            return false;
        };

        let counterpart = kind.counterpart();
        if self.bucket(counterpart) > 0 && !self.try_force_reset(&mut state, counterpart) {
            return false;
        }

        let (user, gc) = self.distribute(self.ctx.free_segment_count());
        self.buckets[FlowControlType::User.index()].fetch_add(user, Ordering::AcqRel);
        self.buckets[FlowControlType::Gc.index()].fetch_add(gc, Ordering::AcqRel);
        self.stats.refills.fetch_add(1, Ordering::Relaxed);
        info!(
            "Flow control refill for {}: user {} gc {} (buckets now {}/{})",
            kind,
            user,
            gc,
            self.bucket(FlowControlType::User),
            self.bucket(FlowControlType::Gc)
        );
        true
    }

    /// The counterpart still holds tokens. Only reclaim them once it has
    /// stopped spending for `refill_timeout`.
    fn try_force_reset(&self, state: &mut RefillState, counterpart: FlowControlType) -> bool {
        let current = self.bucket(counterpart);
        let index = counterpart.index();
        if state.previous[index] != current {
            state.previous[index] = current;
            state.force_deadline = None;
            return false;
        }

        let now = Instant::now();
        match state.force_deadline {
            None => {
                state.force_deadline = Some(now + self.config.refill_timeout);
                false
            }
            Some(deadline) if now < deadline => false,
            Some(_) => {
                for bucket in &self.buckets {
                    bucket.store(0, Ordering::Release);
                }
                state.force_deadline = None;
                self.stats.forced_resets.fetch_add(1, Ordering::Relaxed);
                info!("{} bucket stalled, flow control buckets force reset", counterpart);
                true
            }
        }
    }

    /// Split the refill between user and GC for the given free segment count.
    pub fn distribute(&self, free_segments: u32) -> (i64, i64) {
        let total = self.total_tokens;
        let user = match self.config.strategy {
            DistributionStrategy::Linear => {
                if free_segments <= self.urgent_threshold {
                    0
                } else {
                    let span = (self.normal_threshold - self.urgent_threshold + 1) as i64;
                    let above = (free_segments.min(self.normal_threshold) - self.urgent_threshold) as i64;
                    total * above / span
                }
            }
            DistributionStrategy::State => match self.ctx.gc_mode() {
                GcMode::Urgent => total * STATE_USER_PERCENT_URGENT / 100,
                _ => total * STATE_USER_PERCENT_NORMAL / 100,
            },
        };
        let gc = (total - user).max(self.min_tokens);
        (user, gc)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::address::AddressInfo;
    use crate::allocator::Allocation;
    use crate::config::GeometryConfig;
    use crate::domain::events::EventSink;

    fn context(num_segments: u32) -> Arc<AllocationContext> {
        let geometry = GeometryConfig {
            block_size: 512,
            blks_per_stripe: 4,
            stripes_per_segment: 1,
            num_segments,
            num_wb_stripes: 4,
            max_volumes: 1,
        };
        Arc::new(AllocationContext::new(
            AddressInfo::new(&geometry).unwrap(),
            4,
            1,
            EventSink::disabled(),
        ))
    }

    /// Use up segments until `free` remain.
    fn consume_segments(ctx: &AllocationContext, free: u32) {
        while ctx.free_segment_count() > free {
            let mut st = ctx.lock_state();
            assert!(matches!(
                ctx.allocate_user_lsid(&mut st, false),
                Allocation::Granted(_)
            ));
        }
    }

    fn flow_control(ctx: Arc<AllocationContext>, timeout_ms: u64) -> FlowControl {
        let config = FlowControlConfig {
            enable: true,
            strategy: DistributionStrategy::Linear,
            total_token_in_stripe: 4,
            refill_timeout: Duration::from_millis(timeout_ms),
        };
        FlowControl::new(ctx, config, 4, 1)
    }

    // =========================================================================
    // Grant Tests
    // =========================================================================

    #[test]
    fn test_plenty_of_space_grants_everything() {
        let fc = flow_control(context(10), 1000);
        assert_eq!(fc.get_token(FlowControlType::User, 1000), 1000);
        assert_eq!(fc.bucket(FlowControlType::User), 0);
    }

    #[test]
    fn test_disabled_grants_everything() {
        let ctx = context(10);
        consume_segments(&ctx, 1);
        let config = FlowControlConfig {
            enable: false,
            ..FlowControlConfig::default()
        };
        let fc = FlowControl::new(ctx, config, 4, 1);
        assert_eq!(fc.get_token(FlowControlType::User, 64), 64);
    }

    #[test]
    fn test_low_space_refills_and_splits() {
        let ctx = context(10);
        consume_segments(&ctx, 3);
        let fc = flow_control(ctx, 1000);

        // 16 tokens, free 3 of span [1, 4]: user gets 16 * 2 / 4.
        assert_eq!(fc.distribute(3), (8, 8));
        assert_eq!(fc.get_token(FlowControlType::Gc, 4), 4);
        assert_eq!(fc.bucket(FlowControlType::Gc), 4);
        assert_eq!(fc.bucket(FlowControlType::User), 8);

        assert_eq!(fc.get_token(FlowControlType::Gc, 4), 4);
        // GC bucket dry while user still holds tokens: refused.
        assert_eq!(fc.get_token(FlowControlType::Gc, 4), 0);
        fc.return_token(FlowControlType::Gc, 4);
        assert_eq!(fc.get_token(FlowControlType::Gc, 4), 4);
    }

    #[test]
    fn test_urgent_gives_user_nothing() {
        let ctx = context(10);
        consume_segments(&ctx, 1);
        let fc = flow_control(ctx, 1000);
        assert_eq!(fc.distribute(1), (0, 16));
        assert_eq!(fc.get_token(FlowControlType::User, 1), 0);
        assert_eq!(fc.get_token(FlowControlType::Gc, 16), 16);
    }

    #[test]
    fn test_stalled_counterpart_force_reset() {
        let ctx = context(10);
        consume_segments(&ctx, 3);
        let fc = flow_control(ctx, 0);

        assert_eq!(fc.get_token(FlowControlType::User, 8), 8);
        assert_eq!(fc.bucket(FlowControlType::Gc), 8);

        // Records the GC level, then arms the deadline, then resets.
        assert_eq!(fc.get_token(FlowControlType::User, 1), 0);
        assert_eq!(fc.get_token(FlowControlType::User, 1), 0);
        assert_eq!(fc.get_token(FlowControlType::User, 1), 1);
        assert_eq!(fc.stats().snapshot().forced_resets, 1);
    }

    #[test]
    fn test_reset_empties_buckets() {
        let ctx = context(10);
        consume_segments(&ctx, 3);
        let fc = flow_control(ctx, 1000);
        fc.get_token(FlowControlType::User, 1);
        fc.reset();
        assert_eq!(fc.bucket(FlowControlType::User), 0);
        assert_eq!(fc.bucket(FlowControlType::Gc), 0);
    }
}
