//! Block and Stripe Allocation
//!
//! Turns `(volume, block count)` requests into virtual block runs backed by
//! write-buffer stripes, and owns the lifecycle of those stripes until they
//! are flushed to the user data area.
//!
//! # Components
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  BlockAllocator          per-tail lock, rollover, rollback        │
//! │        │                                                          │
//! │        ├──▶ WriteBufferStripePool   arena of Stripe slots,        │
//! │        │                            flush trigger, rebuild prep   │
//! │        │                                                          │
//! │        └──▶ AllocationContext       tails, wb bitmap, SSD cursor, │
//! │                                     segments, rebuild targets     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order is always tail lock before the array lock. Nothing holds
//! either lock across I/O submission.

pub mod bitmap;
pub mod block_allocator;
pub mod context;
pub mod stripe;
pub mod wb_stripe_pool;

#[cfg(test)]
mod proptest;

use std::fmt;

pub use block_allocator::{BlockAllocator, BlockGrant};
pub use context::{ActiveStripeTail, AllocationContext, GcMode, SegmentState, TailKind};
pub use stripe::{Stripe, StripeHandle};
pub use wb_stripe_pool::WriteBufferStripePool;

/// Outcome of an allocation request.
///
/// Running out of space and being told to back off are both normal
/// conditions for the write path, so neither is an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation<T> {
    /// The request was served (possibly partially, see the payload).
    Granted(T),
    /// No free write-buffer stripe or no free segment.
    Exhausted,
    /// Allocation is administratively blocked for this caller.
    Prohibited,
}

impl<T> Allocation<T> {
    pub fn is_granted(&self) -> bool {
        matches!(self, Allocation::Granted(_))
    }

    pub fn granted(self) -> Option<T> {
        match self {
            Allocation::Granted(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Allocation<U> {
        match self {
            Allocation::Granted(value) => Allocation::Granted(f(value)),
            Allocation::Exhausted => Allocation::Exhausted,
            Allocation::Prohibited => Allocation::Prohibited,
        }
    }
}

impl<T> fmt::Display for Allocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Allocation::Granted(_) => write!(f, "Granted"),
            Allocation::Exhausted => write!(f, "Exhausted"),
            Allocation::Prohibited => write!(f, "Prohibited"),
        }
    }
}
