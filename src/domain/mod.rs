//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for every external collaborator
//! - **Events** (`events.rs`) - Audit events and the non-blocking sink
//!
//! # Usage
//!
//! ```ignore
//! use stripeflow::domain::ports::{BlockMap, StripeMap};
//!
//! fn is_live<B: BlockMap, S: StripeMap>(blocks: &B, stripes: &S, vol: u32, rba: u64) -> bool {
//!     let vsa = blocks.get_vsa(vol, rba);
//!     !vsa.is_unmap() && stripes.get_lsa(vsa.stripe_id).is_some()
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{EngineEvent, EventSink};
pub use ports::{
    BlockMap, BlockMapUpdate, BlockMapUpdateEntry, Event, EventPublisher, EventScheduler,
    IoCallback, IoCompletion, IoDirection, IoRequest, IoSubmitter, JournalCallback,
    JournalWriter, PartitionType, ReverseMapStore, StripeMap,
};
