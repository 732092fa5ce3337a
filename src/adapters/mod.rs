//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                             │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                          │ │
//! │  │ StripeMap │ BlockMap │ ReverseMapStore │ JournalWriter     │ │
//! │  │ IoSubmitter │ EventPublisher                               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                      │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryStripeMap │ InMemoryBlockMap │ InMemoryJournal     │ │
//! │  │ InMemoryReverseMapStore │ MemoryDevice                     │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use stripeflow::adapters::{InMemoryBlockMap, MemoryDevice};
//! use stripeflow::domain::ports::BlockMap;
//!
//! let blocks = Arc::new(InMemoryBlockMap::new());
//! blocks.create_volume(0, 1 << 20)?;
//! let device = Arc::new(MemoryDevice::new(4096));
//! ```

pub mod event_publisher;
pub mod memory;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use memory::{
    InMemoryBlockMap, InMemoryJournal, InMemoryReverseMapStore, InMemoryStripeMap, MemoryDevice,
};
