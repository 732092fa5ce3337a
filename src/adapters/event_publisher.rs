//! Event Publisher Adapter
//!
//! Routes engine events to tracing at a level that fits what happened:
//!
//! | Event                                   | Level |
//! |-----------------------------------------|-------|
//! | `OwnershipEscalated`                    | error |
//! | `AllocationProhibited`                  | warn  |
//! | `VictimReclaimed`, rebuild events,      | info  |
//! | `AllocationPermitted`                   |       |
//! | segment churn, `VictimSelected`         | debug |
//!
//! Segment churn happens on every stripe that crosses a segment boundary, so
//! it only reaches info when the publisher is built with `verbose()`.

use async_trait::async_trait;
use tracing::{debug, error, info, warn, Level};

use crate::domain::events::EngineEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Level an event is logged at before the verbosity override.
pub fn event_level(event: &EngineEvent) -> Level {
    match event {
        EngineEvent::OwnershipEscalated { .. } => Level::ERROR,
        EngineEvent::AllocationProhibited { .. } => Level::WARN,
        EngineEvent::AllocationPermitted { .. }
        | EngineEvent::RebuildTargetsPrepared { .. }
        | EngineEvent::RebuildStopped { .. }
        | EngineEvent::VictimReclaimed { .. } => Level::INFO,
        EngineEvent::SegmentAllocated { .. }
        | EngineEvent::SegmentFreed { .. }
        | EngineEvent::VictimSelected { .. } => Level::DEBUG,
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Raise debug-level events to info
    verbose: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose() -> Self {
        Self { verbose: true }
    }

    /// Level this publisher actually logs `event` at.
    pub fn level_for(&self, event: &EngineEvent) -> Level {
        let level = event_level(event);
        if self.verbose && level == Level::DEBUG {
            Level::INFO
        } else {
            level
        }
    }
}

macro_rules! emit {
    ($level:expr, $($arg:tt)+) => {{
        let level = $level;
        if level == Level::ERROR {
            error!($($arg)+)
        } else if level == Level::WARN {
            warn!($($arg)+)
        } else if level == Level::INFO {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    }};
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        let level = self.level_for(&event);
        match &event {
            EngineEvent::SegmentAllocated {
                segment_id,
                free_segments,
                ..
            } => emit!(level, segment_id, free_segments, "Segment allocated"),
            EngineEvent::SegmentFreed {
                segment_id,
                free_segments,
                ..
            } => emit!(level, segment_id, free_segments, "Segment freed"),
            EngineEvent::AllocationProhibited { reason, .. } => {
                emit!(level, reason = %reason, "User allocation prohibited")
            }
            EngineEvent::AllocationPermitted { .. } => emit!(level, "User allocation permitted"),
            EngineEvent::RebuildTargetsPrepared {
                segments,
                stale_cleared,
                ..
            } => emit!(level, segments, stale_cleared, "Rebuild targets prepared"),
            EngineEvent::RebuildStopped { .. } => emit!(level, "Rebuild stopped"),
            EngineEvent::VictimSelected {
                segment_id,
                valid_blocks,
                ..
            } => emit!(level, segment_id, valid_blocks, "GC victim selected"),
            EngineEvent::VictimReclaimed {
                segment_id,
                copied_blocks,
                ..
            } => emit!(level, segment_id, copied_blocks, "GC victim reclaimed"),
            EngineEvent::OwnershipEscalated {
                volume_id, retries, ..
            } => emit!(level, volume_id, retries, "GC flush escalated block ownership"),
        }
        Ok(())
    }
}

/// Keeps every published event for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<EngineEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Events a plain logging publisher would surface at warn or above.
    pub fn alerts(&self) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| event_level(e) <= Level::WARN)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<EngineEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn freed(segment_id: u32) -> EngineEvent {
        EngineEvent::SegmentFreed {
            segment_id,
            free_segments: 10,
            timestamp: Utc::now(),
        }
    }

    fn escalated() -> EngineEvent {
        EngineEvent::OwnershipEscalated {
            volume_id: 1,
            retries: 8,
            timestamp: Utc::now(),
        }
    }

    fn prohibited() -> EngineEvent {
        EngineEvent::AllocationProhibited {
            reason: "urgent GC".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_event_levels() {
        assert_eq!(event_level(&escalated()), Level::ERROR);
        assert_eq!(event_level(&prohibited()), Level::WARN);
        assert_eq!(
            event_level(&EngineEvent::RebuildStopped {
                timestamp: Utc::now()
            }),
            Level::INFO
        );
        assert_eq!(
            event_level(&EngineEvent::VictimReclaimed {
                segment_id: 3,
                copied_blocks: 12,
                timestamp: Utc::now(),
            }),
            Level::INFO
        );
        assert_eq!(event_level(&freed(1)), Level::DEBUG);
    }

    #[test]
    fn test_verbose_raises_only_debug_events() {
        let quiet = LoggingEventPublisher::new();
        let verbose = LoggingEventPublisher::verbose();

        assert_eq!(quiet.level_for(&freed(1)), Level::DEBUG);
        assert_eq!(verbose.level_for(&freed(1)), Level::INFO);
        assert_eq!(verbose.level_for(&escalated()), Level::ERROR);
        assert_eq!(verbose.level_for(&prohibited()), Level::WARN);
    }

    #[tokio::test]
    async fn test_logging_publisher_accepts_every_event() {
        let publisher = LoggingEventPublisher::verbose();
        publisher
            .publish_all(vec![
                freed(1),
                escalated(),
                prohibited(),
                EngineEvent::AllocationPermitted {
                    timestamp: Utc::now(),
                },
                EngineEvent::RebuildTargetsPrepared {
                    segments: 4,
                    stale_cleared: 1,
                    timestamp: Utc::now(),
                },
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_collector() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector.publish(freed(1)).await.unwrap();
        collector
            .publish_all(vec![freed(2), escalated(), prohibited()])
            .await
            .unwrap();

        assert_eq!(collector.len(), 4);
        assert_eq!(collector.events_of_type("SegmentFreed").len(), 2);
        let alerts: Vec<_> = collector.alerts().iter().map(|e| e.event_type()).collect();
        assert_eq!(alerts, vec!["OwnershipEscalated", "AllocationProhibited"]);
    }
}
