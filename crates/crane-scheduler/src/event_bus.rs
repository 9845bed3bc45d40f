//! Broadcast of cluster state transitions
//!
//! Every component publishes its transitions here. Subscribers (the REST
//! event stream, tests) each get a bounded buffer; a slow subscriber loses
//! the oldest events rather than blocking publishers.

use chrono::Utc;
use crane_core::{ClusterEvent, EventEnvelope};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-subscriber buffer
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Sequenced broadcast channel for [`ClusterEvent`]s
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    seq: AtomicU64,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish(&self, event: ClusterEvent) -> usize {
        let envelope = EventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            at: Utc::now(),
            event,
        };
        trace!(seq = envelope.seq, kind = envelope.event.kind(), "Event published");
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn publish_batch(&self, events: impl IntoIterator<Item = ClusterEvent>) -> usize {
        events.into_iter().map(|e| self.publish(e)).sum()
    }

    /// Receive all events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sequence number of the latest event (0 before the first)
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
