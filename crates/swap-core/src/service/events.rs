//! # Event Bus
//!
//! Broadcast channel for [`SwapEvent`]s. Components publish; the runtime,
//! the coordinator and tests subscribe. Publishing never blocks and never
//! fails: with no subscribers the event is dropped.

use crate::domain::SwapEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// In-process event bus.
pub struct EventBus {
    sender: broadcast::Sender<SwapEvent>,
    published: AtomicU64,
}

impl EventBus {
    /// Bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Bus with a specific capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Publish; returns how many subscribers received it.
    pub fn publish(&self, event: SwapEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let topic = event.topic();
        match self.sender.send(event) {
            Ok(receivers) => {
                debug!(topic, receivers, "[events] published");
                receivers
            }
            Err(_) => 0,
        }
    }

    /// New subscription receiving every later event.
    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.sender.subscribe()
    }

    /// Total events published.
    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
