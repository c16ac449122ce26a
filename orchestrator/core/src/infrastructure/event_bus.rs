// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Topic-Pattern Pub/Sub
//
// In-memory fan-out of BusEvents over a tokio broadcast channel. Every shard
// subscription is a filtered view of the same stream, selected by a topic
// pattern ("x.*", "*", or an exact topic).
//
// In-memory only: events published while nobody listens are gone.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::events::{topic_matches, BusEvent};

/// Event bus for publishing and subscribing to bus events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<BusEvent>>,
}

/// Callback-style consumer for [`EventBus::subscribe_with`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: BusEvent);
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events a slow subscriber may fall behind
    /// before it starts losing the oldest ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers. Returns how many receivers saw it.
    pub fn publish(&self, event: BusEvent) -> usize {
        debug!(topic = %event.event_type, source = %event.source, "Publishing event");

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
        receiver_count
    }

    /// Subscribe to every event whose topic matches `pattern`
    pub fn subscribe(&self, pattern: impl Into<String>) -> PatternReceiver {
        PatternReceiver {
            receiver: self.sender.subscribe(),
            pattern: pattern.into(),
        }
    }

    /// Subscribe and drive `handler` from a background task until the bus closes
    /// or the returned handle is aborted
    pub fn subscribe_with(
        &self,
        pattern: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> JoinHandle<()> {
        let mut receiver = self.subscribe(pattern);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler.handle(event).await,
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver yielding only events whose topic matches a pattern
pub struct PatternReceiver {
    receiver: broadcast::Receiver<BusEvent>,
    pattern: String,
}

impl PatternReceiver {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching event, skipping the rest
    pub async fn recv(&mut self) -> Result<BusEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!(pattern = %self.pattern, "Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if topic_matches(&self.pattern, &event.event_type) {
                return Ok(event);
            }
        }
    }

    /// Try to receive a matching event without blocking
    pub fn try_recv(&mut self) -> Result<BusEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!(pattern = %self.pattern, "Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if topic_matches(&self.pattern, &event.event_type) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
