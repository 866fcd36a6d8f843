// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory fan-out of runtime lifecycle events using tokio broadcast
// channels. Observers (CLI, metrics bridges, tests) subscribe instead of
// registering callbacks on individual components.
//
// Events are not persisted; a lagging receiver loses the oldest ones.

use crate::domain::events::{ContextEvent, DispatchEvent, ExecutionEvent, ViolationEvent};
use crate::domain::scope::Scope;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Context(ContextEvent),
    Dispatch(DispatchEvent),
    Execution(ExecutionEvent),
    Violation(ViolationEvent),
}

impl DomainEvent {
    /// Scope the event belongs to, when it carries one.
    pub fn scope(&self) -> Option<&Scope> {
        match self {
            DomainEvent::Context(ContextEvent::Created { scope, .. })
            | DomainEvent::Context(ContextEvent::Invalidated { scope, .. })
            | DomainEvent::Context(ContextEvent::Destroyed { scope, .. })
            | DomainEvent::Dispatch(DispatchEvent::Published { scope, .. })
            | DomainEvent::Execution(ExecutionEvent::Started { scope, .. })
            | DomainEvent::Execution(ExecutionEvent::Denied { scope, .. }) => Some(scope),
            DomainEvent::Violation(event) => Some(&event.violation.scope),
            _ => None,
        }
    }
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_context_event(&self, event: ContextEvent) {
        self.publish(DomainEvent::Context(event));
    }

    pub fn publish_dispatch_event(&self, event: DispatchEvent) {
        self.publish(DomainEvent::Dispatch(event));
    }

    pub fn publish_execution_event(&self, event: ExecutionEvent) {
        self.publish(DomainEvent::Execution(event));
    }

    pub fn publish_violation_event(&self, event: ViolationEvent) {
        self.publish(DomainEvent::Violation(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is listening
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        let receiver = self.sender.subscribe();
        EventReceiver { receiver }
    }

    /// Subscribe to events whose scope equals or narrows `scope`
    pub fn subscribe_scope(&self, scope: Scope) -> ScopedEventReceiver {
        let receiver = self.sender.subscribe();
        ScopedEventReceiver { receiver, scope }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one scope lineage
pub struct ScopedEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    scope: Scope,
}

impl ScopedEventReceiver {
    /// Receive the next event inside the subscribed scope; unscoped and
    /// foreign events are skipped
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.scope().is_some_and(|s| s.is_within(&self.scope)) {
                return Ok(event);
            }
        }
    }

    /// Stream of in-scope events. Lag is skipped; the stream ends when the
    /// bus closes.
    pub fn into_stream(self) -> impl Stream<Item = DomainEvent> {
        futures::stream::unfold(self, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            }
        })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::ContextHandle;
    use crate::domain::events::EvictionReason;
    use chrono::Utc;
    use futures::StreamExt;

    fn handle(index: u32) -> ContextHandle {
        ContextHandle {
            index,
            generation: 0,
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();
        let scope = Scope::agent("t1", "a1").unwrap();

        event_bus.publish_context_event(ContextEvent::Created {
            handle: handle(3),
            scope: scope.clone(),
            parent: None,
            created_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Context(ContextEvent::Created { handle: h, scope: s, .. }) => {
                assert_eq!(h, handle(3));
                assert_eq!(s, scope);
            }
            other => panic!("Wrong event type received: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scoped_receiver_skips_other_tenants() {
        let event_bus = EventBus::new(10);
        let mine = Scope::agent("t1", "a1").unwrap();
        let theirs = Scope::agent("t2", "a1").unwrap();
        let mut receiver = event_bus.subscribe_scope(mine.clone());

        event_bus.publish_context_event(ContextEvent::Destroyed {
            handle: handle(1),
            scope: theirs,
            reason: EvictionReason::Expired,
            destroyed_at: Utc::now(),
        });
        event_bus.publish_context_event(ContextEvent::Destroyed {
            handle: handle(2),
            scope: mine.clone().with_platform("qq"),
            reason: EvictionReason::CapacityLru,
            destroyed_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Context(ContextEvent::Destroyed { handle: h, reason, .. }) => {
                assert_eq!(h, handle(2));
                assert_eq!(reason, EvictionReason::CapacityLru);
            }
            other => panic!("Wrong event type received: {other:?}"),
        }
    }

    #[test]
    fn test_scoped_stream_yields_only_lineage() {
        let event_bus = EventBus::new(10);
        let mine = Scope::agent("t1", "a1").unwrap();
        let stream = event_bus.subscribe_scope(mine.clone()).into_stream();
        let mut stream = Box::pin(stream);

        event_bus.publish_context_event(ContextEvent::Created {
            handle: handle(4),
            scope: Scope::agent("t2", "a1").unwrap(),
            parent: None,
            created_at: Utc::now(),
        });
        event_bus.publish_context_event(ContextEvent::Created {
            handle: handle(5),
            scope: mine.clone().with_platform("qq"),
            parent: Some(handle(0)),
            created_at: Utc::now(),
        });

        let event = tokio_test::block_on(stream.next()).unwrap();
        assert_eq!(event.scope(), Some(&mine.with_platform("qq")));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_context_event(ContextEvent::Created {
            handle: handle(0),
            scope: Scope::agent("t1", "a1").unwrap(),
            parent: None,
            created_at: Utc::now(),
        });

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
