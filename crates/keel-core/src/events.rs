//! In-process event bus with durable append.
//!
//! Local delivery is synchronous: `publish` awaits every subscribed handler
//! in registration order before returning. Ordering is per-`entity_id` FIFO
//! (concurrent publishers to the same entity serialize on a per-entity
//! mutex); there is no global order. Handlers run under a deadline; on
//! elapse the delivery is abandoned and a `bus.handler_timeout` event is
//! published. Durable storage goes through the [`EventSink`] contract with
//! at-least-once semantics, so handlers must be idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// An event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Durable append-only transport for published events.
///
/// Delivery is at-least-once; consumers must tolerate replays.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &SystemEvent) -> anyhow::Result<()>;
}

/// A subscribed handler. Receives the event; the return value is ignored.
pub type EventHandler = Arc<dyn Fn(SystemEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    event_type: String,
    id: u64,
}

struct Registered {
    id: u64,
    handler: EventHandler,
}

#[derive(Default)]
struct BusState {
    handlers: HashMap<String, Vec<Registered>>,
    entity_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// The in-process event bus.
pub struct EventBus {
    state: Mutex<BusState>,
    next_id: AtomicU64,
    handler_deadline: Duration,
    sink: Option<Arc<dyn EventSink>>,
}

impl EventBus {
    /// Default deadline granted to each handler.
    pub const DEFAULT_HANDLER_DEADLINE: Duration = Duration::from_secs(5);

    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self::with_deadline(sink, Self::DEFAULT_HANDLER_DEADLINE)
    }

    pub fn with_deadline(sink: Option<Arc<dyn EventSink>>, handler_deadline: Duration) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            next_id: AtomicU64::new(0),
            handler_deadline,
            sink,
        }
    }

    /// Subscribe a handler to an event type. Handlers fire in registration
    /// order.
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: EventHandler,
    ) -> SubscriptionHandle {
        let event_type = event_type.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().expect("event bus lock poisoned");
        state
            .handlers
            .entry(event_type.clone())
            .or_default()
            .push(Registered {
                id,
                handler,
            });
        SubscriptionHandle { event_type, id }
    }

    /// Remove a subscription. Returns whether a handler was removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        if let Some(list) = state.handlers.get_mut(&handle.event_type) {
            let before = list.len();
            list.retain(|r| r.id != handle.id);
            return list.len() < before;
        }
        false
    }

    /// Publish an event: durable append, then synchronous local delivery.
    ///
    /// Returns the number of handlers that completed within their deadline.
    pub async fn publish(&self, event: SystemEvent) -> usize {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&event).await {
                // Local delivery still proceeds; the log is at-least-once,
                // not exactly-once.
                warn!(
                    event_type = %event.event_type,
                    entity_id = %event.entity_id,
                    error = %e,
                    "failed to append event to durable sink"
                );
            }
        }

        // Snapshot handlers and the entity lock without holding the bus
        // lock across an await.
        let (handlers, entity_lock) = {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            let handlers: Vec<EventHandler> = state
                .handlers
                .get(&event.event_type)
                .map(|list| list.iter().map(|r| Arc::clone(&r.handler)).collect())
                .unwrap_or_default();
            let lock = state
                .entity_locks
                .entry(event.entity_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            (handlers, lock)
        };

        let mut delivered = 0;
        let mut timed_out = 0u32;
        {
            let _entity_guard = entity_lock.lock().await;
            for handler in handlers {
                let fut = handler(event.clone());
                match tokio::time::timeout(self.handler_deadline, fut).await {
                    Ok(()) => delivered += 1,
                    Err(_) => {
                        warn!(
                            event_type = %event.event_type,
                            entity_id = %event.entity_id,
                            "event handler exceeded deadline, abandoning delivery"
                        );
                        timed_out += 1;
                    }
                }
            }
        }

        // Guard against a timeout handler itself recursing forever.
        if timed_out > 0 && event.event_type != "bus.handler_timeout" {
            let timeout_event = SystemEvent::new(
                "bus.handler_timeout",
                event.entity_type.clone(),
                event.entity_id.clone(),
                serde_json::json!({
                    "event_type": event.event_type,
                    "timed_out_handlers": timed_out,
                    "deadline_ms": self.handler_deadline.as_millis() as u64,
                }),
            );
            Box::pin(self.publish(timeout_event)).await;
        }

        delivered
    }
}
