//! Bounded lifecycle event log with live fan-out to listeners.
//!
//! The log and the listener registry share one lock so that a streaming
//! listener can take the replay tail and register for live delivery in a
//! single step. Delivery to a listener never blocks: when its channel is full
//! the event is dropped for that listener only.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use berth_common::constants::{DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_LISTENER_BUFFER};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

/// A lifecycle event. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Action that produced the event (`create`, `start`, `die`, ...).
    pub status: String,
    /// Container or image the action applied to.
    pub id: String,
    /// Unix timestamp in seconds.
    pub time: i64,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn now(status: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            id: id.into(),
            time: chrono::Utc::now().timestamp(),
        }
    }
}

/// Identity of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
struct Registry {
    log: VecDeque<Event>,
    listeners: HashMap<ListenerId, mpsc::Sender<Event>>,
}

/// Event log plus listener registry, shared by `Arc`.
#[derive(Debug)]
pub struct EventBus {
    registry: Mutex<Registry>,
    capacity: usize,
    listener_buffer: usize,
    next_listener: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_LISTENER_BUFFER)
    }
}

impl EventBus {
    /// Creates a bus keeping at most `capacity` events and giving each
    /// listener a channel of `listener_buffer` slots.
    #[must_use]
    pub fn new(capacity: usize, listener_buffer: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            capacity: capacity.max(1),
            listener_buffer: listener_buffer.max(1),
            next_listener: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a fresh listener identity.
    pub fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    /// Appends an event and offers it to every listener without blocking.
    pub fn log_event(&self, action: &str, id: &str) -> Event {
        let event = Event::now(action, id);
        let mut registry = self.lock();
        if registry.log.len() >= self.capacity {
            let _ = registry.log.pop_front();
        }
        registry.log.push_back(event.clone());

        registry.listeners.retain(|listener, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(listener = listener.0, status = %event.status, "listener full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        drop(registry);

        tracing::debug!(status = %event.status, id = %event.id, "event logged");
        event
    }

    /// Registers `listener` and returns its delivery channel.
    ///
    /// Subscribing an id twice replaces the earlier registration, whose
    /// receiver then observes a closed channel.
    pub fn subscribe(&self, listener: ListenerId) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.listener_buffer);
        let _ = self.lock().listeners.insert(listener, tx);
        rx
    }

    /// Removes `listener`. No-op when it was never registered.
    pub fn unsubscribe(&self, listener: ListenerId) {
        let _ = self.lock().listeners.remove(&listener);
    }

    /// Number of currently registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Buffered events with `time >= since`, oldest first.
    #[must_use]
    pub fn events_since(&self, since: i64) -> Vec<Event> {
        self.lock()
            .log
            .iter()
            .filter(|event| event.time >= since)
            .cloned()
            .collect()
    }

    /// Forwards events to `out` until `cancel` resolves or `out` closes.
    ///
    /// With `since` set, buffered events stamped at or after it are replayed
    /// first. The replay tail is taken and the live registration made under the
    /// same lock, so no event is lost or duplicated across the boundary.
    pub async fn stream_since<F>(&self, since: Option<i64>, out: mpsc::Sender<Event>, cancel: F)
    where
        F: Future<Output = ()>,
    {
        let listener = self.next_listener_id();
        let (backlog, mut live) = {
            let mut registry = self.lock();
            let backlog: Vec<Event> = since.map_or_else(Vec::new, |since| {
                registry
                    .log
                    .iter()
                    .filter(|event| event.time >= since)
                    .cloned()
                    .collect()
            });
            let (tx, rx) = mpsc::channel(self.listener_buffer);
            let _ = registry.listeners.insert(listener, tx);
            (backlog, rx)
        };
        tracing::debug!(listener = listener.0, replayed = backlog.len(), "event listener attached");

        let forward = async {
            for event in backlog {
                if out.send(event).await.is_err() {
                    return;
                }
            }
            while let Some(event) = live.recv().await {
                if out.send(event).await.is_err() {
                    return;
                }
            }
        };

        tokio::select! {
            () = forward => {}
            () = cancel => {}
        }

        self.unsubscribe(listener);
        tracing::debug!(listener = listener.0, "event listener detached");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn statuses(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.status.as_str()).collect()
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_append_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(bus.next_listener_id());
        let _ = bus.log_event("A", "c1");
        let _ = bus.log_event("B", "c1");
        let _ = bus.log_event("C", "c1");

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(rx.recv().await.expect("event"));
        }
        assert_eq!(statuses(&got), ["A", "B", "C"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn log_is_bounded_and_evicts_oldest() {
        let bus = EventBus::new(2, 4);
        let _ = bus.log_event("A", "x");
        let _ = bus.log_event("B", "x");
        let _ = bus.log_event("C", "x");
        assert_eq!(statuses(&bus.events_since(0)), ["B", "C"]);
    }

    #[test]
    fn slow_listener_drops_without_blocking_logger() {
        let bus = EventBus::new(16, 1);
        let mut slow = bus.subscribe(bus.next_listener_id());
        let mut other = bus.subscribe(bus.next_listener_id());

        let _ = bus.log_event("A", "x");
        let _ = bus.log_event("B", "x");

        assert_eq!(slow.try_recv().expect("first").status, "A");
        assert!(slow.try_recv().is_err());
        assert_eq!(other.try_recv().expect("first").status, "A");
        assert_eq!(bus.events_since(0).len(), 2);
        assert_eq!(bus.listener_count(), 2);
    }

    #[test]
    fn closed_listener_is_pruned_on_next_event() {
        let bus = EventBus::default();
        drop(bus.subscribe(bus.next_listener_id()));
        assert_eq!(bus.listener_count(), 1);
        let _ = bus.log_event("A", "x");
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn unsubscribe_closes_channel_and_is_idempotent() {
        let bus = EventBus::default();
        let id = bus.next_listener_id();
        let mut rx = bus.subscribe(id);
        bus.unsubscribe(id);
        bus.unsubscribe(id);
        bus.unsubscribe(bus.next_listener_id());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn resubscribe_replaces_registration() {
        let bus = EventBus::default();
        let id = bus.next_listener_id();
        let mut first = bus.subscribe(id);
        let mut second = bus.subscribe(id);
        let _ = bus.log_event("A", "x");
        assert!(matches!(
            first.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(second.try_recv().expect("event").status, "A");
        assert_eq!(bus.listener_count(), 1);
    }

    #[tokio::test]
    async fn stream_since_replays_then_forwards_live_events() {
        let bus = Arc::new(EventBus::default());
        let start = chrono::Utc::now().timestamp();
        let _ = bus.log_event("A", "x");
        let _ = bus.log_event("B", "x");

        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let streamer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                bus.stream_since(Some(start), tx, async {
                    let _ = stop_rx.await;
                })
                .await;
            })
        };

        assert_eq!(rx.recv().await.expect("A").status, "A");
        assert_eq!(rx.recv().await.expect("B").status, "B");
        let _ = bus.log_event("C", "x");
        assert_eq!(rx.recv().await.expect("C").status, "C");

        stop_tx.send(()).expect("stop");
        tokio::time::timeout(Duration::from_secs(2), streamer)
            .await
            .expect("streamer exits")
            .expect("join");
        assert_eq!(bus.listener_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_without_since_skips_backlog() {
        let bus = Arc::new(EventBus::default());
        let _ = bus.log_event("old", "x");

        let (tx, mut rx) = mpsc::channel(16);
        let streamer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.stream_since(None, tx, std::future::pending()).await })
        };
        while bus.listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        let _ = bus.log_event("new", "x");
        assert_eq!(rx.recv().await.expect("live").status, "new");

        drop(rx);
        let _ = bus.log_event("after", "x");
        tokio::time::timeout(Duration::from_secs(2), streamer)
            .await
            .expect("streamer exits when output closes")
            .expect("join");
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_loggers_deliver_every_event_once() {
        let bus = Arc::new(EventBus::new(1024, 1024));
        let mut rx = bus.subscribe(bus.next_listener_id());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let bus = Arc::clone(&bus);
                tokio::spawn(async move {
                    for i in 0..50 {
                        let _ = bus.log_event("tick", &format!("{n}-{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join");
        }

        let mut seen = std::collections::HashSet::new();
        while let Ok(event) = rx.try_recv() {
            assert!(seen.insert(event.id));
        }
        assert_eq!(seen.len(), 400);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stream_attached_mid_burst_sees_each_event_once() {
        const TOTAL: usize = 2000;
        let bus = Arc::new(EventBus::new(TOTAL, TOTAL));
        let logger = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                for i in 0..TOTAL {
                    let _ = bus.log_event("tick", &i.to_string());
                    tokio::task::yield_now().await;
                }
            })
        };
        while bus.events_since(0).len() < 50 {
            tokio::task::yield_now().await;
        }

        let (tx, mut rx) = mpsc::channel(TOTAL);
        let streamer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.stream_since(Some(0), tx, std::future::pending()).await })
        };

        let mut ids = Vec::with_capacity(TOTAL);
        while ids.len() < TOTAL {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .expect("stream open");
            ids.push(event.id.parse::<usize>().expect("numeric id"));
        }
        let expected: Vec<usize> = (0..TOTAL).collect();
        assert_eq!(ids, expected);

        logger.await.expect("logger");
        drop(rx);
        let _ = bus.log_event("after", "x");
        tokio::time::timeout(Duration::from_secs(2), streamer)
            .await
            .expect("streamer exits")
            .expect("join");
    }

    #[test]
    fn event_serializes_with_lowercase_fields() {
        let event = Event {
            status: "start".into(),
            id: "abc".into(),
            time: 1_700_000_000,
        };
        let json = serde_json::to_value(&event).expect("encode");
        assert_eq!(json, serde_json::json!({"status": "start", "id": "abc", "time": 1_700_000_000}));
    }
}
