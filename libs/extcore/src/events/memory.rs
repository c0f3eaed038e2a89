//! Component C: in-process event bus with panic-isolated fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

/// Envelope delivered to every subscriber; handlers never see a raw payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventEnvelope {
    pub timestamp: u64,
    pub source: &'static str,
    pub event_type: String,
    pub payload: Value,
}

type Handler = Arc<dyn Fn(EventEnvelope) + Send + Sync>;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct MemoryBusMetrics {
    pub processed: u64,
    pub failed: u64,
    pub inflight: u64,
    pub last_event_time: Option<u64>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    inflight: AtomicU64,
    last_event_time: AtomicU64,
}

/// Thread-safe topic -> handler-list fan-out bus.
///
/// Grounded on the teacher's preference for `parking_lot::RwLock` guarding
/// a snapshot-then-dispatch pattern: readers (the dispatch loop) never hold
/// the lock across a suspension point, only while cloning the handler list.
pub struct MemoryBus {
    subscribers: RwLock<HashMap<String, Vec<Handler>>>,
    counters: Arc<Counters>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn subscribe(&self, topic: &str, handler: Handler) {
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    /// Schedule delivery to every current subscriber of `topic`. Returns
    /// immediately; each handler runs in its own task so one panicking
    /// handler never takes down the others or this call.
    pub fn publish(&self, topic: &str, payload: Value) {
        let handlers = {
            let guard = self.subscribers.read();
            guard.get(topic).cloned().unwrap_or_default()
        };

        let envelope = EventEnvelope {
            timestamp: now_millis(),
            source: "extension",
            event_type: topic.to_string(),
            payload,
        };
        self.counters
            .last_event_time
            .store(envelope.timestamp, Ordering::Relaxed);

        for handler in handlers {
            let envelope = envelope.clone();
            let counters = self.counters.clone();
            counters.inflight.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler(envelope);
                }));
                match result {
                    Ok(()) => {
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        warn!("event handler panicked");
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                counters.inflight.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Retry publishing up to `max_attempts` times, backing off one second
    /// per attempt number; an attempt "fails" iff nobody is subscribed yet.
    pub async fn publish_with_retry(&self, topic: &str, payload: Value, max_attempts: u32) {
        for attempt in 1..=max_attempts.max(1) {
            let has_subscribers = self
                .subscribers
                .read()
                .get(topic)
                .is_some_and(|v| !v.is_empty());
            if has_subscribers {
                self.publish(topic, payload);
                return;
            }
            if attempt < max_attempts {
                tokio::time::sleep(std::time::Duration::from_secs(attempt as u64)).await;
            }
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(topic, "publish_with_retry exhausted attempts with no subscribers");
    }

    pub fn metrics(&self) -> MemoryBusMetrics {
        MemoryBusMetrics {
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            inflight: self.counters.inflight.load(Ordering::Relaxed),
            last_event_time: match self.counters.last_event_time.load(Ordering::Relaxed) {
                0 => None,
                t => Some(t),
            },
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn fan_out_delivers_to_every_subscriber() {
        let bus = MemoryBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            bus.subscribe(
                "t",
                Arc::new(move |env| {
                    assert_eq!(env.event_type, "t");
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        bus.publish("t", serde_json::json!(42));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(bus.metrics().processed, 3);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_break_bus() {
        let bus = MemoryBus::new();
        bus.subscribe("t", Arc::new(|_env| panic!("boom")));
        bus.publish("t", serde_json::json!(1));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(bus.metrics().failed, 1);
        assert_eq!(bus.metrics().processed, 0);
    }

    #[tokio::test]
    async fn publish_with_retry_succeeds_once_subscribed() {
        let bus = Arc::new(MemoryBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let bus2 = bus.clone();
        let hits2 = hits.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            bus2.subscribe(
                "late",
                Arc::new(move |_env| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            );
        });
        bus.publish_with_retry("late", serde_json::json!(1), 3).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
