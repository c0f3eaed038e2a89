//! Component D: bridge to an external message broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::CoreError;
use crate::events::memory::EventEnvelope;
use crate::result::Result;

/// Abstract external message transport. The core never speaks a concrete
/// wire protocol (Kafka, NATS, RabbitMQ, ...); production deployments plug
/// in an adapter crate implementing this trait.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()>;

    /// Register a consumer; the broker adapter is responsible for invoking
    /// `handler` as messages arrive on its own task(s).
    async fn subscribe(
        &self,
        topic: &str,
        consumer_group: Option<&str>,
        handler: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BrokerMetrics {
    pub published: u64,
    pub publish_errors: u64,
    pub subscriptions: u64,
}

/// Wraps an optional `MessageBroker`. Active iff a broker was configured;
/// all operations fail fast with `BrokerUnavailable` otherwise.
pub struct BrokerBridge {
    broker: Option<Arc<dyn MessageBroker>>,
    published: AtomicU64,
    publish_errors: AtomicU64,
    subscriptions: Mutex<HashMap<String, u64>>,
}

impl BrokerBridge {
    pub fn new(broker: Option<Arc<dyn MessageBroker>>) -> Self {
        Self {
            broker,
            published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_active(&self) -> bool {
        self.broker.is_some()
    }

    pub async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let Some(broker) = &self.broker else {
            return Err(CoreError::BrokerUnavailable);
        };
        let envelope = EventEnvelope {
            timestamp: crate::events::memory::now_millis(),
            source: "extension",
            event_type: topic.to_string(),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| CoreError::Other(e.into()))?;
        match broker.publish(topic, &bytes).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.publish_errors.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::Remote(e))
            }
        }
    }

    pub fn subscribe(
        &self,
        topic: &str,
        consumer_group: Option<&str>,
        handler: Arc<dyn Fn(EventEnvelope) + Send + Sync>,
    ) -> Result<()> {
        let Some(broker) = self.broker.clone() else {
            return Err(CoreError::BrokerUnavailable);
        };
        let topic = topic.to_string();
        let group = consumer_group.map(str::to_string);
        *self
            .subscriptions
            .lock()
            .entry(topic.clone())
            .or_insert(0) += 1;

        let raw_handler: Arc<dyn Fn(Vec<u8>) + Send + Sync> = Arc::new(move |bytes| {
            if let Ok(envelope) = serde_json::from_slice::<EventEnvelope>(&bytes) {
                handler(envelope);
            } else {
                tracing::warn!("dropped malformed broker envelope");
            }
        });

        tokio::spawn(async move {
            if let Err(e) = broker
                .subscribe(&topic, group.as_deref(), raw_handler)
                .await
            {
                tracing::error!(topic, error = %e, "broker subscribe failed");
            }
        });
        Ok(())
    }

    pub fn metrics(&self) -> BrokerMetrics {
        BrokerMetrics {
            published: self.published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.lock().values().sum(),
        }
    }
}
