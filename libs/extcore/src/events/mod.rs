//! Component C (memory event bus) and Component D (broker bridge).

pub mod broker;
pub mod memory;

pub use broker::{BrokerBridge, MessageBroker};
pub use memory::{EventEnvelope, MemoryBus, MemoryBusMetrics};

use std::sync::Arc;

use serde_json::Value;

use crate::errors::CoreError;
use crate::events::broker::BrokerMetrics;
use crate::result::Result;

/// Which transport a publish/subscribe call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventTarget {
    #[default]
    Auto,
    Memory,
    Queue,
    All,
}

/// Combined event API the Manager exposes, fanning out to the memory bus
/// and/or the broker bridge depending on `EventTarget` and whether a
/// broker is configured.
pub struct EventRouter {
    memory: Arc<MemoryBus>,
    broker: Arc<BrokerBridge>,
}

impl EventRouter {
    pub fn new(memory: Arc<MemoryBus>, broker: Arc<BrokerBridge>) -> Self {
        Self { memory, broker }
    }

    fn resolve_target(&self, target: EventTarget) -> EventTarget {
        match target {
            EventTarget::Auto if self.broker.is_active() => EventTarget::Queue,
            EventTarget::Auto => EventTarget::Memory,
            other => other,
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        target: EventTarget,
    ) -> Result<()> {
        match self.resolve_target(target) {
            EventTarget::Memory => {
                self.memory.publish(topic, payload);
                Ok(())
            }
            EventTarget::Queue => self.broker.publish(topic, payload).await,
            EventTarget::All => {
                self.memory.publish(topic, payload.clone());
                self.broker.publish(topic, payload).await
            }
            EventTarget::Auto => unreachable!("resolve_target never returns Auto"),
        }
    }

    pub fn subscribe(
        &self,
        topic: &'static str,
        target: EventTarget,
        handler: Arc<dyn Fn(EventEnvelope) + Send + Sync>,
    ) -> Result<()> {
        match self.resolve_target(target) {
            EventTarget::Memory => {
                self.memory.subscribe(topic, handler);
                Ok(())
            }
            EventTarget::Queue => {
                if !self.broker.is_active() {
                    return Err(CoreError::BrokerUnavailable);
                }
                self.broker.subscribe(topic, None, handler)
            }
            EventTarget::All => {
                self.memory.subscribe(topic, handler.clone());
                if self.broker.is_active() {
                    self.broker.subscribe(topic, None, handler)?;
                }
                Ok(())
            }
            EventTarget::Auto => unreachable!("resolve_target never returns Auto"),
        }
    }

    pub fn memory_metrics(&self) -> MemoryBusMetrics {
        self.memory.metrics()
    }

    pub fn broker_metrics(&self) -> BrokerMetrics {
        self.broker.metrics()
    }
}
