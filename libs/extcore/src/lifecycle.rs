//! Component I: lifecycle driver.
//!
//! Generalizes the teacher's `HostRuntime::run_full_cycle` phase pipeline
//! (`wire_system -> db -> init -> rest -> grpc -> start -> wait -> stop`,
//! each phase iterating `modules_by_system_priority()`) down to this
//! system's five extension phases, run in resolved dependency order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::context::ExtensionCtx;
use crate::contracts::{Extension, ExtensionStatus};
use crate::discovery::ServiceDiscoveryClient;
use crate::errors::{CoreError, LifecycleStepError};
use crate::events::{EventRouter, EventTarget};
use crate::registry::{Registry, Resolver};
use crate::result::Result;

/// Names of extensions forced to the tail of the init order regardless of
/// their own declared edges (a "linker"-shaped extension wiring everything
/// else together belongs last).
pub const RESERVED_TAIL_NAMES: &[&str] = &["relation", "relations", "linker", "linkers"];

pub struct LifecycleReport {
    pub order: Vec<&'static str>,
    pub errors: Vec<LifecycleStepError>,
    pub statuses: HashMap<&'static str, ExtensionStatus>,
    /// Instance id returned by `register_service`, keyed by extension name;
    /// must be used (not the service name) when later deregistering.
    pub service_instance_ids: HashMap<&'static str, String>,
}

/// Drives every registered extension through
/// `PreInit -> Init -> PostInit -> (steady state) -> PreCleanup -> Cleanup`.
pub struct LifecycleDriver {
    strict: bool,
}

impl LifecycleDriver {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    pub fn plan(&self, registry: &Registry) -> Result<Vec<&'static str>> {
        let (names, edges) = registry.graph();
        Resolver::resolve(&names, &edges, RESERVED_TAIL_NAMES)
    }

    /// Run PreInit -> Init -> PostInit over every extension in plan order.
    /// A step failure is logged and marks that extension `Error`; unless
    /// `strict` is set, the driver continues with the next extension.
    /// `on_step_complete` fires right after an extension finishes
    /// successfully, before the next extension in `order` starts, so a
    /// caller can track init progress live instead of only after the whole
    /// plan returns.
    pub async fn init_all(
        &self,
        registry: &Registry,
        ctx_for: impl Fn(&'static str) -> ExtensionCtx,
        discovery: Option<&Arc<ServiceDiscoveryClient>>,
        events: &EventRouter,
        mut on_step_complete: impl FnMut(&'static str),
    ) -> Result<LifecycleReport> {
        let order = self.plan(registry)?;
        let mut errors = Vec::new();
        let mut statuses = HashMap::new();
        let mut service_instance_ids = HashMap::new();

        for &name in &order {
            let Some(ext) = registry.get(name) else {
                continue;
            };
            let ctx = ctx_for(name);

            if let Err(e) = ext.pre_init(&ctx).await {
                self.record_failure(&mut errors, &mut statuses, name, "pre_init", e)?;
                continue;
            }

            if let Err(e) = ext.init(&ctx).await {
                self.record_failure(&mut errors, &mut statuses, name, "init", e)?;
                continue;
            }

            if let Err(e) = ext.post_init(&ctx).await {
                self.record_failure(&mut errors, &mut statuses, name, "post_init", e)?;
                continue;
            }

            if ext.needs_service_discovery() {
                if let (Some(discovery), Some(info)) = (discovery, ext.service_info()) {
                    match discovery.register_service(info).await {
                        Ok(instance_id) => {
                            service_instance_ids.insert(name, instance_id);
                        }
                        Err(e) => {
                            warn!(extension = name, error = %e, "service advertisement failed");
                        }
                    }
                }
            }

            for (topic, handler) in ext.handlers() {
                if let Err(e) = events.subscribe(topic, EventTarget::Auto, Arc::from(handler)) {
                    warn!(extension = name, topic, error = %e, "handler subscription failed");
                }
            }

            statuses.insert(name, ExtensionStatus::Active);
            info!(extension = name, "extension initialized");
            on_step_complete(name);
        }

        Ok(LifecycleReport {
            order,
            errors,
            statuses,
            service_instance_ids,
        })
    }

    fn record_failure(
        &self,
        errors: &mut Vec<LifecycleStepError>,
        statuses: &mut HashMap<&'static str, ExtensionStatus>,
        name: &'static str,
        phase: &'static str,
        source: anyhow::Error,
    ) -> Result<()> {
        error!(extension = name, phase, error = %source, "lifecycle step failed");
        statuses.insert(name, ExtensionStatus::Error);
        errors.push(LifecycleStepError {
            extension: name.to_string(),
            phase,
            source,
        });
        if self.strict {
            return Err(CoreError::Other(anyhow::anyhow!(
                "strict_init: extension '{name}' failed during {phase}"
            )));
        }
        Ok(())
    }

    /// Run PreCleanup -> Cleanup in reverse plan order; best-effort.
    pub async fn cleanup_all(
        &self,
        registry: &Registry,
        order: &[&'static str],
        ctx_for: impl Fn(&'static str) -> ExtensionCtx,
        discovery: Option<&Arc<ServiceDiscoveryClient>>,
        service_instance_ids: &HashMap<&'static str, String>,
    ) -> Vec<LifecycleStepError> {
        let mut errors = Vec::new();
        for &name in order.iter().rev() {
            let Some(ext) = registry.get(name) else {
                continue;
            };
            let ctx = ctx_for(name);

            if let Err(e) = ext.pre_cleanup(&ctx).await {
                errors.push(LifecycleStepError {
                    extension: name.to_string(),
                    phase: "pre_cleanup",
                    source: e,
                });
            }
            if let Err(e) = ext.cleanup(&ctx).await {
                errors.push(LifecycleStepError {
                    extension: name.to_string(),
                    phase: "cleanup",
                    source: e,
                });
            }
            if ext.needs_service_discovery() {
                if let (Some(discovery), Some(instance_id)) =
                    (discovery, service_instance_ids.get(name))
                {
                    let _ = discovery.deregister_service(instance_id).await;
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConfigProvider;
    use crate::contracts::Dependencies;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NullConfig;
    impl ConfigProvider for NullConfig {
        fn get_extension_config(&self, _name: &str) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn get_config_raw(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    fn ctx_for(name: &'static str) -> ExtensionCtx {
        ExtensionCtx::new(
            name,
            Arc::new(NullConfig),
            std::sync::Weak::new(),
            CancellationToken::new(),
        )
    }

    struct Good(&'static str, &'static [&'static str]);
    #[async_trait]
    impl Extension for Good {
        fn name(&self) -> &'static str {
            self.0
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        fn dependencies(&self) -> Dependencies {
            Dependencies::new(self.1.to_vec(), vec![])
        }
        async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Failing(&'static str);
    #[async_trait]
    impl Extension for Failing {
        fn name(&self) -> &'static str {
            self.0
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            anyhow::bail!("always fails")
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn test_events() -> EventRouter {
        EventRouter::new(
            Arc::new(crate::events::MemoryBus::new()),
            Arc::new(crate::events::BrokerBridge::disabled()),
        )
    }

    #[tokio::test]
    async fn continues_past_a_failing_extension_by_default() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Failing("bad"))).unwrap();
        registry.register(Arc::new(Good("good", &[]))).unwrap();

        let driver = LifecycleDriver::new(false);
        let events = test_events();
        let report = driver
            .init_all(&registry, ctx_for, None, &events, |_name| {})
            .await
            .unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.statuses.get("bad"), Some(&ExtensionStatus::Error));
        assert_eq!(report.statuses.get("good"), Some(&ExtensionStatus::Active));
    }

    #[tokio::test]
    async fn strict_mode_aborts_on_first_failure() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Failing("bad"))).unwrap();

        let driver = LifecycleDriver::new(true);
        let events = test_events();
        let err = driver
            .init_all(&registry, ctx_for, None, &events, |_name| {})
            .await;
        assert!(err.is_err());
    }

    struct Logging(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);
    #[async_trait]
    impl Extension for Logging {
        fn name(&self) -> &'static str {
            self.0
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            Ok(())
        }
        async fn cleanup(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            self.1.lock().unwrap().push(self.0);
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[tokio::test]
    async fn cleanup_runs_in_reverse_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry.register(Arc::new(Logging("a", log.clone()))).unwrap();
        registry.register(Arc::new(Logging("b", log.clone()))).unwrap();

        let driver = LifecycleDriver::new(false);
        let order = vec!["a", "b"];
        let errors = driver
            .cleanup_all(&registry, &order, ctx_for, None, &HashMap::new())
            .await;
        assert!(errors.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
    }
}
