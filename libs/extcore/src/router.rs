//! Component H: unified local/remote call router.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::breaker::BreakerRegistry;
use crate::contracts::ServiceMethod;
use crate::errors::CoreError;
use crate::registry::Registry;
use crate::result::Result;

/// Strategy selecting between local (in-process) and remote dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStrategy {
    #[default]
    LocalFirst,
    RemoteFirst,
    LocalOnly,
    RemoteOnly,
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub strategy: CallStrategy,
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            strategy: CallStrategy::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Optional remote-call transport; absent when remote calls are disabled.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn invoke(&self, service: &str, method: &str, request: Value) -> anyhow::Result<Value>;
}

pub struct CallContext {
    pub cancel: CancellationToken,
}

/// Routes a logical `(service, method)` call to a local extension or a
/// remote transport according to `CallOptions::strategy`. Every dispatch
/// that resolves to a concrete callee runs through that extension's circuit
/// breaker; routing failures (no such service/method, no transport) bypass
/// the breaker entirely since they never reach a callee.
pub struct CallRouter {
    registry: Arc<RwLock<Registry>>,
    remote: Option<Arc<dyn RemoteTransport>>,
    breakers: Arc<BreakerRegistry>,
}

impl CallRouter {
    pub fn new(
        registry: Arc<RwLock<Registry>>,
        remote: Option<Arc<dyn RemoteTransport>>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            registry,
            remote,
            breakers,
        }
    }

    fn resolve_local(&self, service: &str, method: &str) -> Result<ServiceMethod> {
        let ext = self
            .registry
            .read()
            .get(service)
            .ok_or_else(|| CoreError::ExtensionNotFound(service.to_string()))?;
        let mut methods = ext.services();
        methods
            .remove(method)
            .ok_or_else(|| CoreError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })
    }

    async fn dispatch_local(&self, service: &str, method: &str, request: Value) -> Result<Value> {
        let call = self.resolve_local(service, method)?;
        self.breakers
            .get_or_create(service)
            .execute(async { call(request) })
            .await
    }

    async fn dispatch_remote(
        &self,
        service: &str,
        method: &str,
        request: Value,
        ctx: &CallContext,
        timeout: Duration,
    ) -> Result<Value> {
        let Some(remote) = &self.remote else {
            return Err(CoreError::ExtensionNotFound(service.to_string()));
        };
        self.breakers
            .get_or_create(service)
            .execute(async {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(CoreError::CallCancelled { service: service.to_string() }),
                    res = tokio::time::timeout(timeout, remote.invoke(service, method, request)) => {
                        match res {
                            Ok(Ok(v)) => Ok(v),
                            Ok(Err(e)) => Err(CoreError::Remote(e)),
                            Err(_) => Err(CoreError::CallTimeout { service: service.to_string() }),
                        }
                    }
                }
            })
            .await
    }

    pub async fn call_service(
        &self,
        ctx: &CallContext,
        service: &str,
        method: &str,
        request: Value,
        opts: CallOptions,
    ) -> Result<Value> {
        match opts.strategy {
            CallStrategy::LocalOnly => self.dispatch_local(service, method, request).await,
            CallStrategy::RemoteOnly => {
                self.dispatch_remote(service, method, request, ctx, opts.timeout)
                    .await
            }
            CallStrategy::LocalFirst => {
                match self.dispatch_local(service, method, request.clone()).await {
                    Ok(v) => Ok(v),
                    Err(CoreError::ExtensionNotFound(_)) | Err(CoreError::MethodNotFound { .. }) => {
                        self.dispatch_remote(service, method, request, ctx, opts.timeout)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            CallStrategy::RemoteFirst => {
                match self
                    .dispatch_remote(service, method, request.clone(), ctx, opts.timeout)
                    .await
                {
                    Ok(v) => Ok(v),
                    Err(_) => self.dispatch_local(service, method, request).await,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{Dependencies, Extension, ServiceMethod};
    use crate::context::ExtensionCtx;
    use async_trait::async_trait as at;
    use std::collections::HashMap;

    struct Echo;

    #[at]
    impl Extension for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        fn dependencies(&self) -> Dependencies {
            Dependencies::default()
        }
        async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn services(&self) -> HashMap<&'static str, ServiceMethod> {
            let mut m: HashMap<&'static str, ServiceMethod> = HashMap::new();
            m.insert("echo", Box::new(|v| Ok(v)));
            m
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Flaky;

    #[at]
    impl Extension for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        fn dependencies(&self) -> Dependencies {
            Dependencies::default()
        }
        async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn services(&self) -> HashMap<&'static str, ServiceMethod> {
            let mut m: HashMap<&'static str, ServiceMethod> = HashMap::new();
            m.insert("boom", Box::new(|_v| Err(CoreError::Other(anyhow::anyhow!("downstream failure")))));
            m
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct NoRemote;
    #[async_trait]
    impl RemoteTransport for NoRemote {
        async fn invoke(&self, service: &str, _method: &str, _request: Value) -> anyhow::Result<Value> {
            anyhow::bail!("no remote route for {service}")
        }
    }

    fn ctx() -> CallContext {
        CallContext {
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn local_first_dispatches_local_when_present() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let router = CallRouter::new(
            Arc::new(RwLock::new(registry)),
            None,
            Arc::new(BreakerRegistry::new()),
        );
        let result = router
            .call_service(&ctx(), "echo", "echo", serde_json::json!(5), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(5));
    }

    #[tokio::test]
    async fn local_only_never_touches_remote() {
        let registry = Registry::new();
        let router = CallRouter::new(
            Arc::new(RwLock::new(registry)),
            Some(Arc::new(NoRemote)),
            Arc::new(BreakerRegistry::new()),
        );
        let err = router
            .call_service(
                &ctx(),
                "missing",
                "m",
                Value::Null,
                CallOptions {
                    strategy: CallStrategy::LocalOnly,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ExtensionNotFound(_)));
    }

    #[tokio::test]
    async fn remote_only_fails_without_transport() {
        let registry = Registry::new();
        let router = CallRouter::new(
            Arc::new(RwLock::new(registry)),
            None,
            Arc::new(BreakerRegistry::new()),
        );
        let err = router
            .call_service(
                &ctx(),
                "svc",
                "m",
                Value::Null,
                CallOptions {
                    strategy: CallStrategy::RemoteOnly,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ExtensionNotFound(_)));
    }

    #[tokio::test]
    async fn repeated_local_failures_trip_the_breaker() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Flaky)).unwrap();
        let router = CallRouter::new(
            Arc::new(RwLock::new(registry)),
            None,
            Arc::new(BreakerRegistry::new()),
        );

        for _ in 0..3 {
            let err = router
                .call_service(&ctx(), "flaky", "boom", Value::Null, CallOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::Other(_)));
        }

        let err = router
            .call_service(&ctx(), "flaky", "boom", Value::Null, CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BreakerOpen(_)));
    }
}
