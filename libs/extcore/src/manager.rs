//! Component J: Manager facade. Holds components A-I, exposes a read-heavy
//! lookup API, an admin API, and the admin HTTP surface as an `axum::Router`.
//!
//! Grounded on the teacher's `ModuleManager` (single facade over the
//! registry, `DashMap`-tracked instances, one `RwLock`-guarded aggregate
//! state) and `HostRuntime::run_rest_phase` for the router-composition shape
//! of `admin_router`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::breaker::BreakerRegistry;
use crate::context::{ConfigProvider, ExtensionCtx};
use crate::contracts::{Extension, ExtensionStatus, HandlerFn, Metadata};
use crate::discovery::{AdvertisedService, ServiceDiscoveryClient};
use crate::errors::{CoreError, LifecycleStepError};
use crate::events::{EventRouter, EventTarget};
use crate::lifecycle::{LifecycleDriver, LifecycleReport};
use crate::plugin::{LoaderConfig, PluginLoader};
use crate::registry::Registry;
use crate::result::Result;
use crate::router::{CallContext, CallOptions, CallRouter, RemoteTransport};

/// Thread-safe holder for the whole extension runtime. Read APIs use the
/// shared registry lock; admin APIs additionally serialize through their
/// own step-specific state (`order`, `statuses`, `initialized`, `closed`).
pub struct Manager {
    registry: Arc<RwLock<Registry>>,
    config: Arc<dyn ConfigProvider>,
    events: Arc<EventRouter>,
    discovery: Option<Arc<ServiceDiscoveryClient>>,
    breakers: Arc<BreakerRegistry>,
    call_router: Arc<CallRouter>,
    plugins: Arc<PluginLoader>,
    lifecycle: LifecycleDriver,
    order: RwLock<Vec<&'static str>>,
    statuses: RwLock<HashMap<&'static str, ExtensionStatus>>,
    /// Instance id handed back by `register_service`, keyed by extension
    /// name; `deregister_service` must be called with this, not the service
    /// name, or the backend's id-keyed retain predicate never matches.
    service_instance_ids: RwLock<HashMap<&'static str, String>>,
    /// Names that have completed their own `init` during the in-flight
    /// `init_extensions` run, in completion order. Consulted by
    /// `get_extension` only while `init_running` is set, so a peer's `init`
    /// can never observe an extension later in the plan than itself.
    init_progress: RwLock<Vec<&'static str>>,
    init_running: AtomicBool,
    initialized: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    self_weak: Weak<Manager>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Registry,
        config: Arc<dyn ConfigProvider>,
        events: Arc<EventRouter>,
        discovery: Option<Arc<ServiceDiscoveryClient>>,
        remote: Option<Arc<dyn RemoteTransport>>,
        plugin_config: LoaderConfig,
        strict_init: bool,
    ) -> Arc<Self> {
        let registry = Arc::new(RwLock::new(registry));
        let breakers = Arc::new(BreakerRegistry::new());
        let call_router = Arc::new(CallRouter::new(registry.clone(), remote, breakers.clone()));
        let plugins = Arc::new(PluginLoader::new(plugin_config, registry.clone()));

        Arc::new_cyclic(|weak| Self {
            registry,
            config,
            events,
            discovery,
            breakers,
            call_router,
            plugins,
            lifecycle: LifecycleDriver::new(strict_init),
            order: RwLock::new(Vec::new()),
            statuses: RwLock::new(HashMap::new()),
            service_instance_ids: RwLock::new(HashMap::new()),
            init_progress: RwLock::new(Vec::new()),
            init_running: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            self_weak: weak.clone(),
        })
    }

    fn ctx_for(&self, name: &'static str) -> ExtensionCtx {
        ExtensionCtx::new(name, self.config.clone(), self.self_weak.clone(), self.cancel.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::ManagerClosed);
        }
        Ok(())
    }

    // ---- read API ----

    pub fn get_extension(&self, name: &str) -> Result<Arc<dyn Extension>> {
        self.ensure_open()?;
        if self.init_running.load(Ordering::Acquire)
            && !self.init_progress.read().iter().any(|&n| n == name)
        {
            // Extensions run init sequentially in plan order; while that's in
            // flight, a peer not yet in init_progress hasn't finished its own
            // init and must stay invisible to whoever is looking it up.
            return Err(CoreError::ExtensionNotFound(name.to_string()));
        }
        self.registry
            .read()
            .get(name)
            .ok_or_else(|| CoreError::ExtensionNotFound(name.to_string()))
    }

    pub async fn get_service(&self, name: &str) -> Result<AdvertisedService> {
        self.ensure_open()?;
        let discovery = self
            .discovery
            .as_ref()
            .ok_or_else(|| CoreError::ServiceNotFound(name.to_string()))?;
        discovery.get_service(name).await
    }

    pub fn get_handlers(&self, name: &str) -> Result<HashMap<&'static str, HandlerFn>> {
        Ok(self.get_extension(name)?.handlers())
    }

    pub fn get_metadata(&self, name: &str) -> Result<Metadata> {
        Ok(self.get_extension(name)?.metadata())
    }

    pub fn get_status(&self, name: &str) -> Result<ExtensionStatus> {
        self.ensure_open()?;
        if let Some(status) = self.statuses.read().get(name) {
            return Ok(*status);
        }
        Ok(self.get_extension(name)?.status())
    }

    pub fn list_extensions(&self) -> Result<Vec<(&'static str, Metadata)>> {
        self.ensure_open()?;
        Ok(self
            .registry
            .read()
            .all()
            .iter()
            .map(|e| (e.name(), e.metadata()))
            .collect())
    }

    pub async fn call_service(
        &self,
        service: &str,
        method: &str,
        request: Value,
        opts: CallOptions,
    ) -> Result<Value> {
        self.ensure_open()?;
        let ctx = CallContext {
            cancel: self.cancel.child_token(),
        };
        self.call_router
            .call_service(&ctx, service, method, request, opts)
            .await
    }

    pub async fn publish_event(&self, topic: &str, payload: Value, target: EventTarget) -> Result<()> {
        self.ensure_open()?;
        self.events.publish(topic, payload, target).await
    }

    // ---- admin API ----

    pub fn register(&self, ext: Arc<dyn Extension>) -> Result<()> {
        self.ensure_open()?;
        self.registry.write().register(ext)
    }

    /// Run one extension through `pre_init -> init -> post_init` and, on
    /// success, advertise it to service discovery if it opts in. Used by
    /// `load_plugin`/`reload_plugin` to bring a single extension up without
    /// re-running the whole lifecycle plan.
    async fn init_one(&self, name: &'static str) -> Result<()> {
        let ext = self
            .registry
            .read()
            .get(name)
            .ok_or_else(|| CoreError::ExtensionNotFound(name.to_string()))?;
        let ctx = self.ctx_for(name);

        let outcome: anyhow::Result<()> = async {
            ext.pre_init(&ctx).await?;
            ext.init(&ctx).await?;
            ext.post_init(&ctx).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.statuses.write().insert(name, ExtensionStatus::Active);
                if ext.needs_service_discovery() {
                    if let (Some(discovery), Some(info)) = (&self.discovery, ext.service_info()) {
                        match discovery.register_service(info).await {
                            Ok(instance_id) => {
                                self.service_instance_ids.write().insert(name, instance_id);
                            }
                            Err(e) => {
                                tracing::warn!(extension = name, error = %e, "service advertisement failed");
                            }
                        }
                    }
                }
                for (topic, handler) in ext.handlers() {
                    if let Err(e) = self.events.subscribe(topic, EventTarget::Auto, Arc::from(handler)) {
                        tracing::warn!(extension = name, topic, error = %e, "handler subscription failed");
                    }
                }
                self.order.write().push(name);
                Ok(())
            }
            Err(e) => {
                self.statuses.write().insert(name, ExtensionStatus::Error);
                Err(CoreError::Other(e))
            }
        }
    }

    pub async fn load_plugin(&self, path: &Path) -> Result<String> {
        self.ensure_open()?;
        let name = self.plugins.load(path).await?;
        let ext = self
            .registry
            .read()
            .get(&name)
            .ok_or_else(|| CoreError::ExtensionNotFound(name.clone()))?;
        self.init_one(ext.name()).await?;
        Ok(name)
    }

    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let ext = self
            .registry
            .read()
            .get(name)
            .ok_or_else(|| CoreError::ExtensionNotFound(name.to_string()))?;
        let ctx = self.ctx_for(ext.name());

        let cleanup = async move {
            ext.pre_cleanup(&ctx).await?;
            ext.cleanup(&ctx).await?;
            Ok(())
        };
        self.plugins.unload(name, cleanup).await;

        self.breakers.remove(name);
        self.statuses.write().remove(name);
        self.order.write().retain(|&n| n != name);

        let instance_id = self.service_instance_ids.write().remove(name);
        if let (Some(discovery), Some(instance_id)) = (&self.discovery, instance_id) {
            let _ = discovery.deregister_service(&instance_id).await;
        }
        Ok(())
    }

    pub async fn reload_plugin(&self, name: &str) -> Result<String> {
        self.ensure_open()?;
        let path = self
            .plugins
            .path_of(name)
            .ok_or_else(|| CoreError::ExtensionNotFound(name.to_string()))?;
        self.unload_plugin(name).await?;
        self.load_plugin(&path).await
    }

    pub async fn init_extensions(&self) -> Result<LifecycleReport> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(CoreError::AlreadyInitialized);
        }
        self.init_progress.write().clear();
        self.init_running.store(true, Ordering::Release);
        let snapshot = self.registry.read().clone();
        let result = self
            .lifecycle
            .init_all(
                &snapshot,
                |name| self.ctx_for(name),
                self.discovery.as_ref(),
                &self.events,
                |name| self.init_progress.write().push(name),
            )
            .await;
        self.init_running.store(false, Ordering::Release);
        let report = result?;
        *self.order.write() = report.order.clone();
        *self.statuses.write() = report.statuses.clone();
        *self.service_instance_ids.write() = report.service_instance_ids.clone();
        Ok(report)
    }

    pub async fn cleanup(&self) -> Vec<LifecycleStepError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let snapshot = self.registry.read().clone();
        let order = self.order.read().clone();
        let service_instance_ids = self.service_instance_ids.read().clone();
        self.lifecycle
            .cleanup_all(
                &snapshot,
                &order,
                |name| self.ctx_for(name),
                self.discovery.as_ref(),
                &service_instance_ids,
            )
            .await
    }

    // ---- admin HTTP surface (spec section 6) ----

    pub fn admin_router(self: &Arc<Self>) -> Router {
        let router = Router::new()
            .route("/exts", get(list_handler))
            .route("/exts/status", get(status_handler))
            .route("/exts/load", post(load_handler))
            .route("/exts/unload", post(unload_handler))
            .route("/exts/reload", post(reload_handler))
            .route("/exts/metrics", get(metrics_handler))
            .with_state(self.clone());

        // Extensions register routes against the stateless router, after the
        // admin surface above has already claimed its own state.
        self.registry
            .read()
            .all()
            .iter()
            .fold(router, |router, ext| ext.register_routes(router))
    }
}

#[derive(Deserialize)]
struct NameQuery {
    #[serde(default)]
    name: Option<String>,
}

async fn list_handler(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let extensions = match manager.list_extensions() {
        Ok(v) => v,
        Err(e) => return problem(e),
    };
    let mut grouped: HashMap<&'static str, HashMap<&'static str, Vec<Value>>> = HashMap::new();
    for (name, meta) in extensions {
        grouped
            .entry(meta.group)
            .or_default()
            .entry(meta.kind)
            .or_default()
            .push(json!({ "name": name, "description": meta.description }));
    }
    Json(json!(grouped)).into_response()
}

async fn status_handler(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let extensions = match manager.list_extensions() {
        Ok(v) => v,
        Err(e) => return problem(e),
    };
    let mut out: HashMap<&'static str, ExtensionStatus> = HashMap::new();
    for (name, _) in extensions {
        if let Ok(status) = manager.get_status(name) {
            out.insert(name, status);
        }
    }
    Json(json!(out)).into_response()
}

async fn load_handler(
    State(manager): State<Arc<Manager>>,
    Query(q): Query<NameQuery>,
) -> impl IntoResponse {
    let Some(name) = q.name else {
        return (axum::http::StatusCode::BAD_REQUEST, "missing 'name' query parameter").into_response();
    };
    let path = std::path::PathBuf::from(&name);
    match manager.load_plugin(&path).await {
        Ok(loaded) => Json(json!({ "loaded": loaded })).into_response(),
        Err(e) => problem(e),
    }
}

async fn unload_handler(
    State(manager): State<Arc<Manager>>,
    Query(q): Query<NameQuery>,
) -> impl IntoResponse {
    let Some(name) = q.name else {
        return (axum::http::StatusCode::BAD_REQUEST, "missing 'name' query parameter").into_response();
    };
    match manager.unload_plugin(&name).await {
        Ok(()) => Json(json!({ "unloaded": name })).into_response(),
        Err(e) => problem(e),
    }
}

async fn reload_handler(
    State(manager): State<Arc<Manager>>,
    Query(q): Query<NameQuery>,
) -> impl IntoResponse {
    let Some(name) = q.name else {
        return (axum::http::StatusCode::BAD_REQUEST, "missing 'name' query parameter").into_response();
    };
    match manager.reload_plugin(&name).await {
        Ok(reloaded) => Json(json!({ "reloaded": reloaded })).into_response(),
        Err(e) => problem(e),
    }
}

async fn metrics_handler(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let discovery = manager.discovery.as_ref().map(|d| d.metrics());
    let cache = discovery.as_ref().map(|m| {
        json!({
            "age_seconds": m.age_seconds,
            "is_expired": m.is_expired,
            "hit_rate": if m.hits + m.misses == 0 {
                0.0
            } else {
                m.hits as f64 / (m.hits + m.misses) as f64
            },
        })
    });
    let body = json!({
        "cache": cache,
        "discovery": discovery,
        "event_bus": {
            "memory": manager.events.memory_metrics(),
            "broker": manager.events.broker_metrics(),
        },
        "breakers": manager.breakers.snapshot(),
        "system": {
            "initialized": manager.initialized.load(Ordering::Relaxed),
            "closed": manager.closed.load(Ordering::Relaxed),
            "extensions": manager.registry.read().len(),
        },
    });
    Json(body).into_response()
}

fn problem(e: CoreError) -> axum::response::Response {
    let status = match e {
        CoreError::ExtensionNotFound(_)
        | CoreError::ServiceNotFound(_)
        | CoreError::BreakerMissing(_) => axum::http::StatusCode::NOT_FOUND,
        CoreError::ManagerClosed | CoreError::AlreadyInitialized | CoreError::AlreadyRegistered(_) => {
            axum::http::StatusCode::CONFLICT
        }
        _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Dependencies;
    use async_trait::async_trait;

    struct NullConfig;
    impl ConfigProvider for NullConfig {
        fn get_extension_config(&self, _name: &str) -> Value {
            Value::Null
        }
        fn get_config_raw(&self) -> Value {
            Value::Null
        }
    }

    struct Greeter;
    #[async_trait]
    impl Extension for Greeter {
        fn name(&self) -> &'static str {
            "greeter"
        }
        fn version(&self) -> &'static str {
            "0.1.0"
        }
        fn dependencies(&self) -> Dependencies {
            Dependencies::default()
        }
        async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn test_manager() -> Arc<Manager> {
        Manager::new(
            Registry::new(),
            Arc::new(NullConfig),
            Arc::new(EventRouter::new(
                Arc::new(crate::events::MemoryBus::new()),
                Arc::new(crate::events::BrokerBridge::disabled()),
            )),
            None,
            None,
            LoaderConfig::default(),
            false,
        )
    }

    #[tokio::test]
    async fn init_then_lookup_then_cleanup() {
        let manager = test_manager();
        manager.register(Arc::new(Greeter)).unwrap();

        let report = manager.init_extensions().await.unwrap();
        assert_eq!(report.order, vec!["greeter"]);
        assert_eq!(manager.get_status("greeter").unwrap(), ExtensionStatus::Active);

        let err = manager.init_extensions().await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyInitialized));

        let errors = manager.cleanup().await;
        assert!(errors.is_empty());

        let err = manager.get_extension("greeter").unwrap_err();
        assert!(matches!(err, CoreError::ManagerClosed));
    }

    #[tokio::test]
    async fn unknown_extension_lookup_errors() {
        let manager = test_manager();
        let err = manager.get_extension("ghost").unwrap_err();
        assert!(matches!(err, CoreError::ExtensionNotFound(_)));
    }

    struct Routed(Arc<std::sync::atomic::AtomicBool>);
    #[async_trait]
    impl Extension for Routed {
        fn name(&self) -> &'static str {
            "routed"
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
        fn register_routes(&self, router: Router) -> Router {
            self.0.store(true, Ordering::SeqCst);
            router.route("/exts/routed/ping", get(|| async { "pong" }))
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn admin_router_folds_extension_routes() {
        let manager = test_manager();
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        manager.register(Arc::new(Routed(called.clone()))).unwrap();
        let _router = manager.admin_router();
        assert!(called.load(Ordering::SeqCst));
    }

    struct First(Arc<std::sync::Mutex<Option<bool>>>);
    #[async_trait]
    impl Extension for First {
        fn name(&self) -> &'static str {
            "first"
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        fn dependencies(&self) -> Dependencies {
            Dependencies::default()
        }
        async fn init(&self, ctx: &ExtensionCtx) -> anyhow::Result<()> {
            let manager = ctx.manager().unwrap();
            let saw_second = manager.get_extension("second").is_ok();
            *self.0.lock().unwrap() = Some(saw_second);
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Second;
    #[async_trait]
    impl Extension for Second {
        fn name(&self) -> &'static str {
            "second"
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        fn dependencies(&self) -> Dependencies {
            Dependencies::new(vec!["first"], vec![])
        }
        async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[tokio::test]
    async fn init_order_hides_not_yet_initialized_peers() {
        let manager = test_manager();
        let saw_second = Arc::new(std::sync::Mutex::new(None));
        manager.register(Arc::new(First(saw_second.clone()))).unwrap();
        manager.register(Arc::new(Second)).unwrap();

        let report = manager.init_extensions().await.unwrap();
        assert_eq!(report.order, vec!["first", "second"]);
        assert_eq!(*saw_second.lock().unwrap(), Some(false));
    }
}
