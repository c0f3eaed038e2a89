//! The extension capability contract.
//!
//! The teacher's design composes several capability interfaces (db/rest/stateful/...)
//! selected by a builder. Here that collapses into one `Extension` trait: every
//! extension implements the required methods and picks up the rest (lifecycle
//! hooks, service advertisement, route registration) as no-op defaults.

use std::any::Any;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExtensionCtx;
use crate::result::Result;

/// Where an extension's dependency edge lives relative to the rest of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Must resolve; its absence is fatal.
    Strong,
    /// Preferred but droppable, particularly to break cycles.
    Weak,
}

/// Declared dependency edges for one extension.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    pub strong: Vec<&'static str>,
    pub weak: Vec<&'static str>,
}

impl Dependencies {
    pub fn new(strong: Vec<&'static str>, weak: Vec<&'static str>) -> Self {
        Self { strong, weak }
    }
}

/// Static metadata returned by `Extension::metadata`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Metadata {
    pub description: &'static str,
    pub group: &'static str,
    pub kind: &'static str,
}

/// Runtime status of an extension, surfaced via `GET /exts/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    Active,
    Error,
    Unloaded,
}

/// Advertisement an extension wants published to the external service
/// registry once its `init` completes.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service_name: String,
    pub address: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

/// One callable method exposed by an extension's `services()` table.
pub type ServiceMethod = Box<dyn Fn(Value) -> Result<Value> + Send + Sync + 'static>;

/// One subscribed event handler exposed by an extension's `handlers()` table.
/// Takes the envelope, never the raw payload — source and timestamp stay truthful.
pub type HandlerFn = Box<dyn Fn(crate::events::EventEnvelope) + Send + Sync + 'static>;

/// The capability set every extension implements.
///
/// Required: `name`, `version`, `init`. Everything else carries a default
/// no-op implementation.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Process-wide unique name.
    fn name(&self) -> &'static str;

    /// Semantic version string, informational only.
    fn version(&self) -> &'static str;

    /// Declared strong/weak dependency edges.
    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }

    /// Static descriptive metadata.
    fn metadata(&self) -> Metadata {
        Metadata::default()
    }

    /// Runs before `init`, in topological order. Default: no-op.
    async fn pre_init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Required initialization step.
    async fn init(&self, ctx: &ExtensionCtx) -> anyhow::Result<()>;

    /// Runs after `init`, in topological order. Default: no-op.
    async fn post_init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs before `cleanup`, in reverse topological order. Default: no-op.
    async fn pre_cleanup(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs during teardown, in reverse topological order. Default: no-op.
    async fn cleanup(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Route registration hook for the admin/extension HTTP surface.
    /// Default: registers nothing.
    fn register_routes(&self, router: axum::Router) -> axum::Router {
        router
    }

    /// Whether this extension wants a service advertisement published
    /// to the external registry once `init` succeeds.
    fn needs_service_discovery(&self) -> bool {
        false
    }

    /// The advertisement to publish, when `needs_service_discovery` is true.
    fn service_info(&self) -> Option<ServiceInfo> {
        None
    }

    /// Current status; overridden by extensions that can fail post-init.
    fn status(&self) -> ExtensionStatus {
        ExtensionStatus::Active
    }

    /// Event-bus subscriptions this extension wants wired at init time.
    fn handlers(&self) -> HashMap<&'static str, HandlerFn> {
        HashMap::new()
    }

    /// Callable `(service, method)` table for the call router's local dispatch.
    fn services(&self) -> HashMap<&'static str, ServiceMethod> {
        HashMap::new()
    }

    /// Remote-callable services this extension wants registered with the
    /// remote transport, keyed the same way as `services()`.
    fn register_remote_services(&self) -> HashMap<&'static str, ServiceMethod> {
        HashMap::new()
    }

    fn as_any(&self) -> &dyn Any;
}
