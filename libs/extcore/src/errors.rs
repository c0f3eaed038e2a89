//! Error catalog for the extension runtime core.

use thiserror::Error;

/// All errors the core can surface to a caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("extension '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("extensions already initialized")]
    AlreadyInitialized,

    #[error("extension '{module}' depends on '{dep}', which is not registered")]
    MissingDependency { module: String, dep: String },

    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("extension '{0}' not found")]
    ExtensionNotFound(String),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("no message broker is configured")]
    BrokerUnavailable,

    #[error("plugin limit reached ({max} plugins loaded)")]
    PluginLimitReached { max: usize },

    #[error("security violation loading plugin '{path}': {reason}")]
    SecurityViolation { path: String, reason: String },

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("circuit breaker open for '{0}'")]
    BreakerOpen(String),

    #[error("no circuit breaker registered for '{0}'")]
    BreakerMissing(String),

    #[error("manager is closed")]
    ManagerClosed,

    #[error("method '{method}' not found on service '{service}'")]
    MethodNotFound { service: String, method: String },

    #[error("call to '{service}' timed out")]
    CallTimeout { service: String },

    #[error("call to '{service}' was cancelled")]
    CallCancelled { service: String },

    #[error("plugin I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("service discovery backend error: {0}")]
    Discovery(#[source] anyhow::Error),

    #[error("remote transport error: {0}")]
    Remote(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Non-fatal errors collected while running a lifecycle phase across many
/// extensions; these never abort the phase (see `strict_init`).
#[derive(Debug, Error)]
#[error("extension '{extension}' failed during {phase}: {source}")]
pub struct LifecycleStepError {
    pub extension: String,
    pub phase: &'static str,
    #[source]
    pub source: anyhow::Error,
}
