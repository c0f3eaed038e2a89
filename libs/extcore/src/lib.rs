//! # extcore - in-process extension/plugin runtime
//!
//! The core couples a dependency-ordering algorithm with concurrent
//! initialization, plugin dynamic loading, dual-transport event routing (an
//! in-process bus and an optional external broker), a cached
//! service-discovery client, a per-extension circuit breaker, and a unified
//! local/remote call router. Everything else — storage drivers, search
//! adapters, crypto wrappers, concrete broker/registry implementations — is
//! an external collaborator used *by* extensions, not part of the core.
//!
//! An extension implements the single [`Extension`] trait and announces
//! itself at process start via the `#[extension(...)]` attribute macro
//! (re-exported from `extcore-macros`), which emits an `inventory::submit!`
//! registrator. [`Manager`] then discovers the process-wide registry,
//! resolves the dependency graph, and drives every extension through its
//! lifecycle.

pub use anyhow;
pub use async_trait::async_trait;
pub use inventory;

pub mod breaker;
pub mod context;
pub mod contracts;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod plugin;
pub mod registry;
pub mod result;
pub mod router;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use context::{ConfigProvider, ExtensionCtx};
pub use contracts::{Dependencies, DependencyKind, Extension, ExtensionStatus, Metadata, ServiceInfo};
pub use errors::{CoreError, LifecycleStepError};
pub use events::{BrokerBridge, EventEnvelope, EventRouter, EventTarget, MemoryBus, MessageBroker};
pub use lifecycle::{LifecycleDriver, LifecycleReport};
pub use manager::Manager;
pub use plugin::{LoaderConfig, LoaderMode, PluginLoader, SecurityConfig};
pub use registry::{Edge, EdgeKind, Registrator, Registry, RegistryBuilder, Resolver};
pub use result::Result;
pub use router::{CallContext, CallOptions, CallRouter, CallStrategy, RemoteTransport};

pub use extcore_macros::extension;
