//! Per-extension context handed to lifecycle hooks.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::manager::Manager;

/// Read-only access to an extension's own opaque configuration blob.
///
/// Grounded on the teacher's `ConfigProvider`/`AppConfigProvider` split: the
/// provider owns the whole configuration tree, an extension only ever sees
/// its own `extension.plugin_config.<name>` slice.
pub trait ConfigProvider: Send + Sync {
    /// Opaque configuration for one extension, `Value::Null` if absent.
    fn get_extension_config(&self, name: &str) -> Value;

    /// The full raw configuration tree, for diagnostics/admin use.
    fn get_config_raw(&self) -> Value;
}

/// Context passed to every lifecycle hook (`pre_init`, `init`, ...).
///
/// Carries this extension's own configuration, a cancellation token honored
/// by long-running hooks, and a weak handle back to the `Manager` so an
/// extension can look up sibling services during `init` without creating an
/// `Arc` cycle (the manager owns the extensions, not the other way round).
#[derive(Clone)]
pub struct ExtensionCtx {
    pub name: &'static str,
    config: Arc<dyn ConfigProvider>,
    manager: Weak<Manager>,
    cancel: CancellationToken,
}

impl ExtensionCtx {
    pub fn new(
        name: &'static str,
        config: Arc<dyn ConfigProvider>,
        manager: Weak<Manager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            config,
            manager,
            cancel,
        }
    }

    /// This extension's own configuration blob.
    pub fn config(&self) -> Value {
        self.config.get_extension_config(self.name)
    }

    /// Cancellation token scoped to the current lifecycle run.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upgrade the weak manager handle; `None` once the manager has been dropped.
    pub fn manager(&self) -> Option<Arc<Manager>> {
        self.manager.upgrade()
    }
}
