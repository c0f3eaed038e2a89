use std::sync::Arc;

use serde_json::Value;

use crate::config::AppConfig;
use extcore::context::ConfigProvider;

/// `ConfigProvider` backed by a loaded `AppConfig`.
///
/// An extension's own slice comes from `extension.plugin_config.<name>`; the
/// legacy per-module `modules.<name>` bag is checked as a fallback so
/// extensions ported from the older module-config layout keep working.
pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn from_arc(config: Arc<AppConfig>) -> Self {
        Self(config)
    }

    pub fn inner(&self) -> &AppConfig {
        &self.0
    }
}

impl ConfigProvider for AppConfigProvider {
    fn get_extension_config(&self, name: &str) -> Value {
        if let Some(v) = self.0.extension.plugin_config.get(name) {
            return v.clone();
        }
        self.0.modules.get(name).cloned().unwrap_or(Value::Null)
    }

    fn get_config_raw(&self) -> Value {
        serde_json::to_value(self.0.as_ref()).unwrap_or(Value::Null)
    }
}
