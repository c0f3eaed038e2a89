//! Component F: built-in and dynamic-library plugin loading.
//!
//! Dynamic loading is grounded on the pack's
//! `other_examples/8fff122f_Saskapult-Pinefruit__ekstensions-src-lib.rs.rs`,
//! which loads `libloading::Library` instances directly and wraps the
//! resulting raw function pointers. Loading a dylib is inherently unsafe;
//! the workspace denies `unsafe_code` everywhere else, so the `unsafe` here
//! is scoped to this module only via `#![allow(unsafe_code)]`.
#![allow(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::contracts::Extension;
use crate::errors::CoreError;
use crate::registry::Registry;
use crate::result::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoaderMode {
    #[default]
    Builtin,
    File,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub enable_sandbox: bool,
    pub allowed_paths: Vec<PathBuf>,
    pub blocked_extensions: Vec<String>,
    pub trusted_sources: Vec<String>,
    pub require_signature: bool,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub mode: LoaderMode,
    pub path: PathBuf,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub hot_reload: bool,
    pub max_plugins: usize,
    pub init_timeout: Duration,
    pub security: SecurityConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            mode: LoaderMode::Builtin,
            path: PathBuf::from("./plugins"),
            includes: Vec::new(),
            excludes: Vec::new(),
            hot_reload: false,
            max_plugins: 64,
            init_timeout: Duration::from_secs(120),
            security: SecurityConfig::default(),
        }
    }
}

/// Platform shared-library extension, without the leading dot.
#[cfg(target_os = "windows")]
const LIB_EXT: &str = "dll";
#[cfg(target_os = "macos")]
const LIB_EXT: &str = "dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const LIB_EXT: &str = "so";

/// Exported symbol every file-mode plugin must provide.
const ENTRY_SYMBOL: &[u8] = b"extcore_extension";
type ExtensionEntryPoint = unsafe extern "C" fn() -> *mut dyn Extension;

struct LoadedPlugin {
    #[allow(dead_code)] // kept alive so the vtable behind `Extension` stays mapped
    library: libloading::Library,
    path: PathBuf,
}

pub struct PluginLoader {
    config: LoaderConfig,
    registry: Arc<RwLock<Registry>>,
    loaded: RwLock<HashMap<String, LoadedPlugin>>,
}

impl PluginLoader {
    pub fn new(config: LoaderConfig, registry: Arc<RwLock<Registry>>) -> Self {
        Self {
            config,
            registry,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    fn included(&self, stem: &str) -> bool {
        let blocked = self
            .config
            .security
            .blocked_extensions
            .iter()
            .any(|b| stem == b);
        if blocked {
            return false;
        }
        if !self.config.includes.is_empty() {
            self.config.includes.iter().any(|i| i == stem)
        } else {
            !self.config.excludes.iter().any(|e| e == stem)
        }
    }

    fn validate_path(&self, path: &Path) -> Result<()> {
        if self.config.security.allowed_paths.is_empty() {
            return Ok(());
        }
        let allowed = self
            .config
            .security
            .allowed_paths
            .iter()
            .any(|p| path.starts_with(p));
        if !allowed {
            return Err(CoreError::SecurityViolation {
                path: path.display().to_string(),
                reason: "path is not under an allowed_paths entry".to_string(),
            });
        }
        Ok(())
    }

    fn validate_signature(&self, path: &Path) -> Result<()> {
        if !self.config.security.require_signature {
            return Ok(());
        }
        let sig = path.with_extension(format!("{LIB_EXT}.sig"));
        if !sig.exists() {
            return Err(CoreError::SecurityViolation {
                path: path.display().to_string(),
                reason: format!("missing signature file {}", sig.display()),
            });
        }
        Ok(())
    }

    fn plugin_count(&self) -> usize {
        self.loaded.read().len()
    }

    /// Scan the configured directory and load every eligible plugin.
    pub async fn load_all(&self) -> Result<Vec<String>> {
        if self.config.mode != LoaderMode::File {
            return Ok(Vec::new());
        }
        if !self.config.path.exists() {
            return Ok(Vec::new());
        }

        let mut loaded = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LIB_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !self.included(stem) {
                continue;
            }
            match self.load(&path).await {
                Ok(name) => loaded.push(name),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load plugin"),
            }
        }
        Ok(loaded)
    }

    /// Load a single plugin file; idempotent if its name is already loaded.
    pub async fn load(&self, path: &Path) -> Result<String> {
        if self.plugin_count() >= self.config.max_plugins {
            return Err(CoreError::PluginLimitReached {
                max: self.config.max_plugins,
            });
        }
        self.validate_path(path)?;
        self.validate_signature(path)?;

        let path = path.to_path_buf();
        let path_for_blocking = path.clone();
        let (ext, library) = tokio::task::spawn_blocking(move || -> Result<(Box<dyn Extension>, libloading::Library)> {
            // SAFETY: the library is produced by a build targeting this
            // system's Rust ABI; `ENTRY_SYMBOL` is required to exist and
            // match `ExtensionEntryPoint` by the plugin file-layout contract.
            unsafe {
                let library = libloading::Library::new(&path_for_blocking)
                    .map_err(|e| CoreError::Other(e.into()))?;
                let ctor: libloading::Symbol<ExtensionEntryPoint> = library
                    .get(ENTRY_SYMBOL)
                    .map_err(|e| CoreError::Other(e.into()))?;
                let ext: Box<dyn Extension> = Box::from_raw(ctor());
                Ok((ext, library))
            }
        })
        .await
        .map_err(|e| CoreError::Other(e.into()))??;

        let name = ext.name().to_string();
        self.registry.write().register(Arc::from(ext))?;
        self.loaded.write().insert(
            name.clone(),
            LoadedPlugin {
                library,
                path: path.clone(),
            },
        );
        info!(plugin = %name, path = %path.display(), "plugin loaded");
        Ok(name)
    }

    /// Unload a previously loaded plugin. Best-effort: cleanup failures are
    /// logged, not returned, so unload always removes the extension.
    pub async fn unload(&self, name: &str, cleanup: impl std::future::Future<Output = anyhow::Result<()>>) {
        if let Err(e) = cleanup.await {
            warn!(plugin = name, error = %e, "plugin cleanup failed during unload");
        }
        self.registry.write().unregister(name);
        self.loaded.write().remove(name);
    }

    pub async fn reload(&self, name: &str) -> Result<String> {
        let path = self
            .loaded
            .read()
            .get(name)
            .map(|p| p.path.clone())
            .ok_or_else(|| CoreError::ExtensionNotFound(name.to_string()))?;
        self.registry.write().unregister(name);
        self.loaded.write().remove(name);
        self.load(&path).await
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.read().contains_key(name)
    }

    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.loaded.read().get(name).map(|p| p.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader_with(config: LoaderConfig) -> PluginLoader {
        PluginLoader::new(config, Arc::new(RwLock::new(Registry::new())))
    }

    #[test]
    fn empty_include_means_all_not_excluded() {
        let loader = loader_with(LoaderConfig {
            excludes: vec!["bad".to_string()],
            ..Default::default()
        });
        assert!(loader.included("good"));
        assert!(!loader.included("bad"));
    }

    #[test]
    fn non_empty_include_is_an_allowlist() {
        let loader = loader_with(LoaderConfig {
            includes: vec!["only_this".to_string()],
            ..Default::default()
        });
        assert!(loader.included("only_this"));
        assert!(!loader.included("anything_else"));
    }

    #[test]
    fn blocked_extensions_always_excluded() {
        let loader = loader_with(LoaderConfig {
            includes: vec!["blocked".to_string()],
            security: SecurityConfig {
                blocked_extensions: vec!["blocked".to_string()],
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(!loader.included("blocked"));
    }

    #[test]
    fn path_outside_allowed_paths_is_rejected() {
        let loader = loader_with(LoaderConfig {
            security: SecurityConfig {
                allowed_paths: vec![PathBuf::from("/opt/plugins")],
                ..Default::default()
            },
            ..Default::default()
        });
        let err = loader
            .validate_path(Path::new("/tmp/evil.so"))
            .unwrap_err();
        assert!(matches!(err, CoreError::SecurityViolation { .. }));
    }

    #[test]
    fn missing_signature_is_rejected_when_required() {
        let tmp = tempfile::tempdir().unwrap();
        let plugin_path = tmp.path().join("demo.so");
        std::fs::write(&plugin_path, b"not a real library").unwrap();

        let loader = loader_with(LoaderConfig {
            security: SecurityConfig {
                require_signature: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let err = loader.validate_signature(&plugin_path).unwrap_err();
        assert!(matches!(err, CoreError::SecurityViolation { .. }));
    }

    #[tokio::test]
    async fn empty_plugin_directory_loads_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = loader_with(LoaderConfig {
            mode: LoaderMode::File,
            path: tmp.path().to_path_buf(),
            ..Default::default()
        });
        let loaded = loader.load_all().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn max_plugins_cap_is_enforced_before_touching_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = loader_with(LoaderConfig {
            mode: LoaderMode::File,
            max_plugins: 0,
            ..Default::default()
        });
        let err = loader
            .load(&tmp.path().join("whatever.so"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PluginLimitReached { .. }));
    }
}
