use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::home_dir::resolve_home_dir;
use extcore::plugin::{LoaderConfig, LoaderMode, SecurityConfig as PluginSecurityConfig};

/// Main application configuration: strongly-typed global sections plus a
/// flexible per-extension configuration bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Core server configuration.
    pub server: ServerConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Extension runtime configuration.
    #[serde(default)]
    pub extension: ExtensionConfig,
    /// Service registry / discovery configuration.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Remote-call transport configuration.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Event broker bridge configuration.
    #[serde(default)]
    pub messaging: MessagingConfig,
    /// Abort the whole startup on the first extension lifecycle failure.
    #[serde(default)]
    pub strict_init: bool,
    /// Directory containing per-extension YAML files (optional).
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// Per-extension configuration bag: extension_name → arbitrary JSON/YAML value.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub home_dir: String, // will be normalized to absolute path
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub timeout_sec: u64,
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    pub file: String,          // "logs/api.log"
    #[serde(default)]
    pub file_level: String,
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

/// `extension.*` — where extensions live and how the loader governs them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionConfig {
    /// Directory scanned for dynamic library plugins.
    #[serde(default = "default_extension_path")]
    pub path: String,
    /// "file" (load `.so`/`.dylib`/`.dll` from `path`) or "builtin" (inventory-registered only).
    #[serde(default = "default_extension_mode")]
    pub mode: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub hot_reload: bool,
    #[serde(default = "default_max_plugins")]
    pub max_plugins: usize,
    /// Humantime duration string, e.g. "30s".
    #[serde(default = "default_init_timeout")]
    pub init_timeout: String,
    #[serde(default)]
    pub security: ExtensionSecurityConfig,
    #[serde(default)]
    pub performance: ExtensionPerformanceConfig,
    /// extension_name → opaque plugin config, handed back verbatim through `ConfigProvider`.
    #[serde(default)]
    pub plugin_config: HashMap<String, serde_json::Value>,
}

fn default_extension_path() -> String {
    "extensions".to_string()
}
fn default_extension_mode() -> String {
    "builtin".to_string()
}
fn default_max_plugins() -> usize {
    64
}
fn default_init_timeout() -> String {
    "30s".to_string()
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            path: default_extension_path(),
            mode: default_extension_mode(),
            includes: Vec::new(),
            excludes: Vec::new(),
            hot_reload: false,
            max_plugins: default_max_plugins(),
            init_timeout: default_init_timeout(),
            security: ExtensionSecurityConfig::default(),
            performance: ExtensionPerformanceConfig::default(),
            plugin_config: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ExtensionSecurityConfig {
    #[serde(default)]
    pub enable_sandbox: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_extensions: Vec<String>,
    #[serde(default)]
    pub trusted_sources: Vec<String>,
    #[serde(default)]
    pub require_signature: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionPerformanceConfig {
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<u32>,
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval: String,
    #[serde(default)]
    pub enable_profiling: bool,
    pub gc_interval: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_metrics_interval() -> String {
    "15s".to_string()
}

impl Default for ExtensionPerformanceConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: None,
            max_cpu_percent: None,
            enable_metrics: true,
            metrics_interval: default_metrics_interval(),
            enable_profiling: false,
            gc_interval: None,
        }
    }
}

/// `registry.*` — the service-discovery backend extensions advertise into.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    pub address: Option<String>,
    #[serde(default = "default_registry_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub discovery: RegistryDiscoveryConfig,
}

fn default_registry_scheme() -> String {
    "http".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: None,
            scheme: default_registry_scheme(),
            discovery: RegistryDiscoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryDiscoveryConfig {
    #[serde(default = "default_health_check")]
    pub health_check: String,
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
    #[serde(default = "default_check_timeout")]
    pub timeout: String,
}

fn default_health_check() -> String {
    "http".to_string()
}
fn default_check_interval() -> String {
    "10s".to_string()
}
fn default_check_timeout() -> String {
    "5s".to_string()
}

impl Default for RegistryDiscoveryConfig {
    fn default() -> Self {
        Self {
            health_check: default_health_check(),
            check_interval: default_check_interval(),
            timeout: default_check_timeout(),
        }
    }
}

/// `remote.*` — whether this process accepts remote service calls.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// `messaging.*` — whether the in-process event bus bridges to an external broker.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MessagingConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // Empty => use platform default resolved by resolve_home_dir():
            // Windows: %APPDATA%/.extcore
            // Unix/macOS: $HOME/.extcore
            home_dir: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8087,
            timeout_sec: 0,
        }
    }
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/extcore.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: Some(default_logging_config()),
            extension: ExtensionConfig::default(),
            registry: RegistryConfig::default(),
            remote: RemoteConfig::default(),
            messaging: MessagingConfig::default(),
            strict_init: false,
            modules_dir: None,
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    /// Also normalizes `server.home_dir` into an absolute path and creates the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // For layered loading, start from a minimal base where optional sections are None,
        // so they remain None unless explicitly provided by YAML/ENV.
        let base = AppConfig {
            server: ServerConfig::default(),
            logging: None,
            extension: ExtensionConfig::default(),
            registry: RegistryConfig::default(),
            remote: RemoteConfig::default(),
            messaging: MessagingConfig::default(),
            strict_init: false,
            modules_dir: None,
            modules: HashMap::new(),
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path.as_ref()))
            // Example: APP__SERVER__PORT=8087 maps to server.port
            .merge(Env::prefixed("APP__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| "Failed to extract config from figment".to_string())?;

        // Normalize + create home_dir immediately.
        normalize_home_dir_inplace(&mut config.server)
            .context("Failed to resolve server.home_dir")?;

        // Merge module files if modules_dir is specified.
        if let Some(dir) = config.modules_dir.clone() {
            merge_module_files(&mut config.modules, dir)?;
        }

        Ok(config)
    }

    /// Load configuration from file or create with default values.
    /// Also normalizes `server.home_dir` into an absolute path and creates the directory.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                normalize_home_dir_inplace(&mut c.server)
                    .context("Failed to resolve server.home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }

        // Set logging level based on verbose flags for "default" section.
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }

    /// Converts `extension.*` into the loader's own config type, parsing the
    /// humantime duration strings and mapping `"file"`/`"builtin"` onto `LoaderMode`.
    pub fn plugin_loader_config(&self) -> Result<LoaderConfig> {
        let ext = &self.extension;
        let mode = match ext.mode.as_str() {
            "file" => LoaderMode::File,
            "builtin" => LoaderMode::Builtin,
            other => anyhow::bail!("unknown extension.mode '{other}', expected 'file' or 'builtin'"),
        };
        let init_timeout: Duration = humantime::parse_duration(&ext.init_timeout)
            .with_context(|| format!("invalid extension.init_timeout '{}'", ext.init_timeout))?;

        Ok(LoaderConfig {
            mode,
            path: PathBuf::from(&ext.path),
            includes: ext.includes.clone(),
            excludes: ext.excludes.clone(),
            hot_reload: ext.hot_reload,
            max_plugins: ext.max_plugins,
            init_timeout,
            security: PluginSecurityConfig {
                enable_sandbox: ext.security.enable_sandbox,
                allowed_paths: ext.security.allowed_paths.iter().map(PathBuf::from).collect(),
                blocked_extensions: ext.security.blocked_extensions.clone(),
                trusted_sources: ext.security.trusted_sources.clone(),
                require_signature: ext.security.require_signature,
            },
        })
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config: Option<String>,
    pub port: Option<u16>,
    pub print_config: bool,
    pub verbose: u8,
    pub mock: bool,
}

// TODO: should be pass from outside
const fn default_subdir() -> &'static str {
    ".extcore"
}

/// Normalize `server.home_dir` using `home_dir::resolve_home_dir` and store the absolute path back.
fn normalize_home_dir_inplace(server: &mut ServerConfig) -> Result<()> {
    // Treat empty string as "not provided" => None.
    let opt = if server.home_dir.trim().is_empty() {
        None
    } else {
        Some(server.home_dir.clone())
    };

    let resolved: PathBuf = resolve_home_dir(opt, default_subdir(), /*create*/ true)
        .context("home_dir normalization failed")?;

    server.home_dir = resolved.to_string_lossy().to_string();
    Ok(())
}

fn merge_module_files(
    bag: &mut HashMap<String, serde_json::Value>,
    dir: impl AsRef<Path>,
) -> Result<()> {
    use std::fs;
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != "yml" && ext != "yaml" {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        let raw = fs::read_to_string(&path)?;
        let val: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        let json = serde_json::to_value(val)?;
        bag.insert(name, json);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};
    use tempfile::tempdir;

    /// Helper: a normalized home_dir should be absolute and not start with '~'.
    fn is_normalized_path(p: &str) -> bool {
        let pb = PathBuf::from(p);
        pb.is_absolute() && !p.starts_with('~')
    }

    #[test]
    fn test_default_config_structure() {
        let config = AppConfig::default();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8087);
        // raw (not yet normalized)
        assert_eq!(config.server.home_dir, "");
        assert_eq!(config.server.timeout_sec, 0);

        assert!(config.logging.is_some());
        let logging = config.logging.as_ref().unwrap();
        assert!(logging.contains_key("default"));

        let default_section = &logging["default"];
        assert_eq!(default_section.console_level, "info");
        assert_eq!(default_section.file, "logs/extcore.log");

        assert_eq!(config.extension.mode, "builtin");
        assert_eq!(config.extension.max_plugins, 64);
        assert!(!config.strict_init);
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_load_layered_normalizes_home_dir() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");

        let yaml = r#"
server:
  home_dir: "~/.test_extcore"
  host: "0.0.0.0"
  port: 9090
  timeout_sec: 30

logging:
  default:
    console_level: debug
    file: "logs/default.log"

extension:
  mode: file
  path: "/opt/extcore/extensions"
  max_plugins: 8
  init_timeout: "45s"
"#;
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();

        assert!(is_normalized_path(&config.server.home_dir));
        assert!(config.server.home_dir.ends_with(".test_extcore"));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.timeout_sec, 30);

        let logging = config.logging.as_ref().unwrap();
        let def = &logging["default"];
        assert_eq!(def.console_level, "debug");
        assert_eq!(def.file, "logs/default.log");

        assert_eq!(config.extension.mode, "file");
        assert_eq!(config.extension.max_plugins, 8);
        assert_eq!(config.extension.init_timeout, "45s");
    }

    #[test]
    fn test_load_or_default_normalizes_home_dir_when_none() {
        let tmp = tempdir().unwrap();
        #[cfg(target_os = "windows")]
        env::set_var("APPDATA", tmp.path());
        #[cfg(not(target_os = "windows"))]
        env::set_var("HOME", tmp.path());
        let config = AppConfig::load_or_default(None::<&str>).unwrap();
        assert!(is_normalized_path(&config.server.home_dir));
        assert!(config.server.home_dir.ends_with(default_subdir()));
        assert_eq!(config.server.port, 8087);
    }

    #[test]
    fn test_minimal_yaml_config() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");

        #[cfg(target_os = "windows")]
        env::set_var("APPDATA", tmp.path());
        #[cfg(not(target_os = "windows"))]
        env::set_var("HOME", tmp.path());

        let yaml = r#"
server:
  home_dir: "~/.minimal"
  host: "localhost"
  port: 8080
"#;
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();

        assert!(is_normalized_path(&config.server.home_dir));
        assert!(config.server.home_dir.ends_with(".minimal"));
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.timeout_sec, 0);

        // Optional sections default to None/defaults when absent from YAML.
        assert!(config.logging.is_none());
        assert!(config.modules.is_empty());
        assert_eq!(config.extension.mode, "builtin");
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = AppConfig::default();

        let args = super::CliArgs {
            config: None,
            port: Some(3000),
            print_config: false,
            verbose: 2, // trace
            mock: false,
        };

        config.apply_cli_overrides(&args);

        assert_eq!(config.server.port, 3000);

        let logging = config.logging.as_ref().unwrap();
        let default_section = &logging["default"];
        assert_eq!(default_section.console_level, "trace");
    }

    #[test]
    fn test_cli_verbose_levels_matrix() {
        for (verbose_level, expected_log_level) in [
            (0, "info"), // unchanged from default
            (1, "debug"),
            (2, "trace"),
            (3, "trace"), // cap at trace
        ] {
            let mut config = AppConfig::default();
            let args = super::CliArgs {
                config: None,
                port: None,
                print_config: false,
                verbose: verbose_level,
                mock: false,
            };

            config.apply_cli_overrides(&args);

            let logging = config.logging.as_ref().unwrap();
            let default_section = &logging["default"];

            if verbose_level == 0 {
                assert_eq!(default_section.console_level, "info");
            } else {
                assert_eq!(default_section.console_level, expected_log_level);
            }
        }
    }

    #[test]
    fn test_layered_config_loading_with_modules_dir() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");
        let modules_dir = tmp.path().join("modules.d");
        fs::create_dir_all(&modules_dir).unwrap();
        fs::write(
            modules_dir.join("greeter.yaml"),
            "template: \"Hi, {name}!\"\n",
        )
        .unwrap();

        let yaml = format!(
            r#"
server:
  home_dir: "{}"
  host: "127.0.0.1"
  port: 8087
modules_dir: "{}"
"#,
            tmp.path().join("home").to_string_lossy(),
            modules_dir.to_string_lossy(),
        );
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();
        assert!(config.modules.contains_key("greeter"));
        assert_eq!(
            config.modules["greeter"]["template"],
            serde_json::json!("Hi, {name}!")
        );
    }

    #[test]
    fn test_plugin_loader_config_conversion() {
        let mut config = AppConfig::default();
        config.extension.mode = "file".to_string();
        config.extension.path = "/var/lib/extcore/ext".to_string();
        config.extension.init_timeout = "2s".to_string();
        config.extension.security.allowed_paths = vec!["/var/lib/extcore/ext".to_string()];
        config.extension.security.require_signature = true;

        let loader_cfg = config.plugin_loader_config().unwrap();
        assert_eq!(loader_cfg.mode, LoaderMode::File);
        assert_eq!(loader_cfg.path, PathBuf::from("/var/lib/extcore/ext"));
        assert_eq!(loader_cfg.init_timeout, Duration::from_secs(2));
        assert!(loader_cfg.security.require_signature);
        assert_eq!(
            loader_cfg.security.allowed_paths,
            vec![PathBuf::from("/var/lib/extcore/ext")]
        );
    }

    #[test]
    fn test_plugin_loader_config_rejects_unknown_mode() {
        let mut config = AppConfig::default();
        config.extension.mode = "sandboxed".to_string();
        assert!(config.plugin_loader_config().is_err());
    }

    #[test]
    fn test_registry_and_remote_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.registry.scheme, "http");
        assert_eq!(config.registry.discovery.check_interval, "10s");
        assert!(!config.remote.enabled);
        assert!(!config.messaging.enabled);
    }
}
