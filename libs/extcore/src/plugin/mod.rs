//! Component F: plugin loader (builtin + dynamic-library file modes).

pub mod loader;

pub use loader::{LoaderConfig, LoaderMode, PluginLoader, SecurityConfig};
