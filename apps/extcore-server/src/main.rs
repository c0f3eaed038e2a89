mod registered_modules;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use extcore::discovery::{ConsulBackend, ServiceDiscoveryClient, StaticRegistryBackend};
use extcore::events::{BrokerBridge, EventRouter, MemoryBus};
use extcore::manager::Manager;
use extcore::registry::Registry;
use extcore_bootstrap::config_provider::AppConfigProvider;
use extcore_bootstrap::{AppConfig, CliArgs};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// extcore server - host process for the extension runtime
#[derive(Parser)]
#[command(name = "extcore-server")]
#[command(about = "extcore server - host process for the extension runtime")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Port override for the admin HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        port: cli.port,
        print_config: cli.print_config,
        verbose: cli.verbose,
        mock: false,
    };

    // Layered config: 1) defaults -> 2) YAML (if provided) -> 3) env (APP__*) -> 4) CLI overrides.
    // Also normalizes + creates server.home_dir.
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    extcore_bootstrap::logging::init_logging_unified(
        &logging_config,
        std::path::Path::new(&config.server.home_dir),
    );

    tracing::info!("extcore server starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config).await,
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    tracing::info!("initializing extensions…");

    let registry = Registry::discover_and_build()
        .map_err(|e| anyhow::anyhow!("extension registry discovery failed: {e}"))?;
    tracing::info!(count = registry.len(), "extensions discovered");

    let config_provider = Arc::new(AppConfigProvider::new(config.clone()));

    let events = Arc::new(EventRouter::new(
        Arc::new(MemoryBus::new()),
        // No concrete message broker adapter ships with the core; `messaging.enabled`
        // is a config placeholder for a future adapter crate.
        Arc::new(BrokerBridge::disabled()),
    ));
    if config.messaging.enabled {
        tracing::warn!("messaging.enabled is set but no broker adapter is linked; events stay in-process");
    }

    let discovery = match config.registry.address.as_ref() {
        Some(address) => {
            let backend = ConsulBackend::new(&config.registry.scheme, address);
            Some(Arc::new(ServiceDiscoveryClient::new(
                Arc::new(backend),
                humantime::parse_duration(&config.registry.discovery.check_interval)
                    .unwrap_or(Duration::from_secs(10)),
                true,
            )))
        }
        None => {
            tracing::warn!("no registry.address configured; using an in-process static backend");
            Some(Arc::new(ServiceDiscoveryClient::new(
                Arc::new(StaticRegistryBackend::new()),
                Duration::from_secs(30),
                false,
            )))
        }
    };

    let plugin_config = config.plugin_loader_config()?;

    let manager = Manager::new(
        registry,
        config_provider,
        events,
        discovery,
        // No concrete remote-call transport ships with the core; `remote.*` is a
        // config placeholder for a future adapter crate.
        None,
        plugin_config,
        config.strict_init,
    );

    let report = manager.init_extensions().await?;
    if !report.errors.is_empty() {
        for err in &report.errors {
            tracing::error!(extension = %err.extension, phase = err.phase, error = %err.source, "extension init failed");
        }
    }
    tracing::info!(order = ?report.order, "extension init order");

    let admin = manager.admin_router();
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "admin HTTP surface listening");

    tokio::select! {
        result = axum::serve(listener, admin) => {
            result?;
        }
        result = extcore_bootstrap::signals::wait_for_shutdown() => {
            result?;
        }
    }

    tracing::info!("shutting down extensions…");
    let cleanup_errors = manager.cleanup().await;
    for err in &cleanup_errors {
        tracing::error!(extension = %err.extension, phase = err.phase, error = %err.source, "extension cleanup failed");
    }

    Ok(())
}

async fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("checking configuration…");
    config.plugin_loader_config()?;
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}
