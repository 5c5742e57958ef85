//! # generic-device-plugin
//!
//! A device plugin for generic, file-path-addressable host devices.
//!
//! This daemon is responsible for:
//! - Loading the configured device classes
//! - Periodically discovering devices by glob pattern
//! - Advertising device lists over the watch protocol
//! - Allocating devices to containers as host path bindings
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  generic-device-plugin                    │
//! │                                                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐    │
//! │  │    Plugin    │  │    Watch     │  │   Metrics    │    │
//! │  │   Registry   │  │   Manager    │  │   Registry   │    │
//! │  └──────┬───────┘  └──────────────┘  └──────────────┘    │
//! │         │                                                 │
//! │  ┌──────▼───────────────────────────────────────────┐    │
//! │  │   GenericPlugin (one per resource)                │    │
//! │  │   discovery → device table ← allocation           │    │
//! │  └───────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//!
//! The daemon reads configuration from
//! `$XDG_CONFIG_HOME/generic-device-plugin/config.toml`, or from the file named
//! by `GENERIC_DEVICE_PLUGIN_CONFIG`.
//!
//! ## Running
//!
//! ```bash
//! cargo run --bin generic-device-plugin
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin generic-device-plugin
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use generic_device_plugin::config::Config;
use generic_device_plugin::registry::PluginRegistry;
use generic_device_plugin::watch::WatchManager;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;

    // Initialize logging, RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting generic-device-plugin v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Plugin directory: {}",
        config.daemon.plugin_directory.display()
    );

    let metrics = prometheus::Registry::new();
    let registry = Arc::new(PluginRegistry::from_config(&config, &metrics)?);

    let resources = registry.list();
    info!("Registered {} resource(s): {:?}", resources.len(), resources);

    let mut watch_manager = WatchManager::new(Arc::clone(&registry));
    let mut events = watch_manager
        .take_event_receiver()
        .context("Watch event receiver already taken")?;
    watch_manager.start().await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(
                "{}: {} device(s), {} healthy",
                event.resource, event.device_count, event.healthy_count
            );
        }
    });

    info!("Daemon startup complete");
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");

    watch_manager.shutdown().await;

    let encoded = prometheus::TextEncoder::new()
        .encode_to_string(&metrics.gather())
        .context("Failed to encode metrics")?;
    debug!("Final metrics:\n{}", encoded);

    info!("Daemon stopped");
    Ok(())
}
