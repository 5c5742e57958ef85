//! # Plugin Registry
//!
//! Holds one device plugin per advertised resource.
//!
//! Plugins are stored by resource name as trait objects, so the watch
//! supervisor and any transport harness can drive them without knowing their
//! concrete type.

use anyhow::{Context, Result};
use device_plugin_api::DevicePlugin;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::metrics::PluginMetrics;
use crate::plugin::GenericPlugin;

/// Registry of device plugins keyed by resource name.
///
/// # Example
///
/// ```no_run
/// use generic_device_plugin::config::Config;
/// use generic_device_plugin::registry::PluginRegistry;
///
/// let config = Config::load_default().unwrap();
/// let metrics = prometheus::Registry::new();
/// let registry = PluginRegistry::from_config(&config, &metrics).unwrap();
///
/// for resource in registry.list() {
///     println!("Advertising {}", resource);
/// }
/// ```
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn DevicePlugin>>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Build a `GenericPlugin` for every configured device class and register
    /// its metrics with `metrics`.
    pub fn from_config(config: &Config, metrics: &prometheus::Registry) -> Result<Self> {
        let mut registry = Self::new();

        for spec in config.resource_specs() {
            let plugin_metrics = PluginMetrics::new(&spec.resource)
                .with_context(|| format!("Failed to create metrics for {}", spec.resource))?;
            plugin_metrics
                .register(metrics)
                .with_context(|| format!("Failed to register metrics for {}", spec.resource))?;

            info!(
                "Configured resource {} with {} path group(s)",
                spec.resource,
                spec.groups.len()
            );
            registry.register(GenericPlugin::new(spec, plugin_metrics));
        }

        Ok(registry)
    }

    /// Register a plugin under its resource name, replacing any plugin already
    /// registered for that resource.
    pub fn register<P>(&mut self, plugin: P)
    where
        P: DevicePlugin + 'static,
    {
        self.register_arc(Arc::new(plugin));
    }

    /// Register a shared plugin.
    pub fn register_arc(&mut self, plugin: Arc<dyn DevicePlugin>) {
        let resource = plugin.resource_name().to_string();
        self.plugins.insert(resource, plugin);
    }

    /// Get a plugin by resource name.
    pub fn get(&self, resource: &str) -> Option<Arc<dyn DevicePlugin>> {
        self.plugins.get(resource).cloned()
    }

    /// List all registered resource names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut resources: Vec<&str> = self.plugins.keys().map(|s| s.as_str()).collect();
        resources.sort_unstable();
        resources
    }

    /// Get the number of registered plugins.
    pub fn count(&self) -> usize {
        self.plugins.len()
    }

    /// Check if a plugin is registered for the resource.
    pub fn contains(&self, resource: &str) -> bool {
        self.plugins.contains_key(resource)
    }

    /// Remove a plugin from the registry.
    pub fn remove(&mut self, resource: &str) -> Option<Arc<dyn DevicePlugin>> {
        self.plugins.remove(resource)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
