//! Prometheus instruments for a device plugin.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

const DEVICES_METRIC: &str = "generic_device_plugin_devices";
const ALLOCATIONS_METRIC: &str = "generic_device_plugin_allocations_total";

/// Per-resource metrics. Cloning shares the underlying instruments.
#[derive(Debug, Clone)]
pub struct PluginMetrics {
    devices: IntGauge,
    allocations: IntCounter,
}

impl PluginMetrics {
    /// Create unregistered instruments labelled with `resource`.
    pub fn new(resource: &str) -> prometheus::Result<Self> {
        let devices = IntGauge::with_opts(
            Opts::new(DEVICES_METRIC, "The number of devices managed by this device plugin.")
                .const_label("resource", resource),
        )?;
        let allocations = IntCounter::with_opts(
            Opts::new(
                ALLOCATIONS_METRIC,
                "The total number of device allocations made by this device plugin.",
            )
            .const_label("resource", resource),
        )?;

        Ok(Self {
            devices,
            allocations,
        })
    }

    /// Register both instruments with `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.devices.clone()))?;
        registry.register(Box::new(self.allocations.clone()))?;
        Ok(())
    }

    pub fn set_devices(&self, count: usize) {
        self.devices.set(count as i64);
    }

    pub fn add_allocations(&self, count: usize) {
        self.allocations.inc_by(count as u64);
    }

    pub fn devices(&self) -> i64 {
        self.devices.get()
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.get()
    }
}
