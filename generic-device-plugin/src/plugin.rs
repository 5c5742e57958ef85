//! The generic device plugin.
//!
//! `GenericPlugin` owns the device table of one resource. The table is rebuilt
//! from scratch by every refresh and is only ever touched under its lock, so
//! allocation and refresh never interleave. Filesystem discovery and stream
//! sends happen outside the lock.

use async_trait::async_trait;
use device_plugin_api::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePlugin,
    DevicePluginOptions, DeviceSpec, Health, ListAndWatchResponse, PluginError,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::discovery::{discover, DiscoveredDevice, ResourceSpec};
use crate::metrics::PluginMetrics;

/// How often the watch loop re-runs discovery.
pub const DEVICE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle of a `list_and_watch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    /// Waiting for the first discovery and push.
    Initializing,
    /// At least one device list has been pushed.
    Streaming,
    /// The loop ended. Holds the reason.
    Terminated(String),
}

/// A device plugin for devices that can be found by file path and mounted
/// without any special setup.
pub struct GenericPlugin {
    spec: Arc<ResourceSpec>,
    devices: Mutex<HashMap<String, DiscoveredDevice>>,
    metrics: PluginMetrics,
    watch_state: watch::Sender<WatchState>,
    #[cfg(test)]
    discovery_gate: std::sync::Mutex<Option<DiscoveryGate>>,
}

/// Sets the watch state to `Terminated` however `list_and_watch` ends,
/// including when its future is dropped mid-loop.
struct TerminateOnDrop<'a> {
    state: &'a watch::Sender<WatchState>,
    reason: Option<String>,
}

impl Drop for TerminateOnDrop<'_> {
    fn drop(&mut self) {
        let reason = self
            .reason
            .take()
            .unwrap_or_else(|| "watch dropped".to_string());
        self.state.send_replace(WatchState::Terminated(reason));
    }
}

/// Parks the next discovery run until released.
#[cfg(test)]
struct DiscoveryGate {
    entered: tokio::sync::oneshot::Sender<()>,
    release: tokio::sync::oneshot::Receiver<()>,
}

impl GenericPlugin {
    /// Create a plugin with an empty device table.
    pub fn new(spec: ResourceSpec, metrics: PluginMetrics) -> Self {
        let (watch_state, _) = watch::channel(WatchState::Initializing);
        Self {
            spec: Arc::new(spec),
            devices: Mutex::new(HashMap::new()),
            metrics,
            watch_state,
            #[cfg(test)]
            discovery_gate: std::sync::Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &PluginMetrics {
        &self.metrics
    }

    /// Re-run discovery and replace the device table.
    ///
    /// Returns `true` when the new table holds exactly the same identifiers as
    /// the previous one. On error the previous table is kept.
    pub async fn refresh(&self) -> Result<bool> {
        let spec = Arc::clone(&self.spec);
        #[cfg(test)]
        let gate = self.discovery_gate.lock().ok().and_then(|mut g| g.take());
        let discovered = tokio::task::spawn_blocking(move || {
            #[cfg(test)]
            if let Some(gate) = gate {
                let _ = gate.entered.send(());
                let _ = gate.release.blocking_recv();
            }
            discover(&spec)
        })
        .await
        .map_err(|e| PluginError::Internal(format!("discovery task failed: {e}")))??;

        self.metrics.set_devices(discovered.len());

        let mut devices = self.devices.lock().await;
        let old = std::mem::take(&mut *devices);
        for device in discovered {
            devices.insert(device.id.clone(), device);
        }

        let unchanged = old.len() == devices.len() && old.keys().all(|id| devices.contains_key(id));
        debug!(
            "Refreshed {}: {} device(s), unchanged: {}",
            self.spec.resource,
            devices.len(),
            unchanged
        );

        Ok(unchanged)
    }

    /// Snapshot of the current table, sorted by identifier.
    pub async fn devices(&self) -> Vec<Device> {
        let devices = self.devices.lock().await;
        let mut list: Vec<Device> = devices.values().map(DiscoveredDevice::to_device).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Resolved paths of a device, if it is in the current table.
    pub async fn device_paths(&self, id: &str) -> Option<Vec<String>> {
        self.devices.lock().await.get(id).map(|d| d.paths.clone())
    }

    /// Health of a device. Generic devices carry no health signal of their own,
    /// so this is always `Healthy`.
    pub fn device_state(&self, _id: &str) -> Health {
        Health::Healthy
    }

    /// Current state of the most recent `list_and_watch` call.
    pub fn watch_state(&self) -> WatchState {
        self.watch_state.borrow().clone()
    }

    /// Follow watch state transitions.
    pub fn subscribe_watch_state(&self) -> watch::Receiver<WatchState> {
        self.watch_state.subscribe()
    }

    async fn watch_loop(&self, stream: &mpsc::Sender<ListAndWatchResponse>) -> Result<()> {
        self.refresh().await?;

        let mut ticker = interval_at(Instant::now() + DEVICE_CHECK_INTERVAL, DEVICE_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut unchanged = false;
        loop {
            if !unchanged {
                let response = ListAndWatchResponse {
                    devices: self.devices().await,
                };
                info!(
                    "Sending {} device(s) for {}",
                    response.devices.len(),
                    self.spec.resource
                );
                stream
                    .send(response)
                    .await
                    .map_err(|_| PluginError::StreamClosed)?;

                self.watch_state.send_if_modified(|state| {
                    if *state == WatchState::Streaming {
                        false
                    } else {
                        *state = WatchState::Streaming;
                        true
                    }
                });
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = stream.closed() => {
                    info!("Watch stream for {} closed by receiver", self.spec.resource);
                    return Ok(());
                }
            }

            unchanged = self.refresh().await?;
        }
    }

    /// Park the next refresh inside discovery. Resolves the returned
    /// receiver once discovery is entered; discovery resumes when the
    /// returned sender fires or is dropped.
    #[cfg(test)]
    pub(crate) fn hold_next_discovery(
        &self,
    ) -> (
        tokio::sync::oneshot::Receiver<()>,
        tokio::sync::oneshot::Sender<()>,
    ) {
        let (entered, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release) = tokio::sync::oneshot::channel();
        if let Ok(mut gate) = self.discovery_gate.lock() {
            *gate = Some(DiscoveryGate { entered, release });
        }
        (entered_rx, release_tx)
    }

    #[cfg(test)]
    pub(crate) async fn set_health(&self, id: &str, health: Health) {
        if let Some(device) = self.devices.lock().await.get_mut(id) {
            device.health = health;
        }
    }
}

#[async_trait]
impl DevicePlugin for GenericPlugin {
    fn resource_name(&self) -> &str {
        &self.spec.resource
    }

    async fn get_device_plugin_options(&self) -> Result<DevicePluginOptions> {
        Ok(DevicePluginOptions::default())
    }

    async fn list_and_watch(&self, stream: mpsc::Sender<ListAndWatchResponse>) -> Result<()> {
        info!("Starting list and watch for {}", self.spec.resource);
        self.watch_state.send_replace(WatchState::Initializing);
        let mut terminated = TerminateOnDrop {
            state: &self.watch_state,
            reason: None,
        };

        let result = self.watch_loop(&stream).await;

        terminated.reason = Some(match &result {
            Ok(()) => "stream cancelled".to_string(),
            Err(e) => {
                warn!("List and watch for {} terminated: {}", self.spec.resource, e);
                e.to_string()
            }
        });

        result
    }

    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse> {
        let devices = self.devices.lock().await;

        let mut response = AllocateResponse {
            container_responses: Vec::with_capacity(request.container_requests.len()),
        };
        for container_request in &request.container_requests {
            let mut container = ContainerAllocateResponse::default();
            for id in &container_request.devices_ids {
                let device = devices
                    .get(id)
                    .ok_or_else(|| PluginError::DeviceNotFound(id.clone()))?;
                if !device.health.is_healthy() {
                    return Err(PluginError::DeviceUnhealthy(id.clone()));
                }
                container
                    .devices
                    .extend(device.paths.iter().map(|p| DeviceSpec::identity(p.as_str())));
            }
            response.container_responses.push(container);
        }

        self.metrics.add_allocations(response.container_responses.len());
        debug!(
            "Allocated {} container request(s) for {}",
            response.container_responses.len(),
            self.spec.resource
        );

        Ok(response)
    }

    async fn get_preferred_allocation(
        &self,
        _request: PreferredAllocationRequest,
    ) -> Result<PreferredAllocationResponse> {
        Ok(PreferredAllocationResponse::default())
    }

    async fn pre_start_container(
        &self,
        _request: PreStartContainerRequest,
    ) -> Result<PreStartContainerResponse> {
        Ok(PreStartContainerResponse::default())
    }
}
