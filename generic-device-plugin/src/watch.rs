//! Watch supervisor for registered plugins.
//!
//! This module implements the `WatchManager`, which subscribes to the device
//! list stream of every registered plugin the same way a resource manager
//! does. It handles:
//!
//! - One background task per plugin consuming its `list_and_watch` stream
//! - Tracking watch state (last update, update count, error count)
//! - Resubscription with exponential backoff after a watch terminates
//! - Graceful shutdown signaling
//! - Event emission for every pushed device list
//!
//! # Example
//!
//! ```no_run
//! use generic_device_plugin::config::Config;
//! use generic_device_plugin::registry::PluginRegistry;
//! use generic_device_plugin::watch::WatchManager;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load_default()?;
//! let metrics = prometheus::Registry::new();
//! let registry = Arc::new(PluginRegistry::from_config(&config, &metrics)?);
//!
//! let mut watch_manager = WatchManager::new(registry);
//! watch_manager.start().await?;
//!
//! // Later: shutdown gracefully
//! watch_manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use device_plugin_api::{DevicePlugin, ListAndWatchResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::registry::PluginRegistry;

// ============================================================================
// Watch State Types
// ============================================================================

/// Current status of a resource's watch subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchStatus {
    /// Waiting for the first device list
    Subscribing,
    /// Receiving device lists
    Watching,
    /// The last subscription terminated with an error
    Error(String),
}

/// Per-resource watch state tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceWatchState {
    /// Resource name
    pub resource: String,
    /// Current watch status
    pub status: WatchStatus,
    /// Time of the last received device list
    pub last_update: Option<DateTime<Utc>>,
    /// Device lists received over all subscriptions
    pub update_count: u64,
    /// Number of consecutive terminated subscriptions
    pub error_count: u32,
    /// Scheduled time of the next resubscription
    pub next_retry: Option<DateTime<Utc>>,
}

impl ResourceWatchState {
    fn new(resource: String) -> Self {
        Self {
            resource,
            status: WatchStatus::Subscribing,
            last_update: None,
            update_count: 0,
            error_count: 0,
            next_retry: None,
        }
    }
}

/// Event emitted for every device list pushed by a plugin.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub resource: String,
    pub device_count: usize,
    pub healthy_count: usize,
    pub timestamp: DateTime<Utc>,
}

type WatchStates = Arc<RwLock<HashMap<String, ResourceWatchState>>>;

// ============================================================================
// WatchManager
// ============================================================================

/// Watches every registered plugin.
pub struct WatchManager {
    registry: Arc<PluginRegistry>,
    state: WatchStates,
    shutdown_tx: Option<broadcast::Sender<()>>,
    event_tx: mpsc::Sender<WatchEvent>,
    event_rx: Option<mpsc::Receiver<WatchEvent>>,
}

impl WatchManager {
    /// Create a new watch manager over `registry`.
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);

        Self {
            registry,
            state: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Start one watch task per registered plugin.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting watch manager");

        let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let mut state = self.state.write().await;
        for resource in self.registry.list() {
            state.insert(
                resource.to_string(),
                ResourceWatchState::new(resource.to_string()),
            );
        }
        drop(state);

        let mut task_count = 0;
        for resource in self.registry.list() {
            let Some(plugin) = self.registry.get(resource) else {
                continue;
            };

            self.spawn_watch_task(plugin, shutdown_tx.subscribe());
            task_count += 1;
        }

        if task_count == 0 {
            warn!("No resources configured, watch manager has no work to do");
        } else {
            info!("Started {} watch task(s)", task_count);
        }

        Ok(())
    }

    /// Spawn the background watch task for a single plugin.
    fn spawn_watch_task(
        &self,
        plugin: Arc<dyn DevicePlugin>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let resource = plugin.resource_name().to_string();

            loop {
                tokio::select! {
                    reason = Self::run_subscription(&plugin, &state, &event_tx) => {
                        let backoff = Self::handle_watch_error(&resource, &state, &reason).await;
                        tokio::select! {
                            _ = sleep(backoff) => {
                                info!("Resubscribing to {}", resource);
                            }
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            info!("Watch task for '{}' stopped", resource);
        });
    }

    /// Consume one `list_and_watch` subscription until it ends.
    ///
    /// Returns the reason the subscription ended.
    async fn run_subscription(
        plugin: &Arc<dyn DevicePlugin>,
        state: &WatchStates,
        event_tx: &mpsc::Sender<WatchEvent>,
    ) -> String {
        let resource = plugin.resource_name();
        let (tx, rx) = mpsc::channel::<ListAndWatchResponse>(1);
        let mut updates = ReceiverStream::new(rx);

        let watch = plugin.list_and_watch(tx);
        tokio::pin!(watch);

        loop {
            tokio::select! {
                result = &mut watch => {
                    return match result {
                        Ok(()) => "watch ended".to_string(),
                        Err(e) => e.to_string(),
                    };
                }
                Some(update) = updates.next() => {
                    Self::record_update(resource, &update, state, event_tx).await;
                }
            }
        }
    }

    /// Record a received device list and emit an event for it.
    async fn record_update(
        resource: &str,
        update: &ListAndWatchResponse,
        state: &WatchStates,
        event_tx: &mpsc::Sender<WatchEvent>,
    ) {
        let now = Utc::now();
        let healthy_count = update
            .devices
            .iter()
            .filter(|d| d.health.is_healthy())
            .count();

        debug!(
            "Resource '{}' reported {} device(s), {} healthy",
            resource,
            update.devices.len(),
            healthy_count
        );

        {
            let mut state_lock = state.write().await;
            if let Some(resource_state) = state_lock.get_mut(resource) {
                resource_state.status = WatchStatus::Watching;
                resource_state.last_update = Some(now);
                resource_state.update_count += 1;
                resource_state.error_count = 0;
                resource_state.next_retry = None;
            }
        }

        let event = WatchEvent {
            resource: resource.to_string(),
            device_count: update.devices.len(),
            healthy_count,
            timestamp: now,
        };
        if let Err(e) = event_tx.try_send(event) {
            debug!("Dropping watch event for '{}': {}", resource, e);
        }
    }

    /// Record a terminated subscription and compute the backoff before the
    /// next one: 2^error_count seconds, max 60 seconds.
    async fn handle_watch_error(resource: &str, state: &WatchStates, reason: &str) -> Duration {
        error!("Watch for '{}' terminated: {}", resource, reason);

        let mut state_lock = state.write().await;
        let Some(resource_state) = state_lock.get_mut(resource) else {
            return Duration::from_secs(1);
        };

        resource_state.status = WatchStatus::Error(reason.to_string());
        resource_state.error_count += 1;

        let backoff_secs = 2_u64.pow(resource_state.error_count.min(6)).min(60);
        resource_state.next_retry =
            Some(Utc::now() + chrono::Duration::seconds(backoff_secs as i64));

        warn!(
            "Resource '{}' error count: {}, resubscribing in {} seconds",
            resource, resource_state.error_count, backoff_secs
        );

        Duration::from_secs(backoff_secs)
    }

    /// Get the current watch state for all resources.
    pub async fn get_watch_states(&self) -> HashMap<String, ResourceWatchState> {
        self.state.read().await.clone()
    }

    /// Get the watch state for a specific resource.
    pub async fn get_watch_state(&self, resource: &str) -> Option<ResourceWatchState> {
        self.state.read().await.get(resource).cloned()
    }

    /// Gracefully shutdown all watch tasks.
    ///
    /// Dropping a task's subscription closes the plugin's stream, which ends
    /// its `list_and_watch` call.
    pub async fn shutdown(&mut self) {
        info!("Shutting down watch manager");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            drop(shutdown_tx);

            // Give tasks a moment to shut down gracefully
            sleep(Duration::from_millis(500)).await;
        }

        info!("Watch manager shutdown complete");
    }

    /// Take ownership of the event receiver.
    ///
    /// This allows the caller to receive watch events. Can only be called once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<WatchEvent>> {
        self.event_rx.take()
    }
}

// ============================================================================
// Tests
// ============================================================================
