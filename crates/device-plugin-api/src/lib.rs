//! # device-plugin-api
//!
//! Protocol types and traits for node-local device plugins.
//!
//! This crate defines the messages exchanged between a node resource manager
//! and a device plugin, plus the [`DevicePlugin`] trait that a plugin
//! implements:
//!
//! - [`Device`] / [`Health`] - A device instance as advertised on the watch stream
//! - [`DeviceSpec`] - A host path binding returned by allocation
//! - [`AllocateRequest`] / [`AllocateResponse`] - Allocation messages
//! - [`ListAndWatchResponse`] - One full device list pushed on the watch stream
//!
//! Transport (gRPC, registration with the resource manager) is not part of this
//! crate; a harness maps these operations onto the wire.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Permission string granting read, write and mknod on a device node.
pub const DEVICE_PERMISSIONS: &str = "mrw";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("failed to discover devices: bad pattern {pattern:?}: {message}")]
    Discovery { pattern: String, message: String },

    #[error("requested device does not exist {0:?}")]
    DeviceNotFound(String),

    #[error("requested device is not healthy {0:?}")]
    DeviceUnhealthy(String),

    #[error("device list stream closed")]
    StreamClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PluginError>;

// ============================================================================
// Device Types
// ============================================================================

/// Health of a single device instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    #[default]
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device as advertised to the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub health: Health,
}

/// A host path to expose inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

impl DeviceSpec {
    /// Bind `path` at the same location inside the container.
    pub fn identity(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            container_path: path.clone(),
            host_path: path,
            permissions: DEVICE_PERMISSIONS.to_string(),
        }
    }
}

/// A mount to add to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

// ============================================================================
// Protocol Messages
// ============================================================================

/// Options a plugin reports to the resource manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePluginOptions {
    pub pre_start_required: bool,
    pub get_preferred_allocation_available: bool,
}

/// Full device list pushed on the watch stream. Never a delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAndWatchResponse {
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAllocateRequest {
    pub devices_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub container_requests: Vec<ContainerAllocateRequest>,
}

impl AllocateRequest {
    /// Build a request with one container request per id group.
    pub fn new<I, G, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            container_requests: groups
                .into_iter()
                .map(|ids| ContainerAllocateRequest {
                    devices_ids: ids.into_iter().map(Into::into).collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAllocateResponse {
    pub envs: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<DeviceSpec>,
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub container_responses: Vec<ContainerAllocateResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPreferredAllocationRequest {
    pub available_device_ids: Vec<String>,
    pub must_include_device_ids: Vec<String>,
    pub allocation_size: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredAllocationRequest {
    pub container_requests: Vec<ContainerPreferredAllocationRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPreferredAllocationResponse {
    pub device_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredAllocationResponse {
    pub container_responses: Vec<ContainerPreferredAllocationResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreStartContainerRequest {
    pub devices_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreStartContainerResponse {}

// ============================================================================
// Plugin Trait
// ============================================================================

/// The device plugin protocol.
///
/// Every operation maps one-to-one onto a remote procedure of the resource
/// manager's plugin API. Errors are returned to the caller as-is; a plugin
/// never retries on its own.
#[async_trait]
pub trait DevicePlugin: Send + Sync {
    /// Fully qualified resource name, e.g. `example.com/serial`.
    fn resource_name(&self) -> &str;

    async fn get_device_plugin_options(&self) -> Result<DevicePluginOptions>;

    /// Push the full device list on `stream` now and again whenever it
    /// changes.
    ///
    /// Runs until discovery fails, a send fails, or the receiving side of
    /// `stream` is dropped. The latter ends the call with `Ok(())`.
    async fn list_and_watch(&self, stream: mpsc::Sender<ListAndWatchResponse>) -> Result<()>;

    /// Allocate devices to containers. Fails the whole call if any requested
    /// device is unknown or unhealthy.
    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse>;

    async fn get_preferred_allocation(
        &self,
        request: PreferredAllocationRequest,
    ) -> Result<PreferredAllocationResponse>;

    async fn pre_start_container(
        &self,
        request: PreStartContainerRequest,
    ) -> Result<PreStartContainerResponse>;
}
